//! Collaborating services: photo upload, photo delete and order submit.
//!
//! The session core only sees the three traits below. `HttpBackend` talks to
//! the real endpoints; `SimulatedBackend` answers in-process with configurable
//! latency and injectable failures.

use crate::assembler::SubmissionPayload;
use crate::config::BackendConfig;
use crate::photo::{PhotoFile, PhotoId};
use crate::submission::OrderDraft;
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use rand::Rng;
use reqwest::multipart::{Form, Part};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, instrument};

const UPLOAD_PATH: &str = "/api/photo/upload";
const DELETE_PATH: &str = "/api/photo/delete";
const SUBMIT_PATH: &str = "/api/order/submit";

/// Errors reported by a collaborating service
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ServiceError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Request rejected: {0}")]
    Rejected(String),

    #[error("Malformed response: {0}")]
    Decode(String),

    #[error("No response after {0:?}")]
    TimedOut(Duration),
}

impl From<reqwest::Error> for ServiceError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            ServiceError::Decode(err.to_string())
        } else {
            ServiceError::Network(err.to_string())
        }
    }
}

/// Response envelope shared by all endpoints
#[derive(Debug, Deserialize)]
pub struct ApiEnvelope<T> {
    pub success: bool,
    pub data: Option<T>,
    #[serde(default)]
    pub message: Option<String>,
}

impl<T> ApiEnvelope<T> {
    /// Unwrap `data` from a successful envelope
    pub fn into_data(self) -> Result<T, ServiceError> {
        if !self.success {
            return Err(self.rejection());
        }
        self.data
            .ok_or_else(|| ServiceError::Decode("success response without data".to_string()))
    }

    /// Accept a successful envelope whose data is irrelevant
    pub fn into_ack(self) -> Result<(), ServiceError> {
        if self.success {
            Ok(())
        } else {
            Err(self.rejection())
        }
    }

    fn rejection(&self) -> ServiceError {
        ServiceError::Rejected(
            self.message
                .clone()
                .unwrap_or_else(|| "unknown error".to_string()),
        )
    }
}

/// A single photo upload
#[derive(Debug, Clone)]
pub struct UploadRequest {
    pub photo_id: PhotoId,
    pub size_key: String,
    pub file: PhotoFile,
}

/// What the upload service stored
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadedPhoto {
    /// Server-side photo id
    pub id: String,
    /// Storage URL of the uploaded image
    pub url: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub size: Option<String>,
}

/// Order submission body: the grouped payload plus the order form fields
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubmitRequest {
    pub order_sn: String,
    pub receiver: String,
    pub remark: String,
    #[serde(flatten)]
    pub payload: SubmissionPayload,
}

impl SubmitRequest {
    pub fn new(draft: &OrderDraft, payload: SubmissionPayload) -> Self {
        Self {
            order_sn: draft.order_number.trim().to_string(),
            receiver: draft.receiver_name.trim().to_string(),
            remark: draft.remark.clone(),
            payload,
        }
    }
}

/// Submit service answer; `total` is authoritative when present
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct SubmitResponse {
    #[serde(default)]
    pub order_sn: Option<String>,
    #[serde(default)]
    pub total: Option<u64>,
    #[serde(default)]
    pub receiver: Option<String>,
    #[serde(default)]
    pub timestamp: Option<i64>,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait UploadService: Send + Sync {
    async fn upload(&self, request: UploadRequest) -> Result<UploadedPhoto, ServiceError>;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DeleteService: Send + Sync {
    /// Best-effort removal of a stored photo by its server-side id
    async fn delete(&self, server_id: String) -> Result<(), ServiceError>;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SubmitService: Send + Sync {
    async fn submit(&self, request: SubmitRequest) -> Result<SubmitResponse, ServiceError>;
}

/// The three collaborators a session needs
#[derive(Clone)]
pub struct SessionServices {
    pub upload: Arc<dyn UploadService>,
    pub delete: Arc<dyn DeleteService>,
    pub submit: Arc<dyn SubmitService>,
}

impl SessionServices {
    /// Use one backend for all three services
    pub fn from_backend<B>(backend: B) -> Self
    where
        B: UploadService + DeleteService + SubmitService + 'static,
    {
        let backend = Arc::new(backend);
        Self {
            upload: backend.clone(),
            delete: backend.clone(),
            submit: backend,
        }
    }

    /// Build the backend selected by configuration
    pub fn from_config(config: &BackendConfig) -> Result<Self, ServiceError> {
        match config.mode {
            crate::config::BackendMode::Simulated => {
                Ok(Self::from_backend(SimulatedBackend::new(config)))
            }
            crate::config::BackendMode::Http => Ok(Self::from_backend(HttpBackend::new(config)?)),
        }
    }
}

/// HTTP client for the order backend
#[derive(Debug, Clone)]
pub struct HttpBackend {
    client: reqwest::Client,
    base_url: String,
}

impl HttpBackend {
    pub fn new(config: &BackendConfig) -> Result<Self, ServiceError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;

        info!(base_url = %config.base_url, "HTTP backend initialized");

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn read_envelope<T: DeserializeOwned>(
        resp: reqwest::Response,
    ) -> Result<ApiEnvelope<T>, ServiceError> {
        let status = resp.status();

        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(ServiceError::Rejected(format!("HTTP {}: {}", status, text)));
        }

        resp.json().await.map_err(Into::into)
    }
}

#[async_trait]
impl UploadService for HttpBackend {
    #[instrument(skip(self, request), fields(photo_id = %request.photo_id, size_key = %request.size_key))]
    async fn upload(&self, request: UploadRequest) -> Result<UploadedPhoto, ServiceError> {
        let part = Part::stream(reqwest::Body::from(request.file.bytes.clone()))
            .file_name(request.file.name.clone())
            .mime_str(&request.file.mime_type())?;

        let form = Form::new()
            .part("file", part)
            .text("size", request.size_key.clone())
            .text("name", request.file.name.clone())
            .text("client_id", request.photo_id.to_string());

        let resp = self
            .client
            .post(self.endpoint(UPLOAD_PATH))
            .multipart(form)
            .send()
            .await?;

        let uploaded = Self::read_envelope::<UploadedPhoto>(resp).await?.into_data()?;
        debug!(server_id = %uploaded.id, url = %uploaded.url, "Upload accepted");
        Ok(uploaded)
    }
}

#[async_trait]
impl DeleteService for HttpBackend {
    #[instrument(skip(self))]
    async fn delete(&self, server_id: String) -> Result<(), ServiceError> {
        let resp = self
            .client
            .post(self.endpoint(DELETE_PATH))
            .json(&serde_json::json!({ "id": server_id }))
            .send()
            .await?;

        Self::read_envelope::<serde_json::Value>(resp)
            .await?
            .into_ack()
    }
}

#[async_trait]
impl SubmitService for HttpBackend {
    #[instrument(skip(self, request), fields(order_sn = %request.order_sn))]
    async fn submit(&self, request: SubmitRequest) -> Result<SubmitResponse, ServiceError> {
        let resp = self
            .client
            .post(self.endpoint(SUBMIT_PATH))
            .json(&request)
            .send()
            .await?;

        Self::read_envelope::<SubmitResponse>(resp).await?.into_data()
    }
}

#[derive(Debug, Default)]
struct SimulatedState {
    failing_files: HashSet<String>,
    submit_failure: Option<String>,
    deleted: Vec<String>,
    submissions: Vec<SubmitRequest>,
}

/// In-process backend mirroring the order API's observable behavior
#[derive(Debug, Clone)]
pub struct SimulatedBackend {
    origin: String,
    upload_latency: Duration,
    delete_latency: Duration,
    submit_latency: Duration,
    state: Arc<Mutex<SimulatedState>>,
}

impl SimulatedBackend {
    pub fn new(config: &BackendConfig) -> Self {
        Self {
            origin: config.simulated_origin.trim_end_matches('/').to_string(),
            upload_latency: config.upload_latency(),
            delete_latency: config.delete_latency(),
            submit_latency: config.submit_latency(),
            state: Arc::new(Mutex::new(SimulatedState::default())),
        }
    }

    /// Zero-latency backend
    pub fn instant() -> Self {
        let config = BackendConfig {
            upload_latency_ms: 0,
            delete_latency_ms: 0,
            submit_latency_ms: 0,
            ..BackendConfig::default()
        };
        Self::new(&config)
    }

    /// Reject every upload of a file with this name
    pub fn fail_uploads_named(&self, name: &str) {
        self.state.lock().failing_files.insert(name.to_string());
    }

    pub fn allow_uploads_named(&self, name: &str) {
        self.state.lock().failing_files.remove(name);
    }

    /// Reject the next submission with the given message
    pub fn fail_next_submit(&self, message: &str) {
        self.state.lock().submit_failure = Some(message.to_string());
    }

    /// Server ids removed through the delete endpoint
    pub fn deleted_ids(&self) -> Vec<String> {
        self.state.lock().deleted.clone()
    }

    /// Requests accepted by the submit endpoint
    pub fn submissions(&self) -> Vec<SubmitRequest> {
        self.state.lock().submissions.clone()
    }

    async fn delay(latency: Duration) {
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
    }
}

#[async_trait]
impl UploadService for SimulatedBackend {
    async fn upload(&self, request: UploadRequest) -> Result<UploadedPhoto, ServiceError> {
        Self::delay(self.upload_latency).await;

        if self.state.lock().failing_files.contains(&request.file.name) {
            return Err(ServiceError::Rejected(format!(
                "upload of '{}' refused",
                request.file.name
            )));
        }

        let server_id = format!(
            "photo_{}_{}",
            Utc::now().timestamp_millis(),
            rand::thread_rng().gen_range(0..1000)
        );
        let url = format!(
            "{}/uploads/{}/{}",
            self.origin,
            server_id,
            sanitize_path_component(&request.file.name)
        );

        Ok(UploadedPhoto {
            id: server_id,
            url,
            name: Some(request.file.name),
            size: Some(request.size_key),
        })
    }
}

#[async_trait]
impl DeleteService for SimulatedBackend {
    async fn delete(&self, server_id: String) -> Result<(), ServiceError> {
        Self::delay(self.delete_latency).await;
        self.state.lock().deleted.push(server_id);
        Ok(())
    }
}

#[async_trait]
impl SubmitService for SimulatedBackend {
    async fn submit(&self, request: SubmitRequest) -> Result<SubmitResponse, ServiceError> {
        Self::delay(self.submit_latency).await;

        let mut state = self.state.lock();
        if let Some(message) = state.submit_failure.take() {
            return Err(ServiceError::Rejected(message));
        }

        let response = SubmitResponse {
            order_sn: Some(request.order_sn.clone()),
            total: Some(request.payload.photos.len() as u64),
            receiver: Some(request.receiver.clone()),
            timestamp: Some(Utc::now().timestamp_millis()),
        };
        state.submissions.push(request);
        Ok(response)
    }
}

/// Sanitize a path component to prevent path traversal
fn sanitize_path_component(component: &str) -> String {
    component
        .chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' | '.' => c,
            _ => '_',
        })
        .collect::<String>()
        .replace("..", "__")
}

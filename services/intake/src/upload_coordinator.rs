//! Upload lifecycle for individual photos.
//!
//! `begin_upload` registers the record and its preview synchronously, then
//! runs the network upload as a background task. Finished uploads come back
//! over a channel and are applied on the session's own task, keyed by photo
//! id, so completion order never matters. A result whose record was deleted
//! in the meantime is discarded rather than resurrecting the photo.

use crate::config::UploadConfig;
use crate::photo::{PhotoFile, PhotoId, PhotoRecord, PhotoStatus};
use crate::photo_store::{PhotoStore, StoreError};
use crate::services::{DeleteService, ServiceError, UploadRequest, UploadService, UploadedPhoto};
use futures::FutureExt;
use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// Errors returned synchronously when starting or retrying an upload
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UploadError {
    #[error("'{name}' is not an image ({content_type})")]
    InvalidFileType { name: String, content_type: String },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Photo {0} not found")]
    NotFound(PhotoId),

    #[error("Photo {id} is {status} and cannot be retried")]
    NotRetryable { id: PhotoId, status: String },
}

impl UploadError {
    pub fn user_message(&self) -> String {
        match self {
            UploadError::InvalidFileType { name, .. } => {
                format!("'{}' is not an image. Please choose an image file.", name)
            }
            other => other.to_string(),
        }
    }
}

/// Result of one background upload, tagged with the record it belongs to
#[derive(Debug)]
pub struct UploadOutcome {
    pub id: PhotoId,
    pub result: Result<UploadedPhoto, ServiceError>,
}

/// What applying an upload outcome did to the store
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadResolution {
    /// Record is uploaded; the display layer should reload it from `display_url`
    Uploaded { id: PhotoId, display_url: String },
    Failed { id: PhotoId, reason: String },
    TimedOut { id: PhotoId },
    /// Record was deleted or replaced before its upload resolved
    Stale { id: PhotoId },
}

impl UploadResolution {
    pub fn id(&self) -> &PhotoId {
        match self {
            UploadResolution::Uploaded { id, .. }
            | UploadResolution::Failed { id, .. }
            | UploadResolution::TimedOut { id }
            | UploadResolution::Stale { id } => id,
        }
    }
}

/// Files started and files refused by a multi-file pick
#[derive(Debug, Default)]
pub struct BatchReport {
    pub started: Vec<PhotoRecord>,
    pub rejected: Vec<(String, UploadError)>,
}

/// Drives uploads, retries and deletions against the photo store
pub struct UploadCoordinator {
    uploader: Arc<dyn UploadService>,
    deleter: Arc<dyn DeleteService>,
    /// `None` disables the bound
    timeout: Option<Duration>,
    cache_bust: bool,
    next_revision: u64,
    outcomes_tx: mpsc::UnboundedSender<UploadOutcome>,
    outcomes_rx: mpsc::UnboundedReceiver<UploadOutcome>,
    in_flight: HashSet<PhotoId>,
    remote_deletes: JoinSet<()>,
}

impl UploadCoordinator {
    pub fn new(
        uploader: Arc<dyn UploadService>,
        deleter: Arc<dyn DeleteService>,
        config: &UploadConfig,
    ) -> Self {
        let (outcomes_tx, outcomes_rx) = mpsc::unbounded_channel();
        let timeout = Some(config.timeout()).filter(|t| !t.is_zero());

        Self {
            uploader,
            deleter,
            timeout,
            cache_bust: config.cache_bust,
            next_revision: 0,
            outcomes_tx,
            outcomes_rx,
            in_flight: HashSet::new(),
            remote_deletes: JoinSet::new(),
        }
    }

    /// Number of uploads whose outcome has not been applied yet
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    pub fn is_in_flight(&self, id: &PhotoId) -> bool {
        self.in_flight.contains(id)
    }

    /// Register a new photo and start uploading it in the background
    ///
    /// Must be called from within a Tokio runtime. Network failures never
    /// surface here; they resolve into the record's status later.
    pub fn begin_upload(
        &mut self,
        store: &mut PhotoStore,
        file: PhotoFile,
        size_key: &str,
    ) -> Result<PhotoRecord, UploadError> {
        validate_file(&file)?;
        if !store.is_selected(size_key) {
            return Err(StoreError::UnknownSize(size_key.to_string()).into());
        }

        let preview = store.issue_preview(&file);
        let mut record = PhotoRecord::new(PhotoId::generate(), size_key, preview, file.name.as_str());
        record.status = PhotoStatus::Uploading;

        if let Err(e) = store.add(record.clone()) {
            store.release_preview(&record.preview_url);
            return Err(e.into());
        }

        self.spawn_upload(UploadRequest {
            photo_id: record.id.clone(),
            size_key: size_key.to_string(),
            file,
        });

        Ok(record)
    }

    /// Start uploads for several files; refused files do not stop the rest
    pub fn begin_batch(
        &mut self,
        store: &mut PhotoStore,
        files: Vec<PhotoFile>,
        size_key: &str,
    ) -> BatchReport {
        let mut report = BatchReport::default();

        for file in files {
            let name = file.name.clone();
            match self.begin_upload(store, file, size_key) {
                Ok(record) => report.started.push(record),
                Err(e) => {
                    warn!(name = %name, size_key = %size_key, error = %e, "File skipped");
                    report.rejected.push((name, e));
                }
            }
        }

        report
    }

    /// Replace a failed or timed-out record with a fresh upload of `file`
    ///
    /// The old record is removed and its preview released; the new record is
    /// appended to the same size.
    pub fn retry(
        &mut self,
        store: &mut PhotoStore,
        id: &PhotoId,
        file: PhotoFile,
    ) -> Result<PhotoRecord, UploadError> {
        let record = store
            .get(id)
            .ok_or_else(|| UploadError::NotFound(id.clone()))?;

        if !record.status.is_retryable() {
            return Err(UploadError::NotRetryable {
                id: id.clone(),
                status: record.status.label().to_string(),
            });
        }

        let size_key = record.size_key().to_string();
        validate_file(&file)?;

        store.remove(id);
        let replacement = self.begin_upload(store, file, &size_key)?;

        info!(
            replaced = %id,
            photo_id = %replacement.id,
            size_key = %size_key,
            "Upload retried"
        );
        Ok(replacement)
    }

    /// Remove a photo locally and delete its server copy in the background
    ///
    /// Unknown ids are a no-op.
    pub fn delete(&mut self, store: &mut PhotoStore, id: &PhotoId) -> Option<PhotoRecord> {
        let record = store.remove(id)?;

        if let Some(server_id) = &record.server_id {
            self.spawn_remote_delete(server_id.clone());
        }

        debug!(
            photo_id = %id,
            in_flight = self.in_flight.contains(id),
            "Photo deleted"
        );
        Some(record)
    }

    /// Deselect a size, dropping its photos and their server copies
    pub fn drop_size(&mut self, store: &mut PhotoStore, size_key: &str) -> Vec<PhotoRecord> {
        let removed = store.remove_size(size_key);

        for server_id in removed.iter().filter_map(|r| r.server_id.clone()) {
            self.spawn_remote_delete(server_id);
        }

        removed
    }

    /// Remote deletions not yet reaped
    pub fn pending_deletes(&self) -> usize {
        self.remote_deletes.len()
    }

    /// Apply one finished upload to its record
    pub fn apply(&mut self, store: &mut PhotoStore, outcome: UploadOutcome) -> UploadResolution {
        let UploadOutcome { id, result } = outcome;
        self.in_flight.remove(&id);

        let record = match store.get_mut(&id) {
            Some(record) if record.status == PhotoStatus::Uploading => record,
            _ => {
                debug!(photo_id = %id, "Discarding upload result for removed photo");
                metrics::counter!("intake_stale_results_total").increment(1);

                // The server kept a copy nobody references any more
                if let Ok(uploaded) = result {
                    self.spawn_remote_delete(uploaded.id);
                }
                return UploadResolution::Stale { id };
            }
        };

        match result {
            Ok(uploaded) => {
                record.server_url = Some(uploaded.url);
                record.server_id = Some(uploaded.id);
                record.status = PhotoStatus::Uploaded;
                if self.cache_bust {
                    self.next_revision += 1;
                    record.revision = Some(self.next_revision);
                }

                let display_url = record.display_url().into_owned();
                info!(
                    photo_id = %id,
                    size_key = %record.size_key(),
                    url = %display_url,
                    "Photo uploaded"
                );
                metrics::counter!("intake_uploads_completed_total", "outcome" => "uploaded")
                    .increment(1);

                UploadResolution::Uploaded { id, display_url }
            }
            Err(ServiceError::TimedOut(after)) => {
                record.status = PhotoStatus::TimedOut;
                warn!(photo_id = %id, after = ?after, "Upload timed out");
                metrics::counter!("intake_uploads_completed_total", "outcome" => "timed_out")
                    .increment(1);

                UploadResolution::TimedOut { id }
            }
            Err(e) => {
                let reason = e.to_string();
                record.status = PhotoStatus::Failed {
                    reason: reason.clone(),
                };
                warn!(photo_id = %id, error = %e, "Upload failed");
                metrics::counter!("intake_uploads_completed_total", "outcome" => "failed")
                    .increment(1);

                UploadResolution::Failed { id, reason }
            }
        }
    }

    /// Wait for the next upload to finish and apply it
    ///
    /// Returns `None` when nothing is in flight.
    pub async fn next_resolution(&mut self, store: &mut PhotoStore) -> Option<UploadResolution> {
        if self.in_flight.is_empty() {
            return None;
        }
        let outcome = self.outcomes_rx.recv().await?;
        Some(self.apply(store, outcome))
    }

    /// Apply every upload that has already finished, without waiting
    pub fn drain_ready(&mut self, store: &mut PhotoStore) -> Vec<UploadResolution> {
        let mut resolutions = Vec::new();
        while let Ok(outcome) = self.outcomes_rx.try_recv() {
            resolutions.push(self.apply(store, outcome));
        }
        self.reap_deletes();
        resolutions
    }

    /// Wait until every in-flight upload has resolved
    pub async fn settle(&mut self, store: &mut PhotoStore) -> Vec<UploadResolution> {
        let mut resolutions = Vec::new();
        while let Some(resolution) = self.next_resolution(store).await {
            resolutions.push(resolution);
        }
        resolutions
    }

    /// Wait for background remote deletions to finish
    pub async fn flush_deletes(&mut self) {
        while self.remote_deletes.join_next().await.is_some() {}
    }

    fn spawn_upload(&mut self, request: UploadRequest) {
        let id = request.photo_id.clone();
        let uploader = self.uploader.clone();
        let tx = self.outcomes_tx.clone();
        let timeout = self.timeout;

        debug!(photo_id = %id, size_key = %request.size_key, "Upload started");
        metrics::counter!("intake_uploads_started_total").increment(1);
        self.in_flight.insert(id.clone());

        tokio::spawn(async move {
            let upload = AssertUnwindSafe(uploader.upload(request)).catch_unwind();

            let result = match timeout {
                Some(limit) => match tokio::time::timeout(limit, upload).await {
                    Ok(finished) => finished,
                    Err(_) => Ok(Err(ServiceError::TimedOut(limit))),
                },
                None => upload.await,
            };

            let result = result.unwrap_or_else(|_| {
                Err(ServiceError::Network("upload task panicked".to_string()))
            });

            // A closed channel means the session is gone
            let _ = tx.send(UploadOutcome { id, result });
        });
    }

    fn reap_deletes(&mut self) {
        while self.remote_deletes.try_join_next().is_some() {}
    }

    fn spawn_remote_delete(&mut self, server_id: String) {
        self.reap_deletes();

        let deleter = self.deleter.clone();
        let timeout = self.timeout.unwrap_or(Duration::from_secs(30));

        self.remote_deletes.spawn(async move {
            match tokio::time::timeout(timeout, deleter.delete(server_id.clone())).await {
                Ok(Ok(())) => debug!(server_id = %server_id, "Remote photo deleted"),
                Ok(Err(e)) => warn!(server_id = %server_id, error = %e, "Remote delete failed"),
                Err(_) => warn!(server_id = %server_id, "Remote delete timed out"),
            }
        });
    }
}

fn validate_file(file: &PhotoFile) -> Result<(), UploadError> {
    if file.is_image() {
        Ok(())
    } else {
        Err(UploadError::InvalidFileType {
            name: file.name.clone(),
            content_type: file.mime_type(),
        })
    }
}

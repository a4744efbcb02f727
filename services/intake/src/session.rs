//! Order session: the single state object the display layer talks to.
//!
//! The display layer sends [`Intent`]s, the session reduces them into state
//! and answers with [`SessionEvent`]s. After every change a fresh
//! [`SessionSnapshot`] is published on a watch channel, so subscribers can
//! re-render from state instead of tracking it themselves.

use crate::assembler::OrderAssembler;
use crate::config::Config;
use crate::photo::{PhotoFile, PhotoId, PhotoStatus};
use crate::photo_store::PhotoStore;
use crate::preview::PreviewUrl;
use crate::services::{SessionServices, SubmitService};
use crate::submission::{FlowPhase, OrderForm, OrderSummary, SubmissionFlow, SubmitReceipt};
use crate::upload_coordinator::{UploadCoordinator, UploadResolution};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info};

/// Editable order form field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FormField {
    OrderNumber,
    ReceiverName,
    Remark,
}

/// User action emitted by the display layer
#[derive(Debug, Clone)]
pub enum Intent {
    SelectSize(String),
    DeselectSize(String),
    UploadFiles {
        size_key: String,
        files: Vec<PhotoFile>,
    },
    DeleteRecord(PhotoId),
    RetryUpload {
        id: PhotoId,
        file: PhotoFile,
    },
    EditForm {
        field: FormField,
        value: String,
    },
    RequestSubmit,
    CancelSubmit,
    ConfirmSubmit,
    DismissResult,
}

/// What a dispatched intent (or a finished upload) changed
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    SizeSelected {
        size_key: String,
    },
    SizeDeselected {
        size_key: String,
        dropped: usize,
    },
    UploadStarted {
        id: PhotoId,
        size_key: String,
        preview_url: PreviewUrl,
    },
    FileRejected {
        name: String,
        message: String,
    },
    UploadResolved(UploadResolution),
    RetryRejected {
        id: PhotoId,
        message: String,
    },
    RecordDeleted {
        id: PhotoId,
    },
    FormUpdated {
        field: FormField,
    },
    SummaryReady(OrderSummary),
    SubmitRejected {
        message: String,
    },
    SubmitCancelled,
    Submitted(SubmitReceipt),
    SubmitFailed {
        message: String,
    },
    ResultDismissed,
}

/// One photo as the display layer should show it
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PhotoView {
    pub id: PhotoId,
    pub name: String,
    pub status: PhotoStatus,
    pub display_url: String,
    pub retryable: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SizeView {
    pub size_key: String,
    pub count: usize,
    pub photos: Vec<PhotoView>,
}

/// Read-only picture of the whole session
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SessionSnapshot {
    pub sizes: Vec<SizeView>,
    pub total: usize,
    pub uploading: usize,
    pub phase: FlowPhase,
    pub form: OrderForm,
    pub summary: Option<OrderSummary>,
    pub receipt: Option<SubmitReceipt>,
    pub last_error: Option<String>,
}

impl SessionSnapshot {
    pub fn size(&self, size_key: &str) -> Option<&SizeView> {
        self.sizes.iter().find(|s| s.size_key == size_key)
    }
}

pub struct OrderSession {
    store: PhotoStore,
    uploads: UploadCoordinator,
    flow: SubmissionFlow,
    form: OrderForm,
    assembler: OrderAssembler,
    submitter: Arc<dyn SubmitService>,
    snapshots: watch::Sender<SessionSnapshot>,
}

impl OrderSession {
    /// Must be created inside a Tokio runtime; uploads are spawned onto it
    pub fn new(services: SessionServices, config: &Config) -> Self {
        let (snapshots, _) = watch::channel(SessionSnapshot::default());

        let session = Self {
            store: PhotoStore::new(),
            uploads: UploadCoordinator::new(services.upload, services.delete, &config.upload),
            flow: SubmissionFlow::new(),
            form: OrderForm::default(),
            assembler: OrderAssembler::from_config(&config.assembly),
            submitter: services.submit,
            snapshots,
        };
        session.publish();
        session
    }

    /// Swap the grouping/pending policy used at submit time
    pub fn with_assembler(mut self, assembler: OrderAssembler) -> Self {
        self.assembler = assembler;
        self
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshots.subscribe()
    }

    pub fn store(&self) -> &PhotoStore {
        &self.store
    }

    pub fn flow(&self) -> &SubmissionFlow {
        &self.flow
    }

    pub fn form(&self) -> &OrderForm {
        &self.form
    }

    pub fn uploads_in_flight(&self) -> usize {
        self.uploads.in_flight()
    }

    /// Reduce one intent into session state
    pub async fn dispatch(&mut self, intent: Intent) -> Vec<SessionEvent> {
        // Apply uploads that finished in the meantime so the intent sees them
        let mut events = self.resolved_events();
        events.extend(self.reduce(intent).await);
        self.publish();
        events
    }

    /// Apply every upload that has already finished, without waiting
    pub fn pump(&mut self) -> Vec<SessionEvent> {
        let events = self.resolved_events();
        if !events.is_empty() {
            self.publish();
        }
        events
    }

    /// Wait for the next upload to finish; `None` when nothing is in flight
    pub async fn next_upload(&mut self) -> Option<SessionEvent> {
        let resolution = self.uploads.next_resolution(&mut self.store).await?;
        self.publish();
        Some(SessionEvent::UploadResolved(resolution))
    }

    /// Wait for every in-flight upload to resolve
    pub async fn settle(&mut self) -> Vec<SessionEvent> {
        let mut events = Vec::new();
        while let Some(event) = self.next_upload().await {
            events.push(event);
        }
        events
    }

    /// End the session, releasing every preview handle
    ///
    /// Pending remote deletions are awaited; in-flight uploads are abandoned
    /// and their results dropped.
    pub async fn teardown(mut self) -> usize {
        self.uploads.flush_deletes().await;
        let released = self.store.clear();
        self.publish();
        info!(released, "Order session closed");
        released
    }

    /// Build a snapshot of the current state
    pub fn snapshot(&self) -> SessionSnapshot {
        let sizes = self
            .store
            .selection()
            .iter()
            .map(|size_key| SizeView {
                size_key: size_key.to_string(),
                count: self.store.count_for(size_key),
                photos: self
                    .store
                    .bucket(size_key)
                    .into_iter()
                    .flat_map(|bucket| bucket.iter())
                    .map(|record| PhotoView {
                        id: record.id.clone(),
                        name: record.name.clone(),
                        status: record.status.clone(),
                        display_url: record.display_url().into_owned(),
                        retryable: record.status.is_retryable(),
                    })
                    .collect(),
            })
            .collect();

        SessionSnapshot {
            sizes,
            total: self.store.total_count(),
            uploading: self.uploads.in_flight(),
            phase: self.flow.phase(),
            form: self.form.clone(),
            summary: self.flow.summary().cloned(),
            receipt: self.flow.receipt().cloned(),
            last_error: self.flow.last_error().map(str::to_string),
        }
    }

    async fn reduce(&mut self, intent: Intent) -> Vec<SessionEvent> {
        match intent {
            Intent::SelectSize(size_key) => {
                if self.store.add_size(&size_key) {
                    vec![SessionEvent::SizeSelected { size_key }]
                } else {
                    Vec::new()
                }
            }
            Intent::DeselectSize(size_key) => {
                if !self.store.is_selected(&size_key) {
                    return Vec::new();
                }
                let dropped = self.uploads.drop_size(&mut self.store, &size_key).len();
                vec![SessionEvent::SizeDeselected { size_key, dropped }]
            }
            Intent::UploadFiles { size_key, files } => {
                let report = self.uploads.begin_batch(&mut self.store, files, &size_key);

                let started = report.started.into_iter().map(|record| {
                    SessionEvent::UploadStarted {
                        id: record.id,
                        size_key: size_key.clone(),
                        preview_url: record.preview_url,
                    }
                });
                let rejected = report
                    .rejected
                    .into_iter()
                    .map(|(name, e)| SessionEvent::FileRejected {
                        name,
                        message: e.user_message(),
                    });
                started.chain(rejected).collect()
            }
            Intent::DeleteRecord(id) => match self.uploads.delete(&mut self.store, &id) {
                Some(_) => vec![SessionEvent::RecordDeleted { id }],
                None => {
                    debug!(photo_id = %id, "Delete of unknown photo ignored");
                    Vec::new()
                }
            },
            Intent::RetryUpload { id, file } => {
                match self.uploads.retry(&mut self.store, &id, file) {
                    Ok(record) => {
                        let size_key = record.size_key().to_string();
                        vec![
                            SessionEvent::RecordDeleted { id },
                            SessionEvent::UploadStarted {
                                id: record.id,
                                size_key,
                                preview_url: record.preview_url,
                            },
                        ]
                    }
                    Err(e) => vec![SessionEvent::RetryRejected {
                        id,
                        message: e.user_message(),
                    }],
                }
            }
            Intent::EditForm { field, value } => {
                match field {
                    FormField::OrderNumber => self.form.order_number = value,
                    FormField::ReceiverName => self.form.receiver_name = value,
                    FormField::Remark => self.form.remark = value,
                }
                vec![SessionEvent::FormUpdated { field }]
            }
            Intent::RequestSubmit => match self.flow.request_confirm(&self.store, &self.form) {
                Ok(summary) => vec![SessionEvent::SummaryReady(summary)],
                Err(e) => vec![SessionEvent::SubmitRejected {
                    message: e.user_message(),
                }],
            },
            Intent::CancelSubmit => match self.flow.cancel() {
                Ok(()) => vec![SessionEvent::SubmitCancelled],
                Err(e) => vec![SessionEvent::SubmitRejected {
                    message: e.user_message(),
                }],
            },
            Intent::ConfirmSubmit => {
                if self.flow.phase() != FlowPhase::Confirming {
                    return vec![SessionEvent::SubmitRejected {
                        message: format!("Cannot submit while {}", self.flow.phase()),
                    }];
                }

                let result = self
                    .flow
                    .confirm(&self.store, &self.assembler, self.submitter.as_ref())
                    .await;
                match result {
                    Ok(receipt) => vec![SessionEvent::Submitted(receipt)],
                    Err(e) => vec![SessionEvent::SubmitFailed {
                        message: e.user_message(),
                    }],
                }
            }
            Intent::DismissResult => match self.flow.dismiss() {
                Ok(()) => vec![SessionEvent::ResultDismissed],
                Err(e) => vec![SessionEvent::SubmitRejected {
                    message: e.user_message(),
                }],
            },
        }
    }

    fn resolved_events(&mut self) -> Vec<SessionEvent> {
        self.uploads
            .drain_ready(&mut self.store)
            .into_iter()
            .map(SessionEvent::UploadResolved)
            .collect()
    }

    fn publish(&self) {
        self.snapshots.send_replace(self.snapshot());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::SimulatedBackend;

    fn session() -> (OrderSession, SimulatedBackend) {
        let backend = SimulatedBackend::instant();
        let session = OrderSession::new(
            SessionServices::from_backend(backend.clone()),
            &Config::default(),
        );
        (session, backend)
    }

    fn jpeg(name: &str) -> PhotoFile {
        PhotoFile::new(name, vec![0xFFu8, 0xD8, 0xFF])
    }

    async fn fill_form(session: &mut OrderSession) {
        session
            .dispatch(Intent::EditForm {
                field: FormField::OrderNumber,
                value: "SN-1001".to_string(),
            })
            .await;
        session
            .dispatch(Intent::EditForm {
                field: FormField::ReceiverName,
                value: "Ana".to_string(),
            })
            .await;
    }

    #[tokio::test]
    async fn test_snapshot_follows_uploads() {
        let (mut session, _) = session();
        let rx = session.subscribe();

        session
            .dispatch(Intent::SelectSize("4x6-full".to_string()))
            .await;
        let events = session
            .dispatch(Intent::UploadFiles {
                size_key: "4x6-full".to_string(),
                files: vec![jpeg("a.jpg"), jpeg("b.jpg")],
            })
            .await;
        assert_eq!(
            events
                .iter()
                .filter(|e| matches!(e, SessionEvent::UploadStarted { .. }))
                .count(),
            2
        );

        {
            let snapshot = rx.borrow();
            assert_eq!(snapshot.total, 2);
            assert_eq!(snapshot.uploading, 2);
            let view = snapshot.size("4x6-full").unwrap();
            assert!(view.photos[0].display_url.starts_with("blob:"));
        }

        let resolved = session.settle().await;
        assert_eq!(resolved.len(), 2);

        let snapshot = rx.borrow();
        assert_eq!(snapshot.uploading, 0);
        assert_eq!(snapshot.size("4x6-full").unwrap().count, 2);
        assert!(snapshot
            .size("4x6-full")
            .unwrap()
            .photos
            .iter()
            .all(|p| p.status == PhotoStatus::Uploaded && p.display_url.contains("?v=")));
    }

    #[tokio::test]
    async fn test_select_twice_emits_once() {
        let (mut session, _) = session();

        let first = session
            .dispatch(Intent::SelectSize("4x6-full".to_string()))
            .await;
        let second = session
            .dispatch(Intent::SelectSize("4x6-full".to_string()))
            .await;

        assert_eq!(first.len(), 1);
        assert!(second.is_empty());
        assert_eq!(session.snapshot().sizes.len(), 1);
    }

    #[tokio::test]
    async fn test_upload_to_unselected_size_is_rejected() {
        let (mut session, _) = session();

        let events = session
            .dispatch(Intent::UploadFiles {
                size_key: "4x6-full".to_string(),
                files: vec![jpeg("a.jpg")],
            })
            .await;

        assert!(matches!(events[0], SessionEvent::FileRejected { .. }));
        assert_eq!(session.store().total_count(), 0);
    }

    #[tokio::test]
    async fn test_submit_round_trip() {
        let (mut session, backend) = session();
        session
            .dispatch(Intent::SelectSize("4x6-full".to_string()))
            .await;
        session
            .dispatch(Intent::UploadFiles {
                size_key: "4x6-full".to_string(),
                files: vec![jpeg("a.jpg")],
            })
            .await;
        session.settle().await;
        fill_form(&mut session).await;

        let events = session.dispatch(Intent::RequestSubmit).await;
        match &events[..] {
            [SessionEvent::SummaryReady(summary)] => assert_eq!(summary.total, 1),
            other => panic!("unexpected events: {:?}", other),
        }
        assert_eq!(session.snapshot().phase, FlowPhase::Confirming);

        let events = session.dispatch(Intent::ConfirmSubmit).await;
        match &events[..] {
            [SessionEvent::Submitted(receipt)] => {
                assert_eq!(receipt.order_number, "SN-1001");
                assert_eq!(receipt.total, 1);
            }
            other => panic!("unexpected events: {:?}", other),
        }
        assert_eq!(session.snapshot().phase, FlowPhase::Succeeded);
        assert_eq!(backend.submissions().len(), 1);

        session.dispatch(Intent::DismissResult).await;
        assert_eq!(session.snapshot().phase, FlowPhase::Idle);
    }

    #[tokio::test]
    async fn test_failed_submit_can_be_resubmitted() {
        let (mut session, backend) = session();
        session
            .dispatch(Intent::SelectSize("4x6-full".to_string()))
            .await;
        session
            .dispatch(Intent::UploadFiles {
                size_key: "4x6-full".to_string(),
                files: vec![jpeg("a.jpg")],
            })
            .await;
        session.settle().await;
        fill_form(&mut session).await;
        backend.fail_next_submit("backend unavailable");

        let queued: Vec<(PhotoId, String)> = session
            .store()
            .records()
            .map(|r| (r.id.clone(), r.server_url.clone().unwrap()))
            .collect();

        session.dispatch(Intent::RequestSubmit).await;
        let events = session.dispatch(Intent::ConfirmSubmit).await;

        assert!(matches!(events[0], SessionEvent::SubmitFailed { .. }));
        let snapshot = session.snapshot();
        assert_eq!(snapshot.phase, FlowPhase::Idle);
        assert!(snapshot.last_error.is_some());
        assert_eq!(snapshot.form.order_number, "SN-1001");

        session.dispatch(Intent::RequestSubmit).await;
        let events = session.dispatch(Intent::ConfirmSubmit).await;
        assert!(matches!(events[0], SessionEvent::Submitted(_)));
        assert_eq!(backend.submissions().len(), 1);

        // Resubmission carries the same photos as the failed attempt
        let submitted: Vec<(PhotoId, String)> = backend.submissions()[0]
            .payload
            .photos
            .iter()
            .map(|p| (p.id.clone(), p.url.clone()))
            .collect();
        assert_eq!(submitted, queued);
        assert_eq!(backend.submissions()[0].order_sn, "SN-1001");
    }

    #[tokio::test]
    async fn test_retry_intent_replaces_failed_photo() {
        let (mut session, backend) = session();
        backend.fail_uploads_named("broken.jpg");
        session
            .dispatch(Intent::SelectSize("4x6-full".to_string()))
            .await;
        session
            .dispatch(Intent::UploadFiles {
                size_key: "4x6-full".to_string(),
                files: vec![jpeg("broken.jpg")],
            })
            .await;
        session.settle().await;

        let failed = session.store().records().next().unwrap().id.clone();
        let events = session
            .dispatch(Intent::RetryUpload {
                id: failed.clone(),
                file: jpeg("fixed.jpg"),
            })
            .await;

        assert_eq!(events.len(), 2);
        assert_eq!(events[0], SessionEvent::RecordDeleted { id: failed.clone() });
        match &events[1] {
            SessionEvent::UploadStarted { id, size_key, .. } => {
                assert_ne!(id, &failed);
                assert_eq!(size_key, "4x6-full");
            }
            other => panic!("unexpected event: {:?}", other),
        }

        session.settle().await;
        let snapshot = session.snapshot();
        assert_eq!(snapshot.total, 1);
        assert_eq!(
            snapshot.size("4x6-full").unwrap().photos[0].status,
            PhotoStatus::Uploaded
        );
    }

    #[tokio::test]
    async fn test_retry_intent_on_uploaded_photo_is_rejected() {
        let (mut session, _) = session();
        session
            .dispatch(Intent::SelectSize("4x6-full".to_string()))
            .await;
        session
            .dispatch(Intent::UploadFiles {
                size_key: "4x6-full".to_string(),
                files: vec![jpeg("a.jpg")],
            })
            .await;
        session.settle().await;

        let id = session.store().records().next().unwrap().id.clone();
        let events = session
            .dispatch(Intent::RetryUpload {
                id: id.clone(),
                file: jpeg("b.jpg"),
            })
            .await;

        assert!(matches!(&events[..], [SessionEvent::RetryRejected { id: rejected, .. }] if rejected == &id));
        assert!(session.store().contains(&id));
    }

    #[tokio::test]
    async fn test_deselect_deletes_uploaded_server_copies() {
        let (mut session, backend) = session();
        session
            .dispatch(Intent::SelectSize("4x6-full".to_string()))
            .await;
        session
            .dispatch(Intent::UploadFiles {
                size_key: "4x6-full".to_string(),
                files: vec![jpeg("a.jpg")],
            })
            .await;
        session.settle().await;
        let server_id = session
            .store()
            .records()
            .next()
            .and_then(|r| r.server_id.clone())
            .unwrap();

        session
            .dispatch(Intent::DeselectSize("4x6-full".to_string()))
            .await;
        session.teardown().await;

        assert_eq!(backend.deleted_ids(), vec![server_id]);
    }

    #[tokio::test]
    async fn test_confirm_without_review_is_rejected() {
        let (mut session, backend) = session();

        let events = session.dispatch(Intent::ConfirmSubmit).await;

        assert!(matches!(events[0], SessionEvent::SubmitRejected { .. }));
        assert!(backend.submissions().is_empty());
    }

    #[tokio::test]
    async fn test_request_submit_reports_missing_fields() {
        let (mut session, _) = session();
        session
            .dispatch(Intent::SelectSize("4x6-full".to_string()))
            .await;

        let events = session.dispatch(Intent::RequestSubmit).await;

        match &events[..] {
            [SessionEvent::SubmitRejected { message }] => {
                assert!(message.contains("order number"));
            }
            other => panic!("unexpected events: {:?}", other),
        }
        assert_eq!(session.snapshot().phase, FlowPhase::Idle);
    }

    #[tokio::test]
    async fn test_deselect_drops_photos() {
        let (mut session, _) = session();
        session
            .dispatch(Intent::SelectSize("4x6-full".to_string()))
            .await;
        session
            .dispatch(Intent::UploadFiles {
                size_key: "4x6-full".to_string(),
                files: vec![jpeg("a.jpg"), jpeg("b.jpg")],
            })
            .await;

        let events = session
            .dispatch(Intent::DeselectSize("4x6-full".to_string()))
            .await;

        assert!(events.contains(&SessionEvent::SizeDeselected {
            size_key: "4x6-full".to_string(),
            dropped: 2,
        }));
        assert_eq!(session.store().previews().outstanding(), 0);

        // Late results for the dropped photos change nothing
        session.settle().await;
        assert_eq!(session.snapshot().total, 0);
    }

    #[tokio::test]
    async fn test_teardown_releases_previews() {
        let (mut session, _) = session();
        session
            .dispatch(Intent::SelectSize("4x6-full".to_string()))
            .await;
        session
            .dispatch(Intent::UploadFiles {
                size_key: "4x6-full".to_string(),
                files: vec![jpeg("a.jpg"), jpeg("b.jpg")],
            })
            .await;

        assert_eq!(session.teardown().await, 2);
    }
}

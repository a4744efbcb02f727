//! Confirm → submit → result state machine.

use crate::assembler::{AssembleError, OrderAssembler};
use crate::photo_store::{PhotoStore, SizeSelection};
use crate::services::{ServiceError, SubmitRequest, SubmitService};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use thiserror::Error;
use tracing::{info, instrument, warn};

/// Errors surfaced by the submission flow
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SubmitError {
    #[error(transparent)]
    ValidationError(#[from] AssembleError),

    #[error("Cannot {action} while {phase}")]
    InvalidTransition {
        action: &'static str,
        phase: FlowPhase,
    },

    #[error("Order submission failed: {0}")]
    SubmitFailed(#[source] ServiceError),
}

impl SubmitError {
    pub fn user_message(&self) -> String {
        match self {
            SubmitError::ValidationError(e) => e.user_message(),
            SubmitError::InvalidTransition { .. } => self.to_string(),
            SubmitError::SubmitFailed(_) => {
                "Submitting the order failed. Please try again.".to_string()
            }
        }
    }
}

/// Editable order form fields
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct OrderForm {
    pub order_number: String,
    pub receiver_name: String,
    pub remark: String,
}

/// Snapshot of the form and active sizes taken for one submission attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OrderDraft {
    pub order_number: String,
    pub receiver_name: String,
    pub remark: String,
    pub sizes: Vec<String>,
}

impl OrderDraft {
    pub fn capture(form: &OrderForm, selection: &SizeSelection) -> Self {
        Self {
            order_number: form.order_number.clone(),
            receiver_name: form.receiver_name.clone(),
            remark: form.remark.clone(),
            sizes: selection.to_vec(),
        }
    }

    /// Order number and receiver are required; the remark is optional
    pub fn validate(&self) -> Result<(), AssembleError> {
        let mut missing = Vec::new();
        if self.order_number.trim().is_empty() {
            missing.push("order number");
        }
        if self.receiver_name.trim().is_empty() {
            missing.push("receiver");
        }

        if missing.is_empty() {
            Ok(())
        } else {
            Err(AssembleError::IncompleteForm { missing })
        }
    }
}

/// Per-size line of the confirmation summary
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SummaryLine {
    pub size_key: String,
    pub count: usize,
}

/// Human-readable review shown before the order is sent
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OrderSummary {
    pub order_number: String,
    pub receiver_name: String,
    pub remark: String,
    pub lines: Vec<SummaryLine>,
    pub total: usize,
}

impl OrderSummary {
    pub fn build(draft: &OrderDraft, store: &PhotoStore) -> Self {
        let lines: Vec<SummaryLine> = draft
            .sizes
            .iter()
            .map(|size_key| SummaryLine {
                size_key: size_key.clone(),
                count: store.count_for(size_key),
            })
            .filter(|line| line.count > 0)
            .collect();

        Self {
            order_number: draft.order_number.trim().to_string(),
            receiver_name: draft.receiver_name.trim().to_string(),
            remark: draft.remark.clone(),
            total: lines.iter().map(|line| line.count).sum(),
            lines,
        }
    }
}

impl fmt::Display for OrderSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Order number: {}", self.order_number)?;
        writeln!(f, "Receiver: {}", self.receiver_name)?;
        if !self.remark.trim().is_empty() {
            writeln!(f, "Remark: {}", self.remark.trim())?;
        }
        writeln!(f, "Sizes:")?;
        for line in &self.lines {
            writeln!(f, "  {}: {} photo(s)", line.size_key, line.count)?;
        }
        write!(f, "Total: {} photo(s)", self.total)
    }
}

/// Outcome of a successful submission
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubmitReceipt {
    pub order_number: String,
    pub receiver_name: String,
    /// Photo total reported by the service, else the locally counted one
    pub total: usize,
    pub submitted_at: DateTime<Utc>,
}

/// Coarse flow state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowPhase {
    #[default]
    Idle,
    Confirming,
    Submitting,
    Succeeded,
}

impl fmt::Display for FlowPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            FlowPhase::Idle => "idle",
            FlowPhase::Confirming => "confirming",
            FlowPhase::Submitting => "submitting",
            FlowPhase::Succeeded => "showing a result",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FlowState {
    Idle,
    Confirming {
        draft: OrderDraft,
        summary: OrderSummary,
    },
    Submitting {
        draft: OrderDraft,
    },
    Succeeded(SubmitReceipt),
}

/// `Idle -> Confirming -> Submitting -> {Succeeded, Failed} -> Idle`
///
/// A failed submission lands back in `Idle` immediately; its draft and error
/// message stay available so the user can resubmit unchanged.
#[derive(Debug)]
pub struct SubmissionFlow {
    state: FlowState,
    retained_draft: Option<OrderDraft>,
    last_error: Option<String>,
}

impl SubmissionFlow {
    pub fn new() -> Self {
        Self {
            state: FlowState::Idle,
            retained_draft: None,
            last_error: None,
        }
    }

    pub fn state(&self) -> &FlowState {
        &self.state
    }

    pub fn phase(&self) -> FlowPhase {
        match self.state {
            FlowState::Idle => FlowPhase::Idle,
            FlowState::Confirming { .. } => FlowPhase::Confirming,
            FlowState::Submitting { .. } => FlowPhase::Submitting,
            FlowState::Succeeded(_) => FlowPhase::Succeeded,
        }
    }

    pub fn summary(&self) -> Option<&OrderSummary> {
        match &self.state {
            FlowState::Confirming { summary, .. } => Some(summary),
            _ => None,
        }
    }

    pub fn receipt(&self) -> Option<&SubmitReceipt> {
        match &self.state {
            FlowState::Succeeded(receipt) => Some(receipt),
            _ => None,
        }
    }

    /// Draft of the last failed attempt
    pub fn retained_draft(&self) -> Option<&OrderDraft> {
        self.retained_draft.as_ref()
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// `Idle -> Confirming`: snapshot the form and build the review summary
    pub fn request_confirm(
        &mut self,
        store: &PhotoStore,
        form: &OrderForm,
    ) -> Result<OrderSummary, SubmitError> {
        self.expect_phase(FlowPhase::Idle, "review the order")?;

        let draft = OrderDraft::capture(form, store.selection());
        if let Err(e) = draft.validate() {
            self.last_error = Some(e.user_message());
            return Err(e.into());
        }
        if store.total_count() == 0 {
            let e = AssembleError::NoPhotos;
            self.last_error = Some(e.user_message());
            return Err(e.into());
        }

        let summary = OrderSummary::build(&draft, store);
        self.last_error = None;
        self.state = FlowState::Confirming {
            draft,
            summary: summary.clone(),
        };
        Ok(summary)
    }

    /// `Confirming -> Idle`
    pub fn cancel(&mut self) -> Result<(), SubmitError> {
        self.expect_phase(FlowPhase::Confirming, "cancel")?;
        self.state = FlowState::Idle;
        Ok(())
    }

    /// `Confirming -> Submitting -> Succeeded | Idle`
    #[instrument(skip_all)]
    pub async fn confirm(
        &mut self,
        store: &PhotoStore,
        assembler: &OrderAssembler,
        service: &dyn SubmitService,
    ) -> Result<SubmitReceipt, SubmitError> {
        let draft = match std::mem::replace(&mut self.state, FlowState::Idle) {
            FlowState::Confirming { draft, .. } => draft,
            other => {
                self.state = other;
                return Err(SubmitError::InvalidTransition {
                    action: "submit",
                    phase: self.phase(),
                });
            }
        };

        let payload = match assembler.assemble(store, &draft) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(error = %e, "Order could not be assembled");
                self.fail(draft, e.user_message());
                return Err(e.into());
            }
        };

        let local_total = payload.photo_count();
        let request = SubmitRequest::new(&draft, payload);
        self.state = FlowState::Submitting {
            draft: draft.clone(),
        };

        match service.submit(request).await {
            Ok(response) => {
                let total = response
                    .total
                    .map(|t| t as usize)
                    .unwrap_or(local_total);

                let receipt = SubmitReceipt {
                    order_number: draft.order_number.trim().to_string(),
                    receiver_name: draft.receiver_name.trim().to_string(),
                    total,
                    submitted_at: Utc::now(),
                };

                info!(
                    order_sn = %receipt.order_number,
                    total = receipt.total,
                    "Order submitted"
                );
                metrics::counter!("intake_submissions_total", "outcome" => "succeeded")
                    .increment(1);

                self.retained_draft = None;
                self.last_error = None;
                self.state = FlowState::Succeeded(receipt.clone());
                Ok(receipt)
            }
            Err(e) => {
                warn!(error = %e, order_sn = %draft.order_number, "Order submission failed");
                metrics::counter!("intake_submissions_total", "outcome" => "failed").increment(1);

                let error = SubmitError::SubmitFailed(e);
                self.fail(draft, error.user_message());
                Err(error)
            }
        }
    }

    /// `Succeeded -> Idle` once the result has been shown
    pub fn dismiss(&mut self) -> Result<(), SubmitError> {
        self.expect_phase(FlowPhase::Succeeded, "dismiss the result")?;
        self.state = FlowState::Idle;
        Ok(())
    }

    fn fail(&mut self, draft: OrderDraft, message: String) {
        self.retained_draft = Some(draft);
        self.last_error = Some(message);
        self.state = FlowState::Idle;
    }

    fn expect_phase(&self, expected: FlowPhase, action: &'static str) -> Result<(), SubmitError> {
        let phase = self.phase();
        if phase == expected {
            Ok(())
        } else {
            Err(SubmitError::InvalidTransition { action, phase })
        }
    }
}

impl Default for SubmissionFlow {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::photo::{PhotoFile, PhotoId, PhotoRecord, PhotoStatus};
    use crate::services::{MockSubmitService, SubmitResponse};

    fn form() -> OrderForm {
        OrderForm {
            order_number: "ORD1".to_string(),
            receiver_name: "Alice".to_string(),
            remark: "matte please".to_string(),
        }
    }

    fn store_with_photos(count: usize) -> PhotoStore {
        let mut store = PhotoStore::new();
        store.add_size("4x6-full");
        for i in 0..count {
            let name = format!("{}.jpg", i);
            let preview = store.issue_preview(&PhotoFile::new(name.as_str(), vec![0u8]));
            let mut record = PhotoRecord::new(PhotoId::generate(), "4x6-full", preview, name.as_str());
            record.server_url = Some(format!("https://cdn.test/{}", name));
            record.status = PhotoStatus::Uploaded;
            store.add(record).unwrap();
        }
        store
    }

    #[test]
    fn test_request_confirm_builds_summary() {
        let store = store_with_photos(2);
        let mut flow = SubmissionFlow::new();

        let summary = flow.request_confirm(&store, &form()).unwrap();

        assert_eq!(summary.total, 2);
        assert_eq!(
            summary.lines,
            vec![SummaryLine {
                size_key: "4x6-full".to_string(),
                count: 2
            }]
        );
        assert!(summary.to_string().contains("4x6-full: 2 photo(s)"));
        assert!(summary.to_string().contains("Remark: matte please"));
        assert_eq!(flow.phase(), FlowPhase::Confirming);
    }

    #[test]
    fn test_request_confirm_validation_keeps_idle() {
        let mut flow = SubmissionFlow::new();

        let empty = store_with_photos(0);
        assert_eq!(
            flow.request_confirm(&empty, &form()).unwrap_err(),
            SubmitError::ValidationError(AssembleError::NoPhotos)
        );
        assert_eq!(flow.phase(), FlowPhase::Idle);

        let store = store_with_photos(1);
        let mut incomplete = form();
        incomplete.order_number.clear();
        assert!(matches!(
            flow.request_confirm(&store, &incomplete),
            Err(SubmitError::ValidationError(AssembleError::IncompleteForm { .. }))
        ));
        assert_eq!(flow.phase(), FlowPhase::Idle);
        assert!(flow.last_error().is_some());
    }

    #[test]
    fn test_cancel_returns_to_idle() {
        let store = store_with_photos(1);
        let mut flow = SubmissionFlow::new();

        assert!(matches!(
            flow.cancel(),
            Err(SubmitError::InvalidTransition { .. })
        ));

        flow.request_confirm(&store, &form()).unwrap();
        flow.cancel().unwrap();
        assert_eq!(flow.phase(), FlowPhase::Idle);
    }

    #[tokio::test]
    async fn test_confirm_uses_service_total() {
        let store = store_with_photos(2);
        let mut flow = SubmissionFlow::new();
        let mut service = MockSubmitService::new();
        service
            .expect_submit()
            .withf(|request: &SubmitRequest| {
                request.order_sn == "ORD1" && request.payload.photo_count() == 2
            })
            .times(1)
            .returning(|_| {
                Ok(SubmitResponse {
                    total: Some(5),
                    ..Default::default()
                })
            });

        flow.request_confirm(&store, &form()).unwrap();
        let receipt = flow
            .confirm(&store, &OrderAssembler::default(), &service)
            .await
            .unwrap();

        assert_eq!(receipt.total, 5);
        assert_eq!(receipt.receiver_name, "Alice");
        assert_eq!(flow.phase(), FlowPhase::Succeeded);

        flow.dismiss().unwrap();
        assert_eq!(flow.phase(), FlowPhase::Idle);
    }

    #[tokio::test]
    async fn test_confirm_falls_back_to_local_total() {
        let store = store_with_photos(3);
        let mut flow = SubmissionFlow::new();
        let mut service = MockSubmitService::new();
        service
            .expect_submit()
            .returning(|_| Ok(SubmitResponse::default()));

        flow.request_confirm(&store, &form()).unwrap();
        let receipt = flow
            .confirm(&store, &OrderAssembler::default(), &service)
            .await
            .unwrap();

        assert_eq!(receipt.total, 3);
    }

    #[tokio::test]
    async fn test_failed_submit_retains_draft() {
        let store = store_with_photos(1);
        let mut flow = SubmissionFlow::new();
        let mut service = MockSubmitService::new();
        service
            .expect_submit()
            .times(1)
            .returning(|_| Err(ServiceError::Network("connection reset".to_string())));

        flow.request_confirm(&store, &form()).unwrap();
        let err = flow
            .confirm(&store, &OrderAssembler::default(), &service)
            .await
            .unwrap_err();

        assert!(matches!(err, SubmitError::SubmitFailed(_)));
        assert_eq!(flow.phase(), FlowPhase::Idle);
        let retained = flow.retained_draft().unwrap();
        assert_eq!(retained.order_number, "ORD1");
        assert_eq!(retained.receiver_name, "Alice");
        assert_eq!(retained.remark, "matte please");
        assert!(flow.last_error().is_some());
    }

    #[tokio::test]
    async fn test_confirm_without_review_is_rejected() {
        let store = store_with_photos(1);
        let mut flow = SubmissionFlow::new();
        let service = MockSubmitService::new();

        let err = flow
            .confirm(&store, &OrderAssembler::default(), &service)
            .await
            .unwrap_err();

        assert_eq!(
            err,
            SubmitError::InvalidTransition {
                action: "submit",
                phase: FlowPhase::Idle
            }
        );
    }
}

//! Photo Intake
//!
//! Session core for a photo-print order form. A user selects print sizes,
//! uploads photos per size, reviews a summary and submits the order. This
//! crate tracks the per-size photo collections through asynchronous upload,
//! delete and retry, keeps counts and previews consistent while that happens,
//! and reshapes the collected photos into a grouped submission payload.
//!
//! ## Features
//!
//! - **Immediate previews**: every picked file gets a local preview handle
//!   before its upload starts; handles are released on delete, deselect and
//!   teardown
//! - **Order-independent uploads**: background uploads resolve by photo id,
//!   with a stale-result guard for photos deleted mid-flight and a timeout
//! - **Pluggable grouping**: the size-to-group mapping is a trait, so the
//!   payload can follow whatever scheme the submit service expects
//! - **Explicit state**: the display layer sends intents and renders from
//!   published snapshots
//!
//! ## Architecture
//!
//! ```text
//!  Display layer                     OrderSession
//! ┌──────────────┐  Intent     ┌────────────────────────────────────┐
//! │ size toggles │────────────▶│ ┌──────────────┐  ┌──────────────┐ │
//! │ file picks   │             │ │ Upload       │─▶│ Photo        │ │
//! │ order form   │             │ │ Coordinator  │  │ Store        │ │
//! └──────────────┘             │ └──────────────┘  └──────────────┘ │
//!        ▲                     │        │                 │         │
//!        │  SessionSnapshot    │        │                 ▼         │
//!        └─────────────────────│        │          ┌──────────────┐ │
//!             (watch)          │        │          │ Submission   │ │
//!                              │        │          │ Flow         │ │
//!                              │        │          └──────────────┘ │
//!                              └────────┼─────────────────┼─────────┘
//!                                       ▼                 ▼
//!                              ┌──────────────┐   ┌──────────────┐
//!                              │ upload /     │   │ submit       │
//!                              │ delete API   │   │ API          │
//!                              └──────────────┘   └──────────────┘
//! ```

pub mod assembler;
pub mod config;
pub mod photo;
pub mod photo_store;
pub mod preview;
pub mod services;
pub mod session;
pub mod submission;
pub mod upload_coordinator;

pub use assembler::{
    AssembleError, DimensionVariantGrouping, GroupKey, GroupKeyPolicy, OrderAssembler,
    PendingUploadPolicy, SizeLabelGrouping, SubmissionPayload,
};
pub use config::Config;
pub use photo::{PhotoFile, PhotoId, PhotoRecord, PhotoStatus};
pub use photo_store::{PhotoStore, SizeSelection, StoreError};
pub use preview::{PreviewRegistry, PreviewUrl};
pub use services::{
    DeleteService, HttpBackend, ServiceError, SessionServices, SimulatedBackend, SubmitService,
    UploadService,
};
pub use session::{FormField, Intent, OrderSession, SessionEvent, SessionSnapshot};
pub use submission::{OrderDraft, OrderForm, OrderSummary, SubmissionFlow, SubmitError, SubmitReceipt};
pub use upload_coordinator::{UploadCoordinator, UploadError, UploadResolution};

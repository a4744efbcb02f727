use anyhow::{Context, Result};
use photo_intake::{
    Config, FormField, Intent, OrderSession, PhotoFile, SessionEvent, SessionServices,
};
use tracing::{info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load().context("Failed to load configuration")?;

    // Initialize logging
    init_tracing(&config.service.log_level);

    info!(
        service = %config.service.name,
        backend = ?config.backend.mode,
        "Starting photo intake session"
    );

    let services =
        SessionServices::from_config(&config.backend).context("Failed to initialize backend")?;
    let mut session = OrderSession::new(services, &config);

    // Stand-in for the display layer: re-render on every published snapshot
    let mut snapshots = session.subscribe();
    let watcher = tokio::spawn(async move {
        while snapshots.changed().await.is_ok() {
            let snapshot = snapshots.borrow_and_update().clone();
            info!(
                total = snapshot.total,
                uploading = snapshot.uploading,
                phase = ?snapshot.phase,
                "Session updated"
            );
        }
    });

    run_demo(&mut session).await;

    let released = session.teardown().await;
    info!(released, "Previews released");

    // Sender is gone after teardown, which ends the watcher
    if let Err(e) = watcher.await {
        warn!(error = %e, "Snapshot watcher failed");
    }

    info!("Photo intake session stopped");

    Ok(())
}

/// Scripted order: two sizes, one refused file, review and submit
async fn run_demo(session: &mut OrderSession) {
    let script = vec![
        Intent::SelectSize("4x6-full".to_string()),
        Intent::SelectSize("5x7-space".to_string()),
        Intent::UploadFiles {
            size_key: "4x6-full".to_string(),
            files: vec![
                PhotoFile::new("beach.jpg", demo_bytes()),
                PhotoFile::new("sunset.jpg", demo_bytes()),
                PhotoFile::new("notes.txt", b"not a photo".to_vec()),
            ],
        },
        Intent::UploadFiles {
            size_key: "5x7-space".to_string(),
            files: vec![PhotoFile::new("family.png", demo_bytes())],
        },
    ];

    for intent in script {
        log_events(session.dispatch(intent).await);
    }

    log_events(session.settle().await);

    let form = [
        (FormField::OrderNumber, "SN-20240601-001"),
        (FormField::ReceiverName, "Sam Doe"),
        (FormField::Remark, "Matte finish please"),
    ];
    for (field, value) in form {
        session
            .dispatch(Intent::EditForm {
                field,
                value: value.to_string(),
            })
            .await;
    }

    log_events(session.dispatch(Intent::RequestSubmit).await);
    if let Some(summary) = session.flow().summary() {
        info!(summary = %summary, "Order review");
    }

    log_events(session.dispatch(Intent::ConfirmSubmit).await);
    log_events(session.dispatch(Intent::DismissResult).await);
}

fn log_events(events: Vec<SessionEvent>) {
    for event in events {
        match event {
            SessionEvent::FileRejected { name, message } => {
                warn!(name = %name, message = %message, "File refused")
            }
            SessionEvent::SubmitRejected { message } | SessionEvent::SubmitFailed { message } => {
                warn!(message = %message, "Submission not accepted")
            }
            SessionEvent::Submitted(receipt) => info!(
                order_sn = %receipt.order_number,
                total = receipt.total,
                submitted_at = %receipt.submitted_at,
                "Order accepted"
            ),
            other => info!(event = ?other, "Session event"),
        }
    }
}

/// Minimal JPEG start-of-image marker standing in for real file content
fn demo_bytes() -> Vec<u8> {
    vec![0xFF, 0xD8, 0xFF, 0xE0]
}

/// Initialize tracing/logging
fn init_tracing(log_level: &str) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().json())
        .init();
}

use std::sync::Arc;

use sd_queue::config::ServiceConfig;
use sd_queue::events::{EventBus, EventSink};
use sd_queue::logging::{self, ErrorCapture};
use sd_queue::resource::UnlinkedBackend;
use sd_queue::{QueueService, panic_hook};
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables before reading configuration
    dotenvy::dotenv().ok();

    let config = ServiceConfig::from_env_or_default();

    let capture = Arc::new(ErrorCapture::new(&config.error_capture));
    let (logging_config, _log_guard) = logging::init_logging(&config.log_dir, capture.clone())?;
    panic_hook::install();

    let shutdown_token = CancellationToken::new();
    logging_config.start_retention_cleanup(shutdown_token.child_token());

    info!(
        state_file = %config.state_file.display(),
        output_dir = %config.output_dir.display(),
        models_dir = %config.models_dir.display(),
        log_filter = %logging_config.get_filter(),
        "Starting sd-queue"
    );

    let bus = Arc::new(EventBus::new());
    spawn_event_logger(&bus, shutdown_token.child_token());
    let events: Arc<dyn EventSink> = bus;
    let service =
        QueueService::start_with_error_capture(config, UnlinkedBackend, events, capture).await?;

    let recovery = service.recovery();
    if recovery.quarantined {
        warn!("Previous state file was unreadable and has been set aside");
    }
    info!(
        loaded = recovery.loaded,
        requeued = recovery.requeued,
        interrupted = recovery.interrupted,
        "Queue state recovered"
    );

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    shutdown_token.cancel();
    service.shutdown().await;

    Ok(())
}

/// Mirror queue events into the debug log.
fn spawn_event_logger(bus: &EventBus, cancel_token: CancellationToken) {
    let mut rx = bus.subscribe();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel_token.cancelled() => break,
                received = rx.recv() => match received {
                    Ok(event) => debug!(
                        event = event.event_type(),
                        job_id = event.job_id().unwrap_or("-"),
                        "Queue event"
                    ),
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Event logger lagged behind");
                    }
                    Err(RecvError::Closed) => break,
                },
            }
        }
    });
}

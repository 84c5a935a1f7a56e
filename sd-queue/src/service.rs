//! Service façade wiring the queue, resources, worker and background tasks.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::config::ServiceConfig;
use crate::events::{EventSink, QueueEvent};
use crate::logging::ErrorCapture;
use crate::queue::{
    Job, JobKind, JobQueue, LINKED_OUTPUT_PLACEHOLDER, NewJob, QueueWorker, RecoveryReport,
    RetentionService, StatePersister,
};
use crate::resource::{Backend, ModelParams, ResourceManager, UpscalerParams};
use crate::utils::fs;
use crate::{Error, Result};

/// Running queue service.
pub struct QueueService<B: Backend> {
    config: ServiceConfig,
    queue: Arc<JobQueue>,
    resources: Arc<ResourceManager<B>>,
    worker: QueueWorker<B>,
    recovery: RecoveryReport,
    cancellation_token: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl<B: Backend> QueueService<B> {
    /// Start the service with a private error capture.
    ///
    /// The capture is not attached to any subscriber, so failed jobs carry
    /// only the backend's own error. Use [`Self::start_with_error_capture`]
    /// with a capture fed by [`crate::logging::ErrorCaptureLayer`] to include
    /// logged backend errors.
    pub async fn start(config: ServiceConfig, backend: B, events: Arc<dyn EventSink>) -> Result<Self> {
        let errors = Arc::new(ErrorCapture::new(&config.error_capture));
        Self::start_with_error_capture(config, backend, events, errors).await
    }

    /// Start the service.
    ///
    /// Loads and recovers the state file before the worker starts, then
    /// spawns the worker, the retention sweeper and the heartbeat.
    pub async fn start_with_error_capture(
        config: ServiceConfig,
        backend: B,
        events: Arc<dyn EventSink>,
        errors: Arc<ErrorCapture>,
    ) -> Result<Self> {
        fs::ensure_dir_all_sync_with_op("creating output directory", &config.output_dir)?;
        fs::ensure_dir_all_sync_with_op("creating models directory", &config.models_dir)?;

        let queue = Arc::new(JobQueue::new(
            StatePersister::new(&config.state_file),
            events.clone(),
        ));
        let recovery = {
            let queue = queue.clone();
            tokio::task::spawn_blocking(move || queue.recover())
                .await
                .map_err(|e| Error::Other(format!("state recovery task failed: {}", e)))??
        };

        let resources = Arc::new(ResourceManager::new(
            Arc::new(backend),
            config.models_dir.clone(),
            events.clone(),
        ));

        let worker = QueueWorker::new(
            queue.clone(),
            resources.clone(),
            errors,
            config.relay.clone(),
            config.output_dir.clone(),
            config.models_dir.clone(),
        );
        worker.start();

        let cancellation_token = CancellationToken::new();
        let mut tasks = Vec::new();
        tasks.push(
            RetentionService::new(config.retention.clone(), queue.clone())
                .start_background_task(cancellation_token.child_token()),
        );
        if config.heartbeat_interval_secs > 0 {
            tasks.push(spawn_heartbeat(
                Duration::from_secs(config.heartbeat_interval_secs),
                queue.clone(),
                resources.clone(),
                events,
                cancellation_token.child_token(),
            ));
        }

        info!(
            state_file = %config.state_file.display(),
            requeued = recovery.requeued,
            interrupted = recovery.interrupted,
            "Queue service started"
        );

        Ok(Self {
            config,
            queue,
            resources,
            worker,
            recovery,
            cancellation_token,
            tasks: Mutex::new(tasks),
        })
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    pub fn queue(&self) -> &Arc<JobQueue> {
        &self.queue
    }

    pub fn resources(&self) -> &Arc<ResourceManager<B>> {
        &self.resources
    }

    /// What startup recovery found in the state file.
    pub fn recovery(&self) -> &RecoveryReport {
        &self.recovery
    }

    // ========================================================================
    // Submission
    // ========================================================================

    /// Submit a job, recording the currently loaded model for model jobs.
    pub fn submit(&self, kind: JobKind, parameters: Value) -> Result<Job> {
        let mut new_job = NewJob::new(kind, parameters);
        if kind.uses_model_context()
            && let Some(snapshot) = self.resources.model_snapshot()
        {
            new_job = new_job.with_resource_snapshot(snapshot);
        }
        self.queue.submit(new_job)
    }

    /// Submit a model download plus a hash job for the downloaded file.
    ///
    /// The hash job is linked to the download: it hashes the download's first
    /// output, and fails without running if the download fails.
    pub fn submit_download(&self, parameters: Value) -> Result<(Job, Job)> {
        let download = self.queue.submit(NewJob::new(JobKind::DownloadModel, parameters))?;
        let hash = self.queue.submit(
            NewJob::new(
                JobKind::HashModel,
                serde_json::json!({ "model": LINKED_OUTPUT_PLACEHOLDER }),
            )
            .with_linked_id(&download.id),
        )?;
        Ok((download, hash))
    }

    // ========================================================================
    // Resource lifecycle (blocking calls moved off the runtime)
    // ========================================================================

    pub async fn load_model(&self, params: ModelParams) -> Result<()> {
        let resources = self.resources.clone();
        tokio::task::spawn_blocking(move || resources.load(params))
            .await
            .map_err(|e| Error::Backend(format!("model load task failed: {}", e)))?
    }

    pub async fn unload_model(&self) -> Result<bool> {
        let resources = self.resources.clone();
        tokio::task::spawn_blocking(move || resources.unload())
            .await
            .map_err(|e| Error::Backend(format!("model unload task failed: {}", e)))
    }

    pub async fn load_upscaler(&self, params: UpscalerParams) -> Result<()> {
        let resources = self.resources.clone();
        tokio::task::spawn_blocking(move || resources.load_upscaler(params))
            .await
            .map_err(|e| Error::Backend(format!("upscaler load task failed: {}", e)))?
    }

    pub async fn unload_upscaler(&self) -> Result<bool> {
        let resources = self.resources.clone();
        tokio::task::spawn_blocking(move || resources.unload_upscaler())
            .await
            .map_err(|e| Error::Backend(format!("upscaler unload task failed: {}", e)))
    }

    // ========================================================================
    // Shutdown
    // ========================================================================

    /// Stop background tasks, let the running job finish, and persist.
    pub async fn shutdown(&self) {
        info!("Shutting down queue service");
        self.cancellation_token.cancel();

        self.worker.stop().await;

        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                error!(error = %e, "Background task ended abnormally");
            }
        }

        let queue = self.queue.clone();
        if let Err(e) = tokio::task::spawn_blocking(move || queue.flush()).await {
            error!(error = %e, "Final state flush failed");
        }
        info!("Queue service stopped");
    }

    pub fn is_shutting_down(&self) -> bool {
        self.cancellation_token.is_cancelled()
    }
}

/// Publish `server-status` periodically. Reads only atomics and short locks.
fn spawn_heartbeat<B: Backend>(
    period: Duration,
    queue: Arc<JobQueue>,
    resources: Arc<ResourceManager<B>>,
    events: Arc<dyn EventSink>,
    cancellation_token: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancellation_token.cancelled() => {
                    debug!("Heartbeat task shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    events.publish(QueueEvent::ServerStatus {
                        queue: queue.stats(),
                        resources: resources.status(),
                        timestamp: Utc::now(),
                    });
                }
            }
        }
    })
}

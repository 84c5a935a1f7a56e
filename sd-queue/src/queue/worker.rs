//! The single worker that runs jobs against the resource manager.
//!
//! Lock discipline: the job mutex is only taken for short bookkeeping calls on
//! [`JobQueue`]. Compute runs on a blocking thread while holding the relevant
//! context mutex, and never touches the job mutex except through the relay's
//! progress updates (context mutex first, job mutex second, never the reverse).

use std::any::Any;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::job::{Job, JobKind};
use super::job_queue::JobQueue;
use super::relay::{ProgressRelay, RelayConfig};
use crate::logging::ErrorCapture;
use crate::resource::{Backend, ComputeRequest, ResourceManager};
use crate::{Error, Result};

/// Everything a compute call needs, shared with the blocking thread.
struct WorkerContext<B: Backend> {
    queue: Arc<JobQueue>,
    resources: Arc<ResourceManager<B>>,
    errors: Arc<ErrorCapture>,
    relay: RelayConfig,
    output_dir: PathBuf,
    models_dir: PathBuf,
}

impl<B: Backend> WorkerContext<B> {
    /// Run the kind-specific compute call. Blocks.
    fn execute(&self, job: &Job) -> Result<Vec<String>> {
        let relay = ProgressRelay::new(&job.id, self.queue.clone(), &self.relay);
        let request = ComputeRequest {
            job_id: &job.id,
            kind: job.kind,
            parameters: &job.parameters,
            output_dir: &self.output_dir,
            models_dir: &self.models_dir,
        };
        let backend = self.resources.backend();

        let outputs = match job.kind {
            JobKind::GenerateImage | JobKind::GenerateImageFromImage | JobKind::GenerateVideo => {
                self.resources
                    .with_context(|model| backend.generate(model, &request, &relay))??
            }
            JobKind::Upscale => self
                .resources
                .with_upscaler(|upscaler| backend.upscale(upscaler, &request, &relay))??,
            JobKind::Convert => backend.convert(&request, &relay)?,
            JobKind::DownloadModel => backend.download(&request, &relay)?,
            JobKind::HashModel => {
                let model = job
                    .parameters
                    .get("model")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| Error::validation("hash_model: missing 'model' parameter"))?;
                vec![self.resources.compute_hash(model)?]
            }
        };
        Ok(outputs)
    }

    /// Failure text: backend errors captured during the run, else the error itself.
    fn failure_message(&self, started: Instant, err: &Error) -> String {
        let captured = self.errors.messages_since(started);
        if captured.is_empty() {
            match err {
                Error::Backend(message) => message.clone(),
                other => other.to_string(),
            }
        } else {
            captured.join("; ")
        }
    }

    async fn process(self: &Arc<Self>, job: Job) {
        let job_id = job.id.clone();
        let kind = job.kind;
        let started = Instant::now();

        let ctx = self.clone();
        let result = tokio::task::spawn_blocking(move || ctx.execute(&job)).await;

        let outcome = match result {
            Ok(Ok(outputs)) => {
                debug!(job_id = %job_id, kind = %kind, outputs = outputs.len(), "Compute finished");
                Ok(outputs)
            }
            Ok(Err(e)) => {
                let message = self.failure_message(started, &e);
                warn!(job_id = %job_id, kind = %kind, error = %message, "Compute failed");
                Err(message)
            }
            Err(join_error) => {
                let message = if join_error.is_panic() {
                    format!("compute panicked: {}", panic_message(join_error.into_panic()))
                } else {
                    format!("compute task aborted: {}", join_error)
                };
                error!(job_id = %job_id, kind = %kind, error = %message, "Compute crashed");
                Err(message)
            }
        };

        // Recording the outcome writes the state file.
        let queue = self.queue.clone();
        let id = job_id.clone();
        let recorded = tokio::task::spawn_blocking(move || match outcome {
            Ok(outputs) => queue.complete(&id, outputs),
            Err(message) => queue.fail(&id, message),
        })
        .await;

        match recorded {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => error!(job_id = %job_id, error = %e, "Failed to record job outcome"),
            Err(e) => error!(job_id = %job_id, error = %e, "Outcome recording task failed"),
        }
    }

    /// Start the next runnable job on the blocking pool.
    ///
    /// Not raced against cancellation, so a job that was started is never dropped.
    async fn start_next(self: &Arc<Self>) -> Option<Job> {
        let ctx = self.clone();
        match tokio::task::spawn_blocking(move || {
            ctx.queue.try_start_next(ctx.resources.model_snapshot())
        })
        .await
        {
            Ok(job) => job,
            Err(e) => {
                error!(error = %e, "Job start task failed");
                None
            }
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Handle to the worker task.
pub struct QueueWorker<B: Backend> {
    context: Arc<WorkerContext<B>>,
    cancellation_token: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl<B: Backend> QueueWorker<B> {
    pub fn new(
        queue: Arc<JobQueue>,
        resources: Arc<ResourceManager<B>>,
        errors: Arc<ErrorCapture>,
        relay: RelayConfig,
        output_dir: impl Into<PathBuf>,
        models_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            context: Arc::new(WorkerContext {
                queue,
                resources,
                errors,
                relay,
                output_dir: output_dir.into(),
                models_dir: models_dir.into(),
            }),
            cancellation_token: CancellationToken::new(),
            task: Mutex::new(None),
        }
    }

    /// Start the worker loop. Calling it again while running is a no-op.
    pub fn start(&self) {
        let mut task = self.task.lock();
        if task.is_some() {
            warn!("Queue worker already started");
            return;
        }

        let ctx = self.context.clone();
        let cancellation_token = self.cancellation_token.clone();

        *task = Some(tokio::spawn(async move {
            info!("Queue worker started");
            while !cancellation_token.is_cancelled() {
                if let Some(job) = ctx.start_next().await {
                    // Not raced against cancellation: a started job always gets an outcome.
                    ctx.process(job).await;
                    continue;
                }

                tokio::select! {
                    _ = cancellation_token.cancelled() => break,
                    _ = ctx.queue.wait_for_work() => {}
                }
            }
            info!("Queue worker stopped");
        }));
    }

    /// Stop polling for jobs and wait for the current one to finish.
    pub async fn stop(&self) {
        self.cancellation_token.cancel();

        let task = self.task.lock().take();
        if let Some(task) = task
            && let Err(e) = task.await
        {
            error!(error = %e, "Queue worker task ended abnormally");
        }
    }

    pub fn is_running(&self) -> bool {
        self.task.lock().is_some() && !self.cancellation_token.is_cancelled()
    }
}

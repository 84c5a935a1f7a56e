//! Shared fixtures for the queue integration tests.
//!
//! `MockBackend` is driven entirely by job parameters:
//! - `steps`: number of progress callbacks to emit (default 4)
//! - `hold_ms`: sleep before returning, to keep a job in Processing
//! - `fail`: log the value on the `sd_backend` target and return an error
//! - `panic`: panic inside the compute call
//! - `name` / `content`: file name and body written by `download_model`

#![allow(dead_code)]

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use parking_lot::Mutex;
use sd_queue::config::ServiceConfig;
use sd_queue::events::{EventSink, QueueEvent};
use sd_queue::logging::{ErrorCapture, ErrorCaptureConfig, ErrorCaptureLayer};
use sd_queue::queue::{Job, JobQueue, JobStatus, RelayConfig, RetentionConfig};
use sd_queue::resource::{
    Backend, BackendError, ComputeCallbacks, ComputeRequest, ModelParams, PreviewFrame,
    UpscalerParams,
};
use serde_json::Value;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Process-wide error capture, installed once per test binary.
pub fn error_capture() -> Arc<ErrorCapture> {
    static CAPTURE: OnceLock<Arc<ErrorCapture>> = OnceLock::new();
    CAPTURE
        .get_or_init(|| {
            let capture = Arc::new(ErrorCapture::new(&ErrorCaptureConfig::default()));
            let _ = tracing_subscriber::registry()
                .with(ErrorCaptureLayer::new(capture.clone()))
                .try_init();
            capture
        })
        .clone()
}

/// Event sink that keeps everything it receives.
#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<QueueEvent>>,
}

impl RecordingSink {
    pub fn events(&self) -> Vec<QueueEvent> {
        self.events.lock().clone()
    }

    /// Statuses announced for `job_id`, in publish order.
    pub fn statuses_for(&self, job_id: &str) -> Vec<JobStatus> {
        self.events
            .lock()
            .iter()
            .filter_map(|event| match event {
                QueueEvent::JobStatusChanged { job_id: id, status, .. } if id == job_id => {
                    Some(*status)
                }
                _ => None,
            })
            .collect()
    }

    /// Job ids in the order they were announced as Processing.
    pub fn processing_order(&self) -> Vec<String> {
        self.events
            .lock()
            .iter()
            .filter_map(|event| match event {
                QueueEvent::JobStatusChanged {
                    job_id,
                    status: JobStatus::Processing,
                    ..
                } => Some(job_id.clone()),
                _ => None,
            })
            .collect()
    }
}

impl EventSink for RecordingSink {
    fn publish(&self, event: QueueEvent) {
        self.events.lock().push(event);
    }
}

/// Scriptable stand-in for the generation library.
#[derive(Debug, Default)]
pub struct MockBackend;

impl MockBackend {
    fn run(
        &self,
        request: &ComputeRequest<'_>,
        callbacks: &dyn ComputeCallbacks,
    ) -> Result<(), BackendError> {
        let params = request.parameters;
        if let Some(ms) = params.get("hold_ms").and_then(Value::as_u64) {
            std::thread::sleep(Duration::from_millis(ms));
        }
        if params.get("panic").and_then(Value::as_bool) == Some(true) {
            panic!("mock backend exploded");
        }
        if let Some(message) = params.get("fail").and_then(Value::as_str) {
            tracing::error!(target: "sd_backend", "{}", message);
            return Err(BackendError::new("generation failed"));
        }

        let steps = params.get("steps").and_then(Value::as_u64).unwrap_or(4) as u32;
        for step in 1..=steps {
            callbacks.on_step(step, steps);
            if step == steps {
                callbacks.on_preview(&PreviewFrame {
                    step,
                    width: 8,
                    height: 8,
                    mime: "image/jpeg".to_string(),
                    data: vec![0xff, 0xd8, 0xff],
                });
            }
        }
        Ok(())
    }

    fn write_output(request: &ComputeRequest<'_>, ext: &str) -> Result<Vec<String>, BackendError> {
        let path = request.output_dir.join(format!("{}.{}", request.job_id, ext));
        std::fs::write(&path, request.job_id).map_err(|e| BackendError::new(e.to_string()))?;
        Ok(vec![path.display().to_string()])
    }
}

impl Backend for MockBackend {
    type Model = String;
    type Upscaler = String;

    fn load_model(
        &self,
        params: &ModelParams,
        on_progress: &dyn Fn(u32, u32),
    ) -> Result<Self::Model, BackendError> {
        if params.model.contains("missing") {
            tracing::error!(target: "sd_backend", "failed to open {}", params.model);
            return Err(BackendError::new("model file not found"));
        }
        for step in 1..=3 {
            on_progress(step, 3);
        }
        Ok(params.model.clone())
    }

    fn load_upscaler(&self, params: &UpscalerParams) -> Result<Self::Upscaler, BackendError> {
        Ok(params.model.clone())
    }

    fn generate(
        &self,
        _model: &mut Self::Model,
        request: &ComputeRequest<'_>,
        callbacks: &dyn ComputeCallbacks,
    ) -> Result<Vec<String>, BackendError> {
        self.run(request, callbacks)?;
        Self::write_output(request, "png")
    }

    fn upscale(
        &self,
        _upscaler: &mut Self::Upscaler,
        request: &ComputeRequest<'_>,
        callbacks: &dyn ComputeCallbacks,
    ) -> Result<Vec<String>, BackendError> {
        self.run(request, callbacks)?;
        Self::write_output(request, "png")
    }

    fn convert(
        &self,
        request: &ComputeRequest<'_>,
        callbacks: &dyn ComputeCallbacks,
    ) -> Result<Vec<String>, BackendError> {
        self.run(request, callbacks)?;
        Self::write_output(request, "gguf")
    }

    fn download(
        &self,
        request: &ComputeRequest<'_>,
        callbacks: &dyn ComputeCallbacks,
    ) -> Result<Vec<String>, BackendError> {
        self.run(request, callbacks)?;
        let name = request
            .parameters
            .get("name")
            .and_then(Value::as_str)
            .unwrap_or("downloaded.safetensors");
        let content = request
            .parameters
            .get("content")
            .and_then(Value::as_str)
            .unwrap_or_default();
        std::fs::write(request.models_dir.join(name), content)
            .map_err(|e| BackendError::new(e.to_string()))?;
        Ok(vec![name.to_string()])
    }
}

/// Config rooted in `dir` with the heartbeat off and no throttling.
pub fn test_config(dir: &tempfile::TempDir) -> ServiceConfig {
    ServiceConfig::default()
        .with_state_file(dir.path().join("state").join("queue_state.json"))
        .with_output_dir(dir.path().join("output"))
        .with_models_dir(dir.path().join("models"))
        .with_heartbeat_interval_secs(0)
        .with_retention(RetentionConfig::default().with_check_interval_secs(3600))
        .with_relay(RelayConfig {
            progress_interval_ms: 0,
            preview_interval_ms: 0,
            ..Default::default()
        })
}

/// Poll until `job_id` reaches a terminal status.
pub async fn wait_for_terminal(queue: &JobQueue, job_id: &str) -> Job {
    wait_for(queue, job_id, |job| job.status.is_terminal()).await
}

/// Poll until `job_id` satisfies `done`, failing the test after 10 seconds.
pub async fn wait_for(queue: &JobQueue, job_id: &str, done: impl Fn(&Job) -> bool) -> Job {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let job = queue.get_job(job_id).expect("job should exist");
        if done(&job) {
            return job;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting on job {} (status {})",
            job_id,
            job.status
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

//! Lifecycle events published to external observers.
//!
//! The queue core never depends on delivery: publishing is fire-and-forget
//! and a sink with no subscribers simply drops events.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::queue::{JobKind, JobStatus, QueueStats};
use crate::resource::ResourceStatus;

/// Events emitted by the queue, worker and resource manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum QueueEvent {
    JobAdded {
        job_id: String,
        kind: JobKind,
        sequence: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        linked_id: Option<String>,
    },
    JobStatusChanged {
        job_id: String,
        status: JobStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        outputs: Vec<String>,
    },
    JobProgress {
        job_id: String,
        step: u32,
        total: u32,
    },
    JobPreview {
        job_id: String,
        step: u32,
        width: u32,
        height: u32,
        mime: String,
        /// Base64-encoded image bytes.
        image: String,
    },
    JobCancelled {
        job_id: String,
        /// True when the job was already running; its compute call is not interrupted.
        was_processing: bool,
    },
    ModelLoadingProgress {
        step: u32,
        total: u32,
    },
    ModelLoaded {
        model: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        architecture: Option<String>,
    },
    ModelLoadFailed {
        model: String,
        error: String,
    },
    ModelUnloaded {
        model: String,
    },
    UpscalerLoaded {
        model: String,
    },
    UpscalerUnloaded {
        model: String,
    },
    ServerStatus {
        queue: QueueStats,
        resources: ResourceStatus,
        timestamp: DateTime<Utc>,
    },
}

impl QueueEvent {
    /// Wire name of the event, as used in the `type` tag.
    pub fn event_type(&self) -> &'static str {
        match self {
            QueueEvent::JobAdded { .. } => "job-added",
            QueueEvent::JobStatusChanged { .. } => "job-status-changed",
            QueueEvent::JobProgress { .. } => "job-progress",
            QueueEvent::JobPreview { .. } => "job-preview",
            QueueEvent::JobCancelled { .. } => "job-cancelled",
            QueueEvent::ModelLoadingProgress { .. } => "model-loading-progress",
            QueueEvent::ModelLoaded { .. } => "model-loaded",
            QueueEvent::ModelLoadFailed { .. } => "model-load-failed",
            QueueEvent::ModelUnloaded { .. } => "model-unloaded",
            QueueEvent::UpscalerLoaded { .. } => "upscaler-loaded",
            QueueEvent::UpscalerUnloaded { .. } => "upscaler-unloaded",
            QueueEvent::ServerStatus { .. } => "server-status",
        }
    }

    /// Job the event refers to, if any.
    pub fn job_id(&self) -> Option<&str> {
        match self {
            QueueEvent::JobAdded { job_id, .. }
            | QueueEvent::JobStatusChanged { job_id, .. }
            | QueueEvent::JobProgress { job_id, .. }
            | QueueEvent::JobPreview { job_id, .. }
            | QueueEvent::JobCancelled { job_id, .. } => Some(job_id),
            _ => None,
        }
    }
}

/// Destination for [`QueueEvent`]s.
///
/// Implementations must return quickly: `publish` is called from the compute
/// thread for progress events and while the queue is mutating state.
pub trait EventSink: Send + Sync + 'static {
    fn publish(&self, event: QueueEvent);
}

/// Sink that discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSink;

impl EventSink for NoopSink {
    fn publish(&self, _event: QueueEvent) {}
}

/// Broadcast-channel backed sink for in-process subscribers (e.g. a WebSocket relay).
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<QueueEvent>,
}

impl EventBus {
    /// Create a new bus with default capacity (1024).
    pub fn new() -> Self {
        Self::with_capacity(1024)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventSink for EventBus {
    fn publish(&self, event: QueueEvent) {
        // Ignore errors - just means no subscribers currently
        let _ = self.sender.send(event);
    }
}

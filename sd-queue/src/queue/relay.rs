//! Progress/preview relay.
//!
//! The backend reports every step (and periodically a preview image) from
//! its own thread. The relay records progress on the job and forwards a
//! throttled subset to the event sink. Publishing never waits on consumers.

use std::sync::Arc;
use std::time::{Duration, Instant};

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use super::job_queue::JobQueue;
use crate::events::{EventSink, QueueEvent};
use crate::resource::{ComputeCallbacks, PreviewFrame};

/// How the backend renders preview images.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum PreviewMode {
    /// No previews.
    None,
    /// Cheap approximate decode.
    #[default]
    Fast,
    /// Full decode through the VAE.
    Full,
}

/// Preview settings handed to the backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreviewSettings {
    #[serde(default)]
    pub mode: PreviewMode,
    /// Encoder quality, 1..=100.
    #[serde(default = "default_preview_quality")]
    pub quality: u8,
    /// Produce a preview every N steps.
    #[serde(default = "default_preview_interval_steps")]
    pub interval_steps: u32,
}

fn default_preview_quality() -> u8 {
    75
}

fn default_preview_interval_steps() -> u32 {
    1
}

impl Default for PreviewSettings {
    fn default() -> Self {
        Self {
            mode: PreviewMode::default(),
            quality: default_preview_quality(),
            interval_steps: default_preview_interval_steps(),
        }
    }
}

/// Configuration for the relay.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Minimum spacing between forwarded progress events.
    #[serde(default = "default_interval_ms")]
    pub progress_interval_ms: u64,
    /// Minimum spacing between forwarded preview events.
    #[serde(default = "default_interval_ms")]
    pub preview_interval_ms: u64,
    #[serde(default)]
    pub preview: PreviewSettings,
}

fn default_interval_ms() -> u64 {
    200
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            progress_interval_ms: default_interval_ms(),
            preview_interval_ms: default_interval_ms(),
            preview: PreviewSettings::default(),
        }
    }
}

/// Lets one event through per interval.
#[derive(Debug)]
pub struct Throttle {
    interval: Duration,
    last: Mutex<Option<Instant>>,
}

impl Throttle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: Mutex::new(None),
        }
    }

    /// Whether an event may pass now. The first call always passes.
    pub fn should_emit(&self) -> bool {
        self.should_emit_at(Instant::now())
    }

    fn should_emit_at(&self, now: Instant) -> bool {
        let mut last = self.last.lock();
        match *last {
            Some(previous) if now.saturating_duration_since(previous) < self.interval => false,
            _ => {
                *last = Some(now);
                true
            }
        }
    }
}

/// Callbacks for one job's compute call.
pub struct ProgressRelay {
    job_id: String,
    queue: Arc<JobQueue>,
    events: Arc<dyn EventSink>,
    progress: Throttle,
    preview: Throttle,
    preview_settings: PreviewSettings,
}

impl ProgressRelay {
    pub fn new(job_id: impl Into<String>, queue: Arc<JobQueue>, config: &RelayConfig) -> Self {
        let events = queue.events().clone();
        Self {
            job_id: job_id.into(),
            queue,
            events,
            progress: Throttle::new(Duration::from_millis(config.progress_interval_ms)),
            preview: Throttle::new(Duration::from_millis(config.preview_interval_ms)),
            preview_settings: config.preview.clone(),
        }
    }
}

impl ComputeCallbacks for ProgressRelay {
    fn on_step(&self, step: u32, total: u32) {
        if !self.queue.update_progress(&self.job_id, step, total) {
            return;
        }

        let is_final = total > 0 && step >= total;
        if is_final || self.progress.should_emit() {
            self.events.publish(QueueEvent::JobProgress {
                job_id: self.job_id.clone(),
                step,
                total,
            });
        }
    }

    fn on_preview(&self, frame: &PreviewFrame) {
        if self.preview_settings.mode == PreviewMode::None || frame.data.is_empty() {
            return;
        }
        if !self.preview.should_emit() {
            return;
        }

        self.events.publish(QueueEvent::JobPreview {
            job_id: self.job_id.clone(),
            step: frame.step,
            width: frame.width,
            height: frame.height,
            mime: frame.mime.clone(),
            image: STANDARD.encode(&frame.data),
        });
    }

    fn preview_settings(&self) -> PreviewSettings {
        self.preview_settings.clone()
    }
}

//! Recent backend error capture.
//!
//! The generation backend reports most of its diagnostics through `tracing`
//! rather than through the error it eventually returns. [`ErrorCaptureLayer`]
//! copies ERROR events from the backend's targets into a small time-windowed
//! ring buffer so a failed job can carry the real cause.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::Layer;

/// Configuration for [`ErrorCapture`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorCaptureConfig {
    /// How long a captured message stays relevant.
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
    /// Maximum number of retained messages.
    #[serde(default = "default_capacity")]
    pub capacity: usize,
    /// Only events whose target starts with this prefix are captured.
    #[serde(default = "default_target_prefix")]
    pub target_prefix: String,
}

fn default_window_secs() -> u64 {
    30
}

fn default_capacity() -> usize {
    32
}

fn default_target_prefix() -> String {
    "sd_backend".to_string()
}

impl Default for ErrorCaptureConfig {
    fn default() -> Self {
        Self {
            window_secs: default_window_secs(),
            capacity: default_capacity(),
            target_prefix: default_target_prefix(),
        }
    }
}

#[derive(Debug, Clone)]
struct CapturedError {
    at: Instant,
    message: String,
}

/// Ring buffer of recent backend error strings.
#[derive(Debug)]
pub struct ErrorCapture {
    window: Duration,
    capacity: usize,
    target_prefix: String,
    entries: Mutex<VecDeque<CapturedError>>,
}

impl ErrorCapture {
    pub fn new(config: &ErrorCaptureConfig) -> Self {
        Self {
            window: Duration::from_secs(config.window_secs),
            capacity: config.capacity.max(1),
            target_prefix: config.target_prefix.clone(),
            entries: Mutex::new(VecDeque::with_capacity(config.capacity.max(1))),
        }
    }

    /// Whether events from `target` belong to the backend.
    pub fn accepts_target(&self, target: &str) -> bool {
        target.starts_with(&self.target_prefix)
    }

    /// Record a message observed now.
    pub fn record(&self, message: impl Into<String>) {
        self.record_at(Instant::now(), message.into());
    }

    fn record_at(&self, at: Instant, message: String) {
        let mut entries = self.entries.lock();
        if entries.len() == self.capacity {
            entries.pop_front();
        }
        entries.push_back(CapturedError { at, message });
    }

    /// Messages recorded at or after `since` that are still inside the window.
    pub fn messages_since(&self, since: Instant) -> Vec<String> {
        let now = Instant::now();
        let entries = self.entries.lock();
        entries
            .iter()
            .filter(|e| e.at >= since && now.saturating_duration_since(e.at) <= self.window)
            .map(|e| e.message.clone())
            .collect()
    }

    /// Messages still inside the window.
    pub fn recent(&self) -> Vec<String> {
        let now = Instant::now();
        let since = now.checked_sub(self.window).unwrap_or(now);
        self.messages_since(since)
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}

/// `tracing` layer feeding backend ERROR events into an [`ErrorCapture`].
pub struct ErrorCaptureLayer {
    capture: Arc<ErrorCapture>,
}

impl ErrorCaptureLayer {
    pub fn new(capture: Arc<ErrorCapture>) -> Self {
        Self { capture }
    }
}

impl<S> Layer<S> for ErrorCaptureLayer
where
    S: Subscriber,
{
    fn on_event(&self, event: &Event<'_>, _ctx: tracing_subscriber::layer::Context<'_, S>) {
        let metadata = event.metadata();
        if *metadata.level() != Level::ERROR || !self.capture.accepts_target(metadata.target()) {
            return;
        }

        let mut message = String::new();
        event.record(&mut MessageVisitor(&mut message));
        if !message.is_empty() {
            self.capture.record(message);
        }
    }
}

/// Visitor to extract the message field from a tracing event.
struct MessageVisitor<'a>(&'a mut String);

impl tracing::field::Visit for MessageVisitor<'_> {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            *self.0 = format!("{:?}", value);
        } else if self.0.is_empty() {
            *self.0 = format!("{}: {:?}", field.name(), value);
        }
    }

    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        if field.name() == "message" || self.0.is_empty() {
            *self.0 = value.to_string();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_subscriber::layer::SubscriberExt;

    fn capture(capacity: usize) -> ErrorCapture {
        ErrorCapture::new(&ErrorCaptureConfig {
            capacity,
            ..Default::default()
        })
    }

    #[test]
    fn test_capacity_drops_oldest() {
        let capture = capture(2);
        capture.record("a");
        capture.record("b");
        capture.record("c");
        assert_eq!(capture.recent(), vec!["b".to_string(), "c".to_string()]);
    }

    #[test]
    fn test_messages_since_filters_older_entries() {
        let capture = capture(8);
        capture.record("before");
        let mark = Instant::now();
        std::thread::sleep(Duration::from_millis(2));
        capture.record("after");
        assert_eq!(capture.messages_since(mark), vec!["after".to_string()]);
    }

    #[test]
    fn test_window_expires_entries() {
        let capture = capture(8);
        let old = Instant::now()
            .checked_sub(Duration::from_secs(120))
            .unwrap_or_else(Instant::now);
        capture.record_at(old, "stale".to_string());
        capture.record("fresh");
        assert_eq!(capture.recent(), vec!["fresh".to_string()]);
    }

    #[test]
    fn test_layer_captures_backend_errors_only() {
        let capture = Arc::new(capture(8));
        let subscriber =
            tracing_subscriber::registry().with(ErrorCaptureLayer::new(capture.clone()));

        tracing::subscriber::with_default(subscriber, || {
            tracing::error!(target: "sd_backend::vae", "VAE decode ran out of memory");
            tracing::warn!(target: "sd_backend::vae", "tiling disabled");
            tracing::error!(target: "sd_queue::worker", "unrelated");
        });

        assert_eq!(capture.recent(), vec!["VAE decode ran out of memory".to_string()]);
    }
}

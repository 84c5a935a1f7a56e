//! Service configuration.
//!
//! [`ServiceConfig`] bundles every knob the queue core consumes. Values come
//! from defaults, optionally overridden by `SDQ_*` environment variables
//! (see [`ServiceConfig::from_env_or_default`]).

use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::logging::ErrorCaptureConfig;
use crate::queue::{PreviewMode, RelayConfig, RetentionConfig};

/// Top-level configuration for [`QueueService`](crate::service::QueueService).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Durable location of the persisted job map.
    #[serde(default = "default_state_file")]
    pub state_file: PathBuf,
    /// Directory generated artifacts are written to.
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    /// Directory model names are resolved against.
    #[serde(default = "default_models_dir")]
    pub models_dir: PathBuf,
    /// Directory for rotated log files.
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    /// Soft-delete retention window and sweep cadence.
    #[serde(default)]
    pub retention: RetentionConfig,
    /// Progress/preview throttling.
    #[serde(default)]
    pub relay: RelayConfig,
    /// Recent backend error capture.
    #[serde(default)]
    pub error_capture: ErrorCaptureConfig,
    /// Seconds between `server-status` heartbeats. 0 disables the heartbeat.
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,
}

fn default_state_file() -> PathBuf {
    PathBuf::from("data/queue_state.json")
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("output")
}

fn default_models_dir() -> PathBuf {
    PathBuf::from("models")
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

fn default_heartbeat_interval_secs() -> u64 {
    5
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            state_file: default_state_file(),
            output_dir: default_output_dir(),
            models_dir: default_models_dir(),
            log_dir: default_log_dir(),
            retention: RetentionConfig::default(),
            relay: RelayConfig::default(),
            error_capture: ErrorCaptureConfig::default(),
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
        }
    }
}

impl ServiceConfig {
    pub fn with_state_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.state_file = path.into();
        self
    }

    pub fn with_output_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.output_dir = path.into();
        self
    }

    pub fn with_models_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.models_dir = path.into();
        self
    }

    pub fn with_retention(mut self, retention: RetentionConfig) -> Self {
        self.retention = retention;
        self
    }

    pub fn with_relay(mut self, relay: RelayConfig) -> Self {
        self.relay = relay;
        self
    }

    pub fn with_heartbeat_interval_secs(mut self, secs: u64) -> Self {
        self.heartbeat_interval_secs = secs;
        self
    }

    /// Load config from environment variables, falling back to defaults.
    ///
    /// Supported env vars:
    /// - `SDQ_STATE_FILE`, `SDQ_OUTPUT_DIR`, `SDQ_MODELS_DIR`, `SDQ_LOG_DIR`
    /// - `SDQ_RETENTION_SECS`, `SDQ_PURGE_INTERVAL_SECS`
    /// - `SDQ_PROGRESS_THROTTLE_MS`, `SDQ_PREVIEW_THROTTLE_MS`
    /// - `SDQ_PREVIEW_MODE` (`none`, `fast`, `full`), `SDQ_PREVIEW_QUALITY`, `SDQ_PREVIEW_EVERY`
    /// - `SDQ_HEARTBEAT_SECS`
    pub fn from_env_or_default() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env_or_default`](Self::from_env_or_default) with an injectable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(path) = non_empty(lookup("SDQ_STATE_FILE")) {
            config.state_file = PathBuf::from(path);
        }
        if let Some(path) = non_empty(lookup("SDQ_OUTPUT_DIR")) {
            config.output_dir = PathBuf::from(path);
        }
        if let Some(path) = non_empty(lookup("SDQ_MODELS_DIR")) {
            config.models_dir = PathBuf::from(path);
        }
        if let Some(path) = non_empty(lookup("SDQ_LOG_DIR")) {
            config.log_dir = PathBuf::from(path);
        }

        if let Some(secs) = parse_var(&lookup, "SDQ_RETENTION_SECS") {
            config.retention.retention_secs = secs;
        }
        if let Some(secs) = parse_var(&lookup, "SDQ_PURGE_INTERVAL_SECS") {
            config.retention.check_interval_secs = secs;
        }
        if let Some(ms) = parse_var(&lookup, "SDQ_PROGRESS_THROTTLE_MS") {
            config.relay.progress_interval_ms = ms;
        }
        if let Some(ms) = parse_var(&lookup, "SDQ_PREVIEW_THROTTLE_MS") {
            config.relay.preview_interval_ms = ms;
        }
        if let Some(mode) = parse_var::<PreviewMode>(&lookup, "SDQ_PREVIEW_MODE") {
            config.relay.preview.mode = mode;
        }
        if let Some(quality) = parse_var::<u8>(&lookup, "SDQ_PREVIEW_QUALITY") {
            config.relay.preview.quality = quality.clamp(1, 100);
        }
        if let Some(every) = parse_var::<u32>(&lookup, "SDQ_PREVIEW_EVERY") {
            config.relay.preview.interval_steps = every.max(1);
        }
        if let Some(secs) = parse_var(&lookup, "SDQ_HEARTBEAT_SECS") {
            config.heartbeat_interval_secs = secs;
        }

        config
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

fn parse_var<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = non_empty(lookup(key))?;
    match raw.trim().parse::<T>() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(key, value = %raw, "Ignoring invalid configuration value");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = ServiceConfig::default();
        assert_eq!(config.state_file, PathBuf::from("data/queue_state.json"));
        assert_eq!(config.relay.progress_interval_ms, 200);
        assert_eq!(config.relay.preview_interval_ms, 200);
        assert_eq!(config.retention.retention_secs, 86_400);
        assert_eq!(config.heartbeat_interval_secs, 5);
    }

    #[test]
    fn test_env_overrides() {
        let config = ServiceConfig::from_lookup(lookup_from(&[
            ("SDQ_STATE_FILE", "/var/lib/sdq/state.json"),
            ("SDQ_RETENTION_SECS", "60"),
            ("SDQ_PROGRESS_THROTTLE_MS", "500"),
            ("SDQ_PREVIEW_MODE", "none"),
            ("SDQ_PREVIEW_QUALITY", "250"),
        ]));

        assert_eq!(config.state_file, PathBuf::from("/var/lib/sdq/state.json"));
        assert_eq!(config.retention.retention_secs, 60);
        assert_eq!(config.relay.progress_interval_ms, 500);
        assert_eq!(config.relay.preview.mode, PreviewMode::None);
        assert_eq!(config.relay.preview.quality, 100);
    }

    #[test]
    fn test_invalid_values_keep_defaults() {
        let config = ServiceConfig::from_lookup(lookup_from(&[
            ("SDQ_RETENTION_SECS", "soon"),
            ("SDQ_PREVIEW_MODE", "sometimes"),
            ("SDQ_OUTPUT_DIR", "   "),
        ]));

        assert_eq!(config.retention.retention_secs, 86_400);
        assert_eq!(config.relay.preview.mode, PreviewMode::Fast);
        assert_eq!(config.output_dir, PathBuf::from("output"));
    }

    #[test]
    fn test_deserialize_partial_json_uses_defaults() {
        let config: ServiceConfig =
            serde_json::from_str(r#"{"state_file": "s.json", "retention": {"retention_secs": 10}}"#)
                .unwrap();
        assert_eq!(config.state_file, PathBuf::from("s.json"));
        assert_eq!(config.retention.retention_secs, 10);
        assert_eq!(config.retention.check_interval_secs, 300);
        assert_eq!(config.output_dir, PathBuf::from("output"));
    }
}

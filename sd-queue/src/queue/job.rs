//! Job record types and the job state machine.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum::{AsRefStr, Display, EnumIter, EnumString};

use crate::{Error, Result};

/// Placeholder replaced by a linked predecessor's first output at dequeue time.
pub const LINKED_OUTPUT_PLACEHOLDER: &str = "{{linked_output}}";

/// Kind of work a job performs.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    AsRefStr,
    EnumIter,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum JobKind {
    GenerateImage,
    GenerateImageFromImage,
    GenerateVideo,
    Upscale,
    Convert,
    DownloadModel,
    HashModel,
}

impl JobKind {
    /// Parameter fields that must be present as non-empty strings.
    fn required_fields(self) -> &'static [&'static str] {
        match self {
            JobKind::GenerateImage | JobKind::GenerateVideo => &["prompt"],
            JobKind::GenerateImageFromImage => &["prompt", "init_image"],
            JobKind::Upscale => &["image"],
            JobKind::Convert => &["input", "output_type"],
            JobKind::DownloadModel => &["url"],
            JobKind::HashModel => &["model"],
        }
    }

    /// Whether the kind runs against the loaded generation model.
    pub fn uses_model_context(self) -> bool {
        matches!(
            self,
            JobKind::GenerateImage | JobKind::GenerateImageFromImage | JobKind::GenerateVideo
        )
    }

    /// Validate a submission payload for this kind.
    ///
    /// Runs before a record exists, so a rejected submission never enters the queue.
    pub fn validate(self, params: &Value) -> Result<()> {
        let Some(object) = params.as_object() else {
            return Err(Error::validation(format!(
                "{} parameters must be a JSON object",
                self
            )));
        };

        for field in self.required_fields() {
            match object.get(*field) {
                Some(Value::String(s)) if !s.trim().is_empty() => {}
                Some(Value::String(_)) => {
                    return Err(Error::validation(format!(
                        "{}: '{}' must not be empty",
                        self, field
                    )));
                }
                Some(_) => {
                    return Err(Error::validation(format!(
                        "{}: '{}' must be a string",
                        self, field
                    )));
                }
                None => {
                    return Err(Error::validation(format!(
                        "{}: missing required parameter '{}'",
                        self, field
                    )));
                }
            }
        }

        for field in ["steps", "width", "height", "batch_count", "video_frames"] {
            if let Some(value) = object.get(field)
                && !value.as_u64().is_some_and(|n| n > 0)
            {
                return Err(Error::validation(format!(
                    "{}: '{}' must be a positive integer",
                    self, field
                )));
            }
        }

        Ok(())
    }
}

/// Job status.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    AsRefStr,
    EnumIter,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum JobStatus {
    /// Waiting in the FIFO queue.
    Pending,
    /// Currently running on the worker.
    Processing,
    Completed,
    Failed,
    Cancelled,
    /// Soft-deleted; kept until the retention sweep purges it.
    Deleted,
}

impl JobStatus {
    /// Whether the job reached an outcome (Deleted is layered on top of these).
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// Allowed edges of the job state machine.
    ///
    /// `Pending -> Failed` only happens when a linked predecessor failed.
    pub fn can_transition_to(self, to: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, to),
            (Pending, Processing | Cancelled | Deleted | Failed)
                | (Processing, Completed | Failed | Cancelled)
                | (Completed | Failed | Cancelled, Deleted)
        )
    }
}

/// Raw progress of the current run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobProgress {
    pub step: u32,
    pub total: u32,
}

/// Resource configuration captured for traceability.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceSnapshot {
    pub model: String,
    /// Component models by role (`vae`, `clip_l`, `t5xxl`, ...).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub components: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub architecture: Option<String>,
}

/// A job record.
///
/// Field names are the persisted keys of the state file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    /// Submission order; FIFO order is rebuilt from this after a restart.
    #[serde(default)]
    pub sequence: u64,
    pub kind: JobKind,
    pub status: JobStatus,
    pub parameters: Value,
    #[serde(default)]
    pub resource_snapshot: Option<ResourceSnapshot>,
    #[serde(default)]
    pub progress: JobProgress,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub outputs: Vec<String>,
    #[serde(default)]
    pub linked_id: Option<String>,
    #[serde(default)]
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Job {
    pub(crate) fn from_new(new: NewJob, sequence: u64) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            sequence,
            kind: new.kind,
            status: JobStatus::Pending,
            parameters: new.parameters,
            resource_snapshot: new.resource_snapshot,
            progress: JobProgress::default(),
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            error: None,
            outputs: Vec::new(),
            linked_id: new.linked_id,
            deleted_at: None,
        }
    }

    pub fn is_deleted(&self) -> bool {
        self.status == JobStatus::Deleted
    }

    /// Move to `to`, rejecting edges the state machine does not allow.
    pub(crate) fn transition(&mut self, to: JobStatus) -> Result<()> {
        if !self.status.can_transition_to(to) {
            return Err(Error::invalid_transition(self.status, to));
        }
        self.status = to;
        Ok(())
    }
}

/// A job submission.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub kind: JobKind,
    pub parameters: Value,
    pub linked_id: Option<String>,
    pub resource_snapshot: Option<ResourceSnapshot>,
}

impl NewJob {
    pub fn new(kind: JobKind, parameters: Value) -> Self {
        Self {
            kind,
            parameters,
            linked_id: None,
            resource_snapshot: None,
        }
    }

    /// Link to a predecessor whose failure propagates to this job.
    pub fn with_linked_id(mut self, linked_id: impl Into<String>) -> Self {
        self.linked_id = Some(linked_id.into());
        self
    }

    pub fn with_resource_snapshot(mut self, snapshot: ResourceSnapshot) -> Self {
        self.resource_snapshot = Some(snapshot);
        self
    }
}

/// Index referenced by a placeholder string, if `s` is one.
fn placeholder_index(s: &str) -> Option<usize> {
    if s == LINKED_OUTPUT_PLACEHOLDER {
        return Some(0);
    }
    s.strip_prefix("{{linked_output:")?
        .strip_suffix("}}")?
        .trim()
        .parse()
        .ok()
}

/// Replace linked-output placeholders in `params` with the predecessor's outputs.
///
/// Returns the number of replaced values, or a message naming the first
/// placeholder that has no matching output.
pub(crate) fn bind_linked_outputs(
    params: &mut Value,
    outputs: &[String],
) -> std::result::Result<usize, String> {
    match params {
        Value::String(s) => match placeholder_index(s) {
            Some(index) => {
                let output = outputs.get(index).ok_or_else(|| {
                    format!(
                        "linked job produced {} output(s), placeholder references output {}",
                        outputs.len(),
                        index
                    )
                })?;
                *s = output.clone();
                Ok(1)
            }
            None => Ok(0),
        },
        Value::Array(items) => items
            .iter_mut()
            .try_fold(0usize, |acc, item| {
                bind_linked_outputs(item, outputs).map(|n| acc + n)
            }),
        Value::Object(map) => map
            .values_mut()
            .try_fold(0usize, |acc, item| {
                bind_linked_outputs(item, outputs).map(|n| acc + n)
            }),
        _ => Ok(0),
    }
}

//! Contract of the generation backend.
//!
//! The backend does the actual work (diffusion, upscaling, conversion,
//! downloads). It is synchronous: every call blocks its thread until the
//! result is ready and reports progress through [`ComputeCallbacks`] from
//! that same thread.

use std::collections::BTreeMap;
use std::convert::Infallible;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::queue::{JobKind, PreviewSettings, ResourceSnapshot};

/// Failure reported by the backend.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct BackendError {
    pub message: String,
}

impl BackendError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl From<BackendError> for crate::Error {
    fn from(err: BackendError) -> Self {
        crate::Error::Backend(err.message)
    }
}

/// Where model weights and intermediate buffers live.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryPlacement {
    /// Keep weights in system RAM and stream them to the GPU.
    #[serde(default)]
    pub offload_to_cpu: bool,
    #[serde(default)]
    pub clip_on_cpu: bool,
    #[serde(default)]
    pub vae_on_cpu: bool,
    #[serde(default)]
    pub vae_tiling: bool,
    #[serde(default)]
    pub flash_attention: bool,
}

/// Full configuration of a model load.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelParams {
    /// Main diffusion model file, relative to the models directory or absolute.
    pub model: String,
    /// Component models by role (`vae`, `clip_l`, `clip_g`, `t5xxl`, `llm`, ...).
    #[serde(default)]
    pub components: BTreeMap<String, String>,
    #[serde(default)]
    pub architecture: Option<String>,
    /// Weight type / quantization override (`f16`, `q8_0`, ...).
    #[serde(default)]
    pub weight_type: Option<String>,
    #[serde(default)]
    pub placement: MemoryPlacement,
    #[serde(default)]
    pub threads: Option<u32>,
}

impl ModelParams {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            ..Default::default()
        }
    }

    pub fn with_component(mut self, role: impl Into<String>, file: impl Into<String>) -> Self {
        self.components.insert(role.into(), file.into());
        self
    }

    pub fn with_architecture(mut self, architecture: impl Into<String>) -> Self {
        self.architecture = Some(architecture.into());
        self
    }

    /// The part of the load configuration recorded on jobs.
    pub fn snapshot(&self) -> ResourceSnapshot {
        ResourceSnapshot {
            model: self.model.clone(),
            components: self.components.clone(),
            architecture: self.architecture.clone(),
        }
    }
}

/// Configuration of an upscaler load.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpscalerParams {
    pub model: String,
    #[serde(default)]
    pub tile_size: Option<u32>,
    #[serde(default)]
    pub threads: Option<u32>,
}

impl UpscalerParams {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            ..Default::default()
        }
    }
}

/// Encoded preview image produced mid-run.
#[derive(Debug, Clone)]
pub struct PreviewFrame {
    pub step: u32,
    pub width: u32,
    pub height: u32,
    pub mime: String,
    pub data: Vec<u8>,
}

/// Callbacks the backend invokes synchronously during a compute call.
///
/// Implementations must return immediately.
pub trait ComputeCallbacks: Send + Sync {
    fn on_step(&self, step: u32, total: u32);

    fn on_preview(&self, frame: &PreviewFrame);

    /// How (and whether) the backend should produce previews.
    fn preview_settings(&self) -> PreviewSettings;
}

/// One unit of work handed to the backend.
#[derive(Debug, Clone, Copy)]
pub struct ComputeRequest<'a> {
    pub job_id: &'a str,
    pub kind: JobKind,
    pub parameters: &'a Value,
    /// Directory outputs must be written to.
    pub output_dir: &'a Path,
    /// Directory models are downloaded to and resolved against.
    pub models_dir: &'a Path,
}

/// The generation backend.
pub trait Backend: Send + Sync + 'static {
    /// Loaded diffusion model context.
    type Model: Send + 'static;
    /// Loaded upscaler context.
    type Upscaler: Send + 'static;

    fn load_model(
        &self,
        params: &ModelParams,
        on_progress: &dyn Fn(u32, u32),
    ) -> std::result::Result<Self::Model, BackendError>;

    fn load_upscaler(
        &self,
        params: &UpscalerParams,
    ) -> std::result::Result<Self::Upscaler, BackendError>;

    /// Image and video generation; returns output paths.
    fn generate(
        &self,
        model: &mut Self::Model,
        request: &ComputeRequest<'_>,
        callbacks: &dyn ComputeCallbacks,
    ) -> std::result::Result<Vec<String>, BackendError>;

    fn upscale(
        &self,
        upscaler: &mut Self::Upscaler,
        request: &ComputeRequest<'_>,
        callbacks: &dyn ComputeCallbacks,
    ) -> std::result::Result<Vec<String>, BackendError>;

    /// Model format conversion / quantization. Does not use a loaded context.
    fn convert(
        &self,
        request: &ComputeRequest<'_>,
        callbacks: &dyn ComputeCallbacks,
    ) -> std::result::Result<Vec<String>, BackendError>;

    /// Fetch a model file; returns the stored path.
    fn download(
        &self,
        request: &ComputeRequest<'_>,
        callbacks: &dyn ComputeCallbacks,
    ) -> std::result::Result<Vec<String>, BackendError>;
}

/// Backend used when no generation library is linked into the binary.
///
/// Loads are rejected and every compute call fails, so the queue, its
/// state file and the event stream can run without a GPU.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnlinkedBackend;

impl UnlinkedBackend {
    fn unavailable(what: &str) -> BackendError {
        BackendError::new(format!(
            "{} is unavailable: no generation backend is linked into this build",
            what
        ))
    }
}

impl Backend for UnlinkedBackend {
    type Model = Infallible;
    type Upscaler = Infallible;

    fn load_model(
        &self,
        _params: &ModelParams,
        _on_progress: &dyn Fn(u32, u32),
    ) -> std::result::Result<Self::Model, BackendError> {
        Err(Self::unavailable("model loading"))
    }

    fn load_upscaler(
        &self,
        _params: &UpscalerParams,
    ) -> std::result::Result<Self::Upscaler, BackendError> {
        Err(Self::unavailable("upscaler loading"))
    }

    fn generate(
        &self,
        model: &mut Self::Model,
        _request: &ComputeRequest<'_>,
        _callbacks: &dyn ComputeCallbacks,
    ) -> std::result::Result<Vec<String>, BackendError> {
        match *model {}
    }

    fn upscale(
        &self,
        upscaler: &mut Self::Upscaler,
        _request: &ComputeRequest<'_>,
        _callbacks: &dyn ComputeCallbacks,
    ) -> std::result::Result<Vec<String>, BackendError> {
        match *upscaler {}
    }

    fn convert(
        &self,
        _request: &ComputeRequest<'_>,
        _callbacks: &dyn ComputeCallbacks,
    ) -> std::result::Result<Vec<String>, BackendError> {
        Err(Self::unavailable("model conversion"))
    }

    fn download(
        &self,
        _request: &ComputeRequest<'_>,
        _callbacks: &dyn ComputeCallbacks,
    ) -> std::result::Result<Vec<String>, BackendError> {
        Err(Self::unavailable("model download"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_model_params_snapshot() {
        let params = ModelParams::new("flux1-dev-q8_0.gguf")
            .with_component("vae", "ae.safetensors")
            .with_component("t5xxl", "t5xxl_fp16.safetensors")
            .with_architecture("flux");

        let snapshot = params.snapshot();
        assert_eq!(snapshot.model, "flux1-dev-q8_0.gguf");
        assert_eq!(snapshot.components.len(), 2);
        assert_eq!(snapshot.architecture.as_deref(), Some("flux"));
    }

    #[test]
    fn test_model_params_deserialize_defaults() {
        let params: ModelParams =
            serde_json::from_str(r#"{"model": "sd15.safetensors", "placement": {"vae_tiling": true}}"#)
                .unwrap();
        assert!(params.components.is_empty());
        assert!(params.placement.vae_tiling);
        assert!(!params.placement.offload_to_cpu);
    }

    #[test]
    fn test_unlinked_backend_rejects_loads() {
        let err = UnlinkedBackend
            .load_model(&ModelParams::new("sd15.safetensors"), &|_, _| {})
            .unwrap_err();
        assert!(err.message.contains("no generation backend"));

        let err: crate::Error = err.into();
        assert!(matches!(err, crate::Error::Backend(_)));
    }
}

//! Resource manager: lifecycle of the loaded model and upscaler contexts.
//!
//! Each slot has two access paths:
//! - the context mutex, held for a whole load, unload or compute call;
//! - atomics and short `RwLock`s that mirror its state for status readers.
//!
//! Status queries only use the second path, so they stay responsive while a
//! multi-gigabyte model is loading or a generation is running.

mod backend;
mod hash;

pub use backend::{
    Backend, BackendError, ComputeCallbacks, ComputeRequest, MemoryPlacement, ModelParams,
    PreviewFrame, UnlinkedBackend, UpscalerParams,
};
pub use hash::{HashCache, sha256_file};

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::events::{EventSink, QueueEvent};
use crate::queue::{ResourceSnapshot, Throttle};
use crate::{Error, Result};

/// Minimum spacing between forwarded model-loading progress events.
const LOAD_PROGRESS_INTERVAL: Duration = Duration::from_millis(200);

/// Latest (step, total) of a model load.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadProgress {
    pub step: u32,
    pub total: u32,
}

impl LoadProgress {
    /// Both halves in one word, so readers never see a mixed pair.
    fn pack(self) -> u64 {
        (u64::from(self.step) << 32) | u64::from(self.total)
    }

    fn unpack(word: u64) -> Self {
        Self {
            step: (word >> 32) as u32,
            total: word as u32,
        }
    }
}

/// Non-blocking snapshot of both slots.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResourceStatus {
    pub loaded: bool,
    pub loading: bool,
    pub progress: LoadProgress,
    pub load_params: Option<ModelParams>,
    pub last_error: Option<String>,
    pub upscaler_loaded: bool,
    pub upscaler_loading: bool,
    pub upscaler_params: Option<UpscalerParams>,
    pub upscaler_last_error: Option<String>,
}

/// One exclusive context plus its lock-free mirror.
struct Slot<C, P> {
    kind: &'static str,
    context: Mutex<Option<C>>,
    loaded: AtomicBool,
    loading: AtomicBool,
    params: RwLock<Option<P>>,
    last_error: RwLock<Option<String>>,
}

/// Clears the slot's `loading` flag when the load ends, including by panic.
struct LoadingGuard<'a>(&'a AtomicBool);

impl Drop for LoadingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl<C, P: Clone> Slot<C, P> {
    fn new(kind: &'static str) -> Self {
        Self {
            kind,
            context: Mutex::new(None),
            loaded: AtomicBool::new(false),
            loading: AtomicBool::new(false),
            params: RwLock::new(None),
            last_error: RwLock::new(None),
        }
    }

    /// Claim the slot for a load, failing fast if another load holds it.
    fn begin_load(&self) -> Result<LoadingGuard<'_>> {
        self.loading
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .map_err(|_| Error::LoadInProgress)?;
        Ok(LoadingGuard(&self.loading))
    }

    /// Drop the current context. Caller holds the context mutex.
    fn release(&self, context: &mut Option<C>) -> Option<P> {
        let old = context.take()?;
        self.loaded.store(false, Ordering::SeqCst);
        drop(old);
        self.params.write().take()
    }

    fn with<R>(&self, f: impl FnOnce(&mut C) -> R) -> Result<R> {
        let mut context = self.context.lock();
        let ctx = context.as_mut().ok_or(Error::NoContextLoaded(self.kind))?;
        Ok(f(ctx))
    }

    fn params(&self) -> Option<P> {
        self.params.read().clone()
    }

    fn last_error(&self) -> Option<String> {
        self.last_error.read().clone()
    }
}

/// Owns the model and upscaler contexts.
pub struct ResourceManager<B: Backend> {
    backend: Arc<B>,
    events: Arc<dyn EventSink>,
    model: Slot<B::Model, ModelParams>,
    upscaler: Slot<B::Upscaler, UpscalerParams>,
    /// Packed [`LoadProgress`].
    load_progress: AtomicU64,
    hashes: HashCache,
}

impl<B: Backend> ResourceManager<B> {
    pub fn new(backend: Arc<B>, models_dir: impl Into<PathBuf>, events: Arc<dyn EventSink>) -> Self {
        Self {
            backend,
            events,
            model: Slot::new("model"),
            upscaler: Slot::new("upscaler"),
            load_progress: AtomicU64::new(0),
            hashes: HashCache::new(models_dir),
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    // ========================================================================
    // Model slot
    // ========================================================================

    /// Load a model, replacing the current one.
    ///
    /// Fails with [`Error::LoadInProgress`] without touching anything if
    /// another load is running. Blocks until any in-flight compute call
    /// releases the context, so run it off the async runtime.
    pub fn load(&self, params: ModelParams) -> Result<()> {
        let _loading = self.model.begin_load()?;
        self.load_progress.store(0, Ordering::SeqCst);

        let mut context = self.model.context.lock();
        if let Some(old) = self.model.release(&mut context) {
            info!(model = %old.model, "Unloaded model before loading a new one");
            self.events
                .publish(QueueEvent::ModelUnloaded { model: old.model });
        }

        info!(model = %params.model, architecture = ?params.architecture, "Loading model");
        let throttle = Throttle::new(LOAD_PROGRESS_INTERVAL);
        let on_progress = |step: u32, total: u32| {
            self.load_progress
                .store(LoadProgress { step, total }.pack(), Ordering::SeqCst);
            if (total > 0 && step >= total) || throttle.should_emit() {
                self.events
                    .publish(QueueEvent::ModelLoadingProgress { step, total });
            }
        };

        match self.backend.load_model(&params, &on_progress) {
            Ok(model) => {
                *context = Some(model);
                *self.model.params.write() = Some(params.clone());
                *self.model.last_error.write() = None;
                self.model.loaded.store(true, Ordering::SeqCst);
                info!(model = %params.model, "Model loaded");
                self.events.publish(QueueEvent::ModelLoaded {
                    model: params.model,
                    architecture: params.architecture,
                });
                Ok(())
            }
            Err(e) => {
                *self.model.last_error.write() = Some(e.message.clone());
                warn!(model = %params.model, error = %e, "Model load failed");
                self.events.publish(QueueEvent::ModelLoadFailed {
                    model: params.model,
                    error: e.message.clone(),
                });
                Err(e.into())
            }
        }
    }

    /// Release the loaded model. Returns false if nothing was loaded.
    pub fn unload(&self) -> bool {
        let mut context = self.model.context.lock();
        match self.model.release(&mut context) {
            Some(old) => {
                info!(model = %old.model, "Model unloaded");
                self.events
                    .publish(QueueEvent::ModelUnloaded { model: old.model });
                true
            }
            None => false,
        }
    }

    /// Run `f` against the loaded model while holding the context mutex.
    pub fn with_context<R>(&self, f: impl FnOnce(&mut B::Model) -> R) -> Result<R> {
        self.model.with(f)
    }

    pub fn is_loaded(&self) -> bool {
        self.model.loaded.load(Ordering::SeqCst)
    }

    pub fn is_loading(&self) -> bool {
        self.model.loading.load(Ordering::SeqCst)
    }

    pub fn load_progress(&self) -> LoadProgress {
        LoadProgress::unpack(self.load_progress.load(Ordering::SeqCst))
    }

    pub fn load_params(&self) -> Option<ModelParams> {
        self.model.params()
    }

    pub fn last_load_error(&self) -> Option<String> {
        self.model.last_error()
    }

    /// Snapshot of the loaded model configuration, for job records.
    pub fn model_snapshot(&self) -> Option<ResourceSnapshot> {
        self.model.params.read().as_ref().map(ModelParams::snapshot)
    }

    // ========================================================================
    // Upscaler slot
    // ========================================================================

    pub fn load_upscaler(&self, params: UpscalerParams) -> Result<()> {
        let _loading = self.upscaler.begin_load()?;

        let mut context = self.upscaler.context.lock();
        if let Some(old) = self.upscaler.release(&mut context) {
            self.events
                .publish(QueueEvent::UpscalerUnloaded { model: old.model });
        }

        info!(model = %params.model, "Loading upscaler");
        match self.backend.load_upscaler(&params) {
            Ok(upscaler) => {
                *context = Some(upscaler);
                *self.upscaler.params.write() = Some(params.clone());
                *self.upscaler.last_error.write() = None;
                self.upscaler.loaded.store(true, Ordering::SeqCst);
                info!(model = %params.model, "Upscaler loaded");
                self.events
                    .publish(QueueEvent::UpscalerLoaded { model: params.model });
                Ok(())
            }
            Err(e) => {
                *self.upscaler.last_error.write() = Some(e.message.clone());
                warn!(model = %params.model, error = %e, "Upscaler load failed");
                Err(e.into())
            }
        }
    }

    /// Release the loaded upscaler. Returns false if nothing was loaded.
    pub fn unload_upscaler(&self) -> bool {
        let mut context = self.upscaler.context.lock();
        match self.upscaler.release(&mut context) {
            Some(old) => {
                info!(model = %old.model, "Upscaler unloaded");
                self.events
                    .publish(QueueEvent::UpscalerUnloaded { model: old.model });
                true
            }
            None => false,
        }
    }

    pub fn with_upscaler<R>(&self, f: impl FnOnce(&mut B::Upscaler) -> R) -> Result<R> {
        self.upscaler.with(f)
    }

    // ========================================================================
    // Status and hashing (never take a context mutex)
    // ========================================================================

    pub fn status(&self) -> ResourceStatus {
        ResourceStatus {
            loaded: self.is_loaded(),
            loading: self.is_loading(),
            progress: self.load_progress(),
            load_params: self.model.params(),
            last_error: self.model.last_error(),
            upscaler_loaded: self.upscaler.loaded.load(Ordering::SeqCst),
            upscaler_loading: self.upscaler.loading.load(Ordering::SeqCst),
            upscaler_params: self.upscaler.params(),
            upscaler_last_error: self.upscaler.last_error(),
        }
    }

    /// Content hash of a model file (`sha256:<hex>`), cached after the first call.
    pub fn compute_hash(&self, name: &str) -> Result<String> {
        self.hashes.compute(name)
    }

    pub fn cached_hash(&self, name: &str) -> Option<String> {
        self.hashes.cached(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::NoopSink;
    use std::sync::mpsc;

    /// Backend whose model loads block until released through a channel.
    struct GatedBackend {
        gate: Mutex<Option<mpsc::Receiver<()>>>,
        started: Mutex<Option<mpsc::Sender<()>>>,
    }

    impl Backend for GatedBackend {
        type Model = String;
        type Upscaler = String;

        fn load_model(
            &self,
            params: &ModelParams,
            on_progress: &dyn Fn(u32, u32),
        ) -> std::result::Result<String, BackendError> {
            if let Some(started) = self.started.lock().take() {
                let _ = started.send(());
            }
            if let Some(gate) = self.gate.lock().take() {
                let _ = gate.recv();
            }
            if params.model.starts_with("bad") {
                return Err(BackendError::new("unsupported tensor layout"));
            }
            on_progress(1, 2);
            on_progress(2, 2);
            Ok(params.model.clone())
        }

        fn load_upscaler(
            &self,
            params: &UpscalerParams,
        ) -> std::result::Result<String, BackendError> {
            Ok(params.model.clone())
        }

        fn generate(
            &self,
            model: &mut String,
            _request: &ComputeRequest<'_>,
            _callbacks: &dyn ComputeCallbacks,
        ) -> std::result::Result<Vec<String>, BackendError> {
            Ok(vec![format!("{model}.png")])
        }

        fn upscale(
            &self,
            upscaler: &mut String,
            _request: &ComputeRequest<'_>,
            _callbacks: &dyn ComputeCallbacks,
        ) -> std::result::Result<Vec<String>, BackendError> {
            Ok(vec![format!("{upscaler}.png")])
        }

        fn convert(
            &self,
            _request: &ComputeRequest<'_>,
            _callbacks: &dyn ComputeCallbacks,
        ) -> std::result::Result<Vec<String>, BackendError> {
            Ok(vec!["converted.gguf".into()])
        }

        fn download(
            &self,
            _request: &ComputeRequest<'_>,
            _callbacks: &dyn ComputeCallbacks,
        ) -> std::result::Result<Vec<String>, BackendError> {
            Ok(vec!["downloaded.gguf".into()])
        }
    }

    fn ungated() -> ResourceManager<GatedBackend> {
        let backend = GatedBackend {
            gate: Mutex::new(None),
            started: Mutex::new(None),
        };
        ResourceManager::new(Arc::new(backend), "models", Arc::new(NoopSink))
    }

    #[test]
    fn test_load_and_unload() {
        let resources = ungated();
        assert!(!resources.unload());
        assert!(matches!(
            resources.with_context(|_| ()),
            Err(Error::NoContextLoaded("model"))
        ));

        resources
            .load(ModelParams::new("sd15.safetensors").with_architecture("sd1"))
            .unwrap();
        let status = resources.status();
        assert!(status.loaded);
        assert!(!status.loading);
        assert_eq!(status.progress, LoadProgress { step: 2, total: 2 });
        assert_eq!(resources.model_snapshot().unwrap().model, "sd15.safetensors");
        assert_eq!(
            resources.with_context(|m| m.clone()).unwrap(),
            "sd15.safetensors"
        );

        assert!(resources.unload());
        assert!(!resources.is_loaded());
        assert!(resources.load_params().is_none());
    }

    #[test]
    fn test_failed_load_leaves_nothing_loaded() {
        let resources = ungated();
        resources.load(ModelParams::new("good.gguf")).unwrap();

        let err = resources.load(ModelParams::new("bad.gguf")).unwrap_err();
        assert!(matches!(err, Error::Backend(_)));
        assert!(!resources.is_loaded());
        assert!(!resources.is_loading());
        assert!(resources.load_params().is_none());
        assert_eq!(
            resources.last_load_error().as_deref(),
            Some("unsupported tensor layout")
        );
        assert!(resources.with_context(|_| ()).is_err());
    }

    #[test]
    fn test_concurrent_load_fails_fast() {
        let (release_tx, release_rx) = mpsc::channel();
        let (started_tx, started_rx) = mpsc::channel();
        let backend = GatedBackend {
            gate: Mutex::new(Some(release_rx)),
            started: Mutex::new(Some(started_tx)),
        };
        let resources = Arc::new(ResourceManager::new(
            Arc::new(backend),
            "models",
            Arc::new(NoopSink),
        ));

        let first = {
            let resources = resources.clone();
            std::thread::spawn(move || resources.load(ModelParams::new("p1.gguf")))
        };
        started_rx.recv().unwrap();
        assert!(resources.is_loading());

        let second = resources.load(ModelParams::new("p2.gguf"));
        assert!(matches!(second, Err(Error::LoadInProgress)));
        assert!(resources.status().loading);

        release_tx.send(()).unwrap();
        first.join().unwrap().unwrap();
        assert_eq!(resources.load_params().unwrap().model, "p1.gguf");
        assert!(!resources.is_loading());
    }

    #[test]
    fn test_load_progress_pair_is_read_whole() {
        let progress = LoadProgress {
            step: 7,
            total: u32::MAX,
        };
        assert_eq!(LoadProgress::unpack(progress.pack()), progress);
        assert_eq!(LoadProgress::unpack(0), LoadProgress::default());

        let resources = Arc::new(ungated());
        let loader = {
            let resources = resources.clone();
            std::thread::spawn(move || {
                for i in 0..200 {
                    resources
                        .load(ModelParams::new(format!("m{i}.gguf")))
                        .unwrap();
                }
            })
        };
        while !loader.is_finished() {
            let LoadProgress { step, total } = resources.status().progress;
            assert!(step <= total, "torn progress: {step}/{total}");
        }
        loader.join().unwrap();
        assert_eq!(resources.load_progress(), LoadProgress { step: 2, total: 2 });
    }

    #[test]
    fn test_upscaler_slot_is_independent() {
        let resources = ungated();
        resources.load_upscaler(UpscalerParams::new("esrgan.pth")).unwrap();

        let status = resources.status();
        assert!(status.upscaler_loaded);
        assert!(!status.loaded);
        assert_eq!(
            resources.with_upscaler(|u| u.clone()).unwrap(),
            "esrgan.pth"
        );

        assert!(resources.unload_upscaler());
        assert!(!resources.unload_upscaler());
        assert!(!resources.status().upscaler_loaded);
    }
}

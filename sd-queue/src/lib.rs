//! sd-queue library crate.
//!
//! Job queue and model lifecycle manager for a single-GPU image/video
//! generation server: a persistent FIFO of jobs, one worker executing them
//! against exclusively loaded model contexts, and an event stream describing
//! every change.

pub mod config;
pub mod error;
pub mod events;
pub mod logging;
pub mod panic_hook;
pub mod queue;
pub mod resource;
pub mod service;
pub mod utils;

pub use error::{Error, Result};
pub use service::QueueService;

//! Job queue: records, FIFO scheduling, persistence, worker and sweeper.
//!
//! # Components
//!
//! - **JobQueue**: job map + pending FIFO behind one mutex, query surface
//! - **StatePersister**: state-file load/save after every mutation
//! - **QueueWorker**: the single consumer running jobs against the resources
//! - **ProgressRelay**: throttled progress/preview forwarding
//! - **RetentionService**: periodic purge of soft-deleted jobs

pub mod job;
pub mod job_queue;
pub mod persistence;
pub mod purge;
pub mod relay;
pub mod worker;

pub use job::{
    Job, JobKind, JobProgress, JobStatus, LINKED_OUTPUT_PLACEHOLDER, NewJob, ResourceSnapshot,
};
pub use job_queue::{
    INTERRUPTED_ERROR, JobFilter, JobQueue, MAX_PAGE_SIZE, Pagination, QueueStats, RecoveryReport,
};
pub use persistence::{STATE_FILE_VERSION, StatePersister};
pub use purge::{RetentionConfig, RetentionService};
pub use relay::{PreviewMode, PreviewSettings, ProgressRelay, RelayConfig, Throttle};
pub use worker::QueueWorker;

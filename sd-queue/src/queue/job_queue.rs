//! Persistent FIFO job queue.
//!
//! All job records live in one map guarded by a single mutex, next to the FIFO
//! of pending ids. The mutex is only ever held for in-memory bookkeeping:
//! state-file writes and event publishing happen after it is released, under
//! a second publish lock that is taken before the job mutex is let go. Events
//! therefore leave in the order their mutations were applied.
//!
//! Mutating calls write the state file and block on it. Async callers that
//! mutate often (the worker) run them on the blocking pool.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use super::job::{Job, JobKind, JobStatus, NewJob, ResourceSnapshot, bind_linked_outputs};
use super::persistence::StatePersister;
use crate::events::{EventSink, QueueEvent};
use crate::{Error, Result};

/// Error recorded on jobs found running when the previous process exited.
pub const INTERRUPTED_ERROR: &str = "interrupted: the service stopped while this job was running";

/// Maximum page size for [`JobQueue::list_jobs`].
pub const MAX_PAGE_SIZE: usize = 500;

/// Filter for [`JobQueue::list_jobs`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobFilter {
    #[serde(default)]
    pub status: Option<JobStatus>,
    #[serde(default)]
    pub kind: Option<JobKind>,
    /// Include soft-deleted jobs. Implied when `status` is `Deleted`.
    #[serde(default)]
    pub include_deleted: bool,
    /// Only jobs linked to this job id.
    #[serde(default)]
    pub linked_to: Option<String>,
}

impl JobFilter {
    pub fn with_status(mut self, status: JobStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_kind(mut self, kind: JobKind) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn including_deleted(mut self) -> Self {
        self.include_deleted = true;
        self
    }

    fn matches(&self, job: &Job) -> bool {
        if let Some(status) = self.status {
            if job.status != status {
                return false;
            }
        } else if job.is_deleted() && !self.include_deleted {
            return false;
        }
        if self.kind.is_some_and(|kind| job.kind != kind) {
            return false;
        }
        if let Some(linked_to) = &self.linked_to
            && job.linked_id.as_deref() != Some(linked_to.as_str())
        {
            return false;
        }
        true
    }
}

/// Page request for [`JobQueue::list_jobs`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Pagination {
    pub limit: usize,
    pub offset: usize,
}

impl Pagination {
    /// Create a page request; `limit` is clamped to `1..=MAX_PAGE_SIZE`.
    pub fn new(limit: usize, offset: usize) -> Self {
        Self {
            limit: limit.clamp(1, MAX_PAGE_SIZE),
            offset,
        }
    }
}

impl Default for Pagination {
    fn default() -> Self {
        Self::new(50, 0)
    }
}

/// Job counts per status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub pending: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub deleted: usize,
}

impl QueueStats {
    pub fn total(&self) -> usize {
        self.pending + self.processing + self.completed + self.failed + self.cancelled + self.deleted
    }
}

/// Outcome of [`JobQueue::recover`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Records loaded from the state file.
    pub loaded: usize,
    /// Pending jobs put back into the queue.
    pub requeued: usize,
    /// Jobs found in Processing and marked Failed.
    pub interrupted: usize,
    /// The state file was unreadable and was moved aside.
    pub quarantined: bool,
}

#[derive(Debug, Default)]
struct QueueState {
    jobs: HashMap<String, Job>,
    /// Pending job ids in submission order.
    pending: VecDeque<String>,
    /// Job whose compute call is in flight (may already be Cancelled).
    current: Option<String>,
    next_sequence: u64,
    /// Bumped on every persisted mutation.
    generation: u64,
}

impl QueueState {
    fn job_mut(&mut self, id: &str) -> Result<&mut Job> {
        self.jobs
            .get_mut(id)
            .ok_or_else(|| Error::not_found("Job", id))
    }

    fn remove_pending(&mut self, id: &str) {
        self.pending.retain(|pending_id| pending_id != id);
    }

    /// Jobs ordered by submission, for the state file.
    fn ordered_jobs(&self) -> Vec<Job> {
        let mut jobs: Vec<Job> = self.jobs.values().cloned().collect();
        jobs.sort_by_key(|job| job.sequence);
        jobs
    }
}

/// Timestamp no earlier than `floor`, so recorded timestamps never run backwards.
fn now_not_before(floor: DateTime<Utc>) -> DateTime<Utc> {
    Utc::now().max(floor)
}

fn status_changed(job: &Job) -> QueueEvent {
    QueueEvent::JobStatusChanged {
        job_id: job.id.clone(),
        status: job.status,
        error: job.error.clone(),
        outputs: job.outputs.clone(),
    }
}

/// Outputs of the linked predecessor, or the reason the job cannot run.
fn resolve_linked(
    state: &QueueState,
    job: &Job,
) -> std::result::Result<Option<Vec<String>>, String> {
    let Some(linked_id) = job.linked_id.as_deref() else {
        return Ok(None);
    };
    let Some(predecessor) = state.jobs.get(linked_id) else {
        return Err(format!("linked job {} no longer exists", linked_id));
    };

    match predecessor.status {
        JobStatus::Completed => Ok(Some(predecessor.outputs.clone())),
        JobStatus::Failed => Err(format!(
            "linked job {} failed: {}",
            linked_id,
            predecessor.error.as_deref().unwrap_or("unknown error")
        )),
        JobStatus::Cancelled => Err(format!("linked job {} was cancelled", linked_id)),
        JobStatus::Deleted if predecessor.error.is_some() => Err(format!(
            "linked job {} failed: {}",
            linked_id,
            predecessor.error.as_deref().unwrap_or_default()
        )),
        JobStatus::Deleted if !predecessor.outputs.is_empty() => {
            Ok(Some(predecessor.outputs.clone()))
        }
        JobStatus::Deleted => Err(format!("linked job {} was deleted", linked_id)),
        JobStatus::Pending | JobStatus::Processing => {
            Err(format!("linked job {} has not finished", linked_id))
        }
    }
}

/// The job queue.
pub struct JobQueue {
    state: Mutex<QueueState>,
    /// Pending count, readable without the mutex.
    depth: AtomicUsize,
    /// Wakes the single consumer when a job is submitted.
    notify: Notify,
    /// Orders persistence and publishing. Always taken while holding `state`.
    publish: Mutex<()>,
    events: Arc<dyn EventSink>,
    persister: StatePersister,
}

impl JobQueue {
    pub fn new(persister: StatePersister, events: Arc<dyn EventSink>) -> Self {
        Self {
            state: Mutex::new(QueueState {
                next_sequence: 1,
                ..Default::default()
            }),
            depth: AtomicUsize::new(0),
            notify: Notify::new(),
            publish: Mutex::new(()),
            events,
            persister,
        }
    }

    pub fn events(&self) -> &Arc<dyn EventSink> {
        &self.events
    }

    // ========================================================================
    // Mutation plumbing
    // ========================================================================

    /// Run a mutation under the job mutex, then persist and publish outside it.
    ///
    /// Sinks must not call back into the queue from `publish`.
    fn mutate<T>(
        &self,
        f: impl FnOnce(&mut QueueState, &mut Vec<QueueEvent>) -> Result<T>,
    ) -> Result<T> {
        let mut events = Vec::new();
        let (value, generation, snapshot, _publishing) = {
            let mut state = self.state.lock();
            let value = f(&mut state, &mut events)?;
            state.generation += 1;
            self.depth.store(state.pending.len(), Ordering::SeqCst);
            let publishing = self.publish.lock();
            (value, state.generation, state.ordered_jobs(), publishing)
        };

        self.write_snapshot(generation, &snapshot);
        for event in events {
            self.events.publish(event);
        }
        Ok(value)
    }

    fn write_snapshot(&self, generation: u64, jobs: &[Job]) {
        if let Err(e) = self.persister.save(generation, jobs) {
            error!(
                path = %self.persister.path().display(),
                error = %e,
                "Failed to persist queue state"
            );
        }
    }

    /// Write the current state regardless of pending mutations.
    pub fn flush(&self) {
        let (generation, snapshot) = {
            let mut state = self.state.lock();
            state.generation += 1;
            (state.generation, state.ordered_jobs())
        };
        self.write_snapshot(generation, &snapshot);
    }

    // ========================================================================
    // Submission and recovery
    // ========================================================================

    /// Validate and enqueue a job.
    pub fn submit(&self, new_job: NewJob) -> Result<Job> {
        new_job.kind.validate(&new_job.parameters)?;

        let job = self.mutate(|state, events| {
            if let Some(linked_id) = &new_job.linked_id
                && !state.jobs.contains_key(linked_id)
            {
                return Err(Error::validation(format!(
                    "linked job {} does not exist",
                    linked_id
                )));
            }

            let sequence = state.next_sequence;
            state.next_sequence += 1;
            let job = Job::from_new(new_job, sequence);

            state.pending.push_back(job.id.clone());
            state.jobs.insert(job.id.clone(), job.clone());
            events.push(QueueEvent::JobAdded {
                job_id: job.id.clone(),
                kind: job.kind,
                sequence,
                linked_id: job.linked_id.clone(),
            });
            Ok(job)
        })?;

        info!(job_id = %job.id, kind = %job.kind, sequence = job.sequence, "Job submitted");
        self.notify.notify_one();
        Ok(job)
    }

    /// Replace in-memory state with the persisted state file.
    ///
    /// Must run before the worker starts. Jobs left in Processing by the
    /// previous process are marked Failed; Pending jobs are requeued in
    /// submission order.
    pub fn recover(&self) -> Result<RecoveryReport> {
        let mut report = RecoveryReport::default();
        let loaded = match self.persister.load() {
            Ok(jobs) => jobs,
            Err(Error::Serialization(e)) => {
                error!(
                    path = %self.persister.path().display(),
                    error = %e,
                    "State file is unreadable, starting with an empty queue"
                );
                self.persister.quarantine()?;
                report.quarantined = true;
                Vec::new()
            }
            Err(e) => return Err(e),
        };
        report.loaded = loaded.len();

        self.mutate(|state, _events| {
            let mut jobs = loaded;
            jobs.sort_by(|a, b| a.sequence.cmp(&b.sequence).then(a.created_at.cmp(&b.created_at)));

            *state = QueueState {
                generation: state.generation,
                ..Default::default()
            };
            let mut next_sequence = 1;
            for mut job in jobs {
                if job.sequence == 0 {
                    job.sequence = next_sequence;
                }
                next_sequence = next_sequence.max(job.sequence + 1);

                match job.status {
                    JobStatus::Processing => {
                        job.status = JobStatus::Failed;
                        job.error = Some(INTERRUPTED_ERROR.to_string());
                        job.outputs.clear();
                        job.completed_at =
                            Some(now_not_before(job.started_at.unwrap_or(job.created_at)));
                        warn!(job_id = %job.id, kind = %job.kind, "Marking interrupted job as failed");
                        report.interrupted += 1;
                    }
                    JobStatus::Pending => {
                        state.pending.push_back(job.id.clone());
                        report.requeued += 1;
                    }
                    _ => {}
                }
                state.jobs.insert(job.id.clone(), job);
            }
            state.next_sequence = next_sequence;
            Ok(())
        })?;

        info!(
            loaded = report.loaded,
            requeued = report.requeued,
            interrupted = report.interrupted,
            "Recovered queue state"
        );
        if report.requeued > 0 {
            self.notify.notify_one();
        }
        Ok(report)
    }

    // ========================================================================
    // Queries (short-held lock, no I/O)
    // ========================================================================

    /// Look up a job by id, including soft-deleted ones.
    pub fn get_job(&self, id: &str) -> Option<Job> {
        self.state.lock().jobs.get(id).cloned()
    }

    /// Newest-first page of jobs matching `filter`, with the total match count.
    pub fn list_jobs(&self, filter: &JobFilter, pagination: Pagination) -> (Vec<Job>, usize) {
        let mut matching: Vec<Job> = {
            let state = self.state.lock();
            state
                .jobs
                .values()
                .filter(|job| filter.matches(job))
                .cloned()
                .collect()
        };
        matching.sort_by(|a, b| b.sequence.cmp(&a.sequence));

        let total = matching.len();
        let limit = pagination.limit.clamp(1, MAX_PAGE_SIZE);
        let page = matching
            .into_iter()
            .skip(pagination.offset)
            .take(limit)
            .collect();
        (page, total)
    }

    /// Pending job ids in the order they will start.
    pub fn pending_ids(&self) -> Vec<String> {
        self.state.lock().pending.iter().cloned().collect()
    }

    /// The job currently in Processing, if any.
    pub fn current_job(&self) -> Option<Job> {
        let state = self.state.lock();
        state
            .current
            .as_ref()
            .and_then(|id| state.jobs.get(id))
            .filter(|job| job.status == JobStatus::Processing)
            .cloned()
    }

    pub fn stats(&self) -> QueueStats {
        let state = self.state.lock();
        let mut stats = QueueStats::default();
        for job in state.jobs.values() {
            match job.status {
                JobStatus::Pending => stats.pending += 1,
                JobStatus::Processing => stats.processing += 1,
                JobStatus::Completed => stats.completed += 1,
                JobStatus::Failed => stats.failed += 1,
                JobStatus::Cancelled => stats.cancelled += 1,
                JobStatus::Deleted => stats.deleted += 1,
            }
        }
        stats
    }

    /// Number of pending jobs, without taking the job mutex.
    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::SeqCst)
    }

    // ========================================================================
    // Cancellation, deletion and purge
    // ========================================================================

    /// Cancel a job.
    ///
    /// A Pending job is removed from the queue and never starts. A Processing
    /// job is only marked Cancelled: its compute call keeps running and its
    /// result is discarded when it returns.
    pub fn cancel_job(&self, id: &str) -> Result<Job> {
        let job = self.mutate(|state, events| {
            let job = state.job_mut(id)?;
            let was_processing = job.status == JobStatus::Processing;
            job.transition(JobStatus::Cancelled)?;
            if was_processing {
                job.completed_at = Some(now_not_before(job.started_at.unwrap_or(job.created_at)));
            }
            let job = job.clone();

            if !was_processing {
                state.remove_pending(id);
            }
            events.push(QueueEvent::JobCancelled {
                job_id: job.id.clone(),
                was_processing,
            });
            events.push(status_changed(&job));
            Ok(job)
        })?;

        info!(job_id = %id, "Job cancelled");
        Ok(job)
    }

    /// Soft-delete a Pending or terminal job.
    pub fn delete_job(&self, id: &str) -> Result<Job> {
        let job = self.mutate(|state, events| {
            let job = state.job_mut(id)?;
            let was_pending = job.status == JobStatus::Pending;
            job.transition(JobStatus::Deleted)?;
            job.deleted_at = Some(Utc::now());
            let job = job.clone();

            if was_pending {
                state.remove_pending(id);
            }
            events.push(status_changed(&job));
            Ok(job)
        })?;

        info!(job_id = %id, "Job deleted");
        Ok(job)
    }

    /// Permanently remove soft-deleted jobs whose `deleted_at` is before `cutoff`.
    ///
    /// Idempotent; returns the number of removed records.
    pub fn purge_deleted(&self, cutoff: DateTime<Utc>) -> usize {
        let expired =
            |job: &Job| job.is_deleted() && job.deleted_at.is_some_and(|at| at < cutoff);

        if !self.state.lock().jobs.values().any(expired) {
            return 0;
        }

        let purged = self
            .mutate(|state, _events| {
                let before = state.jobs.len();
                state.jobs.retain(|_, job| !expired(&*job));
                Ok(before - state.jobs.len())
            })
            .unwrap_or(0);

        if purged > 0 {
            info!(count = purged, "Purged deleted jobs");
        }
        purged
    }

    // ========================================================================
    // Worker interface
    // ========================================================================

    /// Record progress of the running job. Returns false if ignored.
    ///
    /// Steps lower than the recorded step are ignored so progress never moves
    /// backwards within a run. Progress is not persisted.
    pub fn update_progress(&self, id: &str, step: u32, total: u32) -> bool {
        let mut state = self.state.lock();
        if state.current.as_deref() != Some(id) {
            return false;
        }
        let Some(job) = state.jobs.get_mut(id) else {
            return false;
        };
        if job.status != JobStatus::Processing || step < job.progress.step {
            return false;
        }
        job.progress.step = step;
        job.progress.total = total;
        true
    }

    /// Start the oldest runnable pending job.
    ///
    /// Jobs whose linked predecessor failed are marked Failed on the way.
    /// `snapshot` provides the resource snapshot for model jobs submitted
    /// without one.
    pub fn try_start_next(&self, snapshot: Option<ResourceSnapshot>) -> Option<Job> {
        {
            let state = self.state.lock();
            if state.pending.is_empty() || state.current.is_some() {
                return None;
            }
        }

        self.mutate(|state, events| {
            if state.current.is_some() {
                return Ok(None);
            }

            while let Some(id) = state.pending.pop_front() {
                let Some(job) = state.jobs.get(&id) else {
                    continue;
                };
                if job.status != JobStatus::Pending {
                    debug!(job_id = %id, status = %job.status, "Skipping non-pending queued job");
                    continue;
                }

                let linked = resolve_linked(state, job);
                let Some(job) = state.jobs.get_mut(&id) else {
                    continue;
                };

                // Bound into a copy: a failed binding leaves the parameters as submitted.
                let bound = match linked {
                    Ok(Some(outputs)) => {
                        let mut parameters = job.parameters.clone();
                        bind_linked_outputs(&mut parameters, &outputs).map(|_| Some(parameters))
                    }
                    Ok(None) => Ok(None),
                    Err(reason) => Err(reason),
                };

                let parameters = match bound {
                    Ok(parameters) => parameters,
                    Err(reason) => {
                        job.status = JobStatus::Failed;
                        job.completed_at = Some(now_not_before(job.created_at));
                        job.error = Some(reason);
                        warn!(
                            job_id = %job.id,
                            kind = %job.kind,
                            error = job.error.as_deref().unwrap_or_default(),
                            "Linked job failed before start"
                        );
                        events.push(status_changed(job));
                        continue;
                    }
                };

                if let Some(parameters) = parameters {
                    job.parameters = parameters;
                }
                job.status = JobStatus::Processing;
                job.started_at = Some(now_not_before(job.created_at));
                job.progress = Default::default();
                if job.resource_snapshot.is_none() && job.kind.uses_model_context() {
                    job.resource_snapshot = snapshot.clone();
                }
                let job = job.clone();
                info!(job_id = %job.id, kind = %job.kind, "Job started");

                state.current = Some(id);
                events.push(status_changed(&job));
                return Ok(Some(job));
            }
            Ok(None)
        })
        .ok()
        .flatten()
    }

    /// Wait until a job may have become runnable.
    ///
    /// Wake-ups are not lost: a submit that lands before this is awaited
    /// leaves a permit behind. Cancel-safe.
    pub async fn wait_for_work(&self) {
        self.notify.notified().await;
    }

    /// Wake the consumer, e.g. after the running job finished.
    pub fn wake(&self) {
        self.notify.notify_one();
    }

    /// Mark the running job Completed. Returns false if the result was discarded.
    ///
    /// An empty output list is recorded as a failure.
    pub fn complete(&self, id: &str, outputs: Vec<String>) -> Result<bool> {
        if outputs.is_empty() {
            return self.fail(id, "job finished without producing any output");
        }
        self.finish(id, JobStatus::Completed, outputs, None)
    }

    /// Mark the running job Failed. Returns false if the result was discarded.
    pub fn fail(&self, id: &str, error: impl Into<String>) -> Result<bool> {
        let mut error = error.into();
        if error.trim().is_empty() {
            error = "unknown error".to_string();
        }
        self.finish(id, JobStatus::Failed, Vec::new(), Some(error))
    }

    fn finish(
        &self,
        id: &str,
        status: JobStatus,
        outputs: Vec<String>,
        error: Option<String>,
    ) -> Result<bool> {
        let applied = self.mutate(|state, events| {
            if state.current.as_deref() == Some(id) {
                state.current = None;
            }

            let job = state.job_mut(id)?;
            if job.status != JobStatus::Processing {
                return Ok(false);
            }

            job.transition(status)?;
            job.completed_at = Some(now_not_before(job.started_at.unwrap_or(job.created_at)));
            job.outputs = outputs;
            job.error = error;
            events.push(status_changed(job));
            Ok(true)
        })?;

        match (applied, status) {
            (false, _) => {
                info!(job_id = %id, "Discarding result of job that is no longer processing")
            }
            (true, JobStatus::Completed) => info!(job_id = %id, "Job completed"),
            (true, _) => warn!(job_id = %id, "Job failed"),
        }

        self.notify.notify_one();
        Ok(applied)
    }
}

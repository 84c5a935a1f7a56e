//! Retention sweeper for soft-deleted jobs.
//!
//! Runs in the background and permanently removes jobs whose `deleted_at`
//! is older than the configured retention window.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{Duration, MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::job_queue::JobQueue;

/// Configuration for the retention sweeper.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionConfig {
    /// Seconds a soft-deleted job is kept before it is purged.
    /// Set to 0 to keep deleted jobs indefinitely.
    #[serde(default = "default_retention_secs")]
    pub retention_secs: u64,

    /// Interval between sweeps in seconds.
    #[serde(default = "default_check_interval_secs")]
    pub check_interval_secs: u64,
}

fn default_retention_secs() -> u64 {
    86_400 // 1 day
}

fn default_check_interval_secs() -> u64 {
    300
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            retention_secs: default_retention_secs(),
            check_interval_secs: default_check_interval_secs(),
        }
    }
}

impl RetentionConfig {
    pub fn with_retention_secs(mut self, secs: u64) -> Self {
        self.retention_secs = secs;
        self
    }

    pub fn with_check_interval_secs(mut self, secs: u64) -> Self {
        self.check_interval_secs = secs;
        self
    }
}

/// Periodically purges expired soft-deleted jobs.
pub struct RetentionService {
    config: RetentionConfig,
    queue: Arc<JobQueue>,
}

impl RetentionService {
    pub fn new(config: RetentionConfig, queue: Arc<JobQueue>) -> Self {
        Self { config, queue }
    }

    /// Run one sweep as of `now`. Returns the number of purged jobs.
    pub fn run_purge_at(&self, now: DateTime<Utc>) -> usize {
        if self.config.retention_secs == 0 {
            debug!("Job purging disabled (retention_secs = 0)");
            return 0;
        }

        let Some(cutoff) = i64::try_from(self.config.retention_secs)
            .ok()
            .and_then(chrono::Duration::try_seconds)
            .and_then(|retention| now.checked_sub_signed(retention))
        else {
            return 0;
        };
        let purged = self.queue.purge_deleted(cutoff);

        if purged > 0 {
            info!(
                count = purged,
                retention_secs = self.config.retention_secs,
                "Purged expired deleted jobs"
            );
        } else {
            debug!("No deleted jobs to purge");
        }
        purged
    }

    pub fn run_purge(&self) -> usize {
        self.run_purge_at(Utc::now())
    }

    /// Start the background sweep task.
    pub fn start_background_task(self, cancellation_token: CancellationToken) -> JoinHandle<()> {
        let service = Arc::new(self);
        tokio::spawn(async move {
            let mut check_interval =
                interval(Duration::from_secs(service.config.check_interval_secs.max(1)));
            check_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            info!(
                retention_secs = service.config.retention_secs,
                interval_secs = service.config.check_interval_secs,
                "Retention sweeper started"
            );

            loop {
                tokio::select! {
                    _ = cancellation_token.cancelled() => {
                        info!("Retention sweeper shutting down");
                        break;
                    }
                    _ = check_interval.tick() => {
                        // State-file writes are blocking; keep them off the async workers.
                        let service = service.clone();
                        let swept = tokio::task::spawn_blocking(move || service.run_purge()).await;
                        if let Err(e) = swept {
                            error!(error = %e, "Retention sweep failed");
                        }
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::NoopSink;
    use crate::queue::{JobKind, NewJob, StatePersister};
    use serde_json::json;

    fn setup(dir: &tempfile::TempDir, retention_secs: u64) -> (Arc<JobQueue>, RetentionService) {
        let queue = Arc::new(JobQueue::new(
            StatePersister::new(dir.path().join("state.json")),
            Arc::new(NoopSink),
        ));
        let service = RetentionService::new(
            RetentionConfig::default().with_retention_secs(retention_secs),
            queue.clone(),
        );
        (queue, service)
    }

    #[test]
    fn test_purge_after_retention_window() {
        let dir = tempfile::tempdir().unwrap();
        let (queue, service) = setup(&dir, 3600);
        let job = queue
            .submit(NewJob::new(JobKind::GenerateImage, json!({"prompt": "e"})))
            .unwrap();
        queue.cancel_job(&job.id).unwrap();
        queue.delete_job(&job.id).unwrap();

        assert_eq!(service.run_purge_at(Utc::now()), 0);
        assert!(queue.get_job(&job.id).is_some());

        let later = Utc::now() + chrono::Duration::seconds(3601);
        assert_eq!(service.run_purge_at(later), 1);
        assert!(queue.get_job(&job.id).is_none());
        assert_eq!(service.run_purge_at(later), 0);
    }

    #[test]
    fn test_zero_retention_keeps_everything() {
        let dir = tempfile::tempdir().unwrap();
        let (queue, service) = setup(&dir, 0);
        let job = queue
            .submit(NewJob::new(JobKind::GenerateImage, json!({"prompt": "e"})))
            .unwrap();
        queue.delete_job(&job.id).unwrap();

        let far_future = Utc::now() + chrono::Duration::days(3650);
        assert_eq!(service.run_purge_at(far_future), 0);
        assert!(queue.get_job(&job.id).is_some());
    }

    #[tokio::test]
    async fn test_background_task_stops_on_cancel() {
        let dir = tempfile::tempdir().unwrap();
        let (_queue, service) = setup(&dir, 60);
        let token = CancellationToken::new();

        let handle = service.start_background_task(token.clone());
        token.cancel();
        tokio::time::timeout(std::time::Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
    }
}

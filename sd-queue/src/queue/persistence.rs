//! State-file persistence for the job map.
//!
//! The whole map is written after every state-affecting mutation. Writes go
//! through a temp file in the same directory and are renamed into place, so
//! a crash mid-write leaves the previous state intact.

use std::io::Write;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::job::Job;
use crate::utils::fs;
use crate::{Error, Result};

/// Current on-disk format version.
pub const STATE_FILE_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct StateFile {
    version: u32,
    jobs: Vec<Job>,
}

#[derive(Debug, Serialize)]
struct StateFileRef<'a> {
    version: u32,
    jobs: &'a [Job],
}

/// Reads and writes the state file.
///
/// Snapshots carry the queue's mutation generation. Writes are serialized by
/// an internal lock, and a snapshot older than the last one written is
/// dropped instead of overwriting newer state.
#[derive(Debug)]
pub struct StatePersister {
    path: PathBuf,
    last_written: Mutex<Option<u64>>,
}

impl StatePersister {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            last_written: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load persisted jobs. A missing file is an empty state.
    pub fn load(&self) -> Result<Vec<Job>> {
        let bytes = match std::fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "No state file, starting empty");
                return Ok(Vec::new());
            }
            Err(e) => return Err(fs::io_error("reading state file", &self.path, e)),
        };

        let state: StateFile = serde_json::from_slice(&bytes)?;
        if state.version > STATE_FILE_VERSION {
            return Err(Error::config(format!(
                "state file {} has version {}, newest supported is {}",
                self.path.display(),
                state.version,
                STATE_FILE_VERSION
            )));
        }
        Ok(state.jobs)
    }

    /// Write `jobs` as the state at `generation`.
    ///
    /// Returns `false` when a newer generation was already written.
    pub fn save(&self, generation: u64, jobs: &[Job]) -> Result<bool> {
        let mut last_written = self.last_written.lock();
        if last_written.is_some_and(|last| generation <= last) {
            debug!(generation, "Skipping stale state snapshot");
            return Ok(false);
        }

        let body = serde_json::to_vec_pretty(&StateFileRef {
            version: STATE_FILE_VERSION,
            jobs,
        })?;
        self.write_atomic(&body)?;

        *last_written = Some(generation);
        Ok(true)
    }

    fn write_atomic(&self, body: &[u8]) -> Result<()> {
        fs::ensure_parent_dir_sync("creating state directory", &self.path)?;
        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };

        let mut tmp = tempfile::NamedTempFile::new_in(dir)
            .map_err(|e| fs::io_error("creating temp state file in", dir, e))?;
        tmp.write_all(body)
            .and_then(|_| tmp.as_file().sync_all())
            .map_err(|e| fs::io_error("writing temp state file for", &self.path, e))?;
        tmp.persist(&self.path)
            .map_err(|e| fs::io_error("replacing state file", &self.path, e.error))?;
        Ok(())
    }

    /// Move an unreadable state file aside so it is not overwritten.
    pub fn quarantine(&self) -> Result<PathBuf> {
        let target = self.path.with_extension(format!(
            "corrupt-{}.json",
            chrono::Utc::now().format("%Y%m%dT%H%M%S")
        ));
        std::fs::rename(&self.path, &target)
            .map_err(|e| fs::io_error("moving aside state file", &self.path, e))?;
        warn!(
            from = %self.path.display(),
            to = %target.display(),
            "Moved unreadable state file aside"
        );
        Ok(target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::job::{JobKind, NewJob};
    use serde_json::json;

    fn sample_jobs(n: u64) -> Vec<Job> {
        (1..=n)
            .map(|seq| {
                Job::from_new(
                    NewJob::new(JobKind::GenerateImage, json!({"prompt": format!("p{seq}")})),
                    seq,
                )
            })
            .collect()
    }

    #[test]
    fn test_missing_file_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let persister = StatePersister::new(dir.path().join("none.json"));
        assert!(persister.load().unwrap().is_empty());
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let persister = StatePersister::new(dir.path().join("nested/state.json"));
        let jobs = sample_jobs(2);

        assert!(persister.save(1, &jobs).unwrap());
        let loaded = persister.load().unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[1].id, jobs[1].id);
        assert_eq!(loaded[1].parameters["prompt"], "p2");

        let raw: serde_json::Value =
            serde_json::from_slice(&std::fs::read(persister.path()).unwrap()).unwrap();
        assert_eq!(raw["version"], STATE_FILE_VERSION);
    }

    #[test]
    fn test_stale_generation_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let persister = StatePersister::new(dir.path().join("state.json"));

        assert!(persister.save(5, &sample_jobs(3)).unwrap());
        assert!(!persister.save(4, &sample_jobs(1)).unwrap());
        assert_eq!(persister.load().unwrap().len(), 3);
    }

    #[test]
    fn test_corrupt_file_errors_and_can_be_quarantined() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, b"{not json").unwrap();
        let persister = StatePersister::new(&path);

        assert!(matches!(persister.load(), Err(Error::Serialization(_))));
        let moved = persister.quarantine().unwrap();
        assert!(moved.exists());
        assert!(!path.exists());
    }

    #[test]
    fn test_newer_version_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, br#"{"version": 99, "jobs": []}"#).unwrap();
        assert!(matches!(
            StatePersister::new(&path).load(),
            Err(Error::Configuration(_))
        ));
    }
}

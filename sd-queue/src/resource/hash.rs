//! Content hashes of model files.

use std::io::Read;
use std::path::{Path, PathBuf};

use dashmap::DashMap;
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::Result;
use crate::utils::fs;

const HASH_BUFFER_SIZE: usize = 1024 * 1024;

/// Stream `path` through SHA-256 and return `sha256:<hex>`.
pub fn sha256_file(path: &Path) -> Result<String> {
    let mut file =
        std::fs::File::open(path).map_err(|e| fs::io_error("opening model file", path, e))?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; HASH_BUFFER_SIZE];

    loop {
        let read = file
            .read(&mut buffer)
            .map_err(|e| fs::io_error("reading model file", path, e))?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }

    Ok(format!("sha256:{}", hex::encode(hasher.finalize())))
}

/// Hashes keyed by resolved model path, computed at most once per path.
#[derive(Debug)]
pub struct HashCache {
    models_dir: PathBuf,
    hashes: DashMap<PathBuf, String>,
}

impl HashCache {
    pub fn new(models_dir: impl Into<PathBuf>) -> Self {
        Self {
            models_dir: models_dir.into(),
            hashes: DashMap::new(),
        }
    }

    pub fn resolve(&self, name: &str) -> PathBuf {
        fs::resolve_under(&self.models_dir, name)
    }

    /// Hash of a model file, computing and caching it on first use.
    ///
    /// Two concurrent first calls may both hash the file; both store the same value.
    pub fn compute(&self, name: &str) -> Result<String> {
        let path = self.resolve(name);
        if let Some(hash) = self.hashes.get(&path) {
            debug!(path = %path.display(), "Model hash cache hit");
            return Ok(hash.clone());
        }

        let hash = sha256_file(&path)?;
        info!(path = %path.display(), hash = %hash, "Computed model hash");
        self.hashes.insert(path, hash.clone());
        Ok(hash)
    }

    /// Cached hash of a model file, without touching the file.
    pub fn cached(&self, name: &str) -> Option<String> {
        self.hashes.get(&self.resolve(name)).map(|h| h.clone())
    }

    pub fn len(&self) -> usize {
        self.hashes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hashes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sha256_known_value() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("abc.bin");
        std::fs::write(&path, b"abc").unwrap();

        assert_eq!(
            sha256_file(&path).unwrap(),
            "sha256:ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_cache_survives_file_change() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("m.gguf"), b"first").unwrap();
        let cache = HashCache::new(dir.path());

        assert!(cache.cached("m.gguf").is_none());
        let first = cache.compute("m.gguf").unwrap();
        std::fs::write(dir.path().join("m.gguf"), b"second").unwrap();

        assert_eq!(cache.compute("m.gguf").unwrap(), first);
        assert_eq!(cache.cached("m.gguf"), Some(first));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_missing_file_is_an_error_and_not_cached() {
        let dir = tempfile::tempdir().unwrap();
        let cache = HashCache::new(dir.path());

        let err = cache.compute("missing.safetensors").unwrap_err();
        assert!(err.to_string().contains("missing.safetensors"));
        assert!(cache.is_empty());
    }
}

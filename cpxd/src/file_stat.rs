//! Per-task file metadata cache.
//!
//! Input files are expected to be stable for the duration of one compile
//! task but may change between tasks, so this cache is created fresh per
//! task and never shared. Each task carries two instances: one for the
//! input set and one for watching its own outputs.

use cpx_common::hashing::ContentHash;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

/// Stat snapshot for one path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileStat {
    pub size: u64,
    pub mtime_ns: u128,
}

impl FileStat {
    fn of(path: &Path) -> std::io::Result<Self> {
        let meta = std::fs::metadata(path)?;
        let mtime_ns = meta
            .modified()?
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        Ok(Self {
            size: meta.len(),
            mtime_ns,
        })
    }
}

/// Lazy stat/hash memo keyed by canonicalised path.
///
/// A miss stats the file and memoises the result, including the miss
/// itself (a path that doesn't exist stays "doesn't exist" for the task).
/// Content hashes are computed only when asked for.
#[derive(Default)]
pub struct FileStatCache {
    stats: HashMap<PathBuf, Option<FileStat>>,
    hashes: HashMap<PathBuf, ContentHash>,
}

impl FileStatCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn canonical(path: &Path) -> PathBuf {
        path.canonicalize().unwrap_or_else(|_| path.to_path_buf())
    }

    /// Stat the path, memoised. Returns None for nonexistent paths.
    pub fn stat(&mut self, path: &Path) -> Option<FileStat> {
        let key = Self::canonical(path);
        self.stats
            .entry(key.clone())
            .or_insert_with(|| FileStat::of(&key).ok())
            .clone()
    }

    /// Content hash of the path, memoised. Stats first so size is known.
    pub fn content_hash(&mut self, path: &Path) -> std::io::Result<ContentHash> {
        let key = Self::canonical(path);
        if let Some(hash) = self.hashes.get(&key) {
            return Ok(hash.clone());
        }
        let hash = ContentHash::of_file(&key)?;
        self.hashes.insert(key, hash.clone());
        Ok(hash)
    }

    /// Drop everything known about `path`; the next access re-stats.
    pub fn forget(&mut self, path: &Path) {
        let key = Self::canonical(path);
        self.stats.remove(&key);
        self.hashes.remove(&key);
    }

    pub fn len(&self) -> usize {
        self.stats.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stats.is_empty()
    }
}

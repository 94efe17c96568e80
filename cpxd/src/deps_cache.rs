//! Dependency-set cache keyed by compile fingerprint.
//!
//! Skips the include scan when a previous task with the same argv, cwd,
//! source, and compiler already computed the input set and none of those
//! inputs have changed on disk. Strictly an optimisation: a miss or an
//! invalidated entry just means the scan runs.

use crate::file_stat::{FileStat, FileStatCache};
use cpx_common::hashing::{Fingerprint, FingerprintBuilder};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

/// Identity of one compile for dependency caching.
pub fn compile_fingerprint(
    argv: &[String],
    cwd: &str,
    primary_source: &str,
    compiler_version: &str,
    compiler_target: &str,
) -> Fingerprint {
    FingerprintBuilder::new("deps-v1")
        .field_list("argv", argv.iter())
        .field("cwd", cwd)
        .field("source", primary_source)
        .field("compiler_version", compiler_version)
        .field("compiler_target", compiler_target)
        .finish()
}

#[derive(Debug, Clone)]
struct DepsEntry {
    inputs: Vec<(PathBuf, Option<FileStat>)>,
}

/// Process-wide map from compile fingerprint to required input paths.
pub struct DepsCache {
    entries: Mutex<HashMap<Fingerprint, DepsEntry>>,
    hits: std::sync::atomic::AtomicU64,
    misses: std::sync::atomic::AtomicU64,
}

impl DepsCache {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            hits: Default::default(),
            misses: Default::default(),
        }
    }

    /// Look up the input set for `fp`, revalidating each stored stat
    /// against the task's stat cache. Any changed input invalidates the
    /// entry.
    pub fn lookup(&self, fp: &Fingerprint, stats: &mut FileStatCache) -> Option<Vec<PathBuf>> {
        use std::sync::atomic::Ordering;

        let entry = {
            let entries = self.entries.lock().expect("deps cache lock");
            entries.get(fp).cloned()
        };
        let Some(entry) = entry else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        };

        for (path, stored) in &entry.inputs {
            if stats.stat(path).as_ref() != stored.as_ref() {
                self.entries.lock().expect("deps cache lock").remove(fp);
                self.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
        }

        self.hits.fetch_add(1, Ordering::Relaxed);
        Some(entry.inputs.into_iter().map(|(p, _)| p).collect())
    }

    /// Record the scan result for `fp` with the inputs' current stats.
    pub fn store(&self, fp: Fingerprint, inputs: &[PathBuf], stats: &mut FileStatCache) {
        let entry = DepsEntry {
            inputs: inputs
                .iter()
                .map(|p| (p.clone(), stats.stat(p)))
                .collect(),
        };
        self.entries.lock().expect("deps cache lock").insert(fp, entry);
    }

    pub fn hit_rate(&self) -> (u64, u64) {
        use std::sync::atomic::Ordering;
        (
            self.hits.load(Ordering::Relaxed),
            self.misses.load(Ordering::Relaxed),
        )
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("deps cache lock").len()
    }
}

impl Default for DepsCache {
    fn default() -> Self {
        Self::new()
    }
}

//! Persistent cache of committed compile outputs.
//!
//! Keyed by compile fingerprint (argv, cwd, compiler identity, input
//! hashes), so a re-request with identical inputs is served from disk
//! without touching the remote service or the local compiler. Blobs are
//! stored content-addressed so identical outputs across keys share bytes.

use cpx_common::hashing::{ContentHash, Fingerprint};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedOutput {
    /// cwd-relative output name.
    pub name: String,
    pub hash: ContentHash,
    pub size: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedEntry {
    pub outputs: Vec<CachedOutput>,
    pub stdout: String,
    pub stderr: String,
}

/// Disk layout: `<root>/keys/<fp>.json` manifests and `<root>/cas/<hash>`
/// blobs.
pub struct LocalOutputCache {
    root: PathBuf,
}

impl LocalOutputCache {
    pub fn new(root: PathBuf) -> std::io::Result<Self> {
        std::fs::create_dir_all(root.join("keys"))?;
        std::fs::create_dir_all(root.join("cas"))?;
        Ok(Self { root })
    }

    fn manifest_path(&self, fp: &Fingerprint) -> PathBuf {
        self.root.join("keys").join(format!("{}.json", fp.to_hex()))
    }

    fn blob_path(&self, hash: &ContentHash) -> PathBuf {
        self.root.join("cas").join(hash.as_str())
    }

    /// Look up an entry; all referenced blobs must still exist.
    pub fn lookup(&self, fp: &Fingerprint) -> Option<CachedEntry> {
        let bytes = std::fs::read(self.manifest_path(fp)).ok()?;
        let entry: CachedEntry = match serde_json::from_slice(&bytes) {
            Ok(e) => e,
            Err(e) => {
                warn!(error = %e, "dropping corrupt local-output manifest");
                let _ = std::fs::remove_file(self.manifest_path(fp));
                return None;
            }
        };
        for output in &entry.outputs {
            if !self.blob_path(&output.hash).exists() {
                debug!(hash = %output.hash, "local-output blob missing, treating as miss");
                return None;
            }
        }
        Some(entry)
    }

    /// Materialise a cached entry's outputs under `cwd`, atomically per
    /// file (copy to a temp sibling, then rename).
    pub fn serve(&self, entry: &CachedEntry, cwd: &Path) -> std::io::Result<()> {
        for output in &entry.outputs {
            let final_path = cwd.join(&output.name);
            if let Some(parent) = final_path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let tmp = final_path.with_extension("cpxtmp");
            std::fs::copy(self.blob_path(&output.hash), &tmp)?;
            std::fs::rename(&tmp, &final_path)?;
        }
        Ok(())
    }

    /// Record outputs for `fp`, copying each file into the blob store.
    pub fn store(
        &self,
        fp: &Fingerprint,
        outputs: &[(String, PathBuf)],
        stdout: &str,
        stderr: &str,
    ) -> std::io::Result<()> {
        let mut cached = Vec::with_capacity(outputs.len());
        for (name, path) in outputs {
            let hash = ContentHash::of_file(path)?;
            let size = std::fs::metadata(path)?.len();
            let blob = self.blob_path(&hash);
            if !blob.exists() {
                let tmp = blob.with_extension("partial");
                std::fs::copy(path, &tmp)?;
                std::fs::rename(&tmp, &blob)?;
            }
            cached.push(CachedOutput {
                name: name.clone(),
                hash,
                size,
            });
        }

        let entry = CachedEntry {
            outputs: cached,
            stdout: stdout.to_string(),
            stderr: stderr.to_string(),
        };
        let tmp = self.manifest_path(fp).with_extension("json.partial");
        std::fs::write(&tmp, serde_json::to_vec(&entry)?)?;
        std::fs::rename(&tmp, self.manifest_path(fp))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cpx_common::hashing::FingerprintBuilder;

    fn fp(tag: &str) -> Fingerprint {
        FingerprintBuilder::new("local-output-v1").field("t", tag).finish()
    }

    #[test]
    fn test_store_lookup_serve_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let cache = LocalOutputCache::new(dir.path().join("loc")).unwrap();

        let work = dir.path().join("work");
        std::fs::create_dir(&work).unwrap();
        let obj = work.join("a.o");
        std::fs::write(&obj, b"object bytes").unwrap();

        cache
            .store(&fp("k1"), &[("a.o".to_string(), obj.clone())], "", "warn: x")
            .unwrap();

        let entry = cache.lookup(&fp("k1")).expect("hit");
        assert_eq!(entry.outputs.len(), 1);
        assert_eq!(entry.stderr, "warn: x");

        // Serve into a fresh cwd.
        let replay = dir.path().join("replay");
        std::fs::create_dir(&replay).unwrap();
        cache.serve(&entry, &replay).unwrap();
        assert_eq!(std::fs::read(replay.join("a.o")).unwrap(), b"object bytes");
    }

    #[test]
    fn test_lookup_misses_unknown_key() {
        let dir = tempfile::tempdir().unwrap();
        let cache = LocalOutputCache::new(dir.path().join("loc")).unwrap();
        assert!(cache.lookup(&fp("nope")).is_none());
    }

    #[test]
    fn test_missing_blob_degrades_to_miss() {
        let dir = tempfile::tempdir().unwrap();
        let cache = LocalOutputCache::new(dir.path().join("loc")).unwrap();

        let obj = dir.path().join("b.o");
        std::fs::write(&obj, b"bytes").unwrap();
        cache
            .store(&fp("k2"), &[("b.o".to_string(), obj)], "", "")
            .unwrap();

        // Simulate blob eviction.
        let hash = ContentHash::of_bytes(b"bytes");
        std::fs::remove_file(dir.path().join("loc/cas").join(hash.as_str())).unwrap();

        assert!(cache.lookup(&fp("k2")).is_none());
    }

    #[test]
    fn test_identical_outputs_share_blob() {
        let dir = tempfile::tempdir().unwrap();
        let cache = LocalOutputCache::new(dir.path().join("loc")).unwrap();

        let obj = dir.path().join("same.o");
        std::fs::write(&obj, b"shared").unwrap();
        cache
            .store(&fp("a"), &[("same.o".to_string(), obj.clone())], "", "")
            .unwrap();
        cache
            .store(&fp("b"), &[("same.o".to_string(), obj)], "", "")
            .unwrap();

        let cas_entries = std::fs::read_dir(dir.path().join("loc/cas")).unwrap().count();
        assert_eq!(cas_entries, 1);
    }
}

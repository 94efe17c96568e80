//! Process-wide compiler capability cache.
//!
//! Probing a compiler (version, target, builtin macros, system include
//! dirs) costs several subprocess round-trips, so results are shared by
//! every task that names the same compiler fingerprint. The cache gives
//! single-flight semantics: N concurrent tasks wanting the same untested
//! fingerprint trigger exactly one probe and all wait on its outcome.
//!
//! Entries are immutable once published. Replacing the compiler binary on
//! disk invalidates the entry on next lookup via the recorded binary stat.

use cpx_common::hashing::{Fingerprint, FingerprintBuilder};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;
use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, info, warn};

/// Identity of a compiler for caching purposes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompilerKey {
    /// Absolute path to the compiler binary.
    pub path: PathBuf,
    /// Argv used to elicit the version (language-specific).
    pub version_argv: Vec<String>,
    /// Locale / toolchain / path-extension variables that change probe
    /// output.
    pub env_subset: BTreeMap<String, String>,
}

impl CompilerKey {
    pub fn fingerprint(&self) -> Fingerprint {
        let mut b = FingerprintBuilder::new("compiler-key-v1")
            .field("path", &self.path.to_string_lossy())
            .field_list("version_argv", self.version_argv.iter());
        for (k, v) in &self.env_subset {
            b = b.field(k, v);
        }
        b.finish()
    }
}

/// Stat of the compiler binary itself, for replacement detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BinaryStat {
    pub size: u64,
    pub mtime_ns: u128,
}

impl BinaryStat {
    pub fn of(path: &Path) -> std::io::Result<Self> {
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

/// Captured description of a local compiler's behaviour.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompilerInfo {
    pub version: String,
    pub target: String,
    pub system_include_dirs: Vec<PathBuf>,
    /// `#define` lines the compiler predefines, verbatim.
    pub predefined_macros: String,
    /// Helper binaries the remote side must mirror (assembler, plugins).
    pub subprograms: Vec<(String, PathBuf)>,
    pub is_cross: bool,
    pub binary_stat: BinaryStat,
}

type ProbeOutcome = Result<Arc<CompilerInfo>, String>;
type Cell = Arc<OnceCell<ProbeOutcome>>;

/// Single-flight cache from compiler fingerprint to [`CompilerInfo`].
pub struct CompilerInfoCache {
    entries: Mutex<HashMap<Fingerprint, Cell>>,
}

impl CompilerInfoCache {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Return the cached info for `key`, or run `probe` exactly once with
    /// concurrent callers for the same key awaiting the same outcome.
    ///
    /// A cached entry whose recorded binary stat no longer matches the
    /// on-disk compiler is dropped and re-probed.
    pub async fn get_or_probe<F, Fut>(&self, key: &CompilerKey, probe: F) -> ProbeOutcome
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<CompilerInfo, String>>,
    {
        let fp = key.fingerprint();

        let cell = {
            let mut entries = self.entries.lock().await;
            if let Some(cell) = entries.get(&fp) {
                if let Some(Ok(info)) = cell.get() {
                    let current = BinaryStat::of(&key.path).ok();
                    if current != Some(info.binary_stat) {
                        debug!(
                            compiler = %key.path.display(),
                            "compiler binary changed on disk, dropping cached info"
                        );
                        entries.remove(&fp);
                    }
                }
            }
            entries.entry(fp).or_default().clone()
        };

        cell.get_or_init(|| async {
            match probe().await {
                Ok(info) => {
                    info!(
                        compiler = %key.path.display(),
                        version = %info.version,
                        target = %info.target,
                        "compiler probed"
                    );
                    Ok(Arc::new(info))
                }
                Err(e) => {
                    warn!(compiler = %key.path.display(), error = %e, "compiler probe failed");
                    Err(e)
                }
            }
        })
        .await
        .clone()
    }

    /// Drop the entry for `key`; the next `get_or_probe` re-runs the probe.
    pub async fn invalidate(&self, key: &CompilerKey) {
        self.entries.lock().await.remove(&key.fingerprint());
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    // ── Persistence ──────────────────────────────────────────────────────

    /// Write all successfully probed entries to `path` as JSON.
    pub async fn save(&self, path: &Path) -> std::io::Result<usize> {
        let entries = self.entries.lock().await;
        let mut rows: Vec<PersistRow> = Vec::new();
        for (fp, cell) in entries.iter() {
            if let Some(Ok(info)) = cell.get() {
                rows.push(PersistRow {
                    fingerprint: fp.to_hex(),
                    info: (**info).clone(),
                });
            }
        }
        drop(entries);

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_vec_pretty(&rows)?;
        std::fs::write(path, json)?;
        Ok(rows.len())
    }

    /// Load entries saved by [`save`], dropping any whose compiler binary
    /// stat no longer holds. Missing file is an empty cache, not an error.
    pub async fn load(&self, path: &Path) -> std::io::Result<usize> {
        let bytes = match std::fs::read(path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e),
        };
        let rows: Vec<PersistRow> = match serde_json::from_slice(&bytes) {
            Ok(r) => r,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "compiler info cache unreadable, starting empty");
                return Ok(0);
            }
        };

        let mut loaded = 0;
        let mut entries = self.entries.lock().await;
        for row in rows {
            let Some(fp) = parse_fingerprint(&row.fingerprint) else {
                continue;
            };
            let cell: Cell = Arc::default();
            cell.set(Ok(Arc::new(row.info))).ok();
            entries.insert(fp, cell);
            loaded += 1;
        }
        Ok(loaded)
    }
}

impl Default for CompilerInfoCache {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Serialize, Deserialize)]
struct PersistRow {
    fingerprint: String,
    info: CompilerInfo,
}

fn parse_fingerprint(hex_str: &str) -> Option<Fingerprint> {
    let bytes = hex::decode(hex_str).ok()?;
    let arr: [u8; 32] = bytes.try_into().ok()?;
    Some(Fingerprint(arr))
}

// ── Default probe ────────────────────────────────────────────────────────

/// Probe a gcc/clang-style compiler for its capability descriptor.
///
/// Four invocations: `-dumpversion`, `-dumpmachine`, a `-v -E` run whose
/// stderr lists the system include search path, and a `-dM -E` run for the
/// predefined macro set.
pub async fn probe_gcc_like(
    path: &Path,
    env_subset: &BTreeMap<String, String>,
) -> Result<CompilerInfo, String> {
    let binary_stat =
        BinaryStat::of(path).map_err(|e| format!("stat {}: {e}", path.display()))?;

    let run = |args: &[&str]| {
        let mut cmd = tokio::process::Command::new(path);
        cmd.args(args)
            .envs(env_subset.clone())
            .stdin(std::process::Stdio::null());
        async move {
            let out = cmd
                .output()
                .await
                .map_err(|e| format!("spawn compiler probe: {e}"))?;
            Ok::<_, String>((
                String::from_utf8_lossy(&out.stdout).into_owned(),
                String::from_utf8_lossy(&out.stderr).into_owned(),
            ))
        }
    };

    let (version, _) = run(&["-dumpversion"]).await?;
    let (target, _) = run(&["-dumpmachine"]).await?;
    let (_, search_stderr) = run(&["-E", "-x", "c", "-v", "/dev/null"]).await?;
    let (macros, _) = run(&["-dM", "-E", "-x", "c", "/dev/null"]).await?;

    let target = target.trim().to_string();
    let host = host_triple_guess();
    let is_cross = !host.is_empty() && !target.is_empty() && !target.starts_with(&host);

    Ok(CompilerInfo {
        version: version.trim().to_string(),
        target,
        system_include_dirs: parse_include_search_path(&search_stderr),
        predefined_macros: macros,
        subprograms: Vec::new(),
        is_cross,
        binary_stat,
    })
}

/// Extract include dirs from the block between "search starts here:" and
/// "End of search list." in `-v -E` stderr.
fn parse_include_search_path(stderr: &str) -> Vec<PathBuf> {
    let mut dirs = Vec::new();
    let mut in_block = false;
    for line in stderr.lines() {
        if line.contains("search starts here:") {
            in_block = true;
            continue;
        }
        if line.starts_with("End of search list") {
            break;
        }
        if in_block {
            let trimmed = line.trim();
            if !trimmed.is_empty() {
                dirs.push(PathBuf::from(trimmed));
            }
        }
    }
    dirs
}

fn host_triple_guess() -> String {
    match std::env::consts::ARCH {
        "" => String::new(),
        arch => arch.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn write_fake_compiler(dir: &Path) -> PathBuf {
        let path = dir.join("cc");
        std::fs::write(&path, b"#!/bin/sh\nexit 0\n").unwrap();
        path
    }

    fn key_for(path: &Path) -> CompilerKey {
        CompilerKey {
            path: path.to_path_buf(),
            version_argv: vec!["-dumpversion".to_string()],
            env_subset: BTreeMap::new(),
        }
    }

    fn fake_info(path: &Path) -> CompilerInfo {
        CompilerInfo {
            version: "13.2.0".to_string(),
            target: "x86_64-linux-gnu".to_string(),
            system_include_dirs: vec![PathBuf::from("/usr/include")],
            predefined_macros: "#define __GNUC__ 13\n".to_string(),
            subprograms: vec![],
            is_cross: false,
            binary_stat: BinaryStat::of(path).unwrap(),
        }
    }

    #[tokio::test]
    async fn test_probe_runs_once_for_concurrent_callers() {
        let dir = tempfile::tempdir().unwrap();
        let cc = write_fake_compiler(dir.path());
        let cache = Arc::new(CompilerInfoCache::new());
        let probes = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            let probes = probes.clone();
            let cc = cc.clone();
            handles.push(tokio::spawn(async move {
                let key = key_for(&cc);
                cache
                    .get_or_probe(&key, || async {
                        probes.fetch_add(1, Ordering::SeqCst);
                        // Hold the probe open long enough for all callers
                        // to attach.
                        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
                        Ok(fake_info(&cc))
                    })
                    .await
            }));
        }

        for h in handles {
            assert!(h.await.unwrap().is_ok());
        }
        assert_eq!(probes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_probe_is_cached_until_invalidate() {
        let dir = tempfile::tempdir().unwrap();
        let cc = write_fake_compiler(dir.path());
        let cache = CompilerInfoCache::new();
        let key = key_for(&cc);

        let out = cache
            .get_or_probe(&key, || async { Err("probe exploded".to_string()) })
            .await;
        assert!(out.is_err());

        // Failure is published; no second probe without invalidation.
        let probes = AtomicUsize::new(0);
        let out = cache
            .get_or_probe(&key, || async {
                probes.fetch_add(1, Ordering::SeqCst);
                Ok(fake_info(&cc))
            })
            .await;
        assert!(out.is_err());
        assert_eq!(probes.load(Ordering::SeqCst), 0);

        cache.invalidate(&key).await;
        let out = cache
            .get_or_probe(&key, || async { Ok(fake_info(&cc)) })
            .await;
        assert!(out.is_ok());
    }

    #[tokio::test]
    async fn test_binary_replacement_invalidates() {
        let dir = tempfile::tempdir().unwrap();
        let cc = write_fake_compiler(dir.path());
        let cache = CompilerInfoCache::new();
        let key = key_for(&cc);

        let first = cache
            .get_or_probe(&key, || async { Ok(fake_info(&cc)) })
            .await
            .unwrap();
        assert_eq!(first.version, "13.2.0");

        // Replace the binary with different content (size changes).
        std::fs::write(&cc, b"#!/bin/sh\necho replaced\nexit 0\n").unwrap();

        let mut updated = fake_info(&cc);
        updated.version = "14.0.1".to_string();
        let second = cache
            .get_or_probe(&key, || async { Ok(updated) })
            .await
            .unwrap();
        assert_eq!(second.version, "14.0.1");
    }

    #[tokio::test]
    async fn test_save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let cc = write_fake_compiler(dir.path());
        let persist = dir.path().join("compiler_info.json");

        let cache = CompilerInfoCache::new();
        let key = key_for(&cc);
        cache
            .get_or_probe(&key, || async { Ok(fake_info(&cc)) })
            .await
            .unwrap();
        assert_eq!(cache.save(&persist).await.unwrap(), 1);

        let fresh = CompilerInfoCache::new();
        assert_eq!(fresh.load(&persist).await.unwrap(), 1);
        let probes = AtomicUsize::new(0);
        let info = fresh
            .get_or_probe(&key, || async {
                probes.fetch_add(1, Ordering::SeqCst);
                Ok(fake_info(&cc))
            })
            .await
            .unwrap();
        assert_eq!(info.version, "13.2.0");
        assert_eq!(probes.load(Ordering::SeqCst), 0, "load should satisfy lookup");
    }

    #[tokio::test]
    async fn test_load_missing_file_is_empty() {
        let cache = CompilerInfoCache::new();
        let loaded = cache
            .load(Path::new("/nonexistent/compiler_info.json"))
            .await
            .unwrap();
        assert_eq!(loaded, 0);
    }

    #[test]
    fn test_parse_include_search_path() {
        let stderr = "\
ignoring nonexistent directory \"/usr/local/include/x86_64-linux-gnu\"
#include \"...\" search starts here:
#include <...> search starts here:
 /usr/lib/gcc/x86_64-linux-gnu/13/include
 /usr/local/include
 /usr/include
End of search list.
";
        let dirs = parse_include_search_path(stderr);
        assert_eq!(
            dirs,
            vec![
                PathBuf::from("/usr/lib/gcc/x86_64-linux-gnu/13/include"),
                PathBuf::from("/usr/local/include"),
                PathBuf::from("/usr/include"),
            ]
        );
    }

    #[test]
    fn test_fingerprint_sensitive_to_env_subset() {
        let base = CompilerKey {
            path: PathBuf::from("/usr/bin/gcc"),
            version_argv: vec!["-dumpversion".into()],
            env_subset: BTreeMap::new(),
        };
        let mut with_lang = base.clone();
        with_lang
            .env_subset
            .insert("LANG".to_string(), "ja_JP.UTF-8".to_string());
        assert_ne!(base.fingerprint(), with_lang.fingerprint());
    }
}

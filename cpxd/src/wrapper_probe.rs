//! Real-compiler resolution.
//!
//! Build systems often put the proxy wrapper ahead of the real compiler on
//! PATH under the compiler's own name, so resolving `gcc` naively would
//! find the wrapper and recurse into ourselves. Candidates are vetted two
//! ways: a file-identity comparison against the known wrapper binary, and
//! an out-of-band probe: the wrapper exits 1 and mentions `GOMA` when
//! invoked with `GOMA_WILL_FAIL_WITH_UNKNOWN_FLAG=true` and no arguments.
//! `cl.exe` is exempt from the probe because some installations pop a
//! modal dialog when run without arguments.

use cpx_common::errors::TaskError;
pub use cpx_common::protocol::WRAPPER_PROBE_ENV;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Substring a probed wrapper prints on stdout/stderr.
const WRAPPER_PROBE_MARKER: &str = "GOMA";

/// Stable identity of a file, robust against hardlinks and PATH aliasing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileIdentity {
    dev: u64,
    ino: u64,
}

impl FileIdentity {
    pub fn of(path: &Path) -> Option<Self> {
        #[cfg(unix)]
        {
            use std::os::unix::fs::MetadataExt;
            let meta = std::fs::metadata(path).ok()?;
            Some(Self {
                dev: meta.dev(),
                ino: meta.ino(),
            })
        }
        #[cfg(not(unix))]
        {
            let _ = path;
            None
        }
    }
}

/// Resolves the real local compiler behind the wrapper.
pub struct CompilerResolver {
    /// Identity of this daemon's own wrapper binary, if known.
    wrapper_identity: Option<FileIdentity>,
}

impl CompilerResolver {
    pub fn new(wrapper_path: Option<&Path>) -> Self {
        Self {
            wrapper_identity: wrapper_path.and_then(FileIdentity::of),
        }
    }

    /// Find the first PATH candidate for `name` that is not the wrapper.
    pub async fn resolve(&self, name: &str, cwd: &Path) -> Result<PathBuf, TaskError> {
        // An explicit path bypasses the PATH walk but is still probed.
        let candidates: Vec<PathBuf> = if name.contains('/') {
            let p = if Path::new(name).is_absolute() {
                PathBuf::from(name)
            } else {
                cwd.join(name)
            };
            vec![p]
        } else {
            which::which_all(name)
                .map_err(|e| TaskError::CompilerNotFound(format!("{name}: {e}")))?
                .collect()
        };

        if candidates.is_empty() {
            return Err(TaskError::CompilerNotFound(name.to_string()));
        }

        for candidate in candidates {
            if self.is_wrapper(&candidate).await {
                debug!(candidate = %candidate.display(), "skipping proxy wrapper on PATH");
                continue;
            }
            return Ok(candidate);
        }

        Err(TaskError::CompilerNotFound(format!(
            "{name}: only the proxy wrapper found on PATH"
        )))
    }

    /// Whether `candidate` is this daemon's wrapper.
    pub async fn is_wrapper(&self, candidate: &Path) -> bool {
        if let (Some(wrapper), Some(this)) = (self.wrapper_identity, FileIdentity::of(candidate)) {
            if wrapper == this {
                return true;
            }
        }

        // cl.exe must not be run without arguments.
        if candidate
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.eq_ignore_ascii_case("cl.exe") || n.eq_ignore_ascii_case("cl"))
        {
            return false;
        }

        probe_for_wrapper(candidate).await
    }
}

/// Run the candidate with the probe env var set and no args. A wrapper
/// exits 1 and mentions the marker; anything else is a real tool.
async fn probe_for_wrapper(candidate: &Path) -> bool {
    let output = tokio::process::Command::new(candidate)
        .env(WRAPPER_PROBE_ENV, "true")
        .stdin(std::process::Stdio::null())
        .output()
        .await;

    match output {
        Ok(out) => {
            let combined = format!(
                "{}{}",
                String::from_utf8_lossy(&out.stdout),
                String::from_utf8_lossy(&out.stderr)
            );
            out.status.code() == Some(1) && combined.contains(WRAPPER_PROBE_MARKER)
        }
        Err(_) => false,
    }
}

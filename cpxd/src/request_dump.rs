//! Failed-request dump directory.
//!
//! When a task fails remotely, its serialised request plus the error
//! classification lands here so the failure can be replayed and triaged
//! offline. Only the last N dumps are retained.

use cpx_common::protocol::ExecReq;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::warn;

#[derive(Debug, Serialize, Deserialize)]
pub struct RequestDump {
    pub task_id: u64,
    pub error_code: String,
    pub error_message: String,
    pub request: ExecReq,
}

pub struct RequestDumper {
    dir: PathBuf,
    keep: usize,
}

impl RequestDumper {
    pub fn new(dir: PathBuf, keep: usize) -> std::io::Result<Self> {
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            keep: keep.max(1),
        })
    }

    /// Write one dump and prune beyond the retention count. Dump failures
    /// are logged, never propagated: losing a dump must not affect the
    /// task outcome.
    pub fn dump(&self, record: &RequestDump) {
        let name = format!("req-{:08}-{}.json", record.task_id, record.error_code);
        let path = self.dir.join(name);
        match serde_json::to_vec_pretty(record) {
            Ok(bytes) => {
                if let Err(e) = std::fs::write(&path, bytes) {
                    warn!(path = %path.display(), error = %e, "failed to write request dump");
                    return;
                }
            }
            Err(e) => {
                warn!(error = %e, "failed to serialise request dump");
                return;
            }
        }
        self.prune();
    }

    /// Load a dump for replay.
    pub fn load(path: &Path) -> std::io::Result<RequestDump> {
        let bytes = std::fs::read(path)?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    pub fn list(&self) -> Vec<PathBuf> {
        let mut paths: Vec<PathBuf> = std::fs::read_dir(&self.dir)
            .into_iter()
            .flatten()
            .flatten()
            .map(|e| e.path())
            .filter(|p| p.extension().is_some_and(|x| x == "json"))
            .collect();
        paths.sort();
        paths
    }

    fn prune(&self) {
        let paths = self.list();
        if paths.len() <= self.keep {
            return;
        }
        // Oldest first by task-id-prefixed name.
        for stale in &paths[..paths.len() - self.keep] {
            if let Err(e) = std::fs::remove_file(stale) {
                warn!(path = %stale.display(), error = %e, "failed to prune request dump");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cpx_common::protocol::{CommandSpec, RequesterInfo};
    use cpx_common::types::TraceId;

    fn dump_for(task_id: u64) -> RequestDump {
        RequestDump {
            task_id,
            error_code: "rpc_http_5xx".to_string(),
            error_message: "remote returned http 503".to_string(),
            request: ExecReq {
                trace_id: TraceId(format!("trace-{task_id}")),
                command: CommandSpec {
                    compiler_path: "/usr/bin/gcc".to_string(),
                    version: "13".to_string(),
                    target: "x86_64".to_string(),
                    argv: vec!["gcc".into(), "-c".into(), "a.c".into()],
                    cwd: "/src".to_string(),
                    env: Default::default(),
                    subprograms: vec![],
                },
                inputs: vec![],
                requester: RequesterInfo::default(),
            },
        }
    }

    #[test]
    fn test_dump_and_reload_preserves_classification() {
        let dir = tempfile::tempdir().unwrap();
        let dumper = RequestDumper::new(dir.path().join("dumps"), 8).unwrap();
        dumper.dump(&dump_for(3));

        let paths = dumper.list();
        assert_eq!(paths.len(), 1);
        let loaded = RequestDumper::load(&paths[0]).unwrap();
        assert_eq!(loaded.task_id, 3);
        assert_eq!(loaded.error_code, "rpc_http_5xx");
        assert_eq!(loaded.request.trace_id.as_str(), "trace-3");
    }

    #[test]
    fn test_retention_prunes_oldest() {
        let dir = tempfile::tempdir().unwrap();
        let dumper = RequestDumper::new(dir.path().join("dumps"), 2).unwrap();
        for id in 1..=5 {
            dumper.dump(&dump_for(id));
        }
        let paths = dumper.list();
        assert_eq!(paths.len(), 2);
        let names: Vec<String> = paths
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert!(names[0].contains("00000004"));
        assert!(names[1].contains("00000005"));
    }
}

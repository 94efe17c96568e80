//! Per-task timing and byte accounting, surfaced on the status page.

use cpx_common::types::TaskState;
use serde::Serialize;
use std::time::{Duration, Instant};

/// Wall-clock spent in each stage plus transfer volumes.
#[derive(Debug, Default, Clone, Serialize)]
pub struct CompileStats {
    pub setup_ms: u64,
    pub file_req_ms: u64,
    pub call_exec_ms: u64,
    pub file_resp_ms: u64,
    pub total_ms: u64,
    pub inputs_total: usize,
    pub inputs_uploaded: usize,
    pub bytes_uploaded: u64,
    pub outputs_downloaded: usize,
    pub bytes_downloaded: u64,
    pub deps_cache_hit: bool,
    pub output_cache_hit: bool,
    pub rpc_retries: u32,
}

impl CompileStats {
    pub fn record_stage(&mut self, state: TaskState, elapsed: Duration) {
        let ms = elapsed.as_millis() as u64;
        match state {
            TaskState::Setup => self.setup_ms += ms,
            TaskState::FileReq => self.file_req_ms += ms,
            TaskState::CallExec => self.call_exec_ms += ms,
            TaskState::FileResp => self.file_resp_ms += ms,
            _ => {}
        }
    }
}

/// Measures one stage; hand the elapsed time to
/// [`CompileStats::record_stage`] at the transition.
pub struct StageTimer {
    started: Instant,
}

impl StageTimer {
    pub fn start() -> Self {
        Self {
            started: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_stage_accumulates() {
        let mut stats = CompileStats::default();
        stats.record_stage(TaskState::Setup, Duration::from_millis(5));
        stats.record_stage(TaskState::Setup, Duration::from_millis(7));
        stats.record_stage(TaskState::CallExec, Duration::from_millis(100));
        assert_eq!(stats.setup_ms, 12);
        assert_eq!(stats.call_exec_ms, 100);
        assert_eq!(stats.file_resp_ms, 0);
    }

    #[test]
    fn test_terminal_states_not_tracked() {
        let mut stats = CompileStats::default();
        stats.record_stage(TaskState::Finished, Duration::from_millis(50));
        assert_eq!(stats.total_ms, 0);
        assert_eq!(stats.setup_ms, 0);
    }
}

//! Common types used across cpx components.

use serde::{Deserialize, Serialize};

/// Monotonic identifier for a compile task within one daemon lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskId(pub u64);

impl TaskId {
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Trace identifier propagated to the remote service and the logs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TraceId(pub String);

impl TraceId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TraceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Stage of a compile task's state machine.
///
/// Transitions are strictly forward; the local branch states run in
/// parallel with the remote branch and terminate the task when the local
/// run wins the race.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Task created; fast-fallback subprocess scheduled here.
    Init,
    /// Flags parsed, compiler probed, include scan running.
    Setup,
    /// Input blobs are being staged to the remote side.
    FileReq,
    /// Exec RPC in flight.
    CallExec,
    /// Served from the local-output cache; no remote call issued.
    LocalOutput,
    /// Output downloads in flight.
    FileResp,
    /// Remote branch settled (success, failure, or cancel).
    Finished,
    /// Local subprocess owns the task; remote was never or no longer called.
    LocalRun,
    /// Local run completed and its result was used.
    LocalFinished,
}

impl TaskState {
    /// Whether this state terminates the task.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Finished | TaskState::LocalFinished | TaskState::LocalOutput
        )
    }

    /// Ordinal used to enforce monotonic transitions on the remote branch.
    pub fn ordinal(&self) -> u8 {
        match self {
            TaskState::Init => 0,
            TaskState::Setup => 1,
            TaskState::FileReq => 2,
            TaskState::CallExec => 3,
            TaskState::LocalOutput => 4,
            TaskState::FileResp => 5,
            TaskState::Finished => 6,
            TaskState::LocalRun => 7,
            TaskState::LocalFinished => 8,
        }
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskState::Init => "init",
            TaskState::Setup => "setup",
            TaskState::FileReq => "file_req",
            TaskState::CallExec => "call_exec",
            TaskState::LocalOutput => "local_output",
            TaskState::FileResp => "file_resp",
            TaskState::Finished => "finished",
            TaskState::LocalRun => "local_run",
            TaskState::LocalFinished => "local_finished",
        };
        write!(f, "{s}")
    }
}

/// How the daemon races the local compiler against the remote service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackPolicy {
    /// Remote only; local compile happens only on remote failure.
    #[default]
    OnError,
    /// Start a low-priority local subprocess immediately; first finisher wins.
    Fast,
    /// Remote result is authoritative, but a local run is compared
    /// byte-for-byte and mismatches are reported.
    Verify,
}

impl std::fmt::Display for FallbackPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::OnError => write!(f, "on_error"),
            Self::Fast => write!(f, "fast"),
            Self::Verify => write!(f, "verify"),
        }
    }
}

impl std::str::FromStr for FallbackPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "on_error" | "onerror" | "default" => Ok(Self::OnError),
            "fast" => Ok(Self::Fast),
            "verify" => Ok(Self::Verify),
            other => Err(format!("unknown fallback policy: {other}")),
        }
    }
}

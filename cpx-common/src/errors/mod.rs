//! Error catalog for the compiler proxy.
//!
//! Two layers: [`ConfigError`] is fatal at startup and exits the daemon;
//! [`TaskError`] is scoped to one compile task and decides, per variant,
//! whether the task may fall back to the local compiler.

use thiserror::Error;

/// Unrecoverable startup failure. Surfaced to stderr; the daemon exits
/// nonzero.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("conflicting credential sources: {0}")]
    ConflictingAuth(String),

    #[error("cannot bind local socket {path}: {source}")]
    SocketBind {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("cache directory {path} unusable: {source}")]
    CacheDir {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Per-task failure, classified for the fallback decision.
#[derive(Debug, Error)]
pub enum TaskError {
    #[error("compiler not found: {0}")]
    CompilerNotFound(String),

    #[error("include scan failed: {0}")]
    IncludeScan(String),

    #[error("blob upload failed for {hash}: {reason}")]
    BlobUpload { hash: String, reason: String },

    #[error("rpc transport error: {0}")]
    RpcTransport(String),

    #[error("remote returned http {status}")]
    RpcHttp5xx { status: u16 },

    /// 4xx or a malformed/explicitly-failed response body. Never retried
    /// and never falls back unless policy opts in: the request itself is
    /// wrong, so a local run would mask a real defect.
    #[error("remote rejected request: {code}: {message}")]
    RpcSemantic { code: String, message: String },

    #[error("authentication unavailable: {0}")]
    Auth(String),

    #[error("output verification failed for {path}: {reason}")]
    OutputVerify { path: String, reason: String },

    #[error("output commit failed for {path}: {reason}")]
    OutputCommit { path: String, reason: String },

    #[error("local compiler run failed: {0}")]
    LocalRun(String),

    /// Not an error for reporting purposes; the client went away and no
    /// reply will be sent.
    #[error("task cancelled")]
    Cancelled,
}

impl TaskError {
    /// Whether this failure makes the task eligible for local fallback.
    pub fn is_fallback_trigger(&self) -> bool {
        match self {
            TaskError::CompilerNotFound(_)
            | TaskError::IncludeScan(_)
            | TaskError::BlobUpload { .. }
            | TaskError::RpcTransport(_)
            | TaskError::RpcHttp5xx { .. }
            | TaskError::Auth(_)
            | TaskError::OutputVerify { .. }
            | TaskError::OutputCommit { .. } => true,
            TaskError::RpcSemantic { .. }
            | TaskError::LocalRun(_)
            | TaskError::Cancelled => false,
        }
    }

    /// Whether the RPC layer may retry the failed call.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TaskError::RpcTransport(_) | TaskError::RpcHttp5xx { .. }
        )
    }

    /// Short machine-readable code for logs and the request dump.
    pub fn code(&self) -> &'static str {
        match self {
            TaskError::CompilerNotFound(_) => "compiler_not_found",
            TaskError::IncludeScan(_) => "include_scan",
            TaskError::BlobUpload { .. } => "blob_upload",
            TaskError::RpcTransport(_) => "rpc_transport",
            TaskError::RpcHttp5xx { .. } => "rpc_http_5xx",
            TaskError::RpcSemantic { .. } => "rpc_semantic",
            TaskError::Auth(_) => "auth",
            TaskError::OutputVerify { .. } => "output_verify",
            TaskError::OutputCommit { .. } => "output_commit",
            TaskError::LocalRun(_) => "local_run",
            TaskError::Cancelled => "cancelled",
        }
    }
}

//! Shared building blocks for the cpx compiler proxy.
//!
//! Everything that crosses a crate boundary lives here: task and hash
//! newtypes, the request/response wire shapes, the environment-driven
//! configuration layer, and the error catalog.

pub mod config;
pub mod errors;
pub mod hashing;
pub mod ipc_client;
pub mod protocol;
pub mod types;

pub use errors::{ConfigError, TaskError};
pub use hashing::{ContentHash, Fingerprint};
pub use protocol::{
    CommandSpec, ExecError, ExecInput, ExecOutput, ExecReq, ExecResp, RequesterInfo,
    ServedBy, WrapperReply, WrapperRequest,
};
pub use types::{FallbackPolicy, TaskId, TaskState, TraceId};

//! Wire shapes for the exec service and the local wrapper IPC.
//!
//! The daemon speaks two protocols with the same message shapes: the
//! wrapper posts an [`ExecReq`] over the local socket, and the daemon
//! forwards a populated copy to the remote exec service. The byte-level
//! codec lives behind the transport seams; these structs define what the
//! messages carry.

use crate::hashing::ContentHash;
use crate::types::TraceId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Path the exec RPC is posted to, on both the local socket and the remote
/// service.
pub const EXEC_PATH: &str = "/e";

/// Remote liveness probe path.
pub const HEALTHZ_PATH: &str = "/healthz";

/// `Host` header value required on local IPC requests. Browsers refuse to
/// post to this host, which blocks cross-origin requests from reaching the
/// daemon through the wrapper's socket.
pub const IPC_HOST: &str = "0.0.0.0";

/// Content type for serialised request/response bodies.
pub const IPC_CONTENT_TYPE: &str = "binary/x-protocol-buffer";

/// Env var the daemon sets when probing a PATH candidate to see whether it
/// is this proxy's own wrapper. The wrapper reacts by exiting 1 with a
/// `GOMA` marker on stderr; real compilers ignore the variable.
pub const WRAPPER_PROBE_ENV: &str = "GOMA_WILL_FAIL_WITH_UNKNOWN_FLAG";

/// Identity of the compiler binary plus the exact invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandSpec {
    /// Absolute path of the real local compiler (wrapper already skipped).
    pub compiler_path: String,
    /// Version string reported by the compiler probe.
    pub version: String,
    /// Target triple reported by the compiler probe.
    pub target: String,
    /// Full argv, argv[0] included.
    pub argv: Vec<String>,
    /// Working directory the invocation runs in.
    pub cwd: String,
    /// Environment subset relevant to compilation (locale, toolchain,
    /// path extensions). Sorted map so serialisation is stable.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Hashes of subprograms the remote side must also provide (e.g. the
    /// assembler or linker plugins).
    #[serde(default)]
    pub subprograms: Vec<SubprogramSpec>,
}

/// A helper binary shipped alongside the compiler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubprogramSpec {
    pub name: String,
    pub path: String,
    pub hash: ContentHash,
}

/// One input file the remote compile needs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecInput {
    /// Path as referenced by the command (may be relative to `cwd`).
    pub path: String,
    pub hash: ContentHash,
    pub size: u64,
}

/// Who is asking, for quota and audit on the remote side.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequesterInfo {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub hostname: String,
    #[serde(default)]
    pub pid: u32,
}

/// Compile request, posted to [`EXEC_PATH`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecReq {
    pub trace_id: TraceId,
    pub command: CommandSpec,
    /// Inputs the remote side needs; all hashes must be staged before the
    /// exec call (the service rejects requests naming unknown blobs).
    pub inputs: Vec<ExecInput>,
    #[serde(default)]
    pub requester: RequesterInfo,
}

/// One output file the remote compile produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecOutput {
    /// Logical name relative to `cwd` (e.g. `obj/foo.o`).
    pub name: String,
    pub hash: ContentHash,
    pub size: u64,
}

/// Semantic error carried inside an otherwise-successful HTTP exchange.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecError {
    pub code: String,
    pub message: String,
}

/// Compile response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecResp {
    pub trace_id: TraceId,
    pub exit_status: i32,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
    #[serde(default)]
    pub outputs: Vec<ExecOutput>,
    /// Hashes the service did not have; the caller must stage them and
    /// retry. Empty on success.
    #[serde(default)]
    pub missing_inputs: Vec<ContentHash>,
    #[serde(default)]
    pub error: Option<ExecError>,
}

impl ExecResp {
    /// A response usable as a compile result: no semantic error and no
    /// missing inputs.
    pub fn is_ok(&self) -> bool {
        self.error.is_none() && self.missing_inputs.is_empty()
    }
}

/// Raw invocation the wrapper forwards over the local socket. The daemon
/// does its own flag parsing, compiler resolution, and input discovery;
/// the wrapper only captures what it was handed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WrapperRequest {
    /// argv[0] is the compiler name the wrapper was invoked as.
    pub argv: Vec<String>,
    pub env: Vec<(String, String)>,
    pub cwd: String,
    #[serde(default)]
    pub requester: RequesterInfo,
}

/// Reply sent back to the wrapper over the local socket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WrapperReply {
    pub exit_status: i32,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
    /// Which branch produced the result, for diagnostics.
    pub served_by: ServedBy,
}

/// Which execution branch satisfied the wrapper.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServedBy {
    Remote,
    Local,
    LocalOutputCache,
}

impl std::fmt::Display for ServedBy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Remote => write!(f, "remote"),
            Self::Local => write!(f, "local"),
            Self::LocalOutputCache => write!(f, "local_output_cache"),
        }
    }
}

//! cpx wrapper - the thin client invoked in place of the compiler.
//!
//! Build systems call this binary under the compiler's name (via symlink
//! or PATH shadowing). It forwards the full invocation to the daemon over
//! the local socket and relays stdout/stderr/exit back. When the daemon
//! is unreachable the wrapper degrades to running the real compiler
//! directly, so builds never hard-depend on the proxy being up.

use anyhow::Result;
use cpx_common::ipc_client::post_exec_request;
use cpx_common::protocol::{RequesterInfo, WrapperRequest, WRAPPER_PROBE_ENV};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing::{debug, warn};
use tracing_subscriber::EnvFilter;

fn socket_path() -> PathBuf {
    std::env::var("GOMA_COMPILER_PROXY_SOCKET_NAME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp/cpxd.sock"))
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    // The daemon probes PATH candidates with this variable to find and
    // skip its own wrapper. Answering the probe is part of the contract:
    // exit 1, name the rejected parameter.
    if std::env::var(WRAPPER_PROBE_ENV).as_deref() == Ok("true") {
        eprintln!("cpx: unknown GOMA_ parameter 'WILL_FAIL_WITH_UNKNOWN_FLAG'");
        return Ok(ExitCode::from(1));
    }

    let mut args: Vec<String> = std::env::args().collect();

    // Invoked as `cpx gcc -c ...` the compiler is the first argument;
    // invoked through a symlink named `gcc`, argv[0] is the compiler.
    let invoked_as = PathBuf::from(&args[0]);
    let basename = invoked_as
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    if basename == "cpx" {
        args.remove(0);
        if args.is_empty() {
            eprintln!("usage: cpx <compiler> [args...]");
            return Ok(ExitCode::from(2));
        }
    } else {
        args[0] = basename;
    }

    let cwd = std::env::current_dir()?;
    let request = WrapperRequest {
        argv: args.clone(),
        env: std::env::vars().collect(),
        cwd: cwd.to_string_lossy().into_owned(),
        requester: RequesterInfo {
            username: std::env::var("USER").unwrap_or_default(),
            hostname: hostname(),
            pid: std::process::id(),
        },
    };

    match post_exec_request(&socket_path(), &request).await {
        Ok(reply) => {
            debug!(served_by = %reply.served_by, exit = reply.exit_status, "daemon replied");
            print!("{}", reply.stdout);
            eprint!("{}", reply.stderr);
            std::io::stdout().flush().ok();
            std::io::stderr().flush().ok();
            Ok(ExitCode::from(reply.exit_status.clamp(0, 255) as u8))
        }
        Err(e) => {
            warn!("daemon unavailable ({e}); compiling locally");
            run_locally(&args, &cwd).await
        }
    }
}

/// Daemon-less degradation: run the real compiler in place, skipping any
/// PATH entry that is this wrapper itself.
async fn run_locally(args: &[String], cwd: &Path) -> Result<ExitCode> {
    let compiler = match find_real_compiler(&args[0]) {
        Some(path) => path,
        None => {
            eprintln!("cpx: compiler not found: {}", args[0]);
            return Ok(ExitCode::from(1));
        }
    };

    let status = tokio::process::Command::new(&compiler)
        .args(&args[1..])
        .current_dir(cwd)
        .status()
        .await?;
    Ok(ExitCode::from(status.code().unwrap_or(1).clamp(0, 255) as u8))
}

/// First PATH match for `name` that is not this executable (by file
/// identity, so symlinked wrapper installs are caught too).
fn find_real_compiler(name: &str) -> Option<PathBuf> {
    let own = std::env::current_exe().ok().and_then(|p| file_identity(&p));
    which::which_all(name)
        .ok()?
        .find(|candidate| file_identity(candidate) != own || own.is_none())
}

#[cfg(unix)]
fn file_identity(path: &Path) -> Option<(u64, u64)> {
    use std::os::unix::fs::MetadataExt;
    let meta = std::fs::metadata(path).ok()?;
    Some((meta.dev(), meta.ino()))
}

#[cfg(not(unix))]
fn file_identity(_path: &Path) -> Option<(u64, u64)> {
    None
}

fn hostname() -> String {
    std::fs::read_to_string("/proc/sys/kernel/hostname")
        .map(|s| s.trim().to_string())
        .unwrap_or_default()
}

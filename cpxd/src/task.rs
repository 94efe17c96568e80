//! Per-compile task engine.
//!
//! Each incoming request becomes one [`run_task`] future owning a strictly
//! forward state machine: INIT → SETUP → FILE_REQ → CALL_EXEC → FILE_RESP →
//! FINISHED on the remote branch, with a local subprocess racing in
//! parallel under the fast and verify policies and a local-output-cache
//! shortcut out of SETUP. Sub-operations (uploads, downloads, the local
//! run) are spawned futures; the engine observes their completions, so
//! task state is only ever mutated from the owning future and snapshots
//! for the status page are copy-outs under a plain mutex.

use crate::auth::TokenRefresher;
use crate::blob::{BlobStage, StagedBlob};
use crate::cancel::{CancelSource, CancelToken};
use crate::coff;
use crate::compiler_info::{probe_gcc_like, CompilerInfoCache, CompilerKey};
use crate::deps_cache::{compile_fingerprint, DepsCache};
use crate::events::{TaskEvent, TaskEventLog};
use crate::file_stat::FileStatCache;
use crate::flags::{FlagsParser, InvocationKind};
use crate::include_scan::IncludeScanner;
use crate::local::{LocalCommand, LocalOutcome, SubprocessHost};
use crate::local_output_cache::LocalOutputCache;
use crate::request_dump::{RequestDump, RequestDumper};
use crate::rpc::{with_retry, RpcChannel};
use crate::stats::{CompileStats, StageTimer};
use crate::wrapper_probe::CompilerResolver;
use cpx_common::config::ProxyConfig;
use cpx_common::errors::TaskError;
use cpx_common::hashing::{ContentHash, Fingerprint, FingerprintBuilder};
use cpx_common::protocol::{
    CommandSpec, ExecInput, ExecReq, ExecResp, RequesterInfo, ServedBy, WrapperReply,
};
use cpx_common::types::{FallbackPolicy, TaskId, TaskState, TraceId};
use serde_json::json;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Env keys that affect compiler behaviour and travel with the request.
const RELEVANT_ENV: &[&str] = &[
    "LANG",
    "LC_ALL",
    "LC_MESSAGES",
    "PATH",
    "PATHEXT",
    "INCLUDE",
    "LIB",
    "SDKROOT",
    "DEVELOPER_DIR",
];

/// Rename retry discipline for output commit.
const COMMIT_RETRIES: u32 = 3;
const COMMIT_RETRY_DELAY: Duration = Duration::from_millis(50);

/// One incoming compile request from the wrapper.
#[derive(Debug, Clone)]
pub struct TaskRequest {
    pub argv: Vec<String>,
    pub env: Vec<(String, String)>,
    pub cwd: PathBuf,
    pub requester: RequesterInfo,
}

/// Copy-out view of a live task for the status page.
#[derive(Debug, Clone, serde::Serialize)]
pub struct TaskSnapshot {
    pub state: TaskState,
    pub abort: bool,
    pub finished: bool,
    pub canceled: bool,
    pub should_fallback: bool,
    pub local_run: bool,
    pub local_killed: bool,
    pub remote_committed: bool,
    pub local_committed: bool,
    pub stats: CompileStats,
}

impl Default for TaskSnapshot {
    fn default() -> Self {
        Self {
            state: TaskState::Init,
            abort: false,
            finished: false,
            canceled: false,
            should_fallback: false,
            local_run: false,
            local_killed: false,
            remote_committed: false,
            local_committed: false,
            stats: CompileStats::default(),
        }
    }
}

/// Shared handle to a running task; kept in the daemon registry until both
/// branches settle and the reply is sent.
pub struct TaskHandle {
    pub id: TaskId,
    pub trace_id: TraceId,
    snapshot: Mutex<TaskSnapshot>,
    cancel: CancelSource,
    token: CancelToken,
    /// Local-output cache key, computed during SETUP.
    output_key: Mutex<Option<Fingerprint>>,
}

impl TaskHandle {
    fn new(id: TaskId) -> Arc<Self> {
        let (cancel, token) = CancelSource::new();
        Arc::new(Self {
            id,
            trace_id: TraceId::generate(),
            snapshot: Mutex::new(TaskSnapshot::default()),
            cancel,
            token,
            output_key: Mutex::new(None),
        })
    }

    fn set_output_key(&self, key: Fingerprint) {
        *self.output_key.lock().expect("output key lock") = Some(key);
    }

    fn output_key(&self) -> Option<Fingerprint> {
        *self.output_key.lock().expect("output key lock")
    }

    /// Client went away (wrapper closed its socket) or daemon shutdown.
    pub fn wrapper_closed(&self) {
        self.cancel.cancel();
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.token.clone()
    }

    pub fn snapshot(&self) -> TaskSnapshot {
        self.snapshot.lock().expect("task snapshot lock").clone()
    }

    /// Forward-only state transition on the remote branch; local branch
    /// states are set directly at race resolution.
    fn set_state(&self, next: TaskState) {
        let mut snap = self.snapshot.lock().expect("task snapshot lock");
        debug_assert!(
            next.ordinal() >= snap.state.ordinal() || next == TaskState::Finished,
            "backward transition {} -> {}",
            snap.state,
            next
        );
        snap.state = next;
        if next.is_terminal() {
            snap.finished = true;
        }
    }

    fn update<F: FnOnce(&mut TaskSnapshot)>(&self, f: F) {
        f(&mut self.snapshot.lock().expect("task snapshot lock"));
    }
}

/// Everything the engine shares across tasks.
pub struct Daemon {
    pub config: ProxyConfig,
    pub rpc: Arc<dyn RpcChannel>,
    pub subprocess: Arc<dyn SubprocessHost>,
    pub flags: Arc<dyn FlagsParser>,
    pub include_scanner: Arc<dyn IncludeScanner>,
    pub link_scanner: Arc<dyn IncludeScanner>,
    pub resolver: Arc<CompilerResolver>,
    pub auth: Arc<TokenRefresher>,
    pub compiler_info: Arc<CompilerInfoCache>,
    pub deps: Arc<DepsCache>,
    pub blobs: Arc<BlobStage>,
    pub output_cache: Option<Arc<LocalOutputCache>>,
    pub dumper: Option<Arc<RequestDumper>>,
    pub events: TaskEventLog,
    pub staging_root: PathBuf,
    next_task_id: AtomicU64,
    tasks: Mutex<HashMap<u64, Arc<TaskHandle>>>,
}

impl Daemon {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: ProxyConfig,
        rpc: Arc<dyn RpcChannel>,
        subprocess: Arc<dyn SubprocessHost>,
        flags: Arc<dyn FlagsParser>,
        include_scanner: Arc<dyn IncludeScanner>,
        link_scanner: Arc<dyn IncludeScanner>,
        resolver: Arc<CompilerResolver>,
        auth: Arc<TokenRefresher>,
    ) -> Arc<Self> {
        let staging_root = config.cache_dir.join("staging");
        let blobs = BlobStage::new(config.max_concurrent_uploads)
            .with_upload_log(config.cache_dir.join("upload.log"));
        let output_cache = if config.local_output_cache {
            LocalOutputCache::new(config.cache_dir.join("local_outputs"))
                .map(Arc::new)
                .ok()
        } else {
            None
        };
        let dumper = config
            .request_dump_dir
            .clone()
            .and_then(|dir| RequestDumper::new(dir, config.request_dump_keep).ok())
            .map(Arc::new);

        Arc::new(Self {
            config,
            rpc,
            subprocess,
            flags,
            include_scanner,
            link_scanner,
            resolver,
            auth,
            compiler_info: Arc::new(CompilerInfoCache::new()),
            deps: Arc::new(DepsCache::new()),
            blobs: Arc::new(blobs),
            output_cache,
            dumper,
            events: TaskEventLog::new(256),
            staging_root,
            next_task_id: AtomicU64::new(1),
            tasks: Mutex::new(HashMap::new()),
        })
    }

    pub fn register_task(&self) -> Arc<TaskHandle> {
        let id = TaskId(self.next_task_id.fetch_add(1, Ordering::SeqCst));
        let handle = TaskHandle::new(id);
        self.tasks
            .lock()
            .expect("task registry lock")
            .insert(id.0, Arc::clone(&handle));
        handle
    }

    fn unregister_task(&self, id: TaskId) {
        self.tasks.lock().expect("task registry lock").remove(&id.0);
    }

    /// Copy-out of every live task, for `/statz`.
    pub fn tasks_snapshot(&self) -> Vec<serde_json::Value> {
        let tasks = self.tasks.lock().expect("task registry lock");
        let mut rows: Vec<_> = tasks
            .values()
            .map(|h| {
                json!({
                    "id": h.id.0,
                    "trace_id": h.trace_id.as_str(),
                    "snapshot": h.snapshot(),
                })
            })
            .collect();
        rows.sort_by_key(|v| v["id"].as_u64());
        rows
    }

    pub fn live_task_count(&self) -> usize {
        self.tasks.lock().expect("task registry lock").len()
    }

    /// Cancel every live task (daemon shutdown).
    pub fn cancel_all(&self) {
        for handle in self.tasks.lock().expect("task registry lock").values() {
            handle.wrapper_closed();
        }
    }
}

// ── Local branch ─────────────────────────────────────────────────────────

struct LocalBranch {
    handle: JoinHandle<Result<LocalOutcome, TaskError>>,
    cancel: CancelSource,
    settled: bool,
}

fn spawn_local(
    daemon: &Arc<Daemon>,
    req: &TaskRequest,
    program: PathBuf,
    low_priority: bool,
    start_delay: Duration,
) -> LocalBranch {
    let (cancel, token) = CancelSource::new();
    let cmd = LocalCommand {
        program,
        argv: req.argv.clone(),
        cwd: req.cwd.clone(),
        env: req.env.clone(),
        low_priority,
        start_delay,
    };
    let host = Arc::clone(&daemon.subprocess);
    let handle = tokio::spawn(async move { host.run(cmd, token).await });
    LocalBranch {
        handle,
        cancel,
        settled: false,
    }
}

impl LocalBranch {
    fn kill(&mut self) {
        self.cancel.cancel();
    }

    async fn reap(mut self) -> Option<Result<LocalOutcome, TaskError>> {
        if self.settled {
            return None;
        }
        self.settled = true;
        match (&mut self.handle).await {
            Ok(result) => Some(result),
            Err(_) => None,
        }
    }
}

// ── SETUP products ───────────────────────────────────────────────────────

struct SetupProduct {
    compiler_path: PathBuf,
    compiler_version: String,
    compiler_target: String,
    /// Absolute input paths with their content hashes and sizes.
    inputs: Vec<(PathBuf, ContentHash, u64)>,
    env_subset: BTreeMap<String, String>,
    output_cache_key: Option<Fingerprint>,
}

struct RemoteReady {
    resp: ExecResp,
    /// (cwd-relative name, staged temp path, final path)
    outputs: Vec<(String, PathBuf, PathBuf)>,
}

// ── Engine ───────────────────────────────────────────────────────────────

/// Run one compile task to completion. Returns `None` when the task was
/// cancelled (no reply is sent to the wrapper).
pub async fn run_task(daemon: Arc<Daemon>, req: TaskRequest) -> Option<WrapperReply> {
    let handle = daemon.register_task();
    let reply = drive_task(&daemon, &handle, req).await;
    daemon.unregister_task(handle.id);
    reply
}

/// Same as [`run_task`] but against a pre-registered handle, so the IPC
/// layer can cancel it on client disconnect.
pub async fn run_task_with_handle(
    daemon: Arc<Daemon>,
    handle: Arc<TaskHandle>,
    req: TaskRequest,
) -> Option<WrapperReply> {
    let reply = drive_task(&daemon, &handle, req).await;
    daemon.unregister_task(handle.id);
    reply
}

async fn drive_task(
    daemon: &Arc<Daemon>,
    handle: &Arc<TaskHandle>,
    req: TaskRequest,
) -> Option<WrapperReply> {
    let task_id = handle.id;
    let cancel = handle.cancel_token();
    let staging_dir = daemon.staging_root.join(format!("task-{}", task_id.0));

    daemon.events.publish(TaskEvent::Started {
        task_id: task_id.0,
        trace_id: handle.trace_id.as_str().to_string(),
        argv0: req.argv.first().cloned(),
        cwd: req.cwd.to_string_lossy().into_owned(),
    });
    info!(task = task_id.0, trace = %handle.trace_id, argv0 = ?req.argv.first(), "task started");

    // INIT: under fast and verify policies the local subprocess is
    // scheduled immediately, niced, so the remote path keeps a head start.
    let policy = daemon.config.fallback_policy;
    let mut local: Option<LocalBranch> = None;
    if matches!(policy, FallbackPolicy::Fast | FallbackPolicy::Verify) {
        if let Some(argv0) = req.argv.first() {
            match daemon.resolver.resolve(argv0, &req.cwd).await {
                Ok(program) => {
                    local = Some(spawn_local(daemon, &req, program, true, Duration::ZERO));
                }
                Err(e) => {
                    // No local compiler: the race degrades to remote-only.
                    warn!(task = task_id.0, error = %e, "cannot schedule local race");
                }
            }
        }
    }

    let remote_fut = remote_branch(daemon, handle, &req, staging_dir.clone());
    tokio::pin!(remote_fut);

    let mut verify_outcome: Option<LocalOutcome> = None;

    let reply = loop {
        let local_running = local.as_ref().map(|l| !l.settled).unwrap_or(false);

        tokio::select! {
            _ = cancel.cancelled() => {
                break on_cancelled(handle, local, &staging_dir).await;
            }

            local_res = async { (&mut local.as_mut().expect("guarded").handle).await }, if local_running => {
                local.as_mut().expect("guarded").settled = true;
                match local_res {
                    Ok(Ok(outcome)) => {
                        if policy == FallbackPolicy::Verify {
                            // Verify mode: local never wins the race; its
                            // result is held for comparison at commit.
                            verify_outcome = Some(outcome);
                            continue;
                        }
                        break on_local_won(daemon, handle, &req, outcome, &staging_dir).await;
                    }
                    Ok(Err(TaskError::Cancelled)) => continue,
                    Ok(Err(e)) => {
                        // Local cannot run; the remote branch is all we have.
                        warn!(task = task_id.0, error = %e, "local race leg failed");
                        local = None;
                        continue;
                    }
                    Err(join_err) => {
                        warn!(task = task_id.0, error = %join_err, "local race leg panicked");
                        local = None;
                        continue;
                    }
                }
            }

            remote = &mut remote_fut => {
                break on_remote_settled(
                    daemon,
                    handle,
                    &req,
                    remote,
                    local.take(),
                    verify_outcome.take(),
                    &staging_dir,
                )
                .await;
            }
        }
    };

    cleanup_staging(&staging_dir).await;

    match &reply {
        Some(r) => {
            daemon.events.publish(TaskEvent::Finished {
                task_id: task_id.0,
                exit_status: r.exit_status,
                served_by: r.served_by,
            });
            info!(task = task_id.0, exit = r.exit_status, served_by = %r.served_by, "task finished");
        }
        None => {
            daemon.events.publish(TaskEvent::Cancelled { task_id: task_id.0 });
            info!(task = task_id.0, "task cancelled");
        }
    }
    reply
}

/// Client disconnected: kill the local branch, abandon the remote branch,
/// scrub staging, reply nothing.
async fn on_cancelled(
    handle: &Arc<TaskHandle>,
    local: Option<LocalBranch>,
    staging_dir: &Path,
) -> Option<WrapperReply> {
    handle.update(|s| {
        s.canceled = true;
        s.abort = true;
    });
    handle.set_state(TaskState::Finished);
    if let Some(mut branch) = local {
        branch.kill();
        let _ = branch.reap().await;
    }
    cleanup_staging(staging_dir).await;
    None
}

/// Local subprocess finished first under the fast policy: it owns the
/// result; the remote branch is aborted by dropping its future.
async fn on_local_won(
    daemon: &Arc<Daemon>,
    handle: &Arc<TaskHandle>,
    req: &TaskRequest,
    outcome: LocalOutcome,
    staging_dir: &Path,
) -> Option<WrapperReply> {
    handle.update(|s| {
        s.abort = true;
        s.local_run = true;
        s.local_committed = true;
        s.state = TaskState::LocalFinished;
        s.finished = true;
    });
    daemon.events.publish(TaskEvent::LocalRaceWon {
        task_id: handle.id.0,
        exit_status: outcome.exit_status,
    });
    cleanup_staging(staging_dir).await;
    if outcome.success() {
        store_local_run_outputs(daemon, handle, req, &outcome);
    }
    Some(WrapperReply {
        exit_status: outcome.exit_status,
        stdout: outcome.stdout,
        stderr: outcome.stderr,
        served_by: ServedBy::Local,
    })
}

/// The remote branch settled: commit on success, fall back or report on
/// failure.
async fn on_remote_settled(
    daemon: &Arc<Daemon>,
    handle: &Arc<TaskHandle>,
    req: &TaskRequest,
    remote: Result<RemoteReady, TaskError>,
    mut local: Option<LocalBranch>,
    verify_outcome: Option<LocalOutcome>,
    staging_dir: &Path,
) -> Option<WrapperReply> {
    let policy = daemon.config.fallback_policy;

    match remote {
        Ok(ready) => {
            // Cache-hit shortcut already terminal.
            if handle.snapshot().state == TaskState::LocalOutput {
                if let Some(mut branch) = local.take() {
                    branch.kill();
                    handle.update(|s| s.local_killed = true);
                    let _ = branch.reap().await;
                }
                return Some(WrapperReply {
                    exit_status: ready.resp.exit_status,
                    stdout: ready.resp.stdout,
                    stderr: ready.resp.stderr,
                    served_by: ServedBy::LocalOutputCache,
                });
            }

            // Verify policy compares against a completed local run before
            // the remote outputs land.
            let verify_local = if policy == FallbackPolicy::Verify {
                match (verify_outcome, local.take()) {
                    (Some(outcome), _) => Some(outcome),
                    (None, Some(branch)) => match branch.reap().await {
                        Some(Ok(outcome)) => Some(outcome),
                        _ => None,
                    },
                    (None, None) => None,
                }
            } else {
                // Fast policy: the remote path won; kill the racer.
                if let Some(mut branch) = local.take() {
                    branch.kill();
                    handle.update(|s| s.local_killed = true);
                    daemon
                        .events
                        .publish(TaskEvent::LocalKilled { task_id: handle.id.0 });
                    let _ = branch.reap().await;
                }
                None
            };

            if let Some(local_out) = &verify_local {
                report_verify_mismatches(daemon, handle, &ready, local_out).await;
            }

            match commit_outputs(&ready).await {
                Ok(()) => {
                    handle.update(|s| s.remote_committed = true);
                    handle.set_state(TaskState::Finished);
                    store_local_outputs(daemon, handle, &ready).await;
                    Some(WrapperReply {
                        exit_status: ready.resp.exit_status,
                        stdout: ready.resp.stdout,
                        stderr: ready.resp.stderr,
                        served_by: ServedBy::Remote,
                    })
                }
                Err(e) => {
                    error!(task = handle.id.0, error = %e, "output commit failed, falling back");
                    fallback_to_local(daemon, handle, req, local, verify_local, e).await
                }
            }
        }
        Err(TaskError::Cancelled) => on_cancelled(handle, local, staging_dir).await,
        Err(e) if e.is_fallback_trigger() || handle.snapshot().should_fallback => {
            daemon.events.publish(TaskEvent::FallbackEngaged {
                task_id: handle.id.0,
                error_code: e.code(),
            });
            fallback_to_local(daemon, handle, req, local, verify_outcome, e).await
        }
        Err(e) => {
            // Semantic rejection: report to the user, never retry locally.
            if let Some(mut branch) = local.take() {
                branch.kill();
                handle.update(|s| s.local_killed = true);
                let _ = branch.reap().await;
            }
            handle.set_state(TaskState::Finished);
            warn!(task = handle.id.0, error = %e, "remote rejected request");
            Some(WrapperReply {
                exit_status: 1,
                stdout: String::new(),
                stderr: format!("compile proxy: {e}\n"),
                served_by: ServedBy::Remote,
            })
        }
    }
}

/// Remote branch failed recoverably: the local compiler produces the
/// result. Reuses a racing branch when one exists, otherwise starts a
/// fresh run at normal priority.
async fn fallback_to_local(
    daemon: &Arc<Daemon>,
    handle: &Arc<TaskHandle>,
    req: &TaskRequest,
    local: Option<LocalBranch>,
    completed_local: Option<LocalOutcome>,
    cause: TaskError,
) -> Option<WrapperReply> {
    handle.update(|s| {
        s.should_fallback = true;
        s.local_run = true;
        s.state = TaskState::LocalRun;
    });

    let outcome = match (completed_local, local) {
        // A racing local run already finished; its outputs are on disk.
        (Some(out), _) => Some(Ok(out)),
        (None, Some(branch)) if !branch.settled => branch.reap().await,
        _ => {
            let argv0 = req.argv.first().cloned().unwrap_or_default();
            match daemon.resolver.resolve(&argv0, &req.cwd).await {
                Ok(program) => {
                    let branch = spawn_local(daemon, req, program, false, Duration::ZERO);
                    branch.reap().await
                }
                Err(e) => Some(Err(e)),
            }
        }
    };

    match outcome {
        Some(Ok(out)) => {
            handle.update(|s| s.local_committed = true);
            handle.set_state(TaskState::Finished);
            if out.success() {
                store_local_run_outputs(daemon, handle, req, &out);
            }
            Some(WrapperReply {
                exit_status: out.exit_status,
                stdout: out.stdout,
                stderr: out.stderr,
                served_by: ServedBy::Local,
            })
        }
        Some(Err(TaskError::Cancelled)) | None => {
            handle.update(|s| s.canceled = true);
            handle.set_state(TaskState::Finished);
            None
        }
        Some(Err(e)) => {
            handle.set_state(TaskState::Finished);
            Some(WrapperReply {
                exit_status: 1,
                stdout: String::new(),
                stderr: format!(
                    "compile proxy: remote failed ({cause}); local fallback failed ({e})\n"
                ),
                served_by: ServedBy::Local,
            })
        }
    }
}

/// Byte-compare committed-to-be outputs against what the local compiler
/// wrote to the same final paths; mismatches are reported, never fatal.
async fn report_verify_mismatches(
    daemon: &Arc<Daemon>,
    handle: &Arc<TaskHandle>,
    ready: &RemoteReady,
    local_out: &LocalOutcome,
) {
    if !local_out.success() {
        debug!(task = handle.id.0, "verify local run failed; skipping comparison");
        return;
    }
    for (name, staged, final_path) in &ready.outputs {
        let remote_bytes = match tokio::fs::read(staged).await {
            Ok(b) => b,
            Err(_) => continue,
        };
        let local_bytes = match tokio::fs::read(final_path).await {
            Ok(b) => b,
            Err(_) => continue,
        };
        if remote_bytes != local_bytes {
            error!(
                task = handle.id.0,
                output = %name,
                remote_len = remote_bytes.len(),
                local_len = local_bytes.len(),
                "verify: remote and local outputs differ"
            );
            daemon.events.publish(TaskEvent::VerifyMismatch {
                task_id: handle.id.0,
                output: name.clone(),
            });
        }
    }
}

/// Persist committed remote outputs into the local-output cache.
async fn store_local_outputs(
    daemon: &Arc<Daemon>,
    handle: &Arc<TaskHandle>,
    ready: &RemoteReady,
) {
    let Some(cache) = &daemon.output_cache else {
        return;
    };
    let Some(key) = handle.output_key() else {
        return;
    };
    let outputs: Vec<(String, PathBuf)> = ready
        .outputs
        .iter()
        .map(|(name, _, final_path)| (name.clone(), final_path.clone()))
        .collect();
    if let Err(e) = cache.store(&key, &outputs, &ready.resp.stdout, &ready.resp.stderr) {
        warn!(task = handle.id.0, error = %e, "local-output cache store failed");
    }
}

/// Persist outputs a successful local run wrote to their final paths.
/// Requires SETUP to have computed the cache key; a local win that beat
/// SETUP simply isn't cached.
fn store_local_run_outputs(
    daemon: &Arc<Daemon>,
    handle: &Arc<TaskHandle>,
    req: &TaskRequest,
    outcome: &LocalOutcome,
) {
    let Some(cache) = &daemon.output_cache else {
        return;
    };
    let Some(key) = handle.output_key() else {
        return;
    };
    let Ok(parsed) = daemon.flags.parse(&req.argv, &req.cwd) else {
        return;
    };
    let outputs: Vec<(String, PathBuf)> = parsed
        .output_paths
        .iter()
        .filter(|p| p.exists())
        .map(|p| (relative_to(p, &req.cwd), p.clone()))
        .collect();
    if outputs.is_empty() {
        return;
    }
    if let Err(e) = cache.store(&key, &outputs, &outcome.stdout, &outcome.stderr) {
        warn!(task = handle.id.0, error = %e, "local-output cache store failed");
    }
}

// ── Remote branch stages ─────────────────────────────────────────────────

async fn remote_branch(
    daemon: &Arc<Daemon>,
    handle: &Arc<TaskHandle>,
    req: &TaskRequest,
    staging_dir: PathBuf,
) -> Result<RemoteReady, TaskError> {
    let cancel = handle.cancel_token();

    // SETUP
    handle.set_state(TaskState::Setup);
    let timer = StageTimer::start();
    let setup = setup_stage(daemon, handle, req).await?;
    handle.update(|s| s.stats.record_stage(TaskState::Setup, timer.elapsed()));

    // Local-output cache shortcut.
    if let (Some(cache), Some(key)) = (&daemon.output_cache, setup.output_cache_key) {
        if let Some(entry) = cache.lookup(&key) {
            cache.serve(&entry, &req.cwd).map_err(|e| TaskError::OutputCommit {
                path: req.cwd.display().to_string(),
                reason: e.to_string(),
            })?;
            handle.update(|s| {
                s.stats.output_cache_hit = true;
                s.local_committed = true;
            });
            handle.set_state(TaskState::LocalOutput);
            daemon
                .events
                .publish(TaskEvent::OutputCacheHit { task_id: handle.id.0 });
            return Ok(RemoteReady {
                resp: ExecResp {
                    trace_id: handle.trace_id.clone(),
                    exit_status: 0,
                    stdout: entry.stdout,
                    stderr: entry.stderr,
                    outputs: vec![],
                    missing_inputs: vec![],
                    error: None,
                },
                outputs: vec![],
            });
        }
    }

    // FILE_REQ
    handle.set_state(TaskState::FileReq);
    let timer = StageTimer::start();
    let authorization = current_authorization(daemon).await;
    let staged_blobs: Vec<StagedBlob> = setup
        .inputs
        .iter()
        .map(|(path, hash, size)| StagedBlob {
            path: path.clone(),
            expected_hash: hash.clone(),
            size: *size,
        })
        .collect();
    let inputs_total = staged_blobs.len();
    let stage_result = daemon
        .blobs
        .ensure_present(&daemon.rpc, staged_blobs, authorization.clone(), &cancel)
        .await;
    if let Some(err) = stage_result.err {
        return Err(err);
    }
    let staged_hashes: HashMap<PathBuf, ContentHash> =
        stage_result.staged.into_iter().collect();
    handle.update(|s| {
        s.stats.record_stage(TaskState::FileReq, timer.elapsed());
        s.stats.inputs_total = inputs_total;
        s.stats.inputs_uploaded = staged_hashes.len();
        s.stats.bytes_uploaded = setup.inputs.iter().map(|(_, _, sz)| *sz).sum();
    });

    // CALL_EXEC
    handle.set_state(TaskState::CallExec);
    let timer = StageTimer::start();
    let exec_req = build_exec_req(handle, req, &setup, &staged_hashes);
    let resp = call_exec_stage(daemon, handle, &exec_req, &cancel).await;
    let resp = match resp {
        Ok(r) => r,
        Err(e) => {
            dump_failed_request(daemon, handle, &exec_req, &e);
            return Err(e);
        }
    };
    handle.update(|s| s.stats.record_stage(TaskState::CallExec, timer.elapsed()));

    // FILE_RESP
    handle.set_state(TaskState::FileResp);
    let timer = StageTimer::start();
    let outputs = file_resp_stage(daemon, req, &resp, &staging_dir, &cancel).await?;
    handle.update(|s| {
        s.stats.record_stage(TaskState::FileResp, timer.elapsed());
        s.stats.outputs_downloaded = outputs.len();
        s.stats.bytes_downloaded = resp.outputs.iter().map(|o| o.size).sum();
    });

    Ok(RemoteReady { resp, outputs })
}

async fn setup_stage(
    daemon: &Arc<Daemon>,
    handle: &Arc<TaskHandle>,
    req: &TaskRequest,
) -> Result<SetupProduct, TaskError> {
    let argv0 = req
        .argv
        .first()
        .ok_or_else(|| TaskError::CompilerNotFound("empty argv".to_string()))?;

    let parsed = daemon.flags.parse(&req.argv, &req.cwd)?;
    match &parsed.kind {
        InvocationKind::Compile | InvocationKind::Link => {}
        InvocationKind::Preprocess => {
            return Err(TaskError::IncludeScan(
                "preprocess invocations run locally".to_string(),
            ));
        }
        InvocationKind::Unsupported(reason) => {
            handle.update(|s| s.should_fallback = true);
            return Err(TaskError::IncludeScan(format!(
                "unsupported invocation: {reason}"
            )));
        }
    }

    let compiler_path = daemon.resolver.resolve(argv0, &req.cwd).await?;
    let env_subset = relevant_env_subset(&req.env);

    let key = CompilerKey {
        path: compiler_path.clone(),
        version_argv: vec!["-dumpversion".to_string(), "-dumpmachine".to_string()],
        env_subset: env_subset.clone(),
    };
    let probe_path = compiler_path.clone();
    let probe_env = env_subset.clone();
    let info = daemon
        .compiler_info
        .get_or_probe(&key, move || async move {
            probe_gcc_like(&probe_path, &probe_env).await
        })
        .await
        .map_err(TaskError::CompilerNotFound)?;

    // Input set: deps-cache shortcut, else the scanner.
    let mut stat_cache = FileStatCache::new();
    let primary = parsed
        .primary_source
        .clone()
        .or_else(|| parsed.input_files.first().cloned())
        .ok_or_else(|| TaskError::IncludeScan("no input files".to_string()))?;
    let deps_fp = compile_fingerprint(
        &req.argv,
        &req.cwd.to_string_lossy(),
        &primary.to_string_lossy(),
        &info.version,
        &info.target,
    );

    let input_paths = match daemon.deps.lookup(&deps_fp, &mut stat_cache) {
        Some(paths) => {
            handle.update(|s| s.stats.deps_cache_hit = true);
            paths
        }
        None => {
            let scanner: &Arc<dyn IncludeScanner> = match parsed.kind {
                InvocationKind::Link => &daemon.link_scanner,
                _ => &daemon.include_scanner,
            };
            let mut paths = scanner
                .scan(&primary, &parsed.extra_inputs, &parsed.include_dirs, &req.cwd)
                .await?;
            for extra in parsed.input_files.iter().skip(1) {
                if !paths.contains(extra) {
                    paths.push(extra.clone());
                }
            }
            daemon.deps.store(deps_fp, &paths, &mut stat_cache);
            paths
        }
    };

    let mut inputs = Vec::with_capacity(input_paths.len());
    for path in &input_paths {
        let stat = stat_cache.stat(path).ok_or_else(|| {
            TaskError::IncludeScan(format!("input vanished: {}", path.display()))
        })?;
        let hash = stat_cache
            .content_hash(path)
            .map_err(|e| TaskError::IncludeScan(format!("hash {}: {e}", path.display())))?;
        inputs.push((path.clone(), hash, stat.size));
    }

    // Output-cache key covers the command identity plus input contents.
    let output_cache_key = if daemon.output_cache.is_some() {
        let mut builder = FingerprintBuilder::new("local-output-v1")
            .field_list("argv", req.argv.iter())
            .field("cwd", &req.cwd.to_string_lossy())
            .field("compiler_version", &info.version)
            .field("compiler_target", &info.target);
        let mut hashes: Vec<&str> = inputs.iter().map(|(_, h, _)| h.as_str()).collect();
        hashes.sort_unstable();
        builder = builder.field_list("input_hashes", hashes);
        let key = builder.finish();
        handle.set_output_key(key);
        Some(key)
    } else {
        None
    };

    Ok(SetupProduct {
        compiler_path,
        compiler_version: info.version.clone(),
        compiler_target: info.target.clone(),
        inputs,
        env_subset,
        output_cache_key,
    })
}

async fn current_authorization(daemon: &Arc<Daemon>) -> Option<String> {
    if daemon.auth.should_refresh() {
        daemon.auth.run_after_refresh().await;
    }
    daemon.auth.get_authorization()
}

fn build_exec_req(
    handle: &Arc<TaskHandle>,
    req: &TaskRequest,
    setup: &SetupProduct,
    staged_hashes: &HashMap<PathBuf, ContentHash>,
) -> ExecReq {
    let inputs = setup
        .inputs
        .iter()
        .map(|(path, hash, size)| {
            // Prefer the hash the stage actually uploaded (it differs when
            // the file changed underfoot).
            let hash = staged_hashes.get(path).cloned().unwrap_or_else(|| hash.clone());
            ExecInput {
                path: relative_to(path, &req.cwd),
                hash,
                size: *size,
            }
        })
        .collect();

    ExecReq {
        trace_id: handle.trace_id.clone(),
        command: CommandSpec {
            compiler_path: setup.compiler_path.to_string_lossy().into_owned(),
            version: setup.compiler_version.clone(),
            target: setup.compiler_target.clone(),
            argv: req.argv.clone(),
            cwd: req.cwd.to_string_lossy().into_owned(),
            env: setup.env_subset.clone(),
            subprograms: vec![],
        },
        inputs,
        requester: req.requester.clone(),
    }
}

async fn call_exec_stage(
    daemon: &Arc<Daemon>,
    handle: &Arc<TaskHandle>,
    exec_req: &ExecReq,
    cancel: &CancelToken,
) -> Result<ExecResp, TaskError> {
    let authorization = current_authorization(daemon).await;
    let budget = daemon.config.rpc_retry_budget;
    let backoff = daemon.config.rpc_retry_backoff;

    let call = || async {
        let auth = authorization.as_deref();
        tokio::select! {
            _ = cancel.cancelled() => Err(TaskError::Cancelled),
            resp = daemon.rpc.call_exec(exec_req, auth) => resp,
        }
    };

    let resp = with_retry(budget, backoff, call).await?;

    if let Some(err) = &resp.error {
        return Err(TaskError::RpcSemantic {
            code: err.code.clone(),
            message: err.message.clone(),
        });
    }

    // The service can race blob eviction against our FILE_REQ; restage the
    // hashes it reports missing, once.
    if !resp.missing_inputs.is_empty() {
        warn!(
            task = handle.id.0,
            missing = resp.missing_inputs.len(),
            "restaging inputs the service reported missing"
        );
        for hash in &resp.missing_inputs {
            daemon.blobs.forget(hash);
        }
        let blobs: Vec<StagedBlob> = exec_req
            .inputs
            .iter()
            .filter(|i| resp.missing_inputs.contains(&i.hash))
            .map(|i| StagedBlob {
                path: absolute_from(&i.path, &exec_req.command.cwd),
                expected_hash: i.hash.clone(),
                size: i.size,
            })
            .collect();
        let authorization = current_authorization(daemon).await;
        let restaged = daemon
            .blobs
            .ensure_present(&daemon.rpc, blobs, authorization, cancel)
            .await;
        if let Some(err) = restaged.err {
            return Err(err);
        }

        let retry = with_retry(0, backoff, || async {
            let auth = authorization_hdr(daemon).await;
            tokio::select! {
                _ = cancel.cancelled() => Err(TaskError::Cancelled),
                resp = daemon.rpc.call_exec(exec_req, auth.as_deref()) => resp,
            }
        })
        .await?;
        if !retry.missing_inputs.is_empty() {
            return Err(TaskError::RpcSemantic {
                code: "MISSING_INPUTS".to_string(),
                message: format!(
                    "{} inputs still missing after restage",
                    retry.missing_inputs.len()
                ),
            });
        }
        return Ok(retry);
    }

    Ok(resp)
}

async fn authorization_hdr(daemon: &Arc<Daemon>) -> Option<String> {
    daemon.auth.get_authorization()
}

async fn file_resp_stage(
    daemon: &Arc<Daemon>,
    req: &TaskRequest,
    resp: &ExecResp,
    staging_dir: &Path,
    cancel: &CancelToken,
) -> Result<Vec<(String, PathBuf, PathBuf)>, TaskError> {
    if resp.outputs.is_empty() {
        return Ok(vec![]);
    }
    tokio::fs::create_dir_all(staging_dir)
        .await
        .map_err(|e| TaskError::OutputCommit {
            path: staging_dir.display().to_string(),
            reason: e.to_string(),
        })?;

    let semaphore = Arc::new(tokio::sync::Semaphore::new(
        daemon.config.max_concurrent_downloads,
    ));
    let authorization = authorization_hdr(daemon).await;
    let mut join = tokio::task::JoinSet::new();

    for (idx, output) in resp.outputs.iter().enumerate() {
        let rpc = Arc::clone(&daemon.rpc);
        let sem = Arc::clone(&semaphore);
        let auth = authorization.clone();
        let cancel = cancel.clone();
        let output = output.clone();
        let staged_path = staging_dir.join(format!("out-{idx}"));
        let final_path = req.cwd.join(&output.name);

        join.spawn(async move {
            let _permit = sem.acquire().await.expect("download semaphore");
            if cancel.is_cancelled() {
                return Err(TaskError::Cancelled);
            }
            let data = tokio::select! {
                _ = cancel.cancelled() => return Err(TaskError::Cancelled),
                d = rpc.download_blob(&output.hash, auth.as_deref()) => d?,
            };

            // Hash and size verify before anything touches disk near the
            // final path.
            if data.len() as u64 != output.size {
                return Err(TaskError::OutputVerify {
                    path: output.name.clone(),
                    reason: format!("size {} != declared {}", data.len(), output.size),
                });
            }
            let actual = ContentHash::of_bytes(&data);
            if actual != output.hash {
                return Err(TaskError::OutputVerify {
                    path: output.name.clone(),
                    reason: "content hash mismatch".to_string(),
                });
            }

            tokio::fs::write(&staged_path, &data)
                .await
                .map_err(|e| TaskError::OutputCommit {
                    path: staged_path.display().to_string(),
                    reason: e.to_string(),
                })?;

            // Downstream incremental tooling needs object files to look
            // freshly built.
            if let Err(e) = coff::freshen_object_timestamp(&staged_path, coff::now_stamp()) {
                debug!(output = %output.name, error = %e, "coff freshen skipped");
            }

            Ok((output.name.clone(), staged_path, final_path))
        });
    }

    let mut outputs = Vec::with_capacity(resp.outputs.len());
    let mut first_err: Option<TaskError> = None;
    while let Some(joined) = join.join_next().await {
        match joined {
            Ok(Ok(tuple)) => outputs.push(tuple),
            Ok(Err(e)) => {
                if first_err.is_none() {
                    first_err = Some(e);
                    join.abort_all();
                }
            }
            Err(_) => {
                if first_err.is_none() {
                    first_err = Some(TaskError::OutputCommit {
                        path: String::new(),
                        reason: "download task panicked".to_string(),
                    });
                }
            }
        }
    }
    if let Some(e) = first_err {
        return Err(e);
    }
    // Deterministic commit order.
    outputs.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(outputs)
}

/// Atomically publish every staged output, or none of them.
async fn commit_outputs(ready: &RemoteReady) -> Result<(), TaskError> {
    let mut committed: Vec<PathBuf> = Vec::new();
    for (name, staged, final_path) in &ready.outputs {
        if let Some(parent) = final_path.parent() {
            if let Err(e) = tokio::fs::create_dir_all(parent).await {
                rollback_committed(&committed).await;
                return Err(TaskError::OutputCommit {
                    path: final_path.display().to_string(),
                    reason: e.to_string(),
                });
            }
        }

        let mut attempt = 0;
        loop {
            match tokio::fs::rename(staged, final_path).await {
                Ok(()) => {
                    committed.push(final_path.clone());
                    break;
                }
                Err(e) if attempt < COMMIT_RETRIES => {
                    attempt += 1;
                    debug!(output = %name, attempt, error = %e, "rename retry");
                    tokio::time::sleep(COMMIT_RETRY_DELAY).await;
                }
                Err(e) => {
                    rollback_committed(&committed).await;
                    return Err(TaskError::OutputCommit {
                        path: final_path.display().to_string(),
                        reason: e.to_string(),
                    });
                }
            }
        }
    }
    Ok(())
}

async fn rollback_committed(committed: &[PathBuf]) {
    for path in committed {
        let _ = tokio::fs::remove_file(path).await;
    }
}

fn dump_failed_request(
    daemon: &Arc<Daemon>,
    handle: &Arc<TaskHandle>,
    exec_req: &ExecReq,
    err: &TaskError,
) {
    if matches!(err, TaskError::Cancelled) {
        return;
    }
    if let Some(dumper) = &daemon.dumper {
        dumper.dump(&RequestDump {
            task_id: handle.id.0,
            error_code: err.code().to_string(),
            error_message: err.to_string(),
            request: exec_req.clone(),
        });
    }
}

async fn cleanup_staging(staging_dir: &Path) {
    if staging_dir.exists() {
        let _ = tokio::fs::remove_dir_all(staging_dir).await;
    }
}

fn relevant_env_subset(env: &[(String, String)]) -> BTreeMap<String, String> {
    env.iter()
        .filter(|(k, _)| RELEVANT_ENV.contains(&k.as_str()))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

fn relative_to(path: &Path, cwd: &Path) -> String {
    path.strip_prefix(cwd)
        .unwrap_or(path)
        .to_string_lossy()
        .into_owned()
}

fn absolute_from(path: &str, cwd: &str) -> PathBuf {
    let p = PathBuf::from(path);
    if p.is_absolute() {
        p
    } else {
        Path::new(cwd).join(p)
    }
}

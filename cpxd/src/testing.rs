//! Scripted collaborators for tests.
//!
//! Lives as a regular module (not `#[cfg(test)]`) so both unit tests and
//! the integration suite can drive the engine without a network or a real
//! compiler.

use crate::cancel::CancelToken;
use crate::local::{LocalCommand, LocalOutcome, SubprocessHost};
use crate::rpc::RpcChannel;
use async_trait::async_trait;
use cpx_common::errors::TaskError;
use cpx_common::hashing::ContentHash;
use cpx_common::protocol::{ExecOutput, ExecReq, ExecResp};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// In-memory exec service double.
///
/// Uploads land in an internal store; exec replies with the configured
/// outputs (whose blobs become downloadable); knobs inject failures and
/// latency at each surface.
#[derive(Default)]
pub struct FakeRpc {
    store: Mutex<HashMap<ContentHash, Vec<u8>>>,
    uploads: Mutex<Vec<ContentHash>>,
    exec_reqs: Mutex<Vec<ExecReq>>,
    outputs: Mutex<Vec<(String, Vec<u8>)>>,
    upload_failures_left: AtomicU32,
    exec_failures_left: AtomicU32,
    missing_inputs_once: AtomicBool,
    exec_error: Mutex<Option<&'static str>>,
    upload_delay: Mutex<Option<Duration>>,
    exec_delay: Mutex<Option<Duration>>,
    exec_exit_status: Mutex<i32>,
    exec_stderr: Mutex<String>,
    healthy: AtomicBool,
}

impl FakeRpc {
    pub fn new() -> Self {
        let fake = Self::default();
        fake.healthy.store(true, Ordering::SeqCst);
        fake
    }

    /// First `n` uploads fail with a 503.
    pub fn with_upload_failures(self, n: u32) -> Self {
        self.upload_failures_left.store(n, Ordering::SeqCst);
        self
    }

    /// First `n` exec calls fail with a 503.
    pub fn with_exec_failures(self, n: u32) -> Self {
        self.exec_failures_left.store(n, Ordering::SeqCst);
        self
    }

    /// Every exec call fails with the given error kind:
    /// `"transport"`, `"5xx"`, or `"semantic"`.
    pub fn with_exec_error(self, kind: &'static str) -> Self {
        *self.exec_error.lock().unwrap() = Some(kind);
        self
    }

    /// The first exec call reports every request input as missing,
    /// exercising the restage-and-retry path.
    pub fn with_missing_inputs_once(self) -> Self {
        self.missing_inputs_once.store(true, Ordering::SeqCst);
        self
    }

    pub fn with_upload_delay_ms(self, ms: u64) -> Self {
        *self.upload_delay.lock().unwrap() = Some(Duration::from_millis(ms));
        self
    }

    pub fn with_exec_delay_ms(self, ms: u64) -> Self {
        *self.exec_delay.lock().unwrap() = Some(Duration::from_millis(ms));
        self
    }

    /// Configure the outputs every successful exec reply carries.
    pub fn with_outputs(self, outputs: Vec<(&str, &[u8])>) -> Self {
        {
            let mut store = self.store.lock().unwrap();
            let mut out = self.outputs.lock().unwrap();
            for (name, data) in outputs {
                store.insert(ContentHash::of_bytes(data), data.to_vec());
                out.push((name.to_string(), data.to_vec()));
            }
        }
        self
    }

    pub fn with_exec_exit_status(self, status: i32, stderr: &str) -> Self {
        *self.exec_exit_status.lock().unwrap() = status;
        *self.exec_stderr.lock().unwrap() = stderr.to_string();
        self
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    pub fn upload_count(&self) -> usize {
        self.uploads.lock().unwrap().len()
    }

    pub fn exec_count(&self) -> usize {
        self.exec_reqs.lock().unwrap().len()
    }

    pub fn last_exec_req(&self) -> Option<ExecReq> {
        self.exec_reqs.lock().unwrap().last().cloned()
    }

    /// Whether the store holds a blob for `hash`.
    pub fn has_blob(&self, hash: &ContentHash) -> bool {
        self.store.lock().unwrap().contains_key(hash)
    }

    /// Corrupt a stored output blob so downloads fail verification.
    pub fn corrupt_blob(&self, hash: &ContentHash) {
        if let Some(data) = self.store.lock().unwrap().get_mut(hash) {
            data.push(0xFF);
        }
    }
}

#[async_trait]
impl RpcChannel for FakeRpc {
    async fn call_exec(
        &self,
        req: &ExecReq,
        _authorization: Option<&str>,
    ) -> Result<ExecResp, TaskError> {
        let delay = *self.exec_delay.lock().unwrap();
        if let Some(d) = delay {
            tokio::time::sleep(d).await;
        }
        self.exec_reqs.lock().unwrap().push(req.clone());

        if let Some(kind) = *self.exec_error.lock().unwrap() {
            return Err(match kind {
                "transport" => TaskError::RpcTransport("connection reset".to_string()),
                "5xx" => TaskError::RpcHttp5xx { status: 503 },
                _ => TaskError::RpcSemantic {
                    code: "INVALID_ARGUMENT".to_string(),
                    message: "scripted rejection".to_string(),
                },
            });
        }
        if self
            .exec_failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(TaskError::RpcHttp5xx { status: 503 });
        }
        if self.missing_inputs_once.swap(false, Ordering::SeqCst) {
            return Ok(ExecResp {
                trace_id: req.trace_id.clone(),
                exit_status: 0,
                stdout: String::new(),
                stderr: String::new(),
                outputs: vec![],
                missing_inputs: req.inputs.iter().map(|i| i.hash.clone()).collect(),
                error: None,
            });
        }

        let outputs: Vec<ExecOutput> = self
            .outputs
            .lock()
            .unwrap()
            .iter()
            .map(|(name, data)| ExecOutput {
                name: name.clone(),
                hash: ContentHash::of_bytes(data),
                size: data.len() as u64,
            })
            .collect();

        Ok(ExecResp {
            trace_id: req.trace_id.clone(),
            exit_status: *self.exec_exit_status.lock().unwrap(),
            stdout: String::new(),
            stderr: self.exec_stderr.lock().unwrap().clone(),
            outputs,
            missing_inputs: vec![],
            error: None,
        })
    }

    async fn upload_blob(
        &self,
        hash: &ContentHash,
        data: Vec<u8>,
        _authorization: Option<&str>,
    ) -> Result<(), TaskError> {
        let delay = *self.upload_delay.lock().unwrap();
        if let Some(d) = delay {
            tokio::time::sleep(d).await;
        }
        if self
            .upload_failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(TaskError::RpcHttp5xx { status: 503 });
        }
        self.uploads.lock().unwrap().push(hash.clone());
        self.store.lock().unwrap().insert(hash.clone(), data);
        Ok(())
    }

    async fn download_blob(
        &self,
        hash: &ContentHash,
        _authorization: Option<&str>,
    ) -> Result<Vec<u8>, TaskError> {
        self.store
            .lock()
            .unwrap()
            .get(hash)
            .cloned()
            .ok_or_else(|| TaskError::RpcSemantic {
                code: "NOT_FOUND".to_string(),
                message: format!("no blob {hash}"),
            })
    }

    async fn healthz(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }
}

/// Scripted local-compiler host.
///
/// Plays back a fixed outcome after a configurable delay and optionally
/// writes output files, so races against the remote branch are
/// deterministic in tests.
pub struct FakeSubprocessHost {
    outcome: LocalOutcome,
    delay: Duration,
    /// Files written relative to the command's cwd just before exiting.
    writes: Vec<(String, Vec<u8>)>,
    runs: AtomicU32,
    cancelled: AtomicU32,
}

impl FakeSubprocessHost {
    pub fn new(exit_status: i32) -> Self {
        Self {
            outcome: LocalOutcome {
                exit_status,
                stdout: String::new(),
                stderr: String::new(),
            },
            delay: Duration::ZERO,
            writes: Vec::new(),
            runs: AtomicU32::new(0),
            cancelled: AtomicU32::new(0),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_output(mut self, stdout: &str, stderr: &str) -> Self {
        self.outcome.stdout = stdout.to_string();
        self.outcome.stderr = stderr.to_string();
        self
    }

    /// Write `data` to `name` (cwd-relative) when the run completes.
    pub fn with_file_write(mut self, name: &str, data: &[u8]) -> Self {
        self.writes.push((name.to_string(), data.to_vec()));
        self
    }

    pub fn run_count(&self) -> u32 {
        self.runs.load(Ordering::SeqCst)
    }

    pub fn cancel_count(&self) -> u32 {
        self.cancelled.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SubprocessHost for FakeSubprocessHost {
    async fn run(&self, cmd: LocalCommand, cancel: CancelToken) -> Result<LocalOutcome, TaskError> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        let total = cmd.start_delay + self.delay;
        tokio::select! {
            _ = cancel.cancelled() => {
                self.cancelled.fetch_add(1, Ordering::SeqCst);
                Err(TaskError::Cancelled)
            }
            _ = tokio::time::sleep(total) => {
                for (name, data) in &self.writes {
                    let path = cmd.cwd.join(name);
                    if let Some(parent) = path.parent() {
                        let _ = std::fs::create_dir_all(parent);
                    }
                    std::fs::write(&path, data).map_err(|e| {
                        TaskError::LocalRun(format!("write {}: {e}", path.display()))
                    })?;
                }
                Ok(self.outcome.clone())
            }
        }
    }
}

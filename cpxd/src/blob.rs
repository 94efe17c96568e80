//! Content-addressed upload deduplicator.
//!
//! Every distinct blob content is uploaded to the remote store at most
//! once per daemon lifetime. Concurrent tasks naming the same hash
//! coalesce onto one in-flight upload; once a hash is Present it stays
//! Present. A bounded semaphore caps active upload RPCs across all tasks,
//! with overflow callers queueing in FIFO order.

use crate::cancel::CancelToken;
use crate::rpc::RpcChannel;
use cpx_common::errors::TaskError;
use cpx_common::hashing::ContentHash;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tokio::sync::{watch, Semaphore};
use tracing::{debug, warn};

/// One input the caller wants present remotely.
#[derive(Debug, Clone)]
pub struct StagedBlob {
    pub path: PathBuf,
    pub expected_hash: ContentHash,
    pub size: u64,
}

/// Outcome of an `ensure_present` call.
#[derive(Debug, Default)]
pub struct StageResult {
    /// Path → hash actually staged (differs from the expected hash when a
    /// file changed underfoot).
    pub staged: Vec<(PathBuf, ContentHash)>,
    pub err: Option<TaskError>,
}

enum BlobState {
    Uploading { done: watch::Receiver<bool> },
    Present,
    Failed { reason: String },
}

/// Process-wide upload dedup map.
pub struct BlobStage {
    states: Mutex<HashMap<ContentHash, BlobState>>,
    upload_slots: Arc<Semaphore>,
    log_path: Option<PathBuf>,
}

impl BlobStage {
    pub fn new(max_concurrent_uploads: usize) -> Self {
        Self {
            states: Mutex::new(HashMap::new()),
            upload_slots: Arc::new(Semaphore::new(max_concurrent_uploads.max(1))),
            log_path: None,
        }
    }

    /// Enable the upload log; hashes recorded there are believed Present
    /// across daemon restarts.
    pub fn with_upload_log(mut self, path: PathBuf) -> Self {
        self.log_path = Some(path);
        self
    }

    /// Replay the upload log, marking recorded hashes Present.
    pub fn load_upload_log(&self) -> std::io::Result<usize> {
        let Some(path) = &self.log_path else {
            return Ok(0);
        };
        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e),
        };
        let mut states = self.states.lock().expect("blob state lock");
        let mut loaded = 0;
        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str::<LogRow>(line) {
                Ok(row) => {
                    states.insert(ContentHash(row.hash), BlobState::Present);
                    loaded += 1;
                }
                Err(e) => warn!(error = %e, "skipping corrupt upload-log line"),
            }
        }
        Ok(loaded)
    }

    fn append_log(&self, hash: &ContentHash) {
        let Some(path) = &self.log_path else { return };
        let row = serde_json::to_string(&LogRow {
            hash: hash.0.clone(),
        })
        .expect("log row serialises");
        let result = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .and_then(|mut f| {
                use std::io::Write;
                writeln!(f, "{row}")
            });
        if let Err(e) = result {
            warn!(error = %e, "failed to append upload log");
        }
    }

    /// How many hashes are currently known Present.
    pub fn present_count(&self) -> usize {
        self.states
            .lock()
            .expect("blob state lock")
            .values()
            .filter(|s| matches!(s, BlobState::Present))
            .count()
    }

    /// Ensure every blob is present remotely, coalescing with other tasks.
    ///
    /// Stops issuing new uploads once `cancel` fires or an upload fails
    /// irrecoverably; uploads already in flight are owned by the stage and
    /// run to completion so their outcome benefits other tasks.
    pub async fn ensure_present(
        self: &Arc<Self>,
        rpc: &Arc<dyn RpcChannel>,
        blobs: Vec<StagedBlob>,
        authorization: Option<String>,
        cancel: &CancelToken,
    ) -> StageResult {
        let mut result = StageResult::default();
        let mut join = tokio::task::JoinSet::new();

        for blob in blobs {
            if cancel.is_cancelled() {
                result.err = Some(TaskError::Cancelled);
                break;
            }
            let stage = Arc::clone(self);
            let rpc = Arc::clone(rpc);
            let auth = authorization.clone();
            let cancel = cancel.clone();
            join.spawn(async move {
                let staged = stage.ensure_one(&rpc, &blob, auth.as_deref(), &cancel).await;
                (blob.path, staged)
            });
        }

        while let Some(joined) = join.join_next().await {
            match joined {
                Ok((path, Ok(hash))) => result.staged.push((path, hash)),
                Ok((_, Err(e))) => {
                    if result.err.is_none() {
                        result.err = Some(e);
                    }
                }
                Err(e) => {
                    if result.err.is_none() {
                        result.err = Some(TaskError::BlobUpload {
                            hash: String::new(),
                            reason: format!("upload task panicked: {e}"),
                        });
                    }
                }
            }
        }
        result
    }

    async fn ensure_one(
        self: &Arc<Self>,
        rpc: &Arc<dyn RpcChannel>,
        blob: &StagedBlob,
        authorization: Option<&str>,
        cancel: &CancelToken,
    ) -> Result<ContentHash, TaskError> {
        loop {
            // Decide our role under the lock: skip, wait, or upload.
            let action = {
                let mut states = self.states.lock().expect("blob state lock");
                match states.get(&blob.expected_hash) {
                    Some(BlobState::Present) => Action::AlreadyPresent,
                    Some(BlobState::Uploading { done }) => Action::Wait(done.clone()),
                    Some(BlobState::Failed { .. }) | None => {
                        // Failed entries are retried by whoever arrives next.
                        let (tx, rx) = watch::channel(false);
                        states.insert(
                            blob.expected_hash.clone(),
                            BlobState::Uploading { done: rx },
                        );
                        Action::Upload(tx)
                    }
                }
            };

            match action {
                Action::AlreadyPresent => return Ok(blob.expected_hash.clone()),
                Action::Wait(mut done) => {
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(TaskError::Cancelled),
                        changed = done.wait_for(|d| *d) => {
                            if changed.is_err() {
                                // Uploader vanished without settling; loop and
                                // take over the entry.
                                continue;
                            }
                        }
                    }
                    let outcome = {
                        let states = self.states.lock().expect("blob state lock");
                        match states.get(&blob.expected_hash) {
                            Some(BlobState::Present) => Ok(blob.expected_hash.clone()),
                            Some(BlobState::Failed { reason }) => Err(TaskError::BlobUpload {
                                hash: blob.expected_hash.0.clone(),
                                reason: reason.clone(),
                            }),
                            _ => Err(TaskError::BlobUpload {
                                hash: blob.expected_hash.0.clone(),
                                reason: "entry dropped (content changed underfoot)".to_string(),
                            }),
                        }
                    };
                    return outcome;
                }
                Action::Upload(tx) => {
                    return self.run_upload(rpc, blob, authorization, cancel, tx).await;
                }
            }
        }
    }

    async fn run_upload(
        self: &Arc<Self>,
        rpc: &Arc<dyn RpcChannel>,
        blob: &StagedBlob,
        authorization: Option<&str>,
        cancel: &CancelToken,
        tx: watch::Sender<bool>,
    ) -> Result<ContentHash, TaskError> {
        // Settle the entry no matter how we leave this function.
        let settle = |state: BlobState| {
            let mut states = self.states.lock().expect("blob state lock");
            states.insert(blob.expected_hash.clone(), state);
            let _ = tx.send(true);
        };

        if cancel.is_cancelled() {
            settle(BlobState::Failed {
                reason: "cancelled before upload".to_string(),
            });
            return Err(TaskError::Cancelled);
        }

        let data = match tokio::fs::read(&blob.path).await {
            Ok(d) => d,
            Err(e) => {
                let reason = format!("read {}: {e}", blob.path.display());
                settle(BlobState::Failed {
                    reason: reason.clone(),
                });
                return Err(TaskError::BlobUpload {
                    hash: blob.expected_hash.0.clone(),
                    reason,
                });
            }
        };

        let actual = ContentHash::of_bytes(&data);
        let upload_hash = if actual != blob.expected_hash {
            // File changed underfoot. Drop the stale entry and stage the
            // content that is actually on disk under its real hash.
            debug!(
                path = %blob.path.display(),
                expected = %blob.expected_hash,
                actual = %actual,
                "input changed underfoot, restaging under actual hash"
            );
            settle(BlobState::Failed {
                reason: "content changed underfoot".to_string(),
            });
            self.states
                .lock()
                .expect("blob state lock")
                .remove(&blob.expected_hash);
            actual.clone()
        } else {
            actual.clone()
        };

        // Bound active upload RPCs; FIFO under contention.
        let permit = self
            .upload_slots
            .acquire()
            .await
            .expect("upload semaphore closed");

        let outcome = rpc
            .upload_blob(&upload_hash, data, authorization)
            .await;
        drop(permit);

        match outcome {
            Ok(()) => {
                if upload_hash == blob.expected_hash {
                    settle(BlobState::Present);
                } else {
                    self.states
                        .lock()
                        .expect("blob state lock")
                        .insert(upload_hash.clone(), BlobState::Present);
                }
                self.append_log(&upload_hash);
                Ok(upload_hash)
            }
            Err(e) => {
                let reason = e.to_string();
                if upload_hash == blob.expected_hash {
                    settle(BlobState::Failed {
                        reason: reason.clone(),
                    });
                } else {
                    self.states.lock().expect("blob state lock").insert(
                        upload_hash.clone(),
                        BlobState::Failed {
                            reason: reason.clone(),
                        },
                    );
                }
                Err(TaskError::BlobUpload {
                    hash: upload_hash.0,
                    reason,
                })
            }
        }
    }

    /// Mark a hash Present without uploading (e.g. the exec service
    /// reported it already had the blob).
    pub fn mark_present(&self, hash: &ContentHash) {
        self.states
            .lock()
            .expect("blob state lock")
            .insert(hash.clone(), BlobState::Present);
        self.append_log(hash);
    }

    /// Drop whatever is known about `hash`. Used when the remote service
    /// disagrees that a blob is present (e.g. server-side eviction).
    pub fn forget(&self, hash: &ContentHash) {
        self.states.lock().expect("blob state lock").remove(hash);
    }

    /// Whether a hash is already known Present, without side effects.
    pub fn is_present(&self, hash: &ContentHash) -> bool {
        matches!(
            self.states.lock().expect("blob state lock").get(hash),
            Some(BlobState::Present)
        )
    }
}

enum Action {
    AlreadyPresent,
    Wait(watch::Receiver<bool>),
    Upload(watch::Sender<bool>),
}

#[derive(serde::Serialize, serde::Deserialize)]
struct LogRow {
    hash: String,
}

//! RPC channel to the remote exec service.
//!
//! The trait is the seam the engine and blob stage talk through; the
//! default implementation speaks HTTP via reqwest. Timeout discipline per
//! call: `initial_timeout` to the first response byte, and when that
//! expires a `/healthz` probe decides whether the remote is alive-but-slow
//! (grant one extension of `check_timeout`) or dead (fail the call).

use async_trait::async_trait;
use cpx_common::errors::TaskError;
use cpx_common::hashing::ContentHash;
use cpx_common::protocol::{ExecReq, ExecResp, EXEC_PATH, HEALTHZ_PATH};
use std::time::Duration;
use tracing::{debug, warn};

/// Timeouts applied to each outbound call.
#[derive(Debug, Clone, Copy)]
pub struct RpcTimeouts {
    pub initial: Duration,
    pub read: Duration,
    pub check: Duration,
}

impl Default for RpcTimeouts {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(20),
            read: Duration::from_secs(60),
            check: Duration::from_secs(30),
        }
    }
}

/// Transport to the remote exec service.
#[async_trait]
pub trait RpcChannel: Send + Sync {
    /// Issue the exec RPC. `authorization` is the pre-signed header value,
    /// absent when the refresher has no valid token.
    async fn call_exec(
        &self,
        req: &ExecReq,
        authorization: Option<&str>,
    ) -> Result<ExecResp, TaskError>;

    /// Upload one blob to the content-addressed store.
    async fn upload_blob(
        &self,
        hash: &ContentHash,
        data: Vec<u8>,
        authorization: Option<&str>,
    ) -> Result<(), TaskError>;

    /// Download one blob from the content-addressed store.
    async fn download_blob(
        &self,
        hash: &ContentHash,
        authorization: Option<&str>,
    ) -> Result<Vec<u8>, TaskError>;

    /// Liveness probe; used to distinguish slow from dead.
    async fn healthz(&self) -> bool;
}

/// HTTP implementation of [`RpcChannel`].
pub struct HttpRpcChannel {
    client: reqwest::Client,
    base_url: String,
    timeouts: RpcTimeouts,
}

impl HttpRpcChannel {
    pub fn new(base_url: impl Into<String>, timeouts: RpcTimeouts) -> Self {
        let client = reqwest::Client::builder()
            .pool_idle_timeout(Duration::from_secs(90))
            .build()
            .unwrap_or_default();
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            timeouts,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Run `send` with the initial timeout; on expiry consult healthz and,
    /// if the remote is alive, retry once with the extended deadline.
    async fn with_health_extension<F, Fut, T>(&self, send: F) -> Result<T, TaskError>
    where
        F: Fn(Duration) -> Fut,
        Fut: std::future::Future<Output = Result<T, TaskError>>,
    {
        match send(self.timeouts.initial + self.timeouts.read).await {
            Err(TaskError::RpcTransport(msg)) if msg.contains("timed out") => {
                debug!("initial timeout expired, probing healthz");
                if self.healthz().await {
                    debug!("remote alive, extending deadline once");
                    send(self.timeouts.check + self.timeouts.read).await
                } else {
                    Err(TaskError::RpcTransport(format!(
                        "{msg}; healthz probe failed"
                    )))
                }
            }
            other => other,
        }
    }

    fn classify_status(status: reqwest::StatusCode, body_hint: &str) -> Option<TaskError> {
        if status.is_server_error() {
            return Some(TaskError::RpcHttp5xx {
                status: status.as_u16(),
            });
        }
        if status.is_client_error() {
            return Some(TaskError::RpcSemantic {
                code: status.as_u16().to_string(),
                message: body_hint.chars().take(512).collect(),
            });
        }
        None
    }
}

fn transport_err(e: reqwest::Error) -> TaskError {
    if e.is_timeout() {
        TaskError::RpcTransport(format!("request timed out: {e}"))
    } else {
        TaskError::RpcTransport(e.to_string())
    }
}

#[async_trait]
impl RpcChannel for HttpRpcChannel {
    async fn call_exec(
        &self,
        req: &ExecReq,
        authorization: Option<&str>,
    ) -> Result<ExecResp, TaskError> {
        let url = self.url(EXEC_PATH);
        self.with_health_extension(|deadline| {
            let url = url.clone();
            async move {
                let mut builder = self.client.post(&url).timeout(deadline).json(req);
                if let Some(auth) = authorization {
                    builder = builder.header(reqwest::header::AUTHORIZATION, auth);
                }
                let resp = builder.send().await.map_err(transport_err)?;
                let status = resp.status();
                let body = resp.bytes().await.map_err(transport_err)?;
                if let Some(err) =
                    Self::classify_status(status, &String::from_utf8_lossy(&body))
                {
                    return Err(err);
                }
                serde_json::from_slice::<ExecResp>(&body).map_err(|e| TaskError::RpcSemantic {
                    code: "MALFORMED_BODY".to_string(),
                    message: e.to_string(),
                })
            }
        })
        .await
    }

    async fn upload_blob(
        &self,
        hash: &ContentHash,
        data: Vec<u8>,
        authorization: Option<&str>,
    ) -> Result<(), TaskError> {
        let url = self.url(&format!("/cas/{hash}"));
        let mut builder = self
            .client
            .post(&url)
            .timeout(self.timeouts.initial + self.timeouts.read)
            .body(data);
        if let Some(auth) = authorization {
            builder = builder.header(reqwest::header::AUTHORIZATION, auth);
        }
        let resp = builder.send().await.map_err(transport_err)?;
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        if let Some(err) = Self::classify_status(status, &body) {
            return Err(err);
        }
        Ok(())
    }

    async fn download_blob(
        &self,
        hash: &ContentHash,
        authorization: Option<&str>,
    ) -> Result<Vec<u8>, TaskError> {
        let url = self.url(&format!("/cas/{hash}"));
        self.with_health_extension(|deadline| {
            let url = url.clone();
            async move {
                let mut builder = self.client.get(&url).timeout(deadline);
                if let Some(auth) = authorization {
                    builder = builder.header(reqwest::header::AUTHORIZATION, auth);
                }
                let resp = builder.send().await.map_err(transport_err)?;
                let status = resp.status();
                if let Some(err) = Self::classify_status(status, "") {
                    return Err(err);
                }
                Ok(resp.bytes().await.map_err(transport_err)?.to_vec())
            }
        })
        .await
    }

    async fn healthz(&self) -> bool {
        let url = format!(
            "{}?pid={}",
            self.url(HEALTHZ_PATH),
            std::process::id()
        );
        match self
            .client
            .get(&url)
            .timeout(Duration::from_secs(5))
            .send()
            .await
        {
            Ok(resp) => resp.status().is_success(),
            Err(e) => {
                warn!(error = %e, "healthz probe failed");
                false
            }
        }
    }
}

/// Retry `call` on retryable errors with exponential backoff, up to
/// `budget` retries. 4xx and semantic errors surface immediately.
pub async fn with_retry<T, F, Fut>(
    budget: u32,
    min_backoff: Duration,
    call: F,
) -> Result<T, TaskError>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = Result<T, TaskError>>,
{
    let mut backoff = min_backoff;
    let mut attempt = 0u32;
    loop {
        match call().await {
            Ok(v) => return Ok(v),
            Err(e) if e.is_retryable() && attempt < budget => {
                attempt += 1;
                debug!(attempt, backoff_ms = backoff.as_millis() as u64, error = %e, "retrying rpc");
                tokio::time::sleep(backoff).await;
                backoff = backoff.saturating_mul(2);
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test(start_paused = true)]
    async fn test_with_retry_retries_5xx_until_budget() {
        let calls = AtomicU32::new(0);
        let result: Result<(), TaskError> = with_retry(2, Duration::from_millis(10), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(TaskError::RpcHttp5xx { status: 503 }) }
        })
        .await;
        assert!(matches!(result, Err(TaskError::RpcHttp5xx { status: 503 })));
        assert_eq!(calls.load(Ordering::SeqCst), 3, "initial + 2 retries");
    }

    #[tokio::test]
    async fn test_with_retry_does_not_retry_semantic() {
        let calls = AtomicU32::new(0);
        let result: Result<(), TaskError> = with_retry(5, Duration::from_millis(1), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async {
                Err(TaskError::RpcSemantic {
                    code: "400".into(),
                    message: "bad flag".into(),
                })
            }
        })
        .await;
        assert!(matches!(result, Err(TaskError::RpcSemantic { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_with_retry_succeeds_mid_budget() {
        let calls = AtomicU32::new(0);
        let result = with_retry(3, Duration::from_millis(10), || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(TaskError::RpcTransport("reset".into()))
                } else {
                    Ok(42)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_classify_status() {
        assert!(matches!(
            HttpRpcChannel::classify_status(reqwest::StatusCode::BAD_GATEWAY, ""),
            Some(TaskError::RpcHttp5xx { status: 502 })
        ));
        assert!(matches!(
            HttpRpcChannel::classify_status(reqwest::StatusCode::FORBIDDEN, "denied"),
            Some(TaskError::RpcSemantic { .. })
        ));
        assert!(HttpRpcChannel::classify_status(reqwest::StatusCode::OK, "").is_none());
    }
}

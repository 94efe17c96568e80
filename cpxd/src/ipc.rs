//! Local IPC server for the wrapper.
//!
//! HTTP/1.1 over a Unix domain socket: the wrapper posts a serialised
//! request to `/e` with `Host: 0.0.0.0` (browsers refuse that host, which
//! keeps cross-origin posts out of the daemon) and waits for the reply.
//! Before any bytes are parsed the peer's uid must match ours; a build
//! proxying compiles for another user would blur credential boundaries.
//! The wrapper hanging up mid-task is the cancellation signal.

use crate::task::{run_task_with_handle, Daemon, TaskRequest};
use cpx_common::errors::ConfigError;
use cpx_common::protocol::{WrapperRequest, EXEC_PATH, IPC_CONTENT_TYPE, IPC_HOST};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, info, warn};

/// Upper bounds on request framing; a compile line is small, the body
/// carries argv and env only.
const MAX_HEAD_BYTES: usize = 64 * 1024;
const MAX_BODY_BYTES: usize = 16 * 1024 * 1024;

pub struct IpcServer {
    daemon: Arc<Daemon>,
    listener: UnixListener,
    socket_path: PathBuf,
}

impl IpcServer {
    /// Bind the daemon socket, replacing a stale one from a dead daemon.
    pub fn bind(daemon: Arc<Daemon>) -> Result<Self, ConfigError> {
        let socket_path = daemon.config.socket_path.clone();
        if socket_path.exists() {
            std::fs::remove_file(&socket_path).map_err(|e| ConfigError::SocketBind {
                path: socket_path.display().to_string(),
                source: e,
            })?;
        }
        if let Some(parent) = socket_path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let listener = UnixListener::bind(&socket_path).map_err(|e| ConfigError::SocketBind {
            path: socket_path.display().to_string(),
            source: e,
        })?;
        info!(socket = %socket_path.display(), "ipc listening");
        Ok(Self {
            daemon,
            listener,
            socket_path,
        })
    }

    pub fn socket_path(&self) -> &PathBuf {
        &self.socket_path
    }

    /// Accept loop; runs until the daemon shuts down.
    pub async fn serve(self) {
        loop {
            match self.listener.accept().await {
                Ok((stream, _)) => {
                    let daemon = Arc::clone(&self.daemon);
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(daemon, stream).await {
                            debug!(error = %e, "ipc connection ended with error");
                        }
                    });
                }
                Err(e) => {
                    warn!(error = %e, "ipc accept failed");
                    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                }
            }
        }
    }
}

/// The uid this daemon runs as, for the peer-identity check.
fn own_uid() -> Option<u32> {
    #[cfg(target_os = "linux")]
    {
        use std::os::unix::fs::MetadataExt;
        std::fs::metadata("/proc/self").ok().map(|m| m.uid())
    }
    #[cfg(not(target_os = "linux"))]
    {
        None
    }
}

async fn handle_connection(daemon: Arc<Daemon>, mut stream: UnixStream) -> std::io::Result<()> {
    // Peer identity: same-user only.
    if let (Ok(cred), Some(uid)) = (stream.peer_cred(), own_uid()) {
        if cred.uid() != uid {
            warn!(peer_uid = cred.uid(), own_uid = uid, "rejecting cross-user ipc connection");
            write_response(&mut stream, 403, b"peer uid mismatch").await?;
            return Ok(());
        }
    }

    let request = match read_http_request(&mut stream).await {
        Ok(r) => r,
        Err(e) => {
            write_response(&mut stream, 400, e.as_bytes()).await?;
            return Ok(());
        }
    };

    if request.method != "POST" || request.path != EXEC_PATH {
        write_response(&mut stream, 404, b"unknown endpoint").await?;
        return Ok(());
    }
    if request.host.as_deref() != Some(IPC_HOST) {
        write_response(&mut stream, 400, b"bad Host header").await?;
        return Ok(());
    }

    let wrapper_req: WrapperRequest = match serde_json::from_slice(&request.body) {
        Ok(r) => r,
        Err(e) => {
            write_response(&mut stream, 400, format!("bad body: {e}").as_bytes()).await?;
            return Ok(());
        }
    };

    let task_req = TaskRequest {
        argv: wrapper_req.argv,
        env: wrapper_req.env,
        cwd: PathBuf::from(wrapper_req.cwd),
        requester: wrapper_req.requester,
    };

    let handle = daemon.register_task();
    let disconnect_handle = Arc::clone(&handle);

    // The wrapper sends nothing after the request; readable EOF means it
    // exited and the task must be cancelled promptly.
    let (mut read_half, mut write_half) = stream.into_split();
    let task_fut = run_task_with_handle(daemon, Arc::clone(&handle), task_req);
    tokio::pin!(task_fut);

    let mut eof_buf = [0u8; 1];
    let reply = loop {
        tokio::select! {
            reply = &mut task_fut => break reply,
            read = read_half.read(&mut eof_buf) => {
                match read {
                    Ok(0) | Err(_) => {
                        debug!(task = disconnect_handle.id.0, "wrapper closed; cancelling task");
                        disconnect_handle.wrapper_closed();
                        // Let the engine unwind; it replies None.
                        break (&mut task_fut).await;
                    }
                    Ok(_) => {
                        // Stray bytes after the request are ignored.
                        continue;
                    }
                }
            }
        }
    };

    match reply {
        Some(reply) => {
            let body = serde_json::to_vec(&reply).unwrap_or_default();
            write_reply(&mut write_half, &body).await?;
        }
        None => {
            // Cancelled: no reply goes out.
        }
    }
    Ok(())
}

#[derive(Debug)]
struct HttpRequest {
    method: String,
    path: String,
    host: Option<String>,
    body: Vec<u8>,
}

/// Minimal HTTP/1.1 request reader: request line, headers, fixed-length
/// body.
async fn read_http_request(stream: &mut UnixStream) -> Result<HttpRequest, String> {
    let mut head = Vec::with_capacity(1024);
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        if head.len() > MAX_HEAD_BYTES {
            return Err("request head too large".to_string());
        }
        let n = stream
            .read(&mut byte)
            .await
            .map_err(|e| format!("read head: {e}"))?;
        if n == 0 {
            return Err("connection closed mid-head".to_string());
        }
        head.push(byte[0]);
    }

    let head_text = String::from_utf8_lossy(&head);
    let mut lines = head_text.split("\r\n");
    let request_line = lines.next().unwrap_or_default();
    let mut parts = request_line.split_whitespace();
    let method = parts.next().unwrap_or_default().to_string();
    let path = parts.next().unwrap_or_default().to_string();

    let mut host = None;
    let mut content_length = 0usize;
    let mut content_type = None;
    for line in lines {
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();
        if name.eq_ignore_ascii_case("host") {
            host = Some(value.to_string());
        } else if name.eq_ignore_ascii_case("content-length") {
            content_length = value
                .parse()
                .map_err(|_| "bad Content-Length".to_string())?;
        } else if name.eq_ignore_ascii_case("content-type") {
            content_type = Some(value.to_string());
        }
    }

    if content_length > MAX_BODY_BYTES {
        return Err("body too large".to_string());
    }
    if let Some(ct) = &content_type {
        if ct != IPC_CONTENT_TYPE {
            return Err(format!("unexpected content type {ct}"));
        }
    }

    let mut body = vec![0u8; content_length];
    stream
        .read_exact(&mut body)
        .await
        .map_err(|e| format!("read body: {e}"))?;

    Ok(HttpRequest {
        method,
        path,
        host,
        body,
    })
}

async fn write_response(stream: &mut UnixStream, status: u16, body: &[u8]) -> std::io::Result<()> {
    let reason = match status {
        200 => "OK",
        400 => "Bad Request",
        403 => "Forbidden",
        404 => "Not Found",
        _ => "Error",
    };
    let head = format!(
        "HTTP/1.1 {status} {reason}\r\nContent-Type: text/plain\r\nContent-Length: {}\r\n\r\n",
        body.len()
    );
    stream.write_all(head.as_bytes()).await?;
    stream.write_all(body).await?;
    stream.flush().await
}

async fn write_reply(
    write_half: &mut tokio::net::unix::OwnedWriteHalf,
    body: &[u8],
) -> std::io::Result<()> {
    let head = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: {IPC_CONTENT_TYPE}\r\nContent-Length: {}\r\n\r\n",
        body.len()
    );
    write_half.write_all(head.as_bytes()).await?;
    write_half.write_all(body).await?;
    write_half.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_read_http_request_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.sock");
        let listener = UnixListener::bind(&path).unwrap();

        let client = tokio::spawn({
            let path = path.clone();
            async move {
                let mut stream = UnixStream::connect(&path).await.unwrap();
                let body = br#"{"argv":["gcc"],"env":[],"cwd":"/src"}"#;
                let head = format!(
                    "POST /e HTTP/1.1\r\nHost: 0.0.0.0\r\nContent-Type: binary/x-protocol-buffer\r\nContent-Length: {}\r\n\r\n",
                    body.len()
                );
                stream.write_all(head.as_bytes()).await.unwrap();
                stream.write_all(body).await.unwrap();
                stream.flush().await.unwrap();
                // Keep the connection open until the server has parsed.
                tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            }
        });

        let (mut stream, _) = listener.accept().await.unwrap();
        let req = read_http_request(&mut stream).await.unwrap();
        assert_eq!(req.method, "POST");
        assert_eq!(req.path, "/e");
        assert_eq!(req.host.as_deref(), Some("0.0.0.0"));
        let parsed: WrapperRequest = serde_json::from_slice(&req.body).unwrap();
        assert_eq!(parsed.argv, vec!["gcc"]);
        client.await.unwrap();
    }

    #[tokio::test]
    async fn test_wrong_content_type_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.sock");
        let listener = UnixListener::bind(&path).unwrap();

        let client = tokio::spawn({
            let path = path.clone();
            async move {
                let mut stream = UnixStream::connect(&path).await.unwrap();
                let head =
                    "POST /e HTTP/1.1\r\nHost: 0.0.0.0\r\nContent-Type: text/html\r\nContent-Length: 0\r\n\r\n";
                stream.write_all(head.as_bytes()).await.unwrap();
                stream.flush().await.unwrap();
                tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            }
        });

        let (mut stream, _) = listener.accept().await.unwrap();
        let err = read_http_request(&mut stream).await.unwrap_err();
        assert!(err.contains("content type"));
        client.await.unwrap();
    }
}

//! Client side of the daemon IPC protocol.
//!
//! Used by the wrapper and by integration tests. Speaks the same minimal
//! HTTP/1.1-over-Unix-socket dialect the daemon serves.

use crate::protocol::{WrapperReply, WrapperRequest, EXEC_PATH, IPC_CONTENT_TYPE, IPC_HOST};
use std::path::Path;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;

const MAX_HEAD_BYTES: usize = 64 * 1024;

/// Post one compile request and wait for the reply.
pub async fn post_exec_request(
    socket_path: &Path,
    request: &WrapperRequest,
) -> Result<WrapperReply, String> {
    let mut stream = UnixStream::connect(socket_path)
        .await
        .map_err(|e| format!("connect {}: {e}", socket_path.display()))?;

    let body = serde_json::to_vec(request).map_err(|e| e.to_string())?;
    let head = format!(
        "POST {EXEC_PATH} HTTP/1.1\r\nHost: {IPC_HOST}\r\nContent-Type: {IPC_CONTENT_TYPE}\r\nContent-Length: {}\r\n\r\n",
        body.len()
    );
    stream
        .write_all(head.as_bytes())
        .await
        .map_err(|e| format!("write request: {e}"))?;
    stream
        .write_all(&body)
        .await
        .map_err(|e| format!("write body: {e}"))?;
    stream.flush().await.map_err(|e| e.to_string())?;

    let mut head = Vec::with_capacity(256);
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        if head.len() > MAX_HEAD_BYTES {
            return Err("response head too large".to_string());
        }
        let n = stream
            .read(&mut byte)
            .await
            .map_err(|e| format!("read response: {e}"))?;
        if n == 0 {
            return Err("daemon closed connection without reply".to_string());
        }
        head.push(byte[0]);
    }

    let head_text = String::from_utf8_lossy(&head);
    let status_line = head_text.split("\r\n").next().unwrap_or_default();
    if !status_line.contains("200") {
        return Err(format!("daemon replied: {status_line}"));
    }
    let content_length: usize = head_text
        .split("\r\n")
        .find_map(|line| {
            let (name, value) = line.split_once(':')?;
            name.eq_ignore_ascii_case("content-length")
                .then(|| value.trim().parse().ok())?
        })
        .ok_or("missing Content-Length")?;

    let mut body = vec![0u8; content_length];
    stream
        .read_exact(&mut body)
        .await
        .map_err(|e| format!("read reply body: {e}"))?;
    serde_json::from_slice(&body).map_err(|e| format!("parse reply: {e}"))
}

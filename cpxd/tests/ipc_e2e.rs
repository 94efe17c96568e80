//! End-to-end tests over the wrapper IPC socket: a daemon backed by
//! scripted collaborators, driven through the same client the wrapper
//! uses.

use cpx_common::config::{AuthSource, ProxyConfig};
use cpx_common::ipc_client::post_exec_request;
use cpx_common::protocol::{
    RequesterInfo, ServedBy, WrapperRequest, EXEC_PATH, IPC_CONTENT_TYPE,
};
use cpxd::auth::TokenRefresher;
use cpxd::flags::GccStyleFlags;
use cpxd::include_scan::{LexicalIncludeScanner, LinkInputScanner};
use cpxd::ipc::IpcServer;
use cpxd::task::Daemon;
use cpxd::testing::{FakeRpc, FakeSubprocessHost};
use cpxd::wrapper_probe::CompilerResolver;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;

struct Harness {
    daemon: Arc<Daemon>,
    fake_rpc: Arc<FakeRpc>,
    socket: PathBuf,
    work: PathBuf,
    compiler: PathBuf,
    _dir: tempfile::TempDir,
}

fn write_fake_compiler(dir: &Path) -> PathBuf {
    let path = dir.join("cc");
    std::fs::write(&path, "#!/bin/sh\nexit 0\n").unwrap();
    let mut perms = std::fs::metadata(&path).unwrap().permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&path, perms).unwrap();
    path
}

async fn start_daemon(fake_rpc: FakeRpc, fake_local: FakeSubprocessHost) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let socket = dir.path().join("cpxd.sock");
    let work = dir.path().join("work");
    std::fs::create_dir_all(&work).unwrap();
    std::fs::write(work.join("a.c"), b"int main() { return 0; }\n").unwrap();
    let compiler = write_fake_compiler(dir.path());

    let config = ProxyConfig {
        socket_path: socket.clone(),
        server_url: "http://127.0.0.1:0".into(),
        auth_scope: String::new(),
        auth_source: AuthSource::None,
        fallback_policy: Default::default(),
        max_concurrent_uploads: 8,
        max_concurrent_downloads: 4,
        http_initial_timeout: Duration::from_secs(5),
        http_read_timeout: Duration::from_secs(5),
        http_check_timeout: Duration::from_secs(5),
        rpc_retry_budget: 0,
        rpc_retry_backoff: Duration::from_millis(1),
        cache_dir: dir.path().join("cache"),
        status_port: 0,
        request_dump_dir: None,
        request_dump_keep: 4,
        local_output_cache: false,
    };

    let fake_rpc = Arc::new(fake_rpc);
    let daemon = Daemon::new(
        config,
        fake_rpc.clone(),
        Arc::new(fake_local),
        Arc::new(GccStyleFlags),
        Arc::new(LexicalIncludeScanner::new()),
        Arc::new(LinkInputScanner),
        Arc::new(CompilerResolver::new(None)),
        TokenRefresher::new(&AuthSource::None, ""),
    );

    let server = IpcServer::bind(Arc::clone(&daemon)).unwrap();
    tokio::spawn(server.serve());

    Harness {
        daemon,
        fake_rpc,
        socket,
        work,
        compiler,
        _dir: dir,
    }
}

fn compile_request(h: &Harness) -> WrapperRequest {
    WrapperRequest {
        argv: vec![
            h.compiler.to_string_lossy().into_owned(),
            "-c".to_string(),
            "a.c".to_string(),
            "-o".to_string(),
            "a.o".to_string(),
        ],
        env: vec![("LANG".to_string(), "C".to_string())],
        cwd: h.work.to_string_lossy().into_owned(),
        requester: RequesterInfo {
            username: "tester".to_string(),
            hostname: "test-host".to_string(),
            pid: std::process::id(),
        },
    }
}

#[tokio::test]
async fn remote_compile_round_trips_over_ipc() {
    let h = start_daemon(
        FakeRpc::new().with_outputs(vec![("a.o", b"object code")]),
        FakeSubprocessHost::new(0),
    )
    .await;

    let reply = post_exec_request(&h.socket, &compile_request(&h))
        .await
        .expect("daemon reply");
    assert_eq!(reply.exit_status, 0);
    assert_eq!(reply.served_by, ServedBy::Remote);
    assert_eq!(std::fs::read(h.work.join("a.o")).unwrap(), b"object code");
    assert_eq!(h.fake_rpc.exec_count(), 1);
}

#[tokio::test]
async fn remote_failure_served_by_local_fallback() {
    let h = start_daemon(
        FakeRpc::new().with_exec_error("transport"),
        FakeSubprocessHost::new(0).with_output("", "compiled locally\n"),
    )
    .await;

    let reply = post_exec_request(&h.socket, &compile_request(&h))
        .await
        .expect("daemon reply");
    assert_eq!(reply.exit_status, 0);
    assert_eq!(reply.served_by, ServedBy::Local);
    assert_eq!(reply.stderr, "compiled locally\n");
}

#[tokio::test]
async fn client_disconnect_cancels_task() {
    let h = start_daemon(
        FakeRpc::new()
            .with_outputs(vec![("a.o", b"slow object")])
            .with_exec_delay_ms(5_000),
        FakeSubprocessHost::new(0),
    )
    .await;

    // Hand-roll the request so the connection can be dropped mid-task.
    let request = compile_request(&h);
    let body = serde_json::to_vec(&request).unwrap();
    let mut stream = tokio::net::UnixStream::connect(&h.socket).await.unwrap();
    let head = format!(
        "POST {EXEC_PATH} HTTP/1.1\r\nHost: 0.0.0.0\r\nContent-Type: {IPC_CONTENT_TYPE}\r\nContent-Length: {}\r\n\r\n",
        body.len()
    );
    stream.write_all(head.as_bytes()).await.unwrap();
    stream.write_all(&body).await.unwrap();
    stream.flush().await.unwrap();

    // Let the task get going, then vanish like a killed build step.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(h.daemon.live_task_count(), 1);
    drop(stream);

    // Cancellation is prompt: the registry drains well before the 5 s
    // remote call would have completed.
    let mut drained = false;
    for _ in 0..20 {
        tokio::time::sleep(Duration::from_millis(50)).await;
        if h.daemon.live_task_count() == 0 {
            drained = true;
            break;
        }
    }
    assert!(drained, "task must be cancelled promptly on disconnect");
    assert!(!h.work.join("a.o").exists(), "no output after cancellation");
}

#[tokio::test]
async fn malformed_request_gets_http_error() {
    let h = start_daemon(FakeRpc::new(), FakeSubprocessHost::new(0)).await;

    let mut stream = tokio::net::UnixStream::connect(&h.socket).await.unwrap();
    let head = format!(
        "POST {EXEC_PATH} HTTP/1.1\r\nHost: 0.0.0.0\r\nContent-Type: {IPC_CONTENT_TYPE}\r\nContent-Length: 7\r\n\r\nnotjson"
    );
    stream.write_all(head.as_bytes()).await.unwrap();
    stream.flush().await.unwrap();

    use tokio::io::AsyncReadExt;
    let mut buf = Vec::new();
    let mut byte = [0u8; 1];
    while !buf.ends_with(b"\r\n\r\n") && buf.len() < 4096 {
        let n = stream.read(&mut byte).await.unwrap();
        if n == 0 {
            break;
        }
        buf.push(byte[0]);
    }
    let head_text = String::from_utf8_lossy(&buf);
    assert!(head_text.starts_with("HTTP/1.1 400"), "got: {head_text}");
}

#[tokio::test]
async fn wrong_host_header_rejected() {
    let h = start_daemon(FakeRpc::new(), FakeSubprocessHost::new(0)).await;

    let mut stream = tokio::net::UnixStream::connect(&h.socket).await.unwrap();
    let head = format!(
        "POST {EXEC_PATH} HTTP/1.1\r\nHost: example.com\r\nContent-Type: {IPC_CONTENT_TYPE}\r\nContent-Length: 2\r\n\r\n{{}}"
    );
    stream.write_all(head.as_bytes()).await.unwrap();
    stream.flush().await.unwrap();

    use tokio::io::AsyncReadExt;
    let mut buf = Vec::new();
    let mut byte = [0u8; 1];
    while !buf.ends_with(b"\r\n\r\n") && buf.len() < 4096 {
        let n = stream.read(&mut byte).await.unwrap();
        if n == 0 {
            break;
        }
        buf.push(byte[0]);
    }
    let head_text = String::from_utf8_lossy(&buf);
    assert!(head_text.starts_with("HTTP/1.1 400"), "got: {head_text}");
}

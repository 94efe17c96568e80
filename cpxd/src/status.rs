//! Status HTTP endpoints.
//!
//! - `/healthz`: liveness, echoes the caller-supplied pid
//! - `/statz`: JSON snapshot of live tasks and cache occupancy
//! - `/tokenz`: auth refresher state, token value redacted

use crate::task::Daemon;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;

pub fn create_router(daemon: Arc<Daemon>) -> Router {
    Router::new()
        .route("/healthz", get(healthz_handler))
        .route("/statz", get(statz_handler))
        .route("/tokenz", get(tokenz_handler))
        .with_state(daemon)
}

#[derive(Deserialize)]
struct HealthzParams {
    pid: Option<u32>,
}

async fn healthz_handler(Query(params): Query<HealthzParams>) -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(json!({
            "status": "ok",
            "pid": std::process::id(),
            "caller_pid": params.pid,
        })),
    )
}

async fn statz_handler(State(daemon): State<Arc<Daemon>>) -> impl IntoResponse {
    let (deps_hits, deps_misses) = daemon.deps.hit_rate();
    Json(json!({
        "live_tasks": daemon.tasks_snapshot(),
        "live_task_count": daemon.live_task_count(),
        "recent_events": daemon.events.recent(),
        "blobs_present": daemon.blobs.present_count(),
        "compiler_info_entries": daemon.compiler_info.len().await,
        "deps_cache": {
            "entries": daemon.deps.len(),
            "hits": deps_hits,
            "misses": deps_misses,
        },
    }))
}

async fn tokenz_handler(State(daemon): State<Arc<Daemon>>) -> impl IntoResponse {
    Json(daemon.auth.status())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::TokenRefresher;
    use crate::flags::GccStyleFlags;
    use crate::include_scan::{LexicalIncludeScanner, LinkInputScanner};
    use crate::local::TokioSubprocessHost;
    use crate::testing::FakeRpc;
    use crate::wrapper_probe::CompilerResolver;
    use cpx_common::config::{AuthSource, ProxyConfig};

    fn test_daemon(dir: &std::path::Path) -> Arc<Daemon> {
        let config = ProxyConfig {
            socket_path: dir.join("cpxd.sock"),
            server_url: "http://127.0.0.1:0".into(),
            auth_scope: String::new(),
            auth_source: AuthSource::None,
            fallback_policy: Default::default(),
            max_concurrent_uploads: 4,
            max_concurrent_downloads: 4,
            http_initial_timeout: std::time::Duration::from_secs(5),
            http_read_timeout: std::time::Duration::from_secs(5),
            http_check_timeout: std::time::Duration::from_secs(5),
            rpc_retry_budget: 0,
            rpc_retry_backoff: std::time::Duration::from_millis(10),
            cache_dir: dir.join("cache"),
            status_port: 0,
            request_dump_dir: None,
            request_dump_keep: 4,
            local_output_cache: false,
        };
        Daemon::new(
            config,
            Arc::new(FakeRpc::new()),
            Arc::new(TokioSubprocessHost),
            Arc::new(GccStyleFlags),
            Arc::new(LexicalIncludeScanner::new()),
            Arc::new(LinkInputScanner),
            Arc::new(CompilerResolver::new(None)),
            TokenRefresher::new(&AuthSource::None, ""),
        )
    }

    async fn body_json(resp: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(resp.into_body(), 64 * 1024)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_healthz_echoes_pid() {
        let resp = healthz_handler(Query(HealthzParams { pid: Some(4242) }))
            .await
            .into_response();
        assert_eq!(resp.status(), StatusCode::OK);
        let v = body_json(resp).await;
        assert_eq!(v["status"], "ok");
        assert_eq!(v["caller_pid"], 4242);
    }

    #[tokio::test]
    async fn test_statz_reports_empty_daemon() {
        let dir = tempfile::tempdir().unwrap();
        let daemon = test_daemon(dir.path());
        let resp = statz_handler(State(daemon)).await.into_response();
        assert_eq!(resp.status(), StatusCode::OK);
        let v = body_json(resp).await;
        assert_eq!(v["live_task_count"], 0);
        assert_eq!(v["blobs_present"], 0);
    }

    #[tokio::test]
    async fn test_tokenz_redacts_and_reports_source() {
        let dir = tempfile::tempdir().unwrap();
        let daemon = test_daemon(dir.path());
        let resp = tokenz_handler(State(daemon)).await.into_response();
        let v = body_json(resp).await;
        assert_eq!(v["source"], "none");
        assert_eq!(v["has_token"], false);
    }
}

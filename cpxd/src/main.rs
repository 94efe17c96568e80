//! cpx compiler-proxy daemon.
//!
//! Bootstraps configuration from `GOMA_*` variables, restores persisted
//! caches, binds the wrapper socket and the status HTTP server, then
//! serves compile tasks until interrupted.

use anyhow::{Context, Result};
use clap::Parser;
use cpxd::auth::TokenRefresher;
use cpxd::flags::GccStyleFlags;
use cpxd::include_scan::{LexicalIncludeScanner, LinkInputScanner};
use cpxd::ipc::IpcServer;
use cpxd::local::TokioSubprocessHost;
use cpxd::rpc::{HttpRpcChannel, RpcTimeouts};
use cpxd::task::Daemon;
use cpxd::wrapper_probe::CompilerResolver;
use cpx_common::config::ProxyConfig;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "cpxd")]
#[command(author, version, about = "cpx daemon - compiler proxy with remote execution")]
struct Cli {
    /// Override the wrapper socket path (GOMA_COMPILER_PROXY_SOCKET_NAME).
    #[arg(short, long)]
    socket: Option<PathBuf>,

    /// Path to this daemon's wrapper binary, for self-identification
    /// during compiler resolution.
    #[arg(long)]
    wrapper: Option<PathBuf>,

    /// Enable verbose output.
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    info!("starting cpx daemon...");

    let mut config = match ProxyConfig::from_env() {
        Ok(c) => c,
        Err(e) => {
            error!("configuration error: {e}");
            eprintln!("cpxd: {e}");
            std::process::exit(1);
        }
    };
    if let Some(socket) = cli.socket {
        config.socket_path = socket;
    }

    std::fs::create_dir_all(&config.cache_dir).with_context(|| {
        format!("creating cache directory {}", config.cache_dir.display())
    })?;

    let rpc = Arc::new(HttpRpcChannel::new(
        config.server_url.clone(),
        RpcTimeouts {
            initial: config.http_initial_timeout,
            read: config.http_read_timeout,
            check: config.http_check_timeout,
        },
    ));
    let auth = TokenRefresher::new(&config.auth_source, &config.auth_scope);
    info!(
        server = %config.server_url,
        auth = config.auth_source.kind(),
        fallback = %config.fallback_policy,
        "configured"
    );

    let resolver = Arc::new(CompilerResolver::new(cli.wrapper.as_deref()));
    let status_port = config.status_port;
    let compiler_info_path = config.cache_dir.join("compiler_info.json");

    let daemon = Daemon::new(
        config,
        rpc,
        Arc::new(TokioSubprocessHost),
        Arc::new(GccStyleFlags),
        Arc::new(LexicalIncludeScanner::new()),
        Arc::new(LinkInputScanner),
        resolver,
        Arc::clone(&auth),
    );

    // Restore persisted state from previous runs.
    match daemon.compiler_info.load(&compiler_info_path).await {
        Ok(n) if n > 0 => info!("restored {n} compiler info entries"),
        Ok(_) => {}
        Err(e) => warn!("compiler info cache load failed: {e}"),
    }
    match daemon.blobs.load_upload_log() {
        Ok(n) if n > 0 => info!("restored {n} uploaded blob hashes"),
        Ok(_) => {}
        Err(e) => warn!("upload log load failed: {e}"),
    }

    // Status HTTP server.
    if status_port != 0 {
        let router = cpxd::status::create_router(Arc::clone(&daemon));
        let addr = std::net::SocketAddr::from(([127, 0, 0, 1], status_port));
        match tokio::net::TcpListener::bind(addr).await {
            Ok(listener) => {
                info!(port = status_port, "status server listening");
                tokio::spawn(async move {
                    if let Err(e) = axum::serve(listener, router).await {
                        error!("status server failed: {e}");
                    }
                });
            }
            Err(e) => warn!(port = status_port, "status server bind failed: {e}"),
        }
    }

    let ipc = match IpcServer::bind(Arc::clone(&daemon)) {
        Ok(server) => server,
        Err(e) => {
            error!("ipc bind error: {e}");
            eprintln!("cpxd: {e}");
            std::process::exit(1);
        }
    };

    let serve = tokio::spawn(ipc.serve());

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    info!("shutting down...");

    serve.abort();
    daemon.cancel_all();
    auth.shutdown();
    if let Err(e) = daemon.compiler_info.save(&compiler_info_path).await {
        warn!("compiler info cache save failed: {e}");
    }

    info!("shutdown complete");
    Ok(())
}

pub mod config;
pub mod engine;
pub mod providers;
pub mod supervisor;

use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use tokio::net::TcpListener;
use axum::Router;
use rmcp::transport::streamable_http_server::{
    StreamableHttpServerConfig,
    StreamableHttpService,
    session::local::LocalSessionManager,
};
use tokio_util::sync::CancellationToken;

use crate::config::WorkerConfigStore;
use crate::engine::audit::AuditLogger;
use crate::engine::server::RelayEngine;
use crate::supervisor::ProcessSupervisor;

/// Fallback audit log for development (relative to CWD).
const DEV_AUDIT_LOG: &str = "audit.log";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("relayd=info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    tracing::info!("Starting relayd node agent");

    let config = config::load_config()?;
    let bind_addr = format!("{}:{}", config.server.bind, config.server.port);
    if config.dev_mode {
        tracing::warn!("Running in dev mode");
    }

    // The last applied worker config survives agent restarts on disk.
    let worker_config = Arc::new(WorkerConfigStore::new(&config.worker.config_file));
    let blob = worker_config.load().await?;
    tracing::info!(
        "Loaded worker config from {} ({} bytes)",
        worker_config.path().display(),
        blob.len()
    );

    let supervisor = Arc::new(
        ProcessSupervisor::new(&config.worker.executable, blob)
            .with_args(config.worker.args.iter().cloned()),
    );
    tracing::info!("Worker executable: {}", supervisor.executable().display());

    // Set up audit log
    let audit_path = if config.dev_mode
        || !std::path::Path::new(&config.audit.path)
            .parent()
            .is_some_and(|p| p.exists())
    {
        DEV_AUDIT_LOG.to_string()
    } else {
        config.audit.path.clone()
    };
    let audit_logger = Arc::new(AuditLogger::new(&audit_path));
    tracing::info!("Audit log: {}", audit_path);

    // Cancelled on SIGINT/SIGTERM; closes open sessions so serve can drain.
    let shutdown = CancellationToken::new();
    let session_manager = LocalSessionManager::default();

    let sup = supervisor.clone();
    let aud = audit_logger.clone();
    let node_name = config.node_name.clone();
    let store = worker_config.clone();
    let stop_timeout = config.worker.stop_timeout();
    let control_service = StreamableHttpService::new(
        move || {
            let engine = RelayEngine::new(
                sup.clone(),
                aud.clone(),
                node_name.clone(),
                store.clone(),
                stop_timeout,
            );
            Ok(engine)
        },
        session_manager.into(),
        StreamableHttpServerConfig {
            cancellation_token: shutdown.child_token(),
            ..Default::default()
        },
    );

    let app = Router::new().nest_service("/api/v1/control", control_service);
    let listener = TcpListener::bind(&bind_addr).await?;

    // Only bring the worker up once the control plane can reach us.
    if config.worker.autostart {
        if let Err(e) = supervisor.start().await {
            tracing::error!(error = %e, "Autostart of worker failed, waiting for control plane");
        }
    }

    let trigger = shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        trigger.cancel();
    });

    tracing::info!(node = %config.node_name, "relayd control surface listening on http://{}", bind_addr);
    let served = serve_until_cancelled(listener, app, shutdown).await;

    tracing::info!("Shutting down, stopping worker");
    if let Err(e) = supervisor.stop(config.worker.stop_timeout()).await {
        tracing::warn!(error = %e, "Worker did not stop cleanly");
    }

    served?;
    Ok(())
}

/// Serve the control surface until `shutdown` is cancelled.
async fn serve_until_cancelled(
    listener: TcpListener,
    app: Router,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await
}

/// Resolves on SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

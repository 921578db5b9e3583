use serde_json::Value;
use std::time::Duration;

use crate::config::WorkerConfigStore;
use crate::supervisor::ProcessSupervisor;

pub async fn worker_start(sup: &ProcessSupervisor) -> anyhow::Result<Value> {
    sup.start()
        .await
        .map_err(|e| anyhow::anyhow!("cannot start worker: {}", e))?;
    Ok(serde_json::json!({"status": "started", "pid": sup.pid()}))
}

pub async fn worker_stop(sup: &ProcessSupervisor, timeout: Duration) -> anyhow::Result<Value> {
    sup.stop(timeout)
        .await
        .map_err(|e| anyhow::anyhow!("cannot stop worker: {}", e))?;
    Ok(serde_json::json!({"status": "stopped"}))
}

pub async fn worker_restart(sup: &ProcessSupervisor, timeout: Duration) -> anyhow::Result<Value> {
    sup.restart(timeout)
        .await
        .map_err(|e| anyhow::anyhow!("cannot restart worker: {}", e))?;
    Ok(serde_json::json!({"status": "restarted", "pid": sup.pid()}))
}

/// Persist the new blob, then swap it in. The running worker is untouched;
/// it picks the blob up on its next start or restart.
pub async fn worker_update_config(
    sup: &ProcessSupervisor,
    store: &WorkerConfigStore,
    blob: &str,
) -> anyhow::Result<Value> {
    store
        .persist_then(blob, || sup.update_config(blob))
        .await
        .map_err(|e| anyhow::anyhow!("cannot write config to file: {}", e))?;
    Ok(serde_json::json!({
        "status": "updated",
        "bytes": blob.len(),
        "path": store.path().display().to_string(),
    }))
}

pub async fn worker_status(sup: &ProcessSupervisor) -> anyhow::Result<Value> {
    Ok(serde_json::json!({
        "running": sup.is_running(),
        "pid": sup.pid(),
        "last_exit": sup.last_exit().map(|o| o.to_string()),
    }))
}

pub async fn worker_config(sup: &ProcessSupervisor) -> anyhow::Result<Value> {
    Ok(serde_json::json!({"config": sup.config()}))
}

pub async fn node_info(sup: &ProcessSupervisor, node_name: &str) -> anyhow::Result<Value> {
    Ok(serde_json::json!({
        "node_name": node_name,
        "running": sup.is_running(),
    }))
}

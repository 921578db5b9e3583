use serde::Serialize;
use serde_json::Value;
use std::io::Write;
use std::path::{Path, PathBuf};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use crate::supervisor::ProcessSupervisor;

/// Worker state as it stood right after the request completed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkerSnapshot {
    pub running: bool,
    pub pid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_exit: Option<String>,
}

impl WorkerSnapshot {
    pub fn capture(sup: &ProcessSupervisor) -> Self {
        Self {
            running: sup.is_running(),
            pid: sup.pid(),
            last_exit: sup.last_exit().map(|o| o.to_string()),
        }
    }
}

/// One control-plane request, as appended to the audit log.
#[derive(Debug, Clone, Serialize)]
pub struct AuditEvent {
    pub timestamp: String,
    pub verb: String,
    pub params: Value,
    pub result: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: u64,
    pub worker: WorkerSnapshot,
}

impl AuditEvent {
    pub fn new(
        verb: &str,
        params: &Value,
        error: Option<String>,
        duration_ms: u64,
        worker: WorkerSnapshot,
    ) -> Self {
        let timestamp = OffsetDateTime::now_utc()
            .format(&Rfc3339)
            .unwrap_or_else(|_| "UnknownTime".to_string());
        Self {
            timestamp,
            verb: verb.to_string(),
            params: params.clone(),
            result: if error.is_none() { "success" } else { "error" },
            error,
            duration_ms,
            worker,
        }
    }
}

/// Append-only JSON-lines log of every verb the control plane invoked.
#[derive(Debug, Clone)]
pub struct AuditLogger {
    path: PathBuf,
}

impl AuditLogger {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Never fails the request it describes; problems only reach the log.
    pub async fn record(&self, event: AuditEvent) {
        let line = match serde_json::to_string(&event) {
            Ok(line) => line,
            Err(e) => {
                tracing::warn!(verb = %event.verb, "Audit event serialization failed: {}", e);
                return;
            }
        };

        let path = self.path.clone();
        match tokio::task::spawn_blocking(move || append_line(&path, &line)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::warn!(path = %self.path.display(), verb = %event.verb, "Audit write failed: {}", e)
            }
            Err(e) => tracing::error!("Audit task panicked: {}", e),
        }
    }
}

fn append_line(path: &Path, line: &str) -> std::io::Result<()> {
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    writeln!(file, "{}", line)
}

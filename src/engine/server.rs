use rmcp::{
    handler::server::{ServerHandler, tool::ToolRouter, wrapper::Parameters},
    model::*,
    tool, tool_handler, tool_router,
    ErrorData as McpError,
};
use crate::config::WorkerConfigStore;
use crate::engine::audit::{AuditEvent, AuditLogger, WorkerSnapshot};
use crate::supervisor::ProcessSupervisor;
use std::sync::Arc;
use std::time::Duration;

/// The control surface the control plane talks to. Each tool maps 1:1 onto
/// a supervisor verb; every failure comes back as INTERNAL_ERROR carrying
/// the underlying message.
#[derive(Clone)]
pub struct RelayEngine {
    tool_router: ToolRouter<Self>,
    pub supervisor: Arc<ProcessSupervisor>,
    pub audit: Arc<AuditLogger>,
    pub node_name: String,
    pub worker_config: Arc<WorkerConfigStore>,
    pub default_stop_timeout: Duration,
}

impl RelayEngine {
    fn start_tool_call(&self, tool: &str, params: &serde_json::Value) -> std::time::Instant {
        tracing::info!(verb = %tool, params = %params, "control request");
        std::time::Instant::now()
    }

    async fn complete_tool_call(
        &self,
        tool: &str,
        params: &serde_json::Value,
        start: std::time::Instant,
        result: anyhow::Result<serde_json::Value>,
    ) -> Result<CallToolResult, McpError> {
        let duration = start.elapsed().as_millis() as u64;
        let worker = WorkerSnapshot::capture(&self.supervisor);
        match result {
            Ok(info) => {
                tracing::info!(verb = %tool, duration_ms = duration, running = worker.running, "control request ok");
                self.audit
                    .record(AuditEvent::new(tool, params, None, duration, worker))
                    .await;
                Ok(CallToolResult::success(vec![Content::text(serde_json::to_string(&info).unwrap_or_default())]))
            }
            Err(e) => {
                tracing::warn!(verb = %tool, duration_ms = duration, error = %e, "control request failed");
                self.audit
                    .record(AuditEvent::new(tool, params, Some(e.to_string()), duration, worker))
                    .await;
                Err(Self::internal_error(e))
            }
        }
    }

    fn internal_error(e: impl std::fmt::Display) -> McpError {
        McpError {
            code: ErrorCode::INTERNAL_ERROR,
            message: e.to_string().into(),
            data: None,
        }
    }

    fn stop_timeout(&self, timeout_ms: Option<u64>) -> Duration {
        timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(self.default_stop_timeout)
    }
}

// ── Argument structs ──────────────────────────────────────────────────

#[derive(serde::Deserialize, schemars::JsonSchema)]
pub struct DeadlineArgs {
    #[schemars(description = "Milliseconds to wait for a graceful exit before killing the worker (default from agent config)")]
    pub timeout_ms: Option<u64>,
}

#[derive(serde::Deserialize, schemars::JsonSchema)]
pub struct UpdateConfigArgs {
    #[schemars(description = "Complete worker configuration; replaces the stored one")]
    pub config: String,
}

// ── Tool implementations ──────────────────────────────────────────────

#[tool_router]
impl RelayEngine {
    pub fn new(
        supervisor: Arc<ProcessSupervisor>,
        audit: Arc<AuditLogger>,
        node_name: String,
        worker_config: Arc<WorkerConfigStore>,
        default_stop_timeout: Duration,
    ) -> Self {
        Self {
            tool_router: Self::tool_router(),
            supervisor,
            audit,
            node_name,
            worker_config,
            default_stop_timeout,
        }
    }

    #[tool(description = "Start the proxy worker with the stored configuration")]
    async fn worker_start(&self) -> Result<CallToolResult, McpError> {
        let tool_name = "worker.start";
        let params = serde_json::json!({});
        let start = self.start_tool_call(tool_name, &params);

        let result = crate::providers::worker::worker_start(&self.supervisor).await;
        self.complete_tool_call(tool_name, &params, start, result).await
    }

    #[tool(description = "Stop the proxy worker: SIGTERM, then SIGKILL once the timeout expires")]
    async fn worker_stop(
        &self,
        args: Parameters<DeadlineArgs>,
    ) -> Result<CallToolResult, McpError> {
        let tool_name = "worker.stop";
        let timeout = self.stop_timeout(args.0.timeout_ms);
        let params = serde_json::json!({"timeout_ms": timeout.as_millis() as u64});
        let start = self.start_tool_call(tool_name, &params);

        let result = crate::providers::worker::worker_stop(&self.supervisor, timeout).await;
        self.complete_tool_call(tool_name, &params, start, result).await
    }

    #[tool(description = "Restart a running proxy worker so it picks up the stored configuration")]
    async fn worker_restart(
        &self,
        args: Parameters<DeadlineArgs>,
    ) -> Result<CallToolResult, McpError> {
        let tool_name = "worker.restart";
        let timeout = self.stop_timeout(args.0.timeout_ms);
        let params = serde_json::json!({"timeout_ms": timeout.as_millis() as u64});
        let start = self.start_tool_call(tool_name, &params);

        let result = crate::providers::worker::worker_restart(&self.supervisor, timeout).await;
        self.complete_tool_call(tool_name, &params, start, result).await
    }

    #[tool(description = "Persist and store a new worker configuration; applied on the next start or restart")]
    async fn worker_update_config(
        &self,
        args: Parameters<UpdateConfigArgs>,
    ) -> Result<CallToolResult, McpError> {
        let tool_name = "worker.update_config";
        // The blob itself can be large and may hold credentials; log its size only.
        let params = serde_json::json!({"config_bytes": args.0.config.len()});
        let start = self.start_tool_call(tool_name, &params);

        let result = crate::providers::worker::worker_update_config(
            &self.supervisor,
            &self.worker_config,
            &args.0.config,
        )
        .await;
        self.complete_tool_call(tool_name, &params, start, result).await
    }

    #[tool(description = "Report whether the proxy worker is running, its pid, and how it last exited")]
    async fn worker_status(&self) -> Result<CallToolResult, McpError> {
        let tool_name = "worker.status";
        let params = serde_json::json!({});
        let start = self.start_tool_call(tool_name, &params);

        let result = crate::providers::worker::worker_status(&self.supervisor).await;
        self.complete_tool_call(tool_name, &params, start, result).await
    }

    #[tool(description = "Return the stored worker configuration")]
    async fn worker_config(&self) -> Result<CallToolResult, McpError> {
        let tool_name = "worker.config";
        let params = serde_json::json!({});
        let start = self.start_tool_call(tool_name, &params);

        let result = crate::providers::worker::worker_config(&self.supervisor).await;
        self.complete_tool_call(tool_name, &params, start, result).await
    }

    #[tool(description = "Return the node name and whether its proxy worker is running")]
    async fn node_info(&self) -> Result<CallToolResult, McpError> {
        let tool_name = "node.info";
        let params = serde_json::json!({});
        let start = self.start_tool_call(tool_name, &params);

        let result = crate::providers::worker::node_info(&self.supervisor, &self.node_name).await;
        self.complete_tool_call(tool_name, &params, start, result).await
    }
}

#[tool_handler]
impl ServerHandler for RelayEngine {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: ProtocolVersion::V_2024_11_05,
            capabilities: ServerCapabilities::builder()
                .enable_tools()
                .build(),
            server_info: Implementation::from_build_env(),
            instructions: Some(
                "relayd supervises this node's proxy worker. It can start, stop, \
                 and restart the worker, and replace the configuration it is \
                 started with.".into()
            ),
            ..Default::default()
        }
    }
}

//! Short-lived stdio sessions against capability servers.
//!
//! Each call launches the server, initializes a client, performs one request
//! and shuts the session down, with every phase bounded by a timeout.

use std::time::Duration;

use async_trait::async_trait;
use rust_mcp_sdk::McpClient;
use rust_mcp_sdk::mcp_client::{ClientHandlerCore, client_runtime_core};
use rust_mcp_sdk::schema::schema_utils::{
    NotificationFromServer, RequestFromServer, ResultFromClient,
};
use rust_mcp_sdk::schema::{
    CallToolRequestParams, ClientCapabilities, Implementation, InitializeRequestParams,
    LATEST_PROTOCOL_VERSION, RpcError,
};
use rust_mcp_sdk::{StdioTransport, TransportOptions};
use serde_json::{Map as JsonMap, Value as JsonValue};

use super::{CapabilityServer, McpTransport, ToolDescriptor};
use crate::error::{FleetError, Result};

pub const DEFAULT_SESSION_TIMEOUT: Duration = Duration::from_millis(10_000);

/// The two operations consumed from a capability server.
#[async_trait]
pub trait ToolSessions: Send + Sync {
    async fn list_tools(&self, server: &CapabilityServer) -> Result<Vec<ToolDescriptor>>;

    /// Returns the first text content of the response.
    async fn call_tool(
        &self,
        server: &CapabilityServer,
        tool: &str,
        args: JsonMap<String, JsonValue>,
    ) -> Result<String>;
}

enum SessionOp {
    ListTools,
    CallTool {
        tool: String,
        args: JsonMap<String, JsonValue>,
    },
}

enum SessionReply {
    Tools(Vec<ToolDescriptor>),
    Text(String),
}

pub struct StdioSessions {
    timeout: Duration,
}

impl StdioSessions {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    async fn run(&self, server: &CapabilityServer, op: SessionOp) -> Result<SessionReply> {
        let McpTransport::Stdio { command, args, env } = &server.transport;
        let session_err = |what: &str, e: String| {
            FleetError::execution(format!("server '{}' {}: {}", server.name, what, e))
        };

        let client_details = InitializeRequestParams {
            capabilities: ClientCapabilities::default(),
            client_info: Implementation {
                name: "fleet-mcp".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
                title: None,
            },
            protocol_version: LATEST_PROTOCOL_VERSION.into(),
        };
        let transport = StdioTransport::create_with_server_launch(
            command,
            args.clone(),
            Some(env.clone()),
            TransportOptions::default(),
        )
        .map_err(|e| session_err("transport error", e.to_string()))?;
        let client =
            client_runtime_core::create_client(client_details, transport, NoopClientHandler);

        tokio::time::timeout(self.timeout, client.clone().start())
            .await
            .map_err(|_| session_err("start", "timeout".to_string()))?
            .map_err(|e| session_err("start", e.to_string()))?;

        let reply = match op {
            SessionOp::ListTools => {
                let resp = tokio::time::timeout(self.timeout, client.list_tools(None))
                    .await
                    .map_err(|_| session_err("list_tools", "timeout".to_string()))?
                    .map_err(|e| session_err("list_tools", e.to_string()))?;
                let tools = resp
                    .tools
                    .into_iter()
                    .map(|t| ToolDescriptor {
                        server_name: server.name.clone(),
                        parameter_schema: serde_json::to_value(&t.input_schema)
                            .unwrap_or(JsonValue::Null),
                        description: t.description.unwrap_or_default(),
                        tool_name: t.name,
                    })
                    .collect();
                SessionReply::Tools(tools)
            }
            SessionOp::CallTool { tool, args } => {
                let params = CallToolRequestParams {
                    name: tool.clone(),
                    arguments: Some(args),
                };
                let result = tokio::time::timeout(self.timeout, client.call_tool(params))
                    .await
                    .map_err(|_| session_err("call_tool", "timeout".to_string()))?
                    .map_err(|e| session_err("call_tool", e.to_string()))?;
                let value = serde_json::to_value(&result)?;
                SessionReply::Text(first_text(&server.name, &tool, &value)?)
            }
        };

        match tokio::time::timeout(self.timeout, client.shut_down()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::debug!(server = %server.name, "shutdown error: {}", e),
            Err(_) => tracing::debug!(server = %server.name, "shutdown timeout"),
        }
        Ok(reply)
    }
}

impl Default for StdioSessions {
    fn default() -> Self {
        Self::new(DEFAULT_SESSION_TIMEOUT)
    }
}

#[async_trait]
impl ToolSessions for StdioSessions {
    async fn list_tools(&self, server: &CapabilityServer) -> Result<Vec<ToolDescriptor>> {
        match self.run(server, SessionOp::ListTools).await? {
            SessionReply::Tools(tools) => Ok(tools),
            SessionReply::Text(_) => Err(FleetError::execution("unexpected reply to list_tools")),
        }
    }

    async fn call_tool(
        &self,
        server: &CapabilityServer,
        tool: &str,
        args: JsonMap<String, JsonValue>,
    ) -> Result<String> {
        let op = SessionOp::CallTool {
            tool: tool.to_string(),
            args,
        };
        match self.run(server, op).await? {
            SessionReply::Text(text) => Ok(text),
            SessionReply::Tools(_) => Err(FleetError::execution("unexpected reply to call_tool")),
        }
    }
}

/// First `text` content item of a serialized `CallToolResult`. A result
/// flagged `isError` becomes an execution error carrying that text.
fn first_text(server: &str, tool: &str, result: &JsonValue) -> Result<String> {
    let text = result
        .get("content")
        .and_then(|c| c.as_array())
        .and_then(|items| {
            items.iter().find_map(|item| {
                (item.get("type").and_then(|t| t.as_str()) == Some("text"))
                    .then(|| item.get("text").and_then(|t| t.as_str()))
                    .flatten()
            })
        })
        .map(str::to_string);
    let is_error = result
        .get("isError")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);
    match (text, is_error) {
        (Some(t), false) => Ok(t),
        (None, false) => Ok(String::new()),
        (t, true) => Err(FleetError::execution(format!(
            "tool '{}' on '{}' failed: {}",
            tool,
            server,
            t.unwrap_or_else(|| "no detail".to_string())
        ))),
    }
}

#[derive(Clone)]
struct NoopClientHandler;

#[async_trait]
impl ClientHandlerCore for NoopClientHandler {
    async fn handle_request(
        &self,
        _request: RequestFromServer,
        _runtime: &dyn McpClient,
    ) -> std::result::Result<ResultFromClient, RpcError> {
        Err(RpcError::method_not_found())
    }

    async fn handle_notification(
        &self,
        _notification: NotificationFromServer,
        _runtime: &dyn McpClient,
    ) -> std::result::Result<(), RpcError> {
        Ok(())
    }

    async fn handle_error(
        &self,
        _error: &RpcError,
        _runtime: &dyn McpClient,
    ) -> std::result::Result<(), RpcError> {
        Ok(())
    }
}

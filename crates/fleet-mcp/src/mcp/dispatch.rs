//! Route a qualified tool name to its server and execute the call.

use std::sync::Arc;

use serde_json::{Map as JsonMap, Value as JsonValue};

use super::registry::ToolRegistry;
use crate::error::{FleetError, Result};

pub struct ToolDispatcher {
    registry: Arc<ToolRegistry>,
}

impl ToolDispatcher {
    pub fn new(registry: Arc<ToolRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    /// Always returns text: either the tool's first text content or an
    /// `Error: ...` line suitable for feeding back to an LLM.
    pub async fn dispatch(&self, qualified: &str, args: JsonValue) -> String {
        match self.try_dispatch(qualified, args).await {
            Ok(text) => text,
            Err(e) => {
                tracing::warn!(tool = %qualified, "dispatch failed: {}", e);
                format!("Error: {}", e)
            }
        }
    }

    pub async fn try_dispatch(&self, qualified: &str, args: JsonValue) -> Result<String> {
        let handle = self.registry.resolve(qualified).await.ok_or_else(|| {
            FleetError::validation(format!("'{}' is not a qualified tool name", qualified))
        })?;
        let server = self
            .registry
            .server(&handle.server)
            .ok_or_else(|| FleetError::UnknownServer(handle.server.clone()))?;
        let known = self
            .registry
            .tools_of(&handle.server)
            .await
            .is_some_and(|tools| tools.iter().any(|t| t.tool_name == handle.tool));
        if !known {
            return Err(FleetError::UnknownTool {
                server: handle.server,
                tool: handle.tool,
            });
        }
        let args = match args {
            JsonValue::Object(map) => map,
            JsonValue::Null => JsonMap::new(),
            other => {
                return Err(FleetError::validation(format!(
                    "tool arguments must be an object, got {}",
                    other
                )));
            }
        };
        tracing::info!(server = %handle.server, tool = %handle.tool, "dispatching tool call");
        self.registry
            .sessions()
            .call_tool(&server, &handle.tool, args)
            .await
    }
}

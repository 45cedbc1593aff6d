//! Capability servers and the tool descriptors they expose.

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// How to reach a capability server. Stdio only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum McpTransport {
    Stdio {
        command: String,
        args: Vec<String>,
        env: HashMap<String, String>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilityServer {
    pub name: String,
    pub transport: McpTransport,
    /// File the definition was read from, if any.
    #[serde(default)]
    pub origin: Option<PathBuf>,
}

impl CapabilityServer {
    pub fn stdio(name: impl Into<String>, command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            name: name.into(),
            transport: McpTransport::Stdio {
                command: command.into(),
                args,
                env: HashMap::new(),
            },
            origin: None,
        }
    }
}

/// One operation offered by a capability server. The schema is validated
/// by the owning server at call time, never by the dispatcher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolDescriptor {
    pub server_name: String,
    pub tool_name: String,
    pub description: String,
    pub parameter_schema: JsonValue,
}

/// Typed reference to a tool; what a qualified name resolves to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ToolHandle {
    pub server: String,
    pub tool: String,
}

/// LLM-facing projection of a descriptor under its qualified name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallableFunctionSpec {
    pub name: String,
    pub description: String,
    pub parameters: JsonValue,
}

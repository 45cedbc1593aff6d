//! MCP server handler that exposes fleet operations as callable tools.
//!
//! Every tool answers with a JSON text payload. Domain failures are reported
//! in that payload as `{ "ok": false, "error": ... }`; only unknown tool
//! names and protocol problems surface as RPC errors.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use rust_mcp_sdk::schema::{
    CallToolResult, ClientRequest, ListToolsResult, RpcError, TextContent, Tool, ToolInputSchema,
    schema_utils::{NotificationFromClient, RequestFromClient, ResultFromServer},
};
use rust_mcp_sdk::{
    McpServer,
    mcp_server::{ServerHandlerCore, enforce_compatible_protocol_version},
};
use serde_json::{Map as JsonMap, Value as JsonValue, json};

use crate::error::{FleetError, Result};
use crate::fleet::Fleet;
use crate::inbound::{ParsedMessage, parse_inbound_message};
use crate::llm::ChatMessage;
use crate::model::{CoordinationMode, DeploymentRequest, Team, TeamMember};

const DEFAULT_SEARCH_LIMIT: usize = 20;

struct Param {
    name: &'static str,
    ty: &'static str,
    description: &'static str,
    required: bool,
}

const fn req(name: &'static str, ty: &'static str, description: &'static str) -> Param {
    Param {
        name,
        ty,
        description,
        required: true,
    }
}

const fn opt(name: &'static str, ty: &'static str, description: &'static str) -> Param {
    Param {
        name,
        ty,
        description,
        required: false,
    }
}

struct ToolSpec {
    name: &'static str,
    description: &'static str,
    params: &'static [Param],
}

const TEAM_NAME: Param = req("teamName", "string", "Team name");

const TOOLS: &[ToolSpec] = &[
    ToolSpec {
        name: "deploy_agent",
        description: "Deploy one agent from its agent-type template.",
        params: &[
            req("agentName", "string", "Unique agent name"),
            req("agentType", "string", "Agent type from the template catalog"),
            opt("deploymentType", "string", "process, container or isolated_container"),
            opt("team", "string", "Team the agent belongs to"),
            opt("configOverrides", "object", "Template fields to override"),
            opt("environmentOverrides", "object", "Extra environment variables"),
            opt("autoStart", "boolean", "When false only validate (default true)"),
        ],
    },
    ToolSpec {
        name: "stop_agent",
        description: "Stop a deployed agent and forget its record.",
        params: &[req("agentName", "string", "Agent name")],
    },
    ToolSpec {
        name: "list_agents",
        description: "List agents, re-validating liveness of running ones.",
        params: &[opt("all", "boolean", "Include records that are not running")],
    },
    ToolSpec {
        name: "create_team",
        description: "Create a team of agents.",
        params: &[
            TEAM_NAME,
            opt("displayName", "string", "Human readable name"),
            opt("description", "string", "What the team does"),
            opt("coordinationMode", "string", "parallel, sequential or collaborative"),
            opt("autoDeploy", "boolean", "Start the team when the server starts"),
            opt(
                "members",
                "array",
                "Agent type names, or { name, agentType } objects",
            ),
        ],
    },
    ToolSpec {
        name: "delete_team",
        description: "Delete a team; active members require force.",
        params: &[TEAM_NAME, opt("force", "boolean", "Stop active members first")],
    },
    ToolSpec {
        name: "add_team_member",
        description: "Add an agent to a team.",
        params: &[
            TEAM_NAME,
            req("agentName", "string", "Member agent name"),
            opt("agentType", "string", "Agent type (defaults to the agent name)"),
        ],
    },
    ToolSpec {
        name: "remove_team_member",
        description: "Remove an agent from a team.",
        params: &[
            TEAM_NAME,
            req("agentName", "string", "Member agent name"),
            opt("stop", "boolean", "Also stop the agent"),
        ],
    },
    ToolSpec {
        name: "start_team",
        description: "Deploy every member of a team.",
        params: &[
            TEAM_NAME,
            opt("mode", "string", "parallel, sequential or collaborative"),
        ],
    },
    ToolSpec {
        name: "stop_team",
        description: "Stop the members of a team.",
        params: &[TEAM_NAME, opt("force", "boolean", "Stop members not tracked as active")],
    },
    ToolSpec {
        name: "restart_team",
        description: "Stop then start every member of a team.",
        params: &[TEAM_NAME],
    },
    ToolSpec {
        name: "team_status",
        description: "Health of a team from a fresh liveness check.",
        params: &[TEAM_NAME],
    },
    ToolSpec {
        name: "list_teams",
        description: "List every team definition.",
        params: &[],
    },
    ToolSpec {
        name: "setup_containers",
        description: "Create missing pre-provisioned containers for container agent types.",
        params: &[opt("agentType", "string", "Only this agent type")],
    },
    ToolSpec {
        name: "list_capabilities",
        description: "List tools offered by the configured capability servers.",
        params: &[opt("refresh", "boolean", "Drop the descriptor cache first")],
    },
    ToolSpec {
        name: "call_capability",
        description: "Call a capability server tool by its qualified name.",
        params: &[
            req("name", "string", "Qualified tool name, server_tool"),
            opt("arguments", "object", "Tool arguments"),
        ],
    },
    ToolSpec {
        name: "ask",
        description: "Natural-language request answered by an LLM using the capability tools. \
                      A JSON object with a command field runs that fleet tool instead.",
        params: &[
            req("message", "string", "Chat message"),
            opt("history", "array", "Earlier turns as { role, content }"),
        ],
    },
    ToolSpec {
        name: "reload_config",
        description: "Re-read agent templates and capability server files.",
        params: &[],
    },
    ToolSpec {
        name: "search_events",
        description: "Search recorded deploy and stop events.",
        params: &[
            req("query", "string", "Keywords; empty matches everything"),
            opt("limit", "integer", "Maximum results (default 20)"),
        ],
    },
];

/// Routes MCP requests to the fleet services.
pub struct FleetServerHandler {
    fleet: Arc<Fleet>,
}

impl FleetServerHandler {
    pub fn new(fleet: Arc<Fleet>) -> Self {
        tracing::debug!("initialized FleetServerHandler (tools={})", TOOLS.len());
        Self { fleet }
    }

    /// Build the list of tool definitions exposed by this server.
    fn tool_definitions(&self) -> Vec<Tool> {
        TOOLS
            .iter()
            .map(|spec| {
                let mut props = HashMap::<String, JsonMap<String, JsonValue>>::new();
                let mut required = Vec::new();
                for p in spec.params {
                    let mut schema = JsonMap::new();
                    schema.insert("type".to_string(), JsonValue::String(p.ty.to_string()));
                    schema.insert(
                        "description".to_string(),
                        JsonValue::String(p.description.to_string()),
                    );
                    props.insert(p.name.to_string(), schema);
                    if p.required {
                        required.push(p.name.to_string());
                    }
                }
                Tool {
                    annotations: None,
                    description: Some(spec.description.to_string()),
                    input_schema: ToolInputSchema::new(required, Some(props)),
                    meta: None,
                    name: spec.name.to_string(),
                    output_schema: None,
                    title: None,
                }
            })
            .collect()
    }

    fn is_known(tool: &str) -> bool {
        TOOLS.iter().any(|t| t.name == tool)
    }

    /// Execute one fleet tool. Boxed because `ask` may route back in here.
    pub fn call<'a>(
        &'a self,
        tool: &'a str,
        args: JsonMap<String, JsonValue>,
    ) -> BoxFuture<'a, Result<JsonValue>> {
        Box::pin(async move {
            let fleet = &self.fleet;
            match tool {
                "deploy_agent" => {
                    let request: DeploymentRequest = serde_json::from_value(JsonValue::Object(args))
                        .map_err(|e| FleetError::validation(format!("invalid deployment request: {}", e)))?;
                    to_json(&fleet.deployments.deploy(request).await)
                }
                "stop_agent" => {
                    let name = req_str(&args, "agentName")?;
                    fleet.deployments.try_stop(&name).await?;
                    Ok(json!({ "ok": true, "agentName": name, "message": format!("Agent '{}' stopped", name) }))
                }
                "list_agents" => {
                    let agents = if opt_bool(&args, "all")?.unwrap_or(false) {
                        fleet.deployments.list_all().await
                    } else {
                        fleet.deployments.list_active().await
                    };
                    Ok(json!({ "count": agents.len(), "agents": agents }))
                }
                "create_team" => {
                    let mut team = Team::new(req_str(&args, "teamName")?);
                    team.display_name = opt_str(&args, "displayName")?.unwrap_or_default();
                    team.description = opt_str(&args, "description")?.unwrap_or_default();
                    if let Some(mode) = opt_mode(&args, "coordinationMode")? {
                        team.coordination_mode = mode;
                    }
                    team.auto_deploy = opt_bool(&args, "autoDeploy")?.unwrap_or(false);
                    team.members = parse_members(args.get("members"))?;
                    to_json(&fleet.teams.create_team(team).await?)
                }
                "delete_team" => {
                    let force = opt_bool(&args, "force")?.unwrap_or(false);
                    let team = fleet.teams.delete_team(&req_str(&args, "teamName")?, force).await?;
                    Ok(json!({ "ok": true, "deleted": team }))
                }
                "add_team_member" => {
                    let agent_name = req_str(&args, "agentName")?;
                    let agent_type = opt_str(&args, "agentType")?.unwrap_or_else(|| agent_name.clone());
                    let team = fleet
                        .teams
                        .add_member(&req_str(&args, "teamName")?, TeamMember::new(agent_name, agent_type))
                        .await?;
                    to_json(&team)
                }
                "remove_team_member" => {
                    let stop = opt_bool(&args, "stop")?.unwrap_or(false);
                    let team = fleet
                        .teams
                        .remove_member(&req_str(&args, "teamName")?, &req_str(&args, "agentName")?, stop)
                        .await?;
                    to_json(&team)
                }
                "start_team" => {
                    let mode = opt_mode(&args, "mode")?;
                    to_json(&fleet.teams.start_team(&req_str(&args, "teamName")?, mode).await)
                }
                "stop_team" => {
                    let force = opt_bool(&args, "force")?.unwrap_or(false);
                    to_json(&fleet.teams.stop_team(&req_str(&args, "teamName")?, force).await)
                }
                "restart_team" => to_json(&fleet.teams.restart_team(&req_str(&args, "teamName")?).await),
                "team_status" => to_json(&fleet.teams.status(&req_str(&args, "teamName")?).await?),
                "list_teams" => {
                    let teams = fleet.teams.list_teams().await;
                    Ok(json!({ "count": teams.len(), "teams": teams }))
                }
                "setup_containers" => {
                    let agent_type = opt_str(&args, "agentType")?;
                    let outcomes = fleet.deployments.provision_containers(agent_type.as_deref()).await?;
                    Ok(json!({
                        "ok": outcomes.iter().all(|o| o.success),
                        "containers": outcomes,
                    }))
                }
                "list_capabilities" => {
                    if opt_bool(&args, "refresh")?.unwrap_or(false) {
                        fleet.registry.invalidate().await;
                    }
                    let servers = fleet.registry.discover_all().await;
                    let tools: usize = servers.values().map(Vec::len).sum();
                    Ok(json!({ "serverCount": servers.len(), "toolCount": tools, "servers": servers }))
                }
                "call_capability" => {
                    let name = req_str(&args, "name")?;
                    let arguments = args.get("arguments").cloned().unwrap_or(JsonValue::Null);
                    let output = fleet.dispatcher.try_dispatch(&name, arguments).await?;
                    Ok(json!({ "ok": true, "output": output }))
                }
                "ask" => {
                    let message = req_str(&args, "message")?;
                    match parse_inbound_message(&message) {
                        None => Err(FleetError::validation("message is empty")),
                        Some(ParsedMessage::Structured { command, args }) => {
                            if command == "ask" || !Self::is_known(&command) {
                                return Err(FleetError::validation(format!(
                                    "'{}' is not a fleet command",
                                    command
                                )));
                            }
                            tracing::info!(command = %command, "routing structured message");
                            self.call(&command, args).await
                        }
                        Some(ParsedMessage::Text { mention, body }) => {
                            let history: Vec<ChatMessage> = match args.get("history") {
                                Some(h) if !h.is_null() => serde_json::from_value(h.clone())
                                    .map_err(|e| FleetError::validation(format!("invalid history: {}", e)))?,
                                _ => Vec::new(),
                            };
                            let conversation = fleet.conversation()?;
                            let reply = conversation.run(&body, &history).await;
                            Ok(json!({ "ok": true, "mention": mention, "reply": reply }))
                        }
                    }
                }
                "reload_config" => {
                    let (templates, servers) = fleet.reload().await?;
                    Ok(json!({ "ok": true, "templates": templates, "servers": servers }))
                }
                "search_events" => {
                    let query = opt_str(&args, "query")?.unwrap_or_default();
                    let limit = args
                        .get("limit")
                        .and_then(JsonValue::as_u64)
                        .map(|l| l as usize)
                        .unwrap_or(DEFAULT_SEARCH_LIMIT);
                    let events = fleet.events.search(&query, limit).await?;
                    Ok(json!({ "count": events.len(), "events": events }))
                }
                other => Err(FleetError::validation(format!("Unknown tool '{}'", other))),
            }
        })
    }
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<JsonValue> {
    Ok(serde_json::to_value(value)?)
}

fn req_str(args: &JsonMap<String, JsonValue>, key: &str) -> Result<String> {
    opt_str(args, key)?
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| FleetError::validation(format!("missing required '{}' string", key)))
}

fn opt_str(args: &JsonMap<String, JsonValue>, key: &str) -> Result<Option<String>> {
    match args.get(key) {
        None | Some(JsonValue::Null) => Ok(None),
        Some(JsonValue::String(s)) => Ok(Some(s.clone())),
        Some(other) => Err(FleetError::validation(format!(
            "'{}' must be a string, got {}",
            key, other
        ))),
    }
}

fn opt_bool(args: &JsonMap<String, JsonValue>, key: &str) -> Result<Option<bool>> {
    match args.get(key) {
        None | Some(JsonValue::Null) => Ok(None),
        Some(JsonValue::Bool(b)) => Ok(Some(*b)),
        Some(other) => Err(FleetError::validation(format!(
            "'{}' must be a boolean, got {}",
            key, other
        ))),
    }
}

fn opt_mode(args: &JsonMap<String, JsonValue>, key: &str) -> Result<Option<CoordinationMode>> {
    opt_str(args, key)?
        .map(|m| {
            serde_json::from_value(JsonValue::String(m.to_lowercase()))
                .map_err(|_| FleetError::validation(format!("unknown coordination mode '{}'", m)))
        })
        .transpose()
}

fn parse_members(value: Option<&JsonValue>) -> Result<Vec<TeamMember>> {
    let Some(value) = value.filter(|v| !v.is_null()) else {
        return Ok(Vec::new());
    };
    let items = value
        .as_array()
        .ok_or_else(|| FleetError::validation("'members' must be an array"))?;
    items
        .iter()
        .map(|item| match item {
            JsonValue::String(name) => Ok(TeamMember::new(name.clone(), name.clone())),
            JsonValue::Object(m) => {
                let name = req_str(m, "name")?;
                let agent_type = match opt_str(m, "agentType")? {
                    Some(t) => t,
                    None => opt_str(m, "agent_type")?.unwrap_or_else(|| name.clone()),
                };
                Ok(TeamMember::new(name, agent_type))
            }
            other => Err(FleetError::validation(format!("invalid team member {}", other))),
        })
        .collect()
}

fn error_payload(e: &FleetError) -> JsonValue {
    json!({
        "ok": false,
        "error": e.to_string(),
        "kind": if e.is_validation() { "validation" } else { "execution" },
    })
}

#[async_trait]
impl ServerHandlerCore for FleetServerHandler {
    async fn handle_request(
        &self,
        request: RequestFromClient,
        runtime: &dyn McpServer,
    ) -> std::result::Result<ResultFromServer, RpcError> {
        let method_name = request.method().to_owned();
        tracing::info!("handle_request: method={}", method_name);
        match request {
            RequestFromClient::ClientRequest(client_request) => match client_request {
                ClientRequest::InitializeRequest(initialize_request) => {
                    tracing::debug!(
                        "initialize_request: client_protocol={}",
                        initialize_request.params.protocol_version
                    );
                    let mut server_info = runtime.server_info().to_owned();
                    if let Some(updated_protocol_version) = enforce_compatible_protocol_version(
                        &initialize_request.params.protocol_version,
                        &server_info.protocol_version,
                    )
                    .map_err(|err| {
                        tracing::error!(
                            "incompatible protocol version (client={}, server={})",
                            initialize_request.params.protocol_version,
                            server_info.protocol_version
                        );
                        RpcError::internal_error().with_message(err.to_string())
                    })? {
                        server_info.protocol_version = updated_protocol_version;
                    }
                    tracing::info!("initialized (protocol={})", server_info.protocol_version);
                    Ok(server_info.into())
                }

                ClientRequest::ListToolsRequest(_) => {
                    let tools = self.tool_definitions();
                    tracing::info!("list_tools (count={})", tools.len());
                    Ok(ListToolsResult {
                        meta: None,
                        next_cursor: None,
                        tools,
                    }
                    .into())
                }

                ClientRequest::CallToolRequest(request) => {
                    let tool = request.tool_name().to_string();
                    let args = request.params.arguments.clone().unwrap_or_default();
                    tracing::info!(
                        "call_tool request: tool={}, arg_keys={:?}",
                        tool,
                        args.keys().collect::<Vec<_>>()
                    );
                    if !Self::is_known(&tool) {
                        tracing::warn!("unknown tool: {}", tool);
                        return Err(RpcError::method_not_found()
                            .with_message(format!("Unknown tool '{}'", tool)));
                    }
                    let payload = match self.call(&tool, args).await {
                        Ok(v) => v,
                        Err(e) => {
                            tracing::warn!(tool = %tool, "tool failed: {}", e);
                            error_payload(&e)
                        }
                    };
                    Ok(CallToolResult::text_content(vec![TextContent::from(payload.to_string())]).into())
                }

                _ => {
                    tracing::warn!("method not implemented: {}", method_name);
                    Err(RpcError::method_not_found()
                        .with_message(format!("No handler is implemented for '{method_name}'.")))
                }
            },
            RequestFromClient::CustomRequest(_) => {
                tracing::warn!("custom request not implemented");
                Err(RpcError::method_not_found()
                    .with_message("No handler is implemented for custom requests.".to_string()))
            }
        }
    }

    async fn handle_notification(
        &self,
        notification: NotificationFromClient,
        _: &dyn McpServer,
    ) -> std::result::Result<(), RpcError> {
        match &notification {
            NotificationFromClient::ClientNotification(_) => {
                tracing::debug!("handle_notification: client notification")
            }
            NotificationFromClient::CustomNotification(_) => {
                tracing::debug!("handle_notification: custom notification")
            }
        }
        Ok(())
    }

    async fn handle_error(
        &self,
        error: &RpcError,
        _: &dyn McpServer,
    ) -> std::result::Result<(), RpcError> {
        tracing::error!(
            "handle_error from client (code={:?}, message={:?})",
            error.code,
            error.message
        );
        Ok(())
    }
}

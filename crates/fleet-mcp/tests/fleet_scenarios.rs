//! End-to-end scenarios across deployment, teams, tool discovery and the
//! conversational loop, using real local processes where it matters.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use fleet_mcp::catalog::TemplateCatalog;
use fleet_mcp::conversation::{ConversationLoop, MAX_ITERATIONS_MESSAGE};
use fleet_mcp::deploy::{DeploymentManager, LocalProcessLauncher};
use fleet_mcp::llm::{ChatMessage, LlmClient, LlmReply, ToolCall};
use fleet_mcp::mcp::{
    CallableFunctionSpec, CapabilityServer, ToolDescriptor, ToolDispatcher, ToolRegistry,
    ToolSessions,
};
use fleet_mcp::model::{
    AgentStatus, AgentTypeTemplate, CoordinationMode, DeploymentMechanism, DeploymentRequest,
    Team, TeamMember,
};
use fleet_mcp::team::{TeamCoordinator, TeamStore, TeamTimings};
use fleet_mcp::{FleetError, Result};
use serde_json::{Map as JsonMap, Value as JsonValue, json};

fn process_template(command: &str, args: &[&str]) -> AgentTypeTemplate {
    let mut t = AgentTypeTemplate {
        mechanism: DeploymentMechanism::Process,
        ..Default::default()
    };
    t.launch.command = Some(command.to_string());
    t.launch.args = args.iter().map(|a| a.to_string()).collect();
    t
}

fn manager(log_dir: &std::path::Path) -> Arc<DeploymentManager> {
    let mut templates = BTreeMap::new();
    templates.insert("grok4".to_string(), process_template("sleep", &["30"]));
    templates.insert(
        "crasher".to_string(),
        process_template("sh", &["-c", "echo boom; exit 3"]),
    );
    let catalog = Arc::new(TemplateCatalog::from_templates(templates));
    Arc::new(
        DeploymentManager::new(catalog, Arc::new(LocalProcessLauncher::new(log_dir)))
            .with_grace(Duration::from_millis(300)),
    )
}

#[tokio::test]
async fn process_deploy_rejects_duplicates_until_stopped() {
    let logs = tempfile::tempdir().unwrap();
    let deployments = manager(logs.path());

    let first = deployments
        .deploy(DeploymentRequest::new("a1", "grok4").with_mechanism(DeploymentMechanism::Process))
        .await;
    assert!(first.success, "{}", first.message);
    assert_eq!(first.status, AgentStatus::Running);
    assert!(first.identifier.starts_with("process_"));

    let second = deployments.deploy(DeploymentRequest::new("a1", "grok4")).await;
    assert!(!second.success);
    assert!(second.message.contains("already"), "{}", second.message);

    let active = deployments.list_active().await;
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].identifier, first.identifier);

    assert!(deployments.stop("a1").await);
    assert!(deployments.list_active().await.is_empty());

    let again = deployments.deploy(DeploymentRequest::new("a1", "grok4")).await;
    assert!(again.success, "{}", again.message);
    assert!(deployments.stop("a1").await);
}

#[tokio::test]
async fn sequential_team_start_reports_partial_success() {
    let logs = tempfile::tempdir().unwrap();
    let deployments = manager(logs.path());
    let teams = TeamCoordinator::new(deployments.clone(), TeamStore::in_memory()).with_timings(
        TeamTimings {
            settle: Duration::from_millis(50),
            restart_pause: Duration::from_millis(50),
        },
    );
    let mut team = Team::new("t1");
    team.coordination_mode = CoordinationMode::Sequential;
    team.members = vec![
        TeamMember::new("a1", "grok4"),
        TeamMember::new("a2", "crasher"),
    ];
    teams.create_team(team).await.unwrap();

    let result = teams.start_team("t1", None).await;
    assert!(result.success);
    assert_eq!(result.started_count, 1);
    assert_eq!(result.total_count, 2);
    let names: Vec<_> = result.members.iter().map(|m| m.agent_name.as_str()).collect();
    assert_eq!(names, vec!["a1", "a2"]);
    assert!(result.members[1].message.contains("boom"), "{}", result.members[1].message);

    let health = teams.status("t1").await.unwrap();
    assert_eq!(health.running_members, 1);
    assert_eq!(health.percentage, 50.0);

    let stopped = teams.stop_team("t1", false).await;
    assert!(stopped.success);
    assert_eq!(stopped.stopped_count, 1);
    assert!(deployments.list_active().await.is_empty());
}

/// Servers listed in `reachable` answer; everything else is unreachable.
struct LocalSessions {
    reachable: HashSet<String>,
}

#[async_trait]
impl ToolSessions for LocalSessions {
    async fn list_tools(&self, server: &CapabilityServer) -> Result<Vec<ToolDescriptor>> {
        if !self.reachable.contains(&server.name) {
            return Err(FleetError::execution(format!("{} unreachable", server.name)));
        }
        Ok(vec![ToolDescriptor {
            server_name: server.name.clone(),
            tool_name: "ping".to_string(),
            description: "Reply with pong".to_string(),
            parameter_schema: json!({ "type": "object" }),
        }])
    }

    async fn call_tool(
        &self,
        server: &CapabilityServer,
        tool: &str,
        _args: JsonMap<String, JsonValue>,
    ) -> Result<String> {
        Ok(format!("pong from {}.{}", server.name, tool))
    }
}

fn registry(names: &[&str], reachable: &[&str]) -> Arc<ToolRegistry> {
    let servers = names
        .iter()
        .map(|n| (n.to_string(), CapabilityServer::stdio(*n, "unused", vec![])))
        .collect();
    let sessions = LocalSessions {
        reachable: reachable.iter().map(|s| s.to_string()).collect(),
    };
    Arc::new(ToolRegistry::new(servers, Arc::new(sessions)))
}

#[tokio::test]
async fn discovery_survives_unreachable_servers() {
    let registry = registry(&["alpha", "beta", "gamma"], &["alpha", "gamma"]);
    let all = registry.discover_all().await;
    assert_eq!(all.len(), 3);
    assert_eq!(all["alpha"].len(), 1);
    assert!(all["beta"].is_empty());
    assert_eq!(all["gamma"].len(), 1);

    let dispatcher = ToolDispatcher::new(registry);
    assert_eq!(
        dispatcher.dispatch("gamma_ping", json!({})).await,
        "pong from gamma.ping"
    );
    assert!(dispatcher.dispatch("beta_ping", json!({})).await.starts_with("Error:"));
}

struct AlwaysCallsTools {
    calls: AtomicUsize,
}

#[async_trait]
impl LlmClient for AlwaysCallsTools {
    async fn complete(
        &self,
        _messages: &[ChatMessage],
        functions: &[CallableFunctionSpec],
    ) -> Result<LlmReply> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(LlmReply {
            content: String::new(),
            tool_calls: vec![ToolCall {
                id: format!("call-{}", n),
                name: functions[0].name.clone(),
                arguments: json!({}),
            }],
        })
    }
}

#[tokio::test]
async fn conversation_terminates_at_the_cap() {
    let llm = Arc::new(AlwaysCallsTools {
        calls: AtomicUsize::new(0),
    });
    let dispatcher = Arc::new(ToolDispatcher::new(registry(&["alpha"], &["alpha"])));
    let convo = ConversationLoop::new(llm.clone(), dispatcher).with_max_iterations(4);
    let reply = convo.run("keep going", &[]).await;
    assert_eq!(reply, MAX_ITERATIONS_MESSAGE);
    assert_eq!(llm.calls.load(Ordering::SeqCst), 4);
}

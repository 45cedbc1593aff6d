//! Deployment lifecycle: resolve a template into a launch plan, execute it,
//! verify liveness and keep one record per agent name.
//!
//! Ordering within a single deploy or stop is strict: validation, then the
//! side effect, then the record mutation. The only record written before the
//! side effect is the `Starting` reservation that makes a concurrent second
//! deploy of the same name fail instead of racing.

pub mod container;
pub mod process;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::Mutex;

use crate::catalog::{TemplateCatalog, apply_overrides};
use crate::error::{FleetError, Result};
use crate::memory::{EventStore, FleetEvent, FleetEventKind};
use crate::model::{
    AgentStatus, AgentSummary, AgentTypeTemplate, DeploymentMechanism, DeploymentRecord,
    DeploymentRequest, DeploymentResult, NotificationOutcome, parse_process_identifier,
    process_identifier,
};

pub use container::{ContainerInfo, ContainerRuntime, ContainerSpec, DockerRuntime, ExecOutput};
pub use process::{LocalProcessLauncher, ProcessLauncher, ProcessProbe, ProcessSpec};

pub const DEFAULT_GRACE: Duration = Duration::from_millis(3000);
pub const DEFAULT_CONTAINER_PREFIX: &str = "fleet";
const ROLE_SIGNAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Resolved, validated plan for one deploy call.
struct LaunchPlan {
    template: AgentTypeTemplate,
    mechanism: DeploymentMechanism,
    env: BTreeMap<String, String>,
    mounts: Vec<String>,
    bot_name: String,
    container: Option<String>,
}

struct Launched {
    identifier: String,
    notification: NotificationOutcome,
}

/// Outcome of provisioning one agent type's container.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProvisionOutcome {
    pub agent_type: String,
    pub container: String,
    pub created: bool,
    pub success: bool,
    pub message: String,
}

pub struct DeploymentManager {
    catalog: Arc<TemplateCatalog>,
    launcher: Arc<dyn ProcessLauncher>,
    containers: Option<Arc<dyn ContainerRuntime>>,
    events: Option<Arc<dyn EventStore>>,
    records: Mutex<HashMap<String, DeploymentRecord>>,
    /// Environment used to resolve credentials; normally the server's own.
    base_env: BTreeMap<String, String>,
    grace: Duration,
    container_prefix: String,
}

impl DeploymentManager {
    pub fn new(catalog: Arc<TemplateCatalog>, launcher: Arc<dyn ProcessLauncher>) -> Self {
        Self {
            catalog,
            launcher,
            containers: None,
            events: None,
            records: Mutex::new(HashMap::new()),
            base_env: BTreeMap::new(),
            grace: DEFAULT_GRACE,
            container_prefix: DEFAULT_CONTAINER_PREFIX.to_string(),
        }
    }

    pub fn with_containers(mut self, runtime: Arc<dyn ContainerRuntime>) -> Self {
        self.containers = Some(runtime);
        self
    }

    pub fn with_events(mut self, events: Arc<dyn EventStore>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn with_base_env(mut self, env: BTreeMap<String, String>) -> Self {
        self.base_env = env;
        self
    }

    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    pub fn with_container_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.container_prefix = prefix.into();
        self
    }

    pub fn catalog(&self) -> &Arc<TemplateCatalog> {
        &self.catalog
    }

    /// Deploy one agent. Never panics or raises: every outcome, including
    /// validation failures, is reported in the result.
    pub async fn deploy(&self, request: DeploymentRequest) -> DeploymentResult {
        let name = request.agent_name.clone();
        tracing::info!(agent = %name, agent_type = %request.agent_type, "deploy requested");

        let plan = match self.plan(&request) {
            Ok(plan) => plan,
            Err(e) => {
                tracing::warn!(agent = %name, "deploy rejected: {}", e);
                return DeploymentResult::failure(&name, request.deployment_type, e.to_string());
            }
        };

        if !request.auto_start {
            return match self.ensure_available(&name).await {
                Ok(()) => DeploymentResult {
                    success: true,
                    agent_name: name.clone(),
                    deployment_type: Some(plan.mechanism),
                    identifier: String::new(),
                    status: AgentStatus::Requested,
                    message: format!(
                        "Deployment of '{}' as {} validated; not started (autoStart=false)",
                        name, plan.mechanism
                    ),
                    discord_bot_name: Some(plan.bot_name),
                    notification: NotificationOutcome::Skipped,
                },
                Err(e) => DeploymentResult::failure(&name, Some(plan.mechanism), e.to_string()),
            };
        }

        if let Err(e) = self.reserve(&request, &plan).await {
            tracing::warn!(agent = %name, "deploy rejected: {}", e);
            return DeploymentResult::failure(&name, Some(plan.mechanism), e.to_string());
        }

        let launched = match plan.mechanism {
            DeploymentMechanism::Process => self.launch_process(&request, &plan).await,
            DeploymentMechanism::Container | DeploymentMechanism::IsolatedContainer => {
                self.launch_container(&request, &plan).await
            }
        };

        match launched {
            Ok(launched) => {
                self.commit(&name, &launched.identifier).await;
                tracing::info!(
                    agent = %name,
                    mechanism = %plan.mechanism,
                    identifier = %launched.identifier,
                    "agent running"
                );
                self.record_event(
                    FleetEventKind::Deployed,
                    &name,
                    &request.agent_type,
                    format!("{} {}", plan.mechanism, launched.identifier),
                )
                .await;
                DeploymentResult {
                    success: true,
                    agent_name: name.clone(),
                    deployment_type: Some(plan.mechanism),
                    identifier: launched.identifier.clone(),
                    status: AgentStatus::Running,
                    message: format!(
                        "Agent '{}' deployed as {} ({})",
                        name, plan.mechanism, launched.identifier
                    ),
                    discord_bot_name: Some(plan.bot_name),
                    notification: launched.notification,
                }
            }
            Err(e) => {
                self.release(&name).await;
                tracing::warn!(agent = %name, mechanism = %plan.mechanism, "deploy failed: {}", e);
                self.record_event(
                    FleetEventKind::DeployFailed,
                    &name,
                    &request.agent_type,
                    e.to_string(),
                )
                .await;
                DeploymentResult::failure(&name, Some(plan.mechanism), e.to_string())
            }
        }
    }

    /// Stop an agent; `true` only when the underlying kill or container stop
    /// succeeded and the record was removed.
    pub async fn stop(&self, agent_name: &str) -> bool {
        match self.try_stop(agent_name).await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(agent = %agent_name, "stop failed: {}", e);
                false
            }
        }
    }

    pub async fn try_stop(&self, agent_name: &str) -> Result<()> {
        let record = self
            .records
            .lock()
            .await
            .get(agent_name)
            .cloned()
            .ok_or_else(|| FleetError::UnknownAgent(agent_name.to_string()))?;
        if record.status == AgentStatus::Starting {
            return Err(FleetError::validation(format!(
                "Agent '{}' is still starting",
                agent_name
            )));
        }

        let outcome = match record.deployment_type {
            DeploymentMechanism::Process => self.stop_process(&record).await,
            DeploymentMechanism::Container | DeploymentMechanism::IsolatedContainer => {
                self.stop_container(&record).await
            }
        };
        if let Err(e) = outcome {
            self.record_event(
                FleetEventKind::StopFailed,
                agent_name,
                &record.agent_type,
                e.to_string(),
            )
            .await;
            return Err(e);
        }

        {
            let mut records = self.records.lock().await;
            if records
                .get(agent_name)
                .is_some_and(|r| r.identifier == record.identifier)
            {
                records.remove(agent_name);
            }
        }
        tracing::info!(agent = %agent_name, identifier = %record.identifier, "agent stopped");
        self.record_event(
            FleetEventKind::Stopped,
            agent_name,
            &record.agent_type,
            record.identifier.clone(),
        )
        .await;
        Ok(())
    }

    /// Re-validate liveness of every running record and report the live ones.
    /// Records whose process or container is gone are marked `Failed`.
    pub async fn list_active(&self) -> Vec<AgentSummary> {
        let snapshot: Vec<DeploymentRecord> = self
            .records
            .lock()
            .await
            .values()
            .filter(|r| r.status == AgentStatus::Running)
            .cloned()
            .collect();

        let mut alive = Vec::new();
        let mut dead = Vec::new();
        for record in snapshot {
            if self.probe_record(&record).await {
                alive.push(record);
            } else {
                dead.push(record);
            }
        }

        if !dead.is_empty() {
            let mut records = self.records.lock().await;
            for gone in &dead {
                if let Some(r) = records.get_mut(&gone.agent_name)
                    && r.identifier == gone.identifier
                {
                    tracing::warn!(
                        agent = %gone.agent_name,
                        identifier = %gone.identifier,
                        "agent no longer alive; marking failed"
                    );
                    r.status = AgentStatus::Failed;
                }
            }
        }

        let mut out: Vec<AgentSummary> = alive.iter().map(AgentSummary::from).collect();
        out.sort_by(|a, b| a.agent_name.cmp(&b.agent_name));
        out
    }

    /// Every record, including starting and failed ones, without probing.
    pub async fn list_all(&self) -> Vec<AgentSummary> {
        let records = self.records.lock().await;
        let mut out: Vec<AgentSummary> = records.values().map(AgentSummary::from).collect();
        out.sort_by(|a, b| a.agent_name.cmp(&b.agent_name));
        out
    }

    pub async fn status_of(&self, agent_name: &str) -> Option<AgentStatus> {
        self.records.lock().await.get(agent_name).map(|r| r.status)
    }

    /// True when the agent has a non-terminal record.
    pub async fn is_active(&self, agent_name: &str) -> bool {
        self.records
            .lock()
            .await
            .get(agent_name)
            .is_some_and(|r| !r.status.is_terminal())
    }

    /// Fresh liveness probe of a running agent.
    pub async fn is_running(&self, agent_name: &str) -> bool {
        let record = self.records.lock().await.get(agent_name).cloned();
        match record {
            Some(r) if r.status == AgentStatus::Running => self.probe_record(&r).await,
            _ => false,
        }
    }

    /// Create the pre-provisioned containers for container-backed agent
    /// types that do not have one yet. Created containers are left stopped.
    pub async fn provision_containers(&self, agent_type: Option<&str>) -> Result<Vec<ProvisionOutcome>> {
        let runtime = self.container_runtime()?;
        let types = match agent_type {
            Some(t) => {
                if !self.catalog.contains(t) {
                    return Err(FleetError::UnknownAgentType(t.to_string()));
                }
                vec![t.to_string()]
            }
            None => self.catalog.names(),
        };

        let mut outcomes = Vec::new();
        for t in types {
            let Some(template) = self.catalog.get(&t) else {
                continue;
            };
            if !template.mechanism.is_container() && agent_type.is_none() {
                continue;
            }
            let name = template.container_name(&t, &self.container_prefix);
            let outcome = self.provision_one(runtime, &t, &template, &name).await;
            outcomes.push(outcome);
        }
        Ok(outcomes)
    }

    async fn provision_one(
        &self,
        runtime: &Arc<dyn ContainerRuntime>,
        agent_type: &str,
        template: &AgentTypeTemplate,
        name: &str,
    ) -> ProvisionOutcome {
        let outcome = |created: bool, success: bool, message: String| ProvisionOutcome {
            agent_type: agent_type.to_string(),
            container: name.to_string(),
            created,
            success,
            message,
        };
        match runtime.inspect(name).await {
            Ok(Some(_)) => return outcome(false, true, "already exists".to_string()),
            Ok(None) => {}
            Err(e) => return outcome(false, false, e.to_string()),
        }
        let Some(image) = template.launch.image.clone() else {
            return outcome(false, false, format!("agent type '{}' has no image", agent_type));
        };
        let mounts = if template.mechanism == DeploymentMechanism::IsolatedContainer {
            Vec::new()
        } else {
            template.mounts.clone()
        };
        let command = template.launch.command.as_ref().map(|c| {
            let mut cmd = vec![c.clone()];
            cmd.extend(template.launch.args.iter().cloned());
            cmd
        });
        let spec = ContainerSpec {
            name: name.to_string(),
            image,
            env: template.env.clone(),
            mounts,
            command,
            labels: HashMap::from([
                ("managed-by".to_string(), "fleet-mcp".to_string()),
                ("fleet.agent-type".to_string(), agent_type.to_string()),
            ]),
        };
        match runtime.create(&spec).await {
            Ok(id) => outcome(true, true, format!("created {}", id)),
            Err(e) => outcome(false, false, e.to_string()),
        }
    }

    fn plan(&self, request: &DeploymentRequest) -> Result<LaunchPlan> {
        if request.agent_name.trim().is_empty() {
            return Err(FleetError::validation("agent name must not be empty"));
        }
        let base = self
            .catalog
            .get(&request.agent_type)
            .ok_or_else(|| FleetError::UnknownAgentType(request.agent_type.clone()))?;
        let template = match &request.config_overrides {
            Some(overrides) if !overrides.is_empty() => apply_overrides(&base, overrides)?,
            _ => base,
        };
        let mechanism = request.deployment_type.unwrap_or(template.mechanism);

        let mut env = template.env.clone();
        if mechanism == DeploymentMechanism::Process {
            if template.launch.command.is_none() {
                return Err(FleetError::validation(format!(
                    "agent type '{}' has no launch command",
                    request.agent_type
                )));
            }
            let resolved = self.resolve_credentials(&request.agent_type, &template, request)?;
            env.extend(resolved);
        }
        env.extend(
            request
                .environment_overrides
                .iter()
                .map(|(k, v)| (k.clone(), v.clone())),
        );
        env.insert("FLEET_AGENT_NAME".into(), request.agent_name.clone());
        env.insert("FLEET_AGENT_TYPE".into(), request.agent_type.clone());
        if let Some(team) = &request.team {
            env.insert("FLEET_TEAM".into(), team.clone());
        }

        let mounts = if mechanism == DeploymentMechanism::IsolatedContainer {
            Vec::new()
        } else {
            template.mounts.clone()
        };
        let bot_name = template.resolve_bot_name(&request.agent_name);
        let container = mechanism
            .is_container()
            .then(|| template.container_name(&request.agent_type, &self.container_prefix));
        tracing::debug!(
            agent = %request.agent_name,
            mechanism = %mechanism,
            env_keys = env.len(),
            mounts = mounts.len(),
            "deployment planned"
        );
        Ok(LaunchPlan {
            template,
            mechanism,
            env,
            mounts,
            bot_name,
            container,
        })
    }

    /// Look up each credential in the request, then the template, then the
    /// base environment. Every missing name is reported at once.
    fn resolve_credentials(
        &self,
        agent_type: &str,
        template: &AgentTypeTemplate,
        request: &DeploymentRequest,
    ) -> Result<BTreeMap<String, String>> {
        let mut resolved = BTreeMap::new();
        let mut missing = Vec::new();
        for key in &template.credentials {
            let value = request
                .environment_overrides
                .get(key)
                .or_else(|| template.env.get(key))
                .or_else(|| self.base_env.get(key))
                .filter(|v| !v.trim().is_empty());
            match value {
                Some(v) => {
                    resolved.insert(key.clone(), v.clone());
                }
                None => missing.push(key.clone()),
            }
        }
        if missing.is_empty() {
            Ok(resolved)
        } else {
            Err(FleetError::MissingCredentials {
                agent_type: agent_type.to_string(),
                missing,
            })
        }
    }

    async fn ensure_available(&self, agent_name: &str) -> Result<()> {
        let records = self.records.lock().await;
        match records.get(agent_name) {
            Some(r) if !r.status.is_terminal() => {
                Err(FleetError::AlreadyDeployed(agent_name.to_string()))
            }
            _ => Ok(()),
        }
    }

    /// Claim the name, and the container if any, with a `Starting` record;
    /// terminal records are replaced.
    async fn reserve(&self, request: &DeploymentRequest, plan: &LaunchPlan) -> Result<()> {
        let mut records = self.records.lock().await;
        if let Some(existing) = records.get(&request.agent_name)
            && !existing.status.is_terminal()
        {
            return Err(FleetError::AlreadyDeployed(request.agent_name.clone()));
        }
        if let Some(container) = &plan.container
            && let Some(holder) = records.values().find(|r| {
                !r.status.is_terminal() && r.container.as_deref() == Some(container.as_str())
            })
        {
            return Err(FleetError::validation(format!(
                "Container '{}' is already in use by agent '{}'",
                container, holder.agent_name
            )));
        }
        records.insert(
            request.agent_name.clone(),
            DeploymentRecord {
                agent_name: request.agent_name.clone(),
                agent_type: request.agent_type.clone(),
                deployment_type: plan.mechanism,
                identifier: String::new(),
                status: AgentStatus::Starting,
                discord_bot_name: Some(plan.bot_name.clone()),
                team: request.team.clone(),
                mounts: plan.mounts.clone(),
                container: plan.container.clone(),
                created_at: Utc::now(),
            },
        );
        Ok(())
    }

    async fn commit(&self, agent_name: &str, identifier: &str) {
        if let Some(r) = self.records.lock().await.get_mut(agent_name) {
            r.identifier = identifier.to_string();
            r.status = AgentStatus::Running;
        }
    }

    async fn release(&self, agent_name: &str) {
        let mut records = self.records.lock().await;
        if records
            .get(agent_name)
            .is_some_and(|r| r.status == AgentStatus::Starting)
        {
            records.remove(agent_name);
        }
    }

    async fn launch_process(
        &self,
        request: &DeploymentRequest,
        plan: &LaunchPlan,
    ) -> Result<Launched> {
        let command = plan
            .template
            .launch
            .command
            .clone()
            .ok_or_else(|| FleetError::validation("missing launch command"))?;
        let spec = ProcessSpec {
            agent_name: request.agent_name.clone(),
            command,
            args: plan.template.launch.args.clone(),
            cwd: plan.template.launch.cwd.clone(),
            env: plan.env.clone(),
        };
        let pid = self.launcher.spawn(&spec).await?;
        tokio::time::sleep(self.grace).await;
        match self.launcher.probe(pid).await {
            ProcessProbe::Alive => Ok(Launched {
                identifier: process_identifier(pid),
                notification: NotificationOutcome::Skipped,
            }),
            ProcessProbe::Exited { code, output } => {
                let code = code.map_or_else(|| "signal".to_string(), |c| c.to_string());
                let detail = if output.is_empty() {
                    "no output".to_string()
                } else {
                    output
                };
                Err(FleetError::execution(format!(
                    "process for '{}' exited during startup (code {}): {}",
                    request.agent_name, code, detail
                )))
            }
            ProcessProbe::Missing => Err(FleetError::execution(format!(
                "process {} for '{}' disappeared during startup",
                pid, request.agent_name
            ))),
        }
    }

    async fn launch_container(
        &self,
        request: &DeploymentRequest,
        plan: &LaunchPlan,
    ) -> Result<Launched> {
        let runtime = self.container_runtime()?;
        let name = plan
            .container
            .clone()
            .ok_or_else(|| FleetError::validation("missing container name"))?;
        let info = runtime.inspect(&name).await?.ok_or_else(|| {
            FleetError::execution(format!(
                "Container '{}' not found; run container setup first",
                name
            ))
        })?;

        let info = if info.running {
            info
        } else {
            runtime.start(&name).await?;
            tokio::time::sleep(self.grace).await;
            match runtime.inspect(&name).await? {
                Some(fresh) if fresh.running => fresh,
                _ => {
                    return Err(FleetError::execution(format!(
                        "Container '{}' did not stay running after start",
                        name
                    )));
                }
            }
        };

        let notification = self.signal_role(runtime, &name, request, plan).await;
        Ok(Launched {
            identifier: info.id,
            notification,
        })
    }

    /// Best-effort; the outcome never changes the deploy result.
    async fn signal_role(
        &self,
        runtime: &Arc<dyn ContainerRuntime>,
        container: &str,
        request: &DeploymentRequest,
        plan: &LaunchPlan,
    ) -> NotificationOutcome {
        let Some(template_cmd) = plan.template.role_signal.as_ref().filter(|c| !c.is_empty())
        else {
            return NotificationOutcome::Skipped;
        };
        let team = request.team.clone().unwrap_or_default();
        let cmd: Vec<String> = template_cmd
            .iter()
            .map(|part| {
                part.replace("{agent_name}", &request.agent_name)
                    .replace("{agent_type}", &request.agent_type)
                    .replace("{bot_name}", &plan.bot_name)
                    .replace("{team}", &team)
            })
            .collect();
        match runtime.exec(container, &cmd, ROLE_SIGNAL_TIMEOUT).await {
            Ok(out) if out.success() => NotificationOutcome::Delivered,
            Ok(out) => {
                tracing::warn!(
                    container = %container,
                    exit_code = out.exit_code,
                    "role signal exited non-zero"
                );
                NotificationOutcome::Failed(format!("exit code {}: {}", out.exit_code, out.output))
            }
            Err(e) => {
                tracing::warn!(container = %container, "role signal failed: {}", e);
                NotificationOutcome::Failed(e.to_string())
            }
        }
    }

    async fn stop_process(&self, record: &DeploymentRecord) -> Result<()> {
        let pid = parse_process_identifier(&record.identifier).ok_or_else(|| {
            FleetError::execution(format!("invalid process identifier '{}'", record.identifier))
        })?;
        match self.launcher.probe(pid).await {
            ProcessProbe::Alive => self.launcher.kill(pid).await,
            _ => {
                tracing::debug!(agent = %record.agent_name, pid, "process already gone");
                Ok(())
            }
        }
    }

    async fn stop_container(&self, record: &DeploymentRecord) -> Result<()> {
        let runtime = self.container_runtime()?;
        runtime.stop(&record.identifier).await?;
        runtime.remove(&record.identifier).await
    }

    async fn probe_record(&self, record: &DeploymentRecord) -> bool {
        match record.deployment_type {
            DeploymentMechanism::Process => match parse_process_identifier(&record.identifier) {
                Some(pid) => self.launcher.probe(pid).await == ProcessProbe::Alive,
                None => false,
            },
            DeploymentMechanism::Container | DeploymentMechanism::IsolatedContainer => {
                let Ok(runtime) = self.container_runtime() else {
                    return false;
                };
                match runtime.inspect(&record.identifier).await {
                    Ok(Some(info)) => info.running,
                    Ok(None) => false,
                    Err(e) => {
                        tracing::warn!(agent = %record.agent_name, "container inspect failed: {}", e);
                        false
                    }
                }
            }
        }
    }

    fn container_runtime(&self) -> Result<&Arc<dyn ContainerRuntime>> {
        self.containers
            .as_ref()
            .ok_or_else(|| FleetError::execution("container runtime unavailable"))
    }

    async fn record_event(
        &self,
        kind: FleetEventKind,
        agent_name: &str,
        agent_type: &str,
        detail: String,
    ) {
        let Some(events) = &self.events else {
            return;
        };
        if let Err(e) = events
            .store(FleetEvent::new(kind, agent_name, agent_type, detail))
            .await
        {
            tracing::warn!(agent = %agent_name, "failed to record event: {}", e);
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use crate::memory::InMemoryEventStore;

    fn env(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn manager(launcher: Arc<FakeLauncher>) -> DeploymentManager {
        let catalog = catalog(vec![
            (
                "grok4",
                template(DeploymentMechanism::Process, &["DISCORD_TOKEN_GROK4", "XAI_API_KEY"]),
            ),
            ("claude", template(DeploymentMechanism::Container, &[])),
        ]);
        DeploymentManager::new(catalog, launcher)
            .with_base_env(env(&[("DISCORD_TOKEN_GROK4", "t"), ("XAI_API_KEY", "k")]))
            .with_grace(Duration::from_millis(1))
    }

    #[tokio::test]
    async fn process_deploy_records_running_and_rejects_duplicate() {
        let launcher = Arc::new(FakeLauncher::default());
        let mgr = manager(launcher.clone());
        let res = mgr
            .deploy(DeploymentRequest::new("a1", "grok4").with_mechanism(DeploymentMechanism::Process))
            .await;
        assert!(res.success, "{}", res.message);
        assert_eq!(res.status, AgentStatus::Running);
        assert!(parse_process_identifier(&res.identifier).is_some());
        assert_eq!(res.discord_bot_name.as_deref(), Some("a1"));

        let again = mgr.deploy(DeploymentRequest::new("a1", "grok4")).await;
        assert!(!again.success);
        assert!(again.message.contains("already deployed"));
        assert_eq!(launcher.spawn_count(), 1);
        assert_eq!(mgr.list_all().await.len(), 1);
    }

    #[tokio::test]
    async fn unknown_type_has_no_side_effects() {
        let launcher = Arc::new(FakeLauncher::default());
        let mgr = manager(launcher.clone());
        let res = mgr.deploy(DeploymentRequest::new("x", "gpt9")).await;
        assert!(!res.success);
        assert!(res.message.contains("Unknown agent type"));
        assert_eq!(launcher.spawn_count(), 0);
        assert!(mgr.list_all().await.is_empty());
    }

    #[tokio::test]
    async fn missing_credentials_never_spawn_or_register() {
        let launcher = Arc::new(FakeLauncher::default());
        let mgr = manager(launcher.clone()).with_base_env(env(&[("XAI_API_KEY", "  ")]));
        let res = mgr.deploy(DeploymentRequest::new("a1", "grok4")).await;
        assert!(!res.success);
        assert!(res.message.contains("DISCORD_TOKEN_GROK4"));
        assert!(res.message.contains("XAI_API_KEY"));
        assert_eq!(launcher.spawn_count(), 0);
        assert!(mgr.list_all().await.is_empty());
    }

    #[tokio::test]
    async fn request_env_supplies_credentials_and_reaches_process() {
        let launcher = Arc::new(FakeLauncher::default());
        let mgr = manager(launcher.clone()).with_base_env(BTreeMap::new());
        let req = DeploymentRequest::new("a1", "grok4")
            .with_env("DISCORD_TOKEN_GROK4", "d")
            .with_env("XAI_API_KEY", "x")
            .with_team("t1");
        let res = mgr.deploy(req).await;
        assert!(res.success, "{}", res.message);
        let seen = launcher.last_env.lock().unwrap().clone();
        assert_eq!(seen.get("XAI_API_KEY").map(String::as_str), Some("x"));
        assert_eq!(seen.get("FLEET_TEAM").map(String::as_str), Some("t1"));
    }

    #[tokio::test]
    async fn early_exit_fails_with_output_and_leaves_no_record() {
        let launcher = Arc::new(FakeLauncher::default());
        launcher.crash_agent("a1", "Traceback: bad token");
        let events = Arc::new(InMemoryEventStore::default());
        let mgr = manager(launcher.clone()).with_events(events.clone());
        let res = mgr.deploy(DeploymentRequest::new("a1", "grok4")).await;
        assert!(!res.success);
        assert!(res.message.contains("bad token"));
        assert!(mgr.list_all().await.is_empty());
        let hits = events.search("a1", 10).await.unwrap();
        assert_eq!(hits[0].kind, FleetEventKind::DeployFailed);
    }

    #[tokio::test]
    async fn auto_start_false_validates_only() {
        let launcher = Arc::new(FakeLauncher::default());
        let mgr = manager(launcher.clone());
        let mut req = DeploymentRequest::new("a1", "grok4");
        req.auto_start = false;
        let res = mgr.deploy(req).await;
        assert!(res.success);
        assert_eq!(res.status, AgentStatus::Requested);
        assert_eq!(launcher.spawn_count(), 0);
        assert!(mgr.list_all().await.is_empty());
    }

    #[tokio::test]
    async fn stop_removes_record_and_failed_stop_keeps_it() {
        let launcher = Arc::new(FakeLauncher::default());
        let mgr = manager(launcher.clone());
        assert!(mgr.deploy(DeploymentRequest::new("a1", "grok4")).await.success);

        *launcher.fail_kill.lock().unwrap() = true;
        assert!(!mgr.stop("a1").await);
        assert_eq!(mgr.status_of("a1").await, Some(AgentStatus::Running));

        *launcher.fail_kill.lock().unwrap() = false;
        assert!(mgr.stop("a1").await);
        assert!(mgr.status_of("a1").await.is_none());
        assert!(!mgr.stop("a1").await);
        assert!(mgr.deploy(DeploymentRequest::new("a1", "grok4")).await.success);
    }

    #[tokio::test]
    async fn list_active_revalidates_and_marks_dead_failed() {
        let launcher = Arc::new(FakeLauncher::default());
        let mgr = manager(launcher.clone());
        let r1 = mgr.deploy(DeploymentRequest::new("a1", "grok4")).await;
        let _ = mgr.deploy(DeploymentRequest::new("a2", "grok4")).await;
        launcher.reap(parse_process_identifier(&r1.identifier).unwrap());

        let active = mgr.list_active().await;
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].agent_name, "a2");
        assert_eq!(mgr.status_of("a1").await, Some(AgentStatus::Failed));
        assert!(!mgr.is_active("a1").await);
        // a failed record can be replaced by a fresh deploy
        assert!(mgr.deploy(DeploymentRequest::new("a1", "grok4")).await.success);
    }

    #[tokio::test]
    async fn container_missing_asks_for_setup() {
        let launcher = Arc::new(FakeLauncher::default());
        let containers = Arc::new(FakeContainers::default());
        let mgr = manager(launcher).with_containers(containers);
        let res = mgr.deploy(DeploymentRequest::new("c1", "claude")).await;
        assert!(!res.success);
        assert!(res.message.contains("run container setup first"));
        assert!(mgr.list_all().await.is_empty());
    }

    #[tokio::test]
    async fn one_container_serves_one_agent_at_a_time() {
        let launcher = Arc::new(FakeLauncher::default());
        let containers = Arc::new(FakeContainers::default());
        containers.add("fleet-claude", "cid1", true);
        let mgr = manager(launcher).with_containers(containers.clone());

        let first = mgr.deploy(DeploymentRequest::new("c1", "claude")).await;
        assert!(first.success, "{}", first.message);
        let second = mgr.deploy(DeploymentRequest::new("c2", "claude")).await;
        assert!(!second.success);
        assert!(second.message.contains("already in use by agent 'c1'"), "{}", second.message);
        assert_eq!(mgr.status_of("c2").await, None);
        assert!(mgr.is_running("c1").await);

        assert!(mgr.stop("c1").await);
        containers.add("fleet-claude", "cid2", true);
        let again = mgr.deploy(DeploymentRequest::new("c2", "claude")).await;
        assert!(again.success, "{}", again.message);
        assert_eq!(again.identifier, "cid2");
    }

    #[tokio::test]
    async fn container_without_runtime_is_execution_failure() {
        let mgr = manager(Arc::new(FakeLauncher::default()));
        let res = mgr.deploy(DeploymentRequest::new("c1", "claude")).await;
        assert!(!res.success);
        assert!(res.message.contains("container runtime unavailable"));
    }

    #[tokio::test]
    async fn stopped_container_is_started_and_role_signal_is_non_critical() {
        let launcher = Arc::new(FakeLauncher::default());
        let containers = Arc::new(FakeContainers::default());
        containers.add("fleet-claude", "cid1", false);
        *containers.exec_exit.lock().unwrap() = 2;
        let mut claude = template(DeploymentMechanism::Container, &[]);
        claude.role_signal = Some(vec!["announce".into(), "{agent_name}".into()]);
        let mgr = DeploymentManager::new(catalog(vec![("claude", claude)]), launcher)
            .with_containers(containers.clone())
            .with_grace(Duration::from_millis(1));

        let res = mgr.deploy(DeploymentRequest::new("c1", "claude")).await;
        assert!(res.success, "{}", res.message);
        assert_eq!(res.identifier, "cid1");
        assert!(matches!(res.notification, NotificationOutcome::Failed(_)));
        assert_eq!(
            containers.execs.lock().unwrap()[0],
            vec!["announce".to_string(), "c1".to_string()]
        );
        assert!(mgr.is_running("c1").await);

        assert!(mgr.stop("c1").await);
        assert!(containers.inspect("fleet-claude").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn isolated_container_clears_mounts() {
        let containers = Arc::new(FakeContainers::default());
        containers.add("fleet-claude", "cid1", true);
        let mut claude = template(DeploymentMechanism::Container, &[]);
        claude.mounts = vec!["/srv/shared:/shared".into()];
        let mgr = DeploymentManager::new(
            catalog(vec![("claude", claude)]),
            Arc::new(FakeLauncher::default()),
        )
        .with_containers(containers);
        let res = mgr
            .deploy(
                DeploymentRequest::new("c1", "claude")
                    .with_mechanism(DeploymentMechanism::IsolatedContainer),
            )
            .await;
        assert!(res.success);
        assert_eq!(res.deployment_type, Some(DeploymentMechanism::IsolatedContainer));
        let records = mgr.records.lock().await;
        assert!(records["c1"].mounts.is_empty());
    }

    #[tokio::test]
    async fn provisioning_creates_missing_containers_only() {
        let containers = Arc::new(FakeContainers::default());
        containers.add("fleet-claude", "cid1", false);
        let mut gemini = template(DeploymentMechanism::IsolatedContainer, &[]);
        gemini.launch.image = Some("fleet/gemini".into());
        gemini.mounts = vec!["/a:/b".into()];
        let mgr = DeploymentManager::new(
            catalog(vec![
                ("claude", template(DeploymentMechanism::Container, &[])),
                ("gemini", gemini),
                ("grok4", template(DeploymentMechanism::Process, &[])),
            ]),
            Arc::new(FakeLauncher::default()),
        )
        .with_containers(containers.clone());

        let outcomes = mgr.provision_containers(None).await.unwrap();
        assert_eq!(outcomes.len(), 2);
        assert!(!outcomes[0].created);
        assert!(outcomes[1].created);
        let created = containers.created.lock().unwrap();
        assert_eq!(created[0].name, "fleet-gemini");
        assert!(created[0].mounts.is_empty());
    }

    #[tokio::test]
    async fn concurrent_deploys_of_one_name_admit_exactly_one() {
        let launcher = Arc::new(FakeLauncher::default());
        let mgr = Arc::new(manager(launcher.clone()));
        let mut set = tokio::task::JoinSet::new();
        for _ in 0..8 {
            let mgr = mgr.clone();
            set.spawn(async move { mgr.deploy(DeploymentRequest::new("dup", "grok4")).await });
        }
        let mut ok = 0;
        while let Some(res) = set.join_next().await {
            if res.unwrap().success {
                ok += 1;
            }
        }
        assert_eq!(ok, 1);
        assert_eq!(launcher.spawn_count(), 1);
    }
}

//! Assembly of the fleet services from resolved settings.
//!
//! `FleetSettings` holds already-resolved values (env > config > default is
//! applied by the binary); `Fleet::build` turns them into the shared service
//! graph handed to the MCP handler.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;

use crate::catalog::TemplateCatalog;
use crate::conversation::{ConversationLoop, DEFAULT_MAX_ITERATIONS};
use crate::deploy::{
    DEFAULT_CONTAINER_PREFIX, DEFAULT_GRACE, DeploymentManager, DockerRuntime,
    LocalProcessLauncher,
};
use crate::error::{FleetError, Result};
use crate::llm::{LlmClient, OpenAiClient, openai};
use crate::mcp::registry::DEFAULT_CACHE_TTL;
use crate::mcp::session::DEFAULT_SESSION_TIMEOUT;
use crate::mcp::{StdioSessions, ToolDispatcher, ToolRegistry, default_server_files};
use crate::memory::{EventStore, InMemoryEventStore};
use crate::team::{TeamCoordinator, TeamStore, TeamTimings};

pub const DEFAULT_EVENT_CAPACITY: usize = 1024;
pub const DEFAULT_API_KEY_ENV: &str = "OPENAI_API_KEY";

#[derive(Debug, Clone)]
pub struct LlmSettings {
    pub base_url: String,
    pub model: String,
    /// Name of the environment variable holding the API key.
    pub api_key_env: String,
    pub max_iterations: usize,
    pub system_prompt: Option<String>,
}

impl Default for LlmSettings {
    fn default() -> Self {
        Self {
            base_url: openai::DEFAULT_BASE_URL.to_string(),
            model: openai::DEFAULT_MODEL.to_string(),
            api_key_env: DEFAULT_API_KEY_ENV.to_string(),
            max_iterations: DEFAULT_MAX_ITERATIONS,
            system_prompt: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FleetSettings {
    pub fleet_home: PathBuf,
    pub workspace_dir: PathBuf,
    /// Layered agent template files, later wins.
    pub template_files: Vec<PathBuf>,
    /// `None` keeps teams in memory only.
    pub teams_file: Option<PathBuf>,
    /// Capability server definition files, later wins per server key.
    pub server_files: Vec<PathBuf>,
    pub grace: Duration,
    pub settle: Duration,
    pub restart_pause: Duration,
    pub container_prefix: String,
    pub stop_timeout_secs: i64,
    /// Connect to the local Docker daemon for container mechanisms.
    pub enable_containers: bool,
    pub cache_ttl: Duration,
    pub session_timeout: Duration,
    pub event_capacity: usize,
    pub llm: LlmSettings,
}

impl FleetSettings {
    /// Defaults rooted at `fleet_home`, with workspace-local files layered last.
    pub fn defaults(fleet_home: &Path, workspace_dir: &Path) -> Self {
        let timings = TeamTimings::default();
        Self {
            fleet_home: fleet_home.to_path_buf(),
            workspace_dir: workspace_dir.to_path_buf(),
            template_files: vec![
                fleet_home.join("agents.toml"),
                workspace_dir.join(".fleet").join("agents.toml"),
            ],
            teams_file: Some(fleet_home.join("teams.toml")),
            server_files: default_server_files(workspace_dir, fleet_home),
            grace: DEFAULT_GRACE,
            settle: timings.settle,
            restart_pause: timings.restart_pause,
            container_prefix: DEFAULT_CONTAINER_PREFIX.to_string(),
            stop_timeout_secs: 10,
            enable_containers: true,
            cache_ttl: DEFAULT_CACHE_TTL,
            session_timeout: DEFAULT_SESSION_TIMEOUT,
            event_capacity: DEFAULT_EVENT_CAPACITY,
            llm: LlmSettings::default(),
        }
    }

    pub fn agent_log_dir(&self) -> PathBuf {
        self.fleet_home.join("logs").join("agents")
    }
}

/// Shared services behind the MCP tools.
pub struct Fleet {
    pub catalog: Arc<TemplateCatalog>,
    pub deployments: Arc<DeploymentManager>,
    pub teams: Arc<TeamCoordinator>,
    pub registry: Arc<ToolRegistry>,
    pub dispatcher: Arc<ToolDispatcher>,
    pub events: Arc<dyn EventStore>,
    conversation: std::result::Result<Arc<ConversationLoop>, String>,
}

impl Fleet {
    pub fn build(settings: &FleetSettings) -> anyhow::Result<Self> {
        let catalog = Arc::new(
            TemplateCatalog::from_files(settings.template_files.clone())
                .context("load agent templates")?,
        );
        let events: Arc<dyn EventStore> =
            Arc::new(InMemoryEventStore::new(settings.event_capacity));

        let launcher = Arc::new(LocalProcessLauncher::new(settings.agent_log_dir()));
        let base_env: BTreeMap<String, String> = std::env::vars().collect();
        let mut manager = DeploymentManager::new(catalog.clone(), launcher)
            .with_events(events.clone())
            .with_base_env(base_env)
            .with_grace(settings.grace)
            .with_container_prefix(settings.container_prefix.clone());
        if settings.enable_containers {
            match DockerRuntime::connect(settings.stop_timeout_secs) {
                Ok(runtime) => manager = manager.with_containers(Arc::new(runtime)),
                Err(e) => tracing::warn!("container mechanisms unavailable: {}", e),
            }
        }
        let deployments = Arc::new(manager);

        let store = match &settings.teams_file {
            Some(path) => TeamStore::load(path).context("load teams")?,
            None => TeamStore::in_memory(),
        };
        let teams = Arc::new(
            TeamCoordinator::new(deployments.clone(), store).with_timings(TeamTimings {
                settle: settings.settle,
                restart_pause: settings.restart_pause,
            }),
        );

        let sessions = Arc::new(StdioSessions::new(settings.session_timeout));
        let registry = Arc::new(
            ToolRegistry::from_files(settings.server_files.clone(), sessions)
                .with_ttl(settings.cache_ttl),
        );
        let dispatcher = Arc::new(ToolDispatcher::new(registry.clone()));

        let conversation = match std::env::var(&settings.llm.api_key_env) {
            Ok(key) if !key.trim().is_empty() => {
                let client: Arc<dyn LlmClient> = Arc::new(OpenAiClient::new(
                    key,
                    settings.llm.base_url.clone(),
                    settings.llm.model.clone(),
                ));
                Ok(Arc::new(conversation_for(client, dispatcher.clone(), &settings.llm)))
            }
            _ => {
                tracing::info!(
                    "{} not set; the ask tool is disabled",
                    settings.llm.api_key_env
                );
                Err(format!(
                    "LLM is not configured: set {} to enable conversational dispatch",
                    settings.llm.api_key_env
                ))
            }
        };

        tracing::info!(
            templates = catalog.names().len(),
            servers = registry.server_names().len(),
            "fleet assembled"
        );
        Ok(Self {
            catalog,
            deployments,
            teams,
            registry,
            dispatcher,
            events,
            conversation,
        })
    }

    /// Assemble from prebuilt parts; used where the defaults would touch the host.
    pub fn from_parts(
        teams: Arc<TeamCoordinator>,
        registry: Arc<ToolRegistry>,
        events: Arc<dyn EventStore>,
        llm: Option<(Arc<dyn LlmClient>, LlmSettings)>,
    ) -> Self {
        let deployments = teams.deployments().clone();
        let catalog = deployments.catalog().clone();
        let dispatcher = Arc::new(ToolDispatcher::new(registry.clone()));
        let conversation = match llm {
            Some((client, settings)) => Ok(Arc::new(conversation_for(
                client,
                dispatcher.clone(),
                &settings,
            ))),
            None => Err("LLM is not configured".to_string()),
        };
        Self {
            catalog,
            deployments,
            teams,
            registry,
            dispatcher,
            events,
            conversation,
        }
    }

    pub fn conversation(&self) -> Result<Arc<ConversationLoop>> {
        self.conversation.clone().map_err(FleetError::Config)
    }

    /// Re-read templates and capability server files.
    pub async fn reload(&self) -> Result<(usize, usize)> {
        let templates = self
            .catalog
            .reload()
            .map_err(|e| FleetError::Config(format!("{:#}", e)))?;
        let servers = self.registry.reload().await;
        Ok((templates, servers))
    }
}

fn conversation_for(
    client: Arc<dyn LlmClient>,
    dispatcher: Arc<ToolDispatcher>,
    settings: &LlmSettings,
) -> ConversationLoop {
    ConversationLoop::new(client, dispatcher)
        .with_max_iterations(settings.max_iterations)
        .with_system_prompt(settings.system_prompt.clone())
}

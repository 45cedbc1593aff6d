//! Agent-type templates: static launch configuration per agent kind.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use super::naming::safe_name;

/// Launch strategy for an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentMechanism {
    #[default]
    Process,
    Container,
    #[serde(alias = "isolatedContainer", alias = "isolated")]
    IsolatedContainer,
}

impl DeploymentMechanism {
    pub fn is_container(self) -> bool {
        matches!(self, Self::Container | Self::IsolatedContainer)
    }
}

impl fmt::Display for DeploymentMechanism {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Process => write!(f, "process"),
            Self::Container => write!(f, "container"),
            Self::IsolatedContainer => write!(f, "isolated_container"),
        }
    }
}

/// What to run: a host command for processes, an image/container for containers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LaunchSpec {
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub cwd: Option<PathBuf>,
    /// Image used when provisioning the long-lived container.
    #[serde(default)]
    pub image: Option<String>,
    /// Explicit name of the pre-provisioned container.
    #[serde(default)]
    pub container: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentTypeTemplate {
    #[serde(default)]
    pub description: String,
    #[serde(default, alias = "deployment_mechanism")]
    pub mechanism: DeploymentMechanism,
    #[serde(default)]
    pub launch: LaunchSpec,
    /// Environment variable names that must resolve to non-empty values.
    #[serde(default)]
    pub credentials: Vec<String>,
    /// Fixed environment entries passed to the agent.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Shared volume mounts, `host:container[:ro]`.
    #[serde(default)]
    pub mounts: Vec<String>,
    /// Chat display identity; defaults to the agent name.
    #[serde(default)]
    pub bot_name: Option<String>,
    /// Command run inside the container after start to announce the new role.
    #[serde(default)]
    pub role_signal: Option<Vec<String>>,
}

impl AgentTypeTemplate {
    /// Name of the long-lived container backing `agent_type`.
    pub fn container_name(&self, agent_type: &str, prefix: &str) -> String {
        self.launch
            .container
            .clone()
            .unwrap_or_else(|| format!("{}-{}", prefix, safe_name(agent_type)))
    }

    pub fn resolve_bot_name(&self, agent_name: &str) -> String {
        self.bot_name
            .clone()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| agent_name.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mechanism_accepts_camel_case_alias() {
        let t: AgentTypeTemplate = toml::from_str(
            r#"
mechanism = "isolatedContainer"
credentials = ["DISCORD_TOKEN"]
[launch]
image = "fleet/claude:latest"
"#,
        )
        .expect("parse");
        assert_eq!(t.mechanism, DeploymentMechanism::IsolatedContainer);
        assert!(t.mechanism.is_container());
        assert_eq!(t.container_name("Claude Opus", "fleet"), "fleet-claude_opus");
    }

    #[test]
    fn explicit_container_and_bot_name_win() {
        let t = AgentTypeTemplate {
            launch: LaunchSpec {
                container: Some("bots-grok".into()),
                ..Default::default()
            },
            bot_name: Some("Grok".into()),
            ..Default::default()
        };
        assert_eq!(t.container_name("grok4", "fleet"), "bots-grok");
        assert_eq!(t.resolve_bot_name("a1"), "Grok");
        assert_eq!(AgentTypeTemplate::default().resolve_bot_name("a1"), "a1");
    }
}

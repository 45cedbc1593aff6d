//! Deployment records: one entry per running or previously started agent.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::template::DeploymentMechanism;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AgentStatus {
    Requested,
    Starting,
    Running,
    Failed,
    Stopped,
}

impl AgentStatus {
    /// Terminal records may be replaced by a fresh deploy under the same name.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Failed | Self::Stopped)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentRecord {
    pub agent_name: String,
    pub agent_type: String,
    pub deployment_type: DeploymentMechanism,
    /// `process_<pid>` or a container id; opaque outside the manager.
    pub identifier: String,
    pub status: AgentStatus,
    pub discord_bot_name: Option<String>,
    pub team: Option<String>,
    #[serde(default)]
    pub mounts: Vec<String>,
    /// Container name held by container deployments.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Reported view of a record after liveness re-validation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentSummary {
    pub agent_name: String,
    pub agent_type: String,
    pub deployment_type: DeploymentMechanism,
    pub identifier: String,
    pub status: AgentStatus,
    pub discord_bot_name: Option<String>,
    pub team: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl From<&DeploymentRecord> for AgentSummary {
    fn from(r: &DeploymentRecord) -> Self {
        Self {
            agent_name: r.agent_name.clone(),
            agent_type: r.agent_type.clone(),
            deployment_type: r.deployment_type,
            identifier: r.identifier.clone(),
            status: r.status,
            discord_bot_name: r.discord_bot_name.clone(),
            team: r.team.clone(),
            created_at: r.created_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_failed_and_stopped_are_terminal() {
        assert!(!AgentStatus::Requested.is_terminal());
        assert!(!AgentStatus::Starting.is_terminal());
        assert!(!AgentStatus::Running.is_terminal());
        assert!(AgentStatus::Failed.is_terminal());
        assert!(AgentStatus::Stopped.is_terminal());
    }

    #[test]
    fn status_serializes_as_pascal_case() {
        assert_eq!(
            serde_json::to_string(&AgentStatus::Running).unwrap(),
            "\"Running\""
        );
    }
}

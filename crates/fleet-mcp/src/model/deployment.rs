//! Deployment request/response shapes exchanged with callers.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Value as JsonValue};

use super::record::AgentStatus;
use super::template::DeploymentMechanism;

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentRequest {
    pub agent_name: String,
    pub agent_type: String,
    /// Explicit mechanism; wins over the template's declared one.
    #[serde(default)]
    pub deployment_type: Option<DeploymentMechanism>,
    #[serde(default)]
    pub team: Option<String>,
    /// Merged over the template, key by key; request wins.
    #[serde(default)]
    pub config_overrides: Option<JsonMap<String, JsonValue>>,
    #[serde(default)]
    pub environment_overrides: BTreeMap<String, String>,
    /// When false the request is validated and planned but nothing is launched.
    #[serde(default = "default_true")]
    pub auto_start: bool,
}

impl DeploymentRequest {
    pub fn new(agent_name: impl Into<String>, agent_type: impl Into<String>) -> Self {
        Self {
            agent_name: agent_name.into(),
            agent_type: agent_type.into(),
            deployment_type: None,
            team: None,
            config_overrides: None,
            environment_overrides: BTreeMap::new(),
            auto_start: true,
        }
    }

    pub fn with_mechanism(mut self, mechanism: DeploymentMechanism) -> Self {
        self.deployment_type = Some(mechanism);
        self
    }

    pub fn with_team(mut self, team: impl Into<String>) -> Self {
        self.team = Some(team.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.environment_overrides.insert(key.into(), value.into());
        self
    }
}

/// Outcome of the best-effort in-container role announcement. Never affects
/// `DeploymentResult::success`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "detail", rename_all = "snake_case")]
pub enum NotificationOutcome {
    #[default]
    Skipped,
    Delivered,
    Failed(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentResult {
    pub success: bool,
    pub agent_name: String,
    pub deployment_type: Option<DeploymentMechanism>,
    pub identifier: String,
    pub status: AgentStatus,
    pub message: String,
    pub discord_bot_name: Option<String>,
    #[serde(default)]
    pub notification: NotificationOutcome,
}

impl DeploymentResult {
    pub fn failure(
        agent_name: &str,
        mechanism: Option<DeploymentMechanism>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            success: false,
            agent_name: agent_name.to_string(),
            deployment_type: mechanism,
            identifier: String::new(),
            status: AgentStatus::Failed,
            message: message.into(),
            discord_bot_name: None,
            notification: NotificationOutcome::Skipped,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_parses_camel_case_json_with_defaults() {
        let req: DeploymentRequest = serde_json::from_str(
            r#"{"agentName":"a1","agentType":"grok4","deploymentType":"process"}"#,
        )
        .expect("parse");
        assert_eq!(req.agent_name, "a1");
        assert_eq!(req.deployment_type, Some(DeploymentMechanism::Process));
        assert!(req.auto_start);
        assert!(req.environment_overrides.is_empty());
    }

    #[test]
    fn notification_outcome_is_tagged() {
        let v = serde_json::to_value(NotificationOutcome::Failed("exec 1".into())).unwrap();
        assert_eq!(v["state"], "failed");
        assert_eq!(v["detail"], "exec 1");
    }
}

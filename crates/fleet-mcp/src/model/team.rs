//! Teams and the results of team-wide lifecycle operations.

use serde::{Deserialize, Serialize};

use super::record::AgentStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoordinationMode {
    #[default]
    Parallel,
    Sequential,
    Collaborative,
}

/// A team member. In team files a bare string means the agent is named
/// after its type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "MemberRepr", rename_all = "camelCase")]
pub struct TeamMember {
    pub name: String,
    pub agent_type: String,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum MemberRepr {
    Name(String),
    Full {
        name: String,
        #[serde(rename = "agentType", alias = "agent_type")]
        agent_type: String,
    },
}

impl From<MemberRepr> for TeamMember {
    fn from(r: MemberRepr) -> Self {
        match r {
            MemberRepr::Name(name) => Self {
                agent_type: name.clone(),
                name,
            },
            MemberRepr::Full { name, agent_type } => Self { name, agent_type },
        }
    }
}

impl TeamMember {
    pub fn new(name: impl Into<String>, agent_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            agent_type: agent_type.into(),
        }
    }
}

/// Written in camelCase like every other payload; hand-written team files
/// may also use snake_case keys.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Team {
    #[serde(alias = "team_name")]
    pub team_name: String,
    #[serde(default, alias = "display_name")]
    pub display_name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, alias = "coordination_mode")]
    pub coordination_mode: CoordinationMode,
    #[serde(default, alias = "auto_deploy")]
    pub auto_deploy: bool,
    /// Kept last so TOML output places member tables after plain keys.
    #[serde(default)]
    pub members: Vec<TeamMember>,
}

impl Team {
    pub fn new(team_name: impl Into<String>) -> Self {
        let team_name = team_name.into();
        Self {
            display_name: team_name.clone(),
            team_name,
            description: String::new(),
            coordination_mode: CoordinationMode::default(),
            auto_deploy: false,
            members: Vec::new(),
        }
    }

    pub fn has_member(&self, name: &str) -> bool {
        self.members.iter().any(|m| m.name == name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TeamOperation {
    Start,
    Stop,
    Restart,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemberAction {
    Start,
    Stop,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemberOutcome {
    pub agent_name: String,
    pub action: MemberAction,
    pub success: bool,
    pub message: String,
    #[serde(default)]
    pub identifier: Option<String>,
}

/// Team operations never collapse to all-or-nothing: counts are always
/// reported alongside the operation-level flag.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TeamOpResult {
    pub team_name: String,
    pub operation: TeamOperation,
    pub success: bool,
    pub started_count: usize,
    pub stopped_count: usize,
    pub total_count: usize,
    pub members: Vec<MemberOutcome>,
    pub message: String,
}

impl TeamOpResult {
    pub fn rejected(team_name: &str, operation: TeamOperation, message: impl Into<String>) -> Self {
        Self {
            team_name: team_name.to_string(),
            operation,
            success: false,
            started_count: 0,
            stopped_count: 0,
            total_count: 0,
            members: Vec::new(),
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    Healthy,
    Degraded,
    Down,
}

impl HealthState {
    /// `healthy` at 80% or more, `down` at zero, `degraded` in between.
    pub fn classify(running: usize, total: usize) -> Self {
        if running == 0 || total == 0 {
            return Self::Down;
        }
        if running * 100 >= total * 80 {
            Self::Healthy
        } else {
            Self::Degraded
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemberHealth {
    pub agent_name: String,
    pub status: Option<AgentStatus>,
    pub running: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TeamHealth {
    pub team_name: String,
    pub running_members: usize,
    pub total_members: usize,
    pub percentage: f64,
    pub state: HealthState,
    pub members: Vec<MemberHealth>,
}

pub fn health_percentage(running: usize, total: usize) -> f64 {
    if total == 0 {
        return 0.0;
    }
    running as f64 / total as f64 * 100.0
}

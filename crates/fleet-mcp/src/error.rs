//! Error taxonomy shared by the deployment, team and tool layers.
//!
//! Validation errors are raised before any side effect is attempted.
//! Execution errors carry whatever diagnostic output the failing launch,
//! container call or capability server produced.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum FleetError {
    #[error("Unknown agent type '{0}'")]
    UnknownAgentType(String),

    #[error("Missing required credential(s) for '{agent_type}': {}", missing.join(", "))]
    MissingCredentials {
        agent_type: String,
        missing: Vec<String>,
    },

    #[error("Agent '{0}' is already deployed")]
    AlreadyDeployed(String),

    #[error("Unknown agent '{0}'")]
    UnknownAgent(String),

    #[error("Unknown team '{0}'")]
    UnknownTeam(String),

    #[error("Team '{0}' already exists")]
    TeamExists(String),

    #[error("Unknown capability server '{0}'")]
    UnknownServer(String),

    #[error("Unknown tool '{tool}' on server '{server}'")]
    UnknownTool { server: String, tool: String },

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Execution error: {0}")]
    Execution(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl FleetError {
    pub fn execution(msg: impl Into<String>) -> Self {
        Self::Execution(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Validation failures never touched a process, container or registry.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::UnknownAgentType(_)
                | Self::MissingCredentials { .. }
                | Self::AlreadyDeployed(_)
                | Self::UnknownAgent(_)
                | Self::UnknownTeam(_)
                | Self::TeamExists(_)
                | Self::UnknownServer(_)
                | Self::UnknownTool { .. }
                | Self::Validation(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, FleetError>;

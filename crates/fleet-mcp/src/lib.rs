//! Agent fleet orchestration exposed over MCP.
//!
//! Deploys agents from typed templates as host processes or containers,
//! groups them into teams, and routes natural-language requests to the tools
//! of configured capability servers.

pub mod catalog;
pub mod config;
pub mod conversation;
pub mod deploy;
pub mod error;
pub mod fleet;
pub mod handler;
pub mod inbound;
pub mod llm;
pub mod mcp;
pub mod memory;
pub mod model;
pub mod team;

pub use error::{FleetError, Result};
pub use fleet::{Fleet, FleetSettings};

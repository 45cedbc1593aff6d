//! Capability servers: discovery of their tools, the descriptor cache and
//! dispatch of qualified calls. Stdio transports only.

pub mod discovery;
pub mod dispatch;
pub mod registry;
pub mod session;
pub mod types;

pub use discovery::{default_server_files, load_servers};
pub use dispatch::ToolDispatcher;
pub use registry::ToolRegistry;
pub use session::{StdioSessions, ToolSessions};
pub use types::*;

//! Fleet domain types: agent templates, deployment records, teams.

pub mod deployment;
pub mod naming;
pub mod record;
pub mod team;
pub mod template;

pub use deployment::*;
pub use naming::*;
pub use record::*;
pub use team::*;
pub use template::*;

//! Tool registry: discovers what each capability server offers and caches
//! the descriptors for a bounded time.
//!
//! The cache is owned here rather than being process-wide. Stale reads within
//! the TTL are accepted; `invalidate` and `reload` drop it explicitly.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tokio::task::JoinSet;

use super::discovery::load_servers;
use super::session::ToolSessions;
use super::{CallableFunctionSpec, CapabilityServer, ToolDescriptor, ToolHandle};
use crate::model::{qualified_tool_name, split_qualified};

pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(300);

struct Snapshot {
    fetched_at: Instant,
    by_server: BTreeMap<String, Vec<ToolDescriptor>>,
    /// Qualified name -> handle, so names containing the separator resolve
    /// without guessing where to split.
    handles: HashMap<String, ToolHandle>,
}

impl Snapshot {
    fn build(by_server: BTreeMap<String, Vec<ToolDescriptor>>) -> Self {
        let mut handles = HashMap::new();
        for (server, tools) in &by_server {
            for tool in tools {
                let qualified = qualified_tool_name(server, &tool.tool_name);
                let handle = ToolHandle {
                    server: server.clone(),
                    tool: tool.tool_name.clone(),
                };
                if let Some(existing) = handles.get(&qualified) {
                    tracing::warn!(
                        "qualified tool name '{}' is ambiguous ({:?} vs {:?}); keeping the first",
                        qualified,
                        existing,
                        handle
                    );
                    continue;
                }
                handles.insert(qualified, handle);
            }
        }
        Self {
            fetched_at: Instant::now(),
            by_server,
            handles,
        }
    }
}

pub struct ToolRegistry {
    sources: Vec<PathBuf>,
    servers: RwLock<BTreeMap<String, CapabilityServer>>,
    sessions: Arc<dyn ToolSessions>,
    ttl: Duration,
    cache: Mutex<Option<Snapshot>>,
}

impl ToolRegistry {
    pub fn new(servers: BTreeMap<String, CapabilityServer>, sessions: Arc<dyn ToolSessions>) -> Self {
        Self {
            sources: Vec::new(),
            servers: RwLock::new(servers),
            sessions,
            ttl: DEFAULT_CACHE_TTL,
            cache: Mutex::new(None),
        }
    }

    /// Registry backed by server definition files; `reload` re-reads them.
    pub fn from_files(sources: Vec<PathBuf>, sessions: Arc<dyn ToolSessions>) -> Self {
        let servers = load_servers(&sources);
        tracing::info!("configured {} capability server(s)", servers.len());
        Self {
            sources,
            ..Self::new(servers, sessions)
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn sessions(&self) -> &Arc<dyn ToolSessions> {
        &self.sessions
    }

    pub fn server_names(&self) -> Vec<String> {
        self.read_servers().keys().cloned().collect()
    }

    pub fn server(&self, name: &str) -> Option<CapabilityServer> {
        self.read_servers().get(name).cloned()
    }

    /// Tool lists per server, from cache when fresh. An unreachable server
    /// contributes an empty list instead of failing discovery.
    pub async fn discover_all(&self) -> BTreeMap<String, Vec<ToolDescriptor>> {
        let mut cache = self.cache.lock().await;
        if let Some(snapshot) = cache.as_ref()
            && snapshot.fetched_at.elapsed() < self.ttl
        {
            return snapshot.by_server.clone();
        }
        let by_server = self.fetch_all().await;
        let snapshot = Snapshot::build(by_server);
        let out = snapshot.by_server.clone();
        *cache = Some(snapshot);
        out
    }

    async fn fetch_all(&self) -> BTreeMap<String, Vec<ToolDescriptor>> {
        let servers: Vec<CapabilityServer> = self.read_servers().values().cloned().collect();
        let mut by_server: BTreeMap<String, Vec<ToolDescriptor>> = servers
            .iter()
            .map(|s| (s.name.clone(), Vec::new()))
            .collect();

        let mut set = JoinSet::new();
        for server in servers {
            let sessions = self.sessions.clone();
            set.spawn(async move {
                let result = sessions.list_tools(&server).await;
                (server.name, result)
            });
        }
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((name, Ok(tools))) => {
                    tracing::debug!(server = %name, tools = tools.len(), "discovered tools");
                    by_server.insert(name, tools);
                }
                Ok((name, Err(e))) => {
                    tracing::warn!(server = %name, "tool discovery failed: {}", e);
                }
                Err(e) => tracing::error!("discovery task failed: {}", e),
            }
        }
        let total: usize = by_server.values().map(Vec::len).sum();
        tracing::info!(
            "discovered {} tool(s) across {} server(s)",
            total,
            by_server.len()
        );
        by_server
    }

    /// Cached tools of one server, discovering if needed.
    pub async fn tools_of(&self, server: &str) -> Option<Vec<ToolDescriptor>> {
        self.discover_all().await.remove(server)
    }

    /// Every discovered tool projected under its qualified name.
    pub async fn function_specs(&self) -> Vec<CallableFunctionSpec> {
        self.discover_all()
            .await
            .into_values()
            .flatten()
            .map(|d| CallableFunctionSpec {
                name: qualified_tool_name(&d.server_name, &d.tool_name),
                description: d.description,
                parameters: if d.parameter_schema.is_object() {
                    d.parameter_schema
                } else {
                    serde_json::json!({ "type": "object", "properties": {} })
                },
            })
            .collect()
    }

    /// Resolve a qualified name through the handle index, falling back to a
    /// split on the first separator for names not in the cache.
    pub async fn resolve(&self, qualified: &str) -> Option<ToolHandle> {
        self.discover_all().await;
        if let Some(handle) = self
            .cache
            .lock()
            .await
            .as_ref()
            .and_then(|s| s.handles.get(qualified).cloned())
        {
            return Some(handle);
        }
        split_qualified(qualified).map(|(server, tool)| ToolHandle {
            server: server.to_string(),
            tool: tool.to_string(),
        })
    }

    pub async fn invalidate(&self) {
        *self.cache.lock().await = None;
        tracing::debug!("tool descriptor cache invalidated");
    }

    /// Re-read server definition files and drop the cache.
    pub async fn reload(&self) -> usize {
        if !self.sources.is_empty() {
            let fresh = load_servers(&self.sources);
            *self.servers.write().unwrap_or_else(|e| e.into_inner()) = fresh;
        }
        self.invalidate().await;
        let count = self.read_servers().len();
        tracing::info!("reloaded {} capability server(s)", count);
        count
    }

    fn read_servers(&self) -> std::sync::RwLockReadGuard<'_, BTreeMap<String, CapabilityServer>> {
        self.servers.read().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scriptable capability servers.

    use super::*;
    use crate::error::{FleetError, Result};
    use async_trait::async_trait;
    use serde_json::{Map as JsonMap, Value as JsonValue};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    pub struct FakeSessions {
        /// server -> tool names; servers absent here are unreachable
        pub tools: HashMap<String, Vec<String>>,
        pub list_calls: AtomicUsize,
    }

    impl FakeSessions {
        pub fn with_server(mut self, server: &str, tools: &[&str]) -> Self {
            self.tools.insert(
                server.to_string(),
                tools.iter().map(|t| t.to_string()).collect(),
            );
            self
        }

        pub fn list_count(&self) -> usize {
            self.list_calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ToolSessions for FakeSessions {
        async fn list_tools(&self, server: &CapabilityServer) -> Result<Vec<ToolDescriptor>> {
            self.list_calls.fetch_add(1, Ordering::SeqCst);
            let tools = self
                .tools
                .get(&server.name)
                .ok_or_else(|| FleetError::execution(format!("{} unreachable", server.name)))?;
            Ok(tools
                .iter()
                .map(|t| ToolDescriptor {
                    server_name: server.name.clone(),
                    tool_name: t.clone(),
                    description: format!("{} on {}", t, server.name),
                    parameter_schema: serde_json::json!({ "type": "object" }),
                })
                .collect())
        }

        async fn call_tool(
            &self,
            server: &CapabilityServer,
            tool: &str,
            args: JsonMap<String, JsonValue>,
        ) -> Result<String> {
            if tool == "explode" {
                return Err(FleetError::execution("tool crashed"));
            }
            Ok(format!(
                "{}.{}({})",
                server.name,
                tool,
                JsonValue::Object(args)
            ))
        }
    }

    pub fn servers(names: &[&str]) -> BTreeMap<String, CapabilityServer> {
        names
            .iter()
            .map(|n| (n.to_string(), CapabilityServer::stdio(*n, "unused", vec![])))
            .collect()
    }
}

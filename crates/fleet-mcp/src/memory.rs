//! Event persistence collaborator for deployment and stop outcomes.
//!
//! The fleet only calls `store` and `search`; similarity search, if any,
//! belongs to the implementation behind the trait. The bundled
//! `InMemoryEventStore` keeps a bounded ring of events and matches by keyword.

use std::collections::VecDeque;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FleetEventKind {
    Deployed,
    DeployFailed,
    Stopped,
    StopFailed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FleetEvent {
    #[serde(default)]
    pub id: String,
    pub kind: FleetEventKind,
    pub agent_name: String,
    pub agent_type: String,
    pub detail: String,
    pub created_at: DateTime<Utc>,
}

impl FleetEvent {
    pub fn new(
        kind: FleetEventKind,
        agent_name: &str,
        agent_type: &str,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            id: String::new(),
            kind,
            agent_name: agent_name.to_string(),
            agent_type: agent_type.to_string(),
            detail: detail.into(),
            created_at: Utc::now(),
        }
    }

    fn haystack(&self) -> String {
        format!(
            "{:?} {} {} {}",
            self.kind, self.agent_name, self.agent_type, self.detail
        )
        .to_lowercase()
    }
}

#[async_trait]
pub trait EventStore: Send + Sync {
    /// Persist an event and return its id.
    async fn store(&self, event: FleetEvent) -> Result<String>;

    /// Return up to `limit` events matching `query`, newest first.
    async fn search(&self, query: &str, limit: usize) -> Result<Vec<FleetEvent>>;
}

pub struct InMemoryEventStore {
    capacity: usize,
    events: RwLock<VecDeque<FleetEvent>>,
}

impl InMemoryEventStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            events: RwLock::new(VecDeque::new()),
        }
    }
}

impl Default for InMemoryEventStore {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    async fn store(&self, mut event: FleetEvent) -> Result<String> {
        let id = uuid::Uuid::new_v4().to_string();
        event.id = id.clone();
        let mut events = self.events.write().await;
        events.push_back(event);
        while events.len() > self.capacity {
            if let Some(evicted) = events.pop_front() {
                tracing::debug!(event_id = %evicted.id, "evicted fleet event");
            }
        }
        Ok(id)
    }

    async fn search(&self, query: &str, limit: usize) -> Result<Vec<FleetEvent>> {
        let terms: Vec<String> = query
            .split_whitespace()
            .map(|t| t.to_lowercase())
            .collect();
        let events = self.events.read().await;
        let found = events
            .iter()
            .rev()
            .filter(|e| {
                let hay = e.haystack();
                terms.iter().all(|t| hay.contains(t.as_str()))
            })
            .take(limit)
            .cloned()
            .collect();
        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn search_matches_all_terms_newest_first() {
        let store = InMemoryEventStore::default();
        store
            .store(FleetEvent::new(FleetEventKind::Deployed, "a1", "grok4", "process_10"))
            .await
            .unwrap();
        store
            .store(FleetEvent::new(FleetEventKind::Stopped, "a1", "grok4", "killed"))
            .await
            .unwrap();
        store
            .store(FleetEvent::new(FleetEventKind::Deployed, "b1", "claude", "container"))
            .await
            .unwrap();

        let hits = store.search("a1", 10).await.unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].kind, FleetEventKind::Stopped);

        let hits = store.search("deployed GROK4", 10).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].agent_name, "a1");
        assert!(!hits[0].id.is_empty());
    }

    #[tokio::test]
    async fn capacity_evicts_oldest() {
        let store = InMemoryEventStore::new(2);
        for name in ["a", "b", "c"] {
            store
                .store(FleetEvent::new(FleetEventKind::Deployed, name, "t", ""))
                .await
                .unwrap();
        }
        let all = store.search("", 10).await.unwrap();
        let names: Vec<_> = all.iter().map(|e| e.agent_name.as_str()).collect();
        assert_eq!(names, vec!["c", "b"]);
    }
}

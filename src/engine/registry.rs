use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::info;

use crate::workflow::model::AgentId;

/// A registered worker: declared capabilities, bounded concurrent
/// capacity, and a base priority in 1..=10. Capabilities and capacity are
/// immutable after registration; re-registering replaces the whole record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub id: AgentId,
    pub capabilities: HashSet<String>,
    pub capacity: usize,
    pub base_priority: u8,
    pub registered_at: DateTime<Utc>,
}

impl Agent {
    pub fn new(id: impl Into<AgentId>, capacity: usize, base_priority: u8) -> Self {
        Self {
            id: id.into(),
            capabilities: HashSet::new(),
            capacity,
            base_priority: base_priority.clamp(1, 10),
            registered_at: Utc::now(),
        }
    }

    pub fn with_capability(mut self, capability: impl Into<String>) -> Self {
        self.capabilities.insert(capability.into());
        self
    }

    pub fn with_capabilities<I, S>(mut self, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.capabilities
            .extend(capabilities.into_iter().map(Into::into));
        self
    }
}

/// Pure store with lookup; no scoring or scheduling logic lives here.
/// Registration order is retained because assignment tie-breaks go to the
/// first-registered agent. The in-flight safety check for deregistration
/// lives in the scheduler, which owns the in-flight map.
#[derive(Clone, Default)]
pub struct AgentRegistry {
    agents: Arc<RwLock<Vec<Agent>>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an agent, replacing any existing record in place so the
    /// original registration order is kept.
    pub async fn register(&self, agent: Agent) {
        let mut agents = self.agents.write().await;
        info!(
            "Registered agent {} (capacity {}, priority {})",
            agent.id, agent.capacity, agent.base_priority
        );
        match agents.iter_mut().find(|a| a.id == agent.id) {
            Some(existing) => *existing = agent,
            None => agents.push(agent),
        }
    }

    pub async fn remove(&self, id: &str) -> bool {
        let mut agents = self.agents.write().await;
        let before = agents.len();
        agents.retain(|a| a.id != id);
        before != agents.len()
    }

    pub async fn get(&self, id: &str) -> Option<Agent> {
        self.agents.read().await.iter().find(|a| a.id == id).cloned()
    }

    pub async fn contains(&self, id: &str) -> bool {
        self.agents.read().await.iter().any(|a| a.id == id)
    }

    /// Agents in registration order.
    pub async fn list(&self) -> Vec<Agent> {
        self.agents.read().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.agents.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.agents.read().await.is_empty()
    }
}

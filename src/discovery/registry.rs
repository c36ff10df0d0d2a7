//! The set of known agents.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use tracing::debug;

use crate::agent::{Agent, AgentId};

/// Source of agents consulted by discovery and the executor.
pub trait AgentRegistry: Send + Sync {
    /// All agents in registration order.
    fn list_agents(&self) -> Vec<Arc<dyn Agent>>;

    fn get_agent(&self, id: &AgentId) -> Option<Arc<dyn Agent>>;

    /// Agents declaring `capability`.
    fn agents_with_capability(&self, capability: &str) -> Vec<Arc<dyn Agent>> {
        self.list_agents()
            .into_iter()
            .filter(|a| a.provides(capability))
            .collect()
    }

    /// Monotonic counter bumped whenever the agent set changes.
    fn revision(&self) -> u64;
}

/// Registry held in memory, populated by the embedder or from config.
#[derive(Default)]
pub struct InMemoryAgentRegistry {
    agents: RwLock<Vec<Arc<dyn Agent>>>,
    revision: AtomicU64,
}

impl InMemoryAgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an agent, replacing any agent with the same id.
    pub fn register(&self, agent: Arc<dyn Agent>) {
        let mut agents = self.agents.write().unwrap_or_else(|e| e.into_inner());
        debug!(agent = %agent.id(), capabilities = agent.capabilities().len(), "registering agent");
        match agents.iter().position(|a| a.id() == agent.id()) {
            Some(pos) => agents[pos] = agent,
            None => agents.push(agent),
        }
        self.revision.fetch_add(1, Ordering::SeqCst);
    }

    /// Remove an agent. Returns false if it was not registered.
    pub fn remove(&self, id: &AgentId) -> bool {
        let mut agents = self.agents.write().unwrap_or_else(|e| e.into_inner());
        let before = agents.len();
        agents.retain(|a| a.id() != id);
        let removed = agents.len() != before;
        if removed {
            debug!(agent = %id, "removed agent");
            self.revision.fetch_add(1, Ordering::SeqCst);
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.agents.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl AgentRegistry for InMemoryAgentRegistry {
    fn list_agents(&self) -> Vec<Arc<dyn Agent>> {
        self.agents
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn get_agent(&self, id: &AgentId) -> Option<Arc<dyn Agent>> {
        self.agents
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .find(|a| a.id() == id)
            .cloned()
    }

    fn revision(&self) -> u64 {
        self.revision.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for InMemoryAgentRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let ids: Vec<AgentId> = self.list_agents().iter().map(|a| a.id().clone()).collect();
        f.debug_struct("InMemoryAgentRegistry")
            .field("agents", &ids)
            .field("revision", &self.revision())
            .finish()
    }
}

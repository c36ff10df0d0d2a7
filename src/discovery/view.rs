//! Read-only projection of the registry: capability name to providers.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::agent::{Agent, AgentId, Capability};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilityRecord {
    pub name: String,
    pub description: String,
    pub providers: BTreeSet<AgentId>,
    /// Closest capabilities above the fallback threshold, most similar first.
    pub fallbacks: Vec<String>,
}

impl CapabilityRecord {
    fn new(name: &str, description: &str) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            providers: BTreeSet::new(),
            fallbacks: Vec::new(),
        }
    }
}

/// Snapshot of every known capability and agent, tagged with the registry
/// revision it was built from.
#[derive(Debug, Clone, Default)]
pub struct CapabilityView {
    records: BTreeMap<String, CapabilityRecord>,
    agents: BTreeMap<AgentId, BTreeSet<String>>,
    revision: u64,
}

impl CapabilityView {
    /// Build from registry agents plus capabilities declared at runtime.
    pub fn build(agents: &[Arc<dyn Agent>], declared: &[Capability], revision: u64) -> Self {
        let mut view = Self {
            revision,
            ..Self::default()
        };

        for agent in agents {
            let provided = view.agents.entry(agent.id().clone()).or_default();
            for capability in agent.capabilities() {
                provided.insert(capability.name.clone());
                let record = view
                    .records
                    .entry(capability.name.clone())
                    .or_insert_with(|| CapabilityRecord::new(&capability.name, ""));
                if record.description.is_empty() {
                    record.description = capability.description.clone();
                }
                record.providers.insert(agent.id().clone());
            }
        }

        for capability in declared {
            let record = view
                .records
                .entry(capability.name.clone())
                .or_insert_with(|| CapabilityRecord::new(&capability.name, ""));
            if !capability.description.is_empty() {
                record.description = capability.description.clone();
            }
        }

        view
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn contains(&self, name: &str) -> bool {
        self.records.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<&CapabilityRecord> {
        self.records.get(name)
    }

    /// Providers of `name`, empty when unknown.
    pub fn providers(&self, name: &str) -> BTreeSet<AgentId> {
        self.records
            .get(name)
            .map(|r| r.providers.clone())
            .unwrap_or_default()
    }

    pub fn has_providers(&self, name: &str) -> bool {
        self.records
            .get(name)
            .is_some_and(|r| !r.providers.is_empty())
    }

    /// Capability names in sorted order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.records.keys().map(String::as_str)
    }

    pub fn records(&self) -> impl Iterator<Item = &CapabilityRecord> {
        self.records.values()
    }

    /// Every known agent with the capabilities it declares.
    pub fn agents(&self) -> &BTreeMap<AgentId, BTreeSet<String>> {
        &self.agents
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub(crate) fn set_fallbacks(&mut self, name: &str, fallbacks: Vec<String>) {
        if let Some(record) = self.records.get_mut(name) {
            record.fallbacks = fallbacks;
        }
    }
}

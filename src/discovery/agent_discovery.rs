//! Capability-based agent selection with similar and degraded fallback.
//!
//! `AgentDiscovery` owns the capability view, the similarity index and the
//! per-(agent, capability) metrics. Lookups rebuild the view first whenever
//! the registry revision has moved.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::agent::{AgentId, Capability};
use crate::config::DiscoveryConfig;
use crate::discovery::metrics::{
    performance_or_neutral, reliability_or_neutral, DiscoveryMetrics, ExecutionOutcome,
};
use crate::discovery::registry::AgentRegistry;
use crate::discovery::similarity::{SimilarCapability, SimilarityIndex};
use crate::discovery::view::{CapabilityRecord, CapabilityView};
use crate::Error;

/// How far discovery may stray from the requested capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum FallbackStrategy {
    /// Exact providers only.
    Strict,
    /// Fall back to similar capabilities.
    #[default]
    Similar,
    /// Similar capabilities, then best partial coverage of the required set.
    Degraded,
}

impl FallbackStrategy {
    pub fn allows_similar(&self) -> bool {
        !matches!(self, FallbackStrategy::Strict)
    }
}

impl std::fmt::Display for FallbackStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FallbackStrategy::Strict => write!(f, "strict"),
            FallbackStrategy::Similar => write!(f, "similar"),
            FallbackStrategy::Degraded => write!(f, "degraded"),
        }
    }
}

impl std::str::FromStr for FallbackStrategy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "strict" => Ok(FallbackStrategy::Strict),
            "similar" => Ok(FallbackStrategy::Similar),
            "degraded" => Ok(FallbackStrategy::Degraded),
            other => Err(Error::Validation(format!(
                "unknown fallback strategy '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FallbackType {
    Similar,
    Degraded,
}

#[derive(Debug, Clone, Default)]
pub struct DiscoveryOptions {
    pub capability: String,
    pub excluded_agent_ids: Vec<AgentId>,
    /// Returned without scoring when it provides the capability.
    pub preferred_agent_id: Option<AgentId>,
    /// Agents whose capability score gets the preferred boost.
    pub preferred_agents: Vec<AgentId>,
    /// Full requirement set, used by degraded fallback.
    pub required_capabilities: Vec<String>,
    pub fallback_strategy: FallbackStrategy,
}

impl DiscoveryOptions {
    pub fn new(capability: &str) -> Self {
        Self {
            capability: capability.to_string(),
            ..Default::default()
        }
    }

    pub fn exclude(mut self, agent_id: impl Into<AgentId>) -> Self {
        self.excluded_agent_ids.push(agent_id.into());
        self
    }

    pub fn prefer(mut self, agent_id: impl Into<AgentId>) -> Self {
        self.preferred_agent_id = Some(agent_id.into());
        self
    }

    pub fn boost(mut self, agent_id: impl Into<AgentId>) -> Self {
        self.preferred_agents.push(agent_id.into());
        self
    }

    pub fn require<I, S>(mut self, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.required_capabilities = capabilities.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_strategy(mut self, strategy: FallbackStrategy) -> Self {
        self.fallback_strategy = strategy;
        self
    }

    fn is_excluded(&self, agent_id: &AgentId) -> bool {
        self.excluded_agent_ids.contains(agent_id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredAgent {
    pub agent_id: AgentId,
    pub score: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FallbackDetails {
    pub fallback_type: FallbackType,
    pub original_capability: String,
    pub used_capability: String,
    /// Similarity for `similar`, coverage fraction for `degraded`.
    pub score: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryResult {
    pub agent_id: AgentId,
    /// Capability the agent was selected for.
    pub capability: String,
    pub score: f64,
    pub metrics: Option<DiscoveryMetrics>,
    pub alternatives: Vec<ScoredAgent>,
    pub fallback: Option<FallbackDetails>,
}

/// A capability asked for but not provided by any agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilityRequest {
    pub name: String,
    pub description: String,
    pub request_count: u32,
    pub first_requested: DateTime<Utc>,
    pub last_requested: DateTime<Utc>,
}

#[derive(Default)]
struct DiscoveryState {
    view: CapabilityView,
    index: SimilarityIndex,
    declared: Vec<Capability>,
    requests: BTreeMap<String, CapabilityRequest>,
    metrics: HashMap<(AgentId, String), DiscoveryMetrics>,
    built: bool,
}

pub struct AgentDiscovery {
    registry: Arc<dyn AgentRegistry>,
    config: DiscoveryConfig,
    state: RwLock<DiscoveryState>,
}

impl AgentDiscovery {
    pub fn new(registry: Arc<dyn AgentRegistry>, config: DiscoveryConfig) -> Self {
        Self {
            registry,
            config,
            state: RwLock::new(DiscoveryState::default()),
        }
    }

    pub fn registry(&self) -> &Arc<dyn AgentRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &DiscoveryConfig {
        &self.config
    }

    // ========== View maintenance ==========

    fn rebuild(&self, state: &mut DiscoveryState) {
        // Revision before listing, so a racing change is never tagged as seen.
        let revision = self.registry.revision();
        let agents = self.registry.list_agents();
        let mut view = CapabilityView::build(&agents, &state.declared, revision);
        let index = SimilarityIndex::build(
            &mut view,
            self.config.similarity_threshold,
            self.config.fallback_threshold,
        );
        debug!(
            capabilities = view.len(),
            agents = view.agents().len(),
            revision = view.revision(),
            "rebuilt capability view"
        );
        state.view = view;
        state.index = index;
        state.built = true;
    }

    /// Rebuild the view and similarity index from the registry.
    pub async fn refresh(&self) {
        let mut state = self.state.write().await;
        self.rebuild(&mut state);
    }

    async fn ensure_fresh(&self) {
        let stale = {
            let state = self.state.read().await;
            !state.built || state.view.revision() != self.registry.revision()
        };
        if stale {
            let mut state = self.state.write().await;
            if !state.built || state.view.revision() != self.registry.revision() {
                self.rebuild(&mut state);
            }
        }
    }

    // ========== Discovery ==========

    /// Pick an agent for `options.capability`.
    ///
    /// `None` is a discovery miss, not an error.
    pub async fn discover_agent(&self, options: &DiscoveryOptions) -> Option<DiscoveryResult> {
        self.ensure_fresh().await;
        let state = self.state.read().await;
        let result = self.discover_in(&state, options);
        match &result {
            Some(r) => debug!(
                capability = %options.capability,
                agent = %r.agent_id,
                score = r.score,
                fallback = ?r.fallback.as_ref().map(|f| f.fallback_type),
                "discovered agent"
            ),
            None => debug!(
                capability = %options.capability,
                strategy = %options.fallback_strategy,
                "no agent available"
            ),
        }
        result
    }

    fn discover_in(
        &self,
        state: &DiscoveryState,
        options: &DiscoveryOptions,
    ) -> Option<DiscoveryResult> {
        let strategy = options.fallback_strategy;
        let known = state.view.contains(&options.capability);

        if known || !strategy.allows_similar() {
            if let Some(result) = self.find_exact(state, &options.capability, options) {
                return Some(result);
            }
        }
        if !strategy.allows_similar() {
            return None;
        }
        if let Some(result) = self.similar_fallback(state, options) {
            return Some(result);
        }
        if strategy == FallbackStrategy::Degraded {
            return self.degraded_fallback(state, options);
        }
        None
    }

    fn score_agent(
        &self,
        state: &DiscoveryState,
        agent_id: &AgentId,
        capability: &str,
        options: &DiscoveryOptions,
    ) -> f64 {
        let metrics = state.metrics.get(&(agent_id.clone(), capability.to_string()));
        let mut capability_score = 1.0;
        if options.preferred_agents.contains(agent_id) {
            capability_score += self.config.preferred_boost;
        }
        capability_score * self.config.capability_weight
            + performance_or_neutral(metrics, self.config.latency_baseline_ms)
                * self.config.performance_weight
            + reliability_or_neutral(metrics) * self.config.reliability_weight
    }

    fn find_exact(
        &self,
        state: &DiscoveryState,
        capability: &str,
        options: &DiscoveryOptions,
    ) -> Option<DiscoveryResult> {
        let candidates: Vec<AgentId> = state
            .view
            .providers(capability)
            .into_iter()
            .filter(|id| !options.is_excluded(id))
            .collect();
        if candidates.is_empty() {
            return None;
        }

        let stored = |id: &AgentId| {
            state
                .metrics
                .get(&(id.clone(), capability.to_string()))
                .cloned()
        };

        if let Some(preferred) = &options.preferred_agent_id {
            if candidates.contains(preferred) {
                return Some(DiscoveryResult {
                    agent_id: preferred.clone(),
                    capability: capability.to_string(),
                    score: 1.0,
                    metrics: stored(preferred),
                    alternatives: Vec::new(),
                    fallback: None,
                });
            }
        }

        let mut ranked: Vec<ScoredAgent> = candidates
            .into_iter()
            .map(|agent_id| ScoredAgent {
                score: self.score_agent(state, &agent_id, capability, options),
                agent_id,
            })
            .collect();
        ranked.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| a.agent_id.cmp(&b.agent_id))
        });

        let mut ranked = ranked.into_iter();
        let best = ranked.next()?;
        Some(DiscoveryResult {
            metrics: stored(&best.agent_id),
            agent_id: best.agent_id,
            capability: capability.to_string(),
            score: best.score,
            alternatives: ranked.take(self.config.max_alternatives).collect(),
            fallback: None,
        })
    }

    fn similar_fallback(
        &self,
        state: &DiscoveryState,
        options: &DiscoveryOptions,
    ) -> Option<DiscoveryResult> {
        let strict = DiscoveryOptions {
            fallback_strategy: FallbackStrategy::Strict,
            ..options.clone()
        };
        for similar in state.index.rank(&state.view, &options.capability) {
            if let Some(mut result) = self.find_exact(state, &similar.name, &strict) {
                result.fallback = Some(FallbackDetails {
                    fallback_type: FallbackType::Similar,
                    original_capability: options.capability.clone(),
                    used_capability: similar.name.clone(),
                    score: similar.score,
                });
                return Some(result);
            }
        }
        None
    }

    fn degraded_fallback(
        &self,
        state: &DiscoveryState,
        options: &DiscoveryOptions,
    ) -> Option<DiscoveryResult> {
        let required = &options.required_capabilities;
        if required.is_empty() {
            return None;
        }

        let mut ranked: Vec<(AgentId, f64, String)> = state
            .view
            .agents()
            .iter()
            .filter(|(id, _)| !options.is_excluded(id))
            .filter_map(|(id, provided)| {
                let covered: Vec<&String> =
                    required.iter().filter(|c| provided.contains(*c)).collect();
                let first = covered.first()?;
                let coverage = covered.len() as f64 / required.len() as f64;
                Some((id.clone(), coverage, (*first).clone()))
            })
            .collect();
        ranked.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));

        let mut ranked = ranked.into_iter();
        let (agent_id, coverage, used) = ranked.next()?;
        Some(DiscoveryResult {
            metrics: state.metrics.get(&(agent_id.clone(), used.clone())).cloned(),
            agent_id,
            capability: used.clone(),
            score: coverage,
            alternatives: ranked
                .take(self.config.max_alternatives)
                .map(|(agent_id, score, _)| ScoredAgent { agent_id, score })
                .collect(),
            fallback: Some(FallbackDetails {
                fallback_type: FallbackType::Degraded,
                original_capability: options.capability.clone(),
                used_capability: used,
                score: coverage,
            }),
        })
    }

    // ========== Metrics ==========

    /// Smooth one execution outcome into the agent's metrics for `capability`.
    pub async fn update_metrics(
        &self,
        agent_id: &AgentId,
        capability: &str,
        outcome: ExecutionOutcome,
    ) -> DiscoveryMetrics {
        let baseline = self.config.latency_baseline_ms;
        let mut state = self.state.write().await;
        let metrics = state
            .metrics
            .entry((agent_id.clone(), capability.to_string()))
            .and_modify(|m| m.record(&outcome, baseline))
            .or_insert_with(|| DiscoveryMetrics::from_outcome(&outcome, baseline))
            .clone();
        debug!(
            agent = %agent_id,
            capability,
            success = outcome.success,
            reliability = metrics.reliability_score(),
            "updated metrics"
        );
        metrics
    }

    pub async fn metrics_for(
        &self,
        agent_id: &AgentId,
        capability: &str,
    ) -> Option<DiscoveryMetrics> {
        self.state
            .read()
            .await
            .metrics
            .get(&(agent_id.clone(), capability.to_string()))
            .cloned()
    }

    // ========== Runtime capabilities ==========

    /// Declare a capability at runtime and rebuild the index.
    pub async fn register_capability(&self, capability: Capability) {
        let mut state = self.state.write().await;
        info!(capability = %capability.name, "registering capability");
        match state.declared.iter().position(|c| c.name == capability.name) {
            Some(pos) => state.declared[pos] = capability,
            None => state.declared.push(capability),
        }
        self.rebuild(&mut state);
    }

    /// Record a capability as wanted but unavailable.
    pub async fn request_capability(&self, name: &str, description: &str) -> CapabilityRequest {
        let mut state = self.state.write().await;
        let now = Utc::now();
        let request = state
            .requests
            .entry(name.to_string())
            .and_modify(|r| {
                r.request_count += 1;
                r.last_requested = now;
                if r.description.is_empty() {
                    r.description = description.to_string();
                }
            })
            .or_insert_with(|| CapabilityRequest {
                name: name.to_string(),
                description: description.to_string(),
                request_count: 1,
                first_requested: now,
                last_requested: now,
            })
            .clone();
        info!(capability = name, count = request.request_count, "capability requested");
        self.rebuild(&mut state);
        request
    }

    /// Requested capabilities that still have no provider.
    pub async fn requested_capabilities(&self) -> Vec<CapabilityRequest> {
        self.ensure_fresh().await;
        let state = self.state.read().await;
        state
            .requests
            .values()
            .filter(|r| !state.view.has_providers(&r.name))
            .cloned()
            .collect()
    }

    // ========== Queries ==========

    pub async fn capability(&self, name: &str) -> Option<CapabilityRecord> {
        self.ensure_fresh().await;
        self.state.read().await.view.get(name).cloned()
    }

    pub async fn capabilities(&self) -> Vec<CapabilityRecord> {
        self.ensure_fresh().await;
        self.state.read().await.view.records().cloned().collect()
    }

    pub async fn similar_capabilities(&self, name: &str) -> Vec<SimilarCapability> {
        self.ensure_fresh().await;
        let state = self.state.read().await;
        state.index.rank(&state.view, name)
    }
}

impl std::fmt::Debug for AgentDiscovery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentDiscovery")
            .field("config", &self.config)
            .field("revision", &self.registry.revision())
            .finish()
    }
}

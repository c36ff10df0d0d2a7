//! Test fixtures for integration tests.
//!
//! Provides helpers for:
//! - A table-driven decomposer
//! - In-process agents (echo, failing, concurrency-tracking)
//! - A wired planner, discovery and executor

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use conductor::agent::{AgentOutput, Capability, FnAgent};
use conductor::config::{DiscoveryConfig, ExecutorConfig, PlannerConfig};
use conductor::core::{PlanId, TaskPlan};
use conductor::discovery::{AgentDiscovery, InMemoryAgentRegistry};
use conductor::orchestration::{Decomposer, PlanOptions, SubtaskSpec, TaskExecutor, TaskPlanner};
use conductor::{Error, Result};

/// Decomposer answering from a fixed goal → subtasks table.
///
/// Goals missing from the table decompose to nothing and stay leaves.
pub struct TableDecomposer {
    answers: HashMap<String, Vec<SubtaskSpec>>,
    failing: Vec<String>,
}

impl TableDecomposer {
    pub fn new(answers: Vec<(&str, Vec<SubtaskSpec>)>) -> Self {
        Self {
            answers: answers
                .into_iter()
                .map(|(goal, specs)| (goal.to_string(), specs))
                .collect(),
            failing: Vec::new(),
        }
    }

    /// Make decomposition of `goal` fail with a parse error.
    pub fn failing_on(mut self, goal: &str) -> Self {
        self.failing.push(goal.to_string());
        self
    }
}

#[async_trait]
impl Decomposer for TableDecomposer {
    async fn decompose(&self, goal: &str, _max_subtasks: usize) -> Result<Vec<SubtaskSpec>> {
        if self.failing.iter().any(|g| g == goal) {
            return Err(Error::Decomposition("unparsable output".to_string()));
        }
        Ok(self.answers.get(goal).cloned().unwrap_or_default())
    }
}

/// Planner, discovery and executor sharing one registry.
pub struct Engine {
    pub registry: Arc<InMemoryAgentRegistry>,
    pub planner: Arc<TaskPlanner>,
    pub discovery: Arc<AgentDiscovery>,
    pub executor: TaskExecutor,
}

impl Engine {
    pub fn new(decomposer: TableDecomposer) -> Self {
        Self::with_config(decomposer, PlannerConfig::default(), ExecutorConfig::default())
    }

    pub fn with_config(
        decomposer: TableDecomposer,
        planner_config: PlannerConfig,
        executor_config: ExecutorConfig,
    ) -> Self {
        let registry = Arc::new(InMemoryAgentRegistry::new());
        let planner = Arc::new(TaskPlanner::new(Arc::new(decomposer), planner_config));
        let discovery = Arc::new(AgentDiscovery::new(
            registry.clone(),
            DiscoveryConfig::default(),
        ));
        let executor = TaskExecutor::new(planner.clone(), discovery.clone(), executor_config);
        Self {
            registry,
            planner,
            discovery,
            executor,
        }
    }

    pub async fn plan(&self, goal: &str) -> TaskPlan {
        self.planner
            .create_plan("test plan", goal, PlanOptions::default())
            .await
            .expect("plan creation should not fail")
    }

    pub async fn snapshot(&self, plan_id: &PlanId) -> TaskPlan {
        self.planner
            .get_task_plan(plan_id)
            .await
            .expect("plan should exist")
    }
}

/// Agent answering `{"task": <name>}` for each listed capability.
pub fn echo_agent(id: &str, capabilities: &[&str]) -> Arc<FnAgent> {
    Arc::new(FnAgent::new(id, named(capabilities), |input| async move {
        Ok(AgentOutput::new(json!({ "task": input.name })))
    }))
}

/// Agent that always fails and counts its invocations.
pub fn failing_agent(id: &str, capabilities: &[&str], calls: Arc<AtomicUsize>) -> Arc<FnAgent> {
    Arc::new(FnAgent::new(id, named(capabilities), move |input| {
        let calls = calls.clone();
        async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(Error::Execution(format!("{} crashed", input.name)))
        }
    }))
}

/// Tracks the number of tasks running at once and the highest value seen.
#[derive(Debug, Default)]
pub struct ConcurrencyProbe {
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

impl ConcurrencyProbe {
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

/// Agent that sleeps for `delay` while registered in `probe`.
pub fn tracking_agent(
    id: &str,
    capabilities: &[&str],
    probe: Arc<ConcurrencyProbe>,
    delay: Duration,
) -> Arc<FnAgent> {
    Arc::new(FnAgent::new(id, named(capabilities), move |input| {
        let probe = probe.clone();
        async move {
            let now = probe.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            probe.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(delay).await;
            probe.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(AgentOutput::new(json!({ "task": input.name })))
        }
    }))
}

fn named(capabilities: &[&str]) -> Vec<Capability> {
    capabilities.iter().map(|c| Capability::named(c)).collect()
}

/// A → {B, C}: B and C both depend on A.
pub fn fan_out() -> Vec<SubtaskSpec> {
    vec![
        SubtaskSpec::new("A", "first step"),
        SubtaskSpec::new("B", "second step").depends_on("A"),
        SubtaskSpec::new("C", "third step").depends_on("A"),
    ]
}

/// `n` independent subtasks named t0..tn with no dependencies.
pub fn independent(n: usize) -> Vec<SubtaskSpec> {
    (0..n)
        .map(|i| SubtaskSpec::new(&format!("t{}", i), &format!("independent step {}", i)))
        .collect()
}

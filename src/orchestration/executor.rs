//! Task executor: dispatches ready tasks to agents and drives plans to a
//! terminal state.
//!
//! `execute_plan` runs in batches. Each pass takes up to `parallel_limit`
//! ready tasks (highest priority first), routes each one through agent
//! discovery, runs the batch concurrently and records each result as it
//! arrives. The next ready set is fetched once the whole batch is done.
//! Every status change goes through the planner so parent propagation
//! stays in one place.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::stream::{FuturesUnordered, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::agent::{Agent, AgentId, TaskInput};
use crate::config::ExecutorConfig;
use crate::core::{PlanId, PlanStatus, Task, TaskId, TaskStatus};
use crate::discovery::{AgentDiscovery, DiscoveryOptions, ExecutionOutcome, FallbackStrategy};
use crate::error::{Error, Result};
use crate::orchestration::events::{EventBus, EventType, ExecutionEvent, SubscriptionId};
use crate::orchestration::planner::TaskPlanner;

/// Knobs for one `execute_plan` call.
#[derive(Debug, Clone)]
pub struct ExecuteOptions {
    /// Maximum tasks in flight at once. Values below 1 are treated as 1.
    pub parallel_limit: usize,
    /// Budget for the whole call.
    pub timeout: Option<Duration>,
    /// Extra attempts on the same agent before a task is failed.
    pub max_retries: u32,
    pub fallback_strategy: FallbackStrategy,
    pub cancel: Option<CancellationToken>,
}

impl Default for ExecuteOptions {
    fn default() -> Self {
        Self::from(&ExecutorConfig::default())
    }
}

impl From<&ExecutorConfig> for ExecuteOptions {
    fn from(config: &ExecutorConfig) -> Self {
        Self {
            parallel_limit: config.parallel_limit,
            timeout: config.timeout(),
            max_retries: config.max_retries,
            fallback_strategy: FallbackStrategy::default(),
            cancel: None,
        }
    }
}

impl ExecuteOptions {
    pub fn with_parallel_limit(mut self, limit: usize) -> Self {
        self.parallel_limit = limit;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_strategy(mut self, strategy: FallbackStrategy) -> Self {
        self.fallback_strategy = strategy;
        self
    }

    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }
}

/// Outcome of running one task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskExecutionResult {
    pub task_id: TaskId,
    pub task_name: String,
    pub agent_id: Option<AgentId>,
    pub status: TaskStatus,
    pub result: Option<Value>,
    pub error: Option<String>,
    /// Agent invocations made, 0 when no agent could be found.
    pub attempts: u32,
    pub execution_time_ms: u64,
}

/// Summary of an `execute_plan` call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionReport {
    pub plan_id: PlanId,
    pub status: PlanStatus,
    /// Dispatched tasks in completion order.
    pub results: Vec<TaskExecutionResult>,
    pub timed_out: bool,
    pub cancelled: bool,
    pub elapsed_ms: u64,
}

impl ExecutionReport {
    pub fn completed_count(&self) -> usize {
        self.count(TaskStatus::Completed)
    }

    pub fn failed_count(&self) -> usize {
        self.count(TaskStatus::Failed)
    }

    fn count(&self, status: TaskStatus) -> usize {
        self.results.iter().filter(|r| r.status == status).count()
    }
}

/// Why a batch stopped before every task in it finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Interrupt {
    TimedOut,
    Cancelled,
}

/// A task ready to run, or the failure recorded while routing it.
enum Dispatch {
    Run {
        task: Task,
        agent: Arc<dyn Agent>,
        capability: String,
    },
    Rejected(TaskExecutionResult),
}

pub struct TaskExecutor {
    planner: Arc<TaskPlanner>,
    discovery: Arc<AgentDiscovery>,
    config: ExecutorConfig,
    events: EventBus,
}

impl TaskExecutor {
    pub fn new(
        planner: Arc<TaskPlanner>,
        discovery: Arc<AgentDiscovery>,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            planner,
            discovery,
            config,
            events: EventBus::new(),
        }
    }

    pub fn planner(&self) -> &Arc<TaskPlanner> {
        &self.planner
    }

    pub fn discovery(&self) -> &Arc<AgentDiscovery> {
        &self.discovery
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    pub fn default_options(&self) -> ExecuteOptions {
        ExecuteOptions::from(&self.config)
    }

    // ========== Events ==========

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn subscribe<F>(&self, handler: F, event_types: Option<Vec<EventType>>) -> SubscriptionId
    where
        F: Fn(&ExecutionEvent) + Send + Sync + 'static,
    {
        self.events.subscribe(handler, event_types)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.events.unsubscribe(id)
    }

    // ========== Single task ==========

    /// Run one task on the agent it is already assigned to.
    ///
    /// Missing tasks, composite tasks and assignment problems are returned
    /// as errors without touching the task. Agent failures are not errors: they are recorded
    /// on the task and reported in the result.
    pub async fn execute_task_directly(
        &self,
        plan_id: &PlanId,
        task_id: &TaskId,
    ) -> Result<TaskExecutionResult> {
        let task = self.planner.get_task(plan_id, task_id).await?;
        if task.status.is_terminal() {
            return Err(Error::InvalidTransition {
                from: task.status,
                to: TaskStatus::InProgress,
            });
        }
        if !self.planner.is_leaf(plan_id, task_id).await? {
            return Err(Error::Validation(format!(
                "task '{}' has subtasks and cannot be run directly",
                task.name
            )));
        }
        let agent_id = task
            .assigned_to
            .clone()
            .ok_or(Error::TaskNotAssigned(task.id))?;
        let agent = self
            .discovery
            .registry()
            .get_agent(&agent_id)
            .ok_or(Error::UnknownAssignedAgent {
                task_id: task.id,
                agent_id,
            })?;
        let capability = self.routing_capability(&task);
        self.run_task(plan_id, &task, agent, &capability, self.config.max_retries)
            .await
    }

    // ========== Plans ==========

    /// Drive a plan until nothing is left to dispatch.
    ///
    /// On timeout or cancellation the unfinished part of the in-flight batch
    /// is dropped; those tasks stay `in_progress` and the report is flagged
    /// accordingly. Tasks of that batch that already finished are reported. A task
    /// pre-assigned to an agent the registry does not know is returned as
    /// an error.
    pub async fn execute_plan(
        &self,
        plan_id: &PlanId,
        options: ExecuteOptions,
    ) -> Result<ExecutionReport> {
        let started = Instant::now();
        self.planner.get_task_plan(plan_id).await?;

        let parallel_limit = options.parallel_limit.max(1);
        let deadline = options.timeout.map(|t| tokio::time::Instant::now() + t);
        let cancel = options.cancel.clone().unwrap_or_default();
        info!(
            plan = %plan_id,
            parallel_limit,
            timeout = ?options.timeout,
            max_retries = options.max_retries,
            "executing plan"
        );

        let mut results = Vec::new();
        let mut timed_out = false;
        let mut cancelled = false;

        self.planner.fail_blocked_tasks(plan_id).await?;
        loop {
            if cancel.is_cancelled() {
                cancelled = true;
                break;
            }
            if deadline.is_some_and(|d| tokio::time::Instant::now() >= d) {
                timed_out = true;
                break;
            }

            let ready = self.planner.get_ready_tasks(plan_id).await?;
            if ready.is_empty() {
                break;
            }

            let mut runs = Vec::new();
            for task in ready.into_iter().take(parallel_limit) {
                match self.dispatch(plan_id, task, &options).await? {
                    Dispatch::Run {
                        task,
                        agent,
                        capability,
                    } => runs.push((task, agent, capability)),
                    Dispatch::Rejected(result) => results.push(result),
                }
            }
            debug!(plan = %plan_id, batch = runs.len(), "dispatching batch");

            let mut batch: FuturesUnordered<_> = runs
                .iter()
                .map(|(task, agent, capability)| {
                    self.run_task(plan_id, task, agent.clone(), capability, options.max_retries)
                })
                .collect();
            let mut interrupt = None;
            loop {
                let next = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        interrupt = Some(Interrupt::Cancelled);
                        break;
                    }
                    _ = wait_until(deadline) => {
                        interrupt = Some(Interrupt::TimedOut);
                        break;
                    }
                    next = batch.next() => next,
                };
                match next {
                    Some(result) => results.push(result?),
                    None => break,
                }
            }
            let in_flight = batch.len();
            drop(batch);

            match interrupt {
                Some(Interrupt::TimedOut) => {
                    warn!(plan = %plan_id, in_flight, "plan timed out");
                    timed_out = true;
                    break;
                }
                Some(Interrupt::Cancelled) => {
                    warn!(plan = %plan_id, in_flight, "plan cancelled");
                    cancelled = true;
                    break;
                }
                None => {}
            }

            self.planner.fail_blocked_tasks(plan_id).await?;
        }

        let status = self.planner.get_task_plan(plan_id).await?.status;
        let report = ExecutionReport {
            plan_id: *plan_id,
            status,
            results,
            timed_out,
            cancelled,
            elapsed_ms: started.elapsed().as_millis() as u64,
        };
        info!(
            plan = %plan_id,
            status = %report.status,
            completed = report.completed_count(),
            failed = report.failed_count(),
            timed_out,
            cancelled,
            elapsed_ms = report.elapsed_ms,
            "plan execution finished"
        );
        Ok(report)
    }

    /// Resolve the agent for a ready task, assigning one through discovery
    /// when needed. A discovery miss is recorded on the task; an assignment
    /// to an unknown agent aborts the run.
    async fn dispatch(
        &self,
        plan_id: &PlanId,
        task: Task,
        options: &ExecuteOptions,
    ) -> Result<Dispatch> {
        let capability = self.routing_capability(&task);

        if let Some(agent_id) = task.assigned_to.clone() {
            let agent = self
                .discovery
                .registry()
                .get_agent(&agent_id)
                .ok_or(Error::UnknownAssignedAgent {
                    task_id: task.id,
                    agent_id,
                })?;
            return Ok(Dispatch::Run {
                task,
                agent,
                capability,
            });
        }

        let request = DiscoveryOptions::new(&capability)
            .require(task.required_capabilities.iter().cloned())
            .with_strategy(options.fallback_strategy);
        let discovered = self.discovery.discover_agent(&request).await;
        let agent = discovered.as_ref().and_then(|found| {
            self.discovery
                .registry()
                .get_agent(&found.agent_id)
                .map(|agent| (agent, found.capability.clone()))
        });

        match agent {
            Some((agent, routed)) => {
                if routed != capability {
                    info!(
                        task = %task.name,
                        requested = %capability,
                        used = %routed,
                        agent = %agent.id(),
                        "routing task through fallback capability"
                    );
                }
                self.planner
                    .assign_task(plan_id, &task.id, agent.id().clone())
                    .await?;
                Ok(Dispatch::Run {
                    task,
                    agent,
                    capability: routed,
                })
            }
            None => {
                self.discovery
                    .request_capability(&capability, &task.description)
                    .await;
                let reason = format!("no agent available for capability '{}'", capability);
                Ok(Dispatch::Rejected(self.reject(plan_id, &task, reason).await?))
            }
        }
    }

    /// Fail a task that never reached an agent.
    async fn reject(
        &self,
        plan_id: &PlanId,
        task: &Task,
        reason: String,
    ) -> Result<TaskExecutionResult> {
        warn!(plan = %plan_id, task = %task.name, reason = %reason, "task rejected");
        self.planner
            .update_task_status(plan_id, &task.id, TaskStatus::Failed, None, Some(reason.clone()))
            .await?;
        self.events.publish(&ExecutionEvent::failed(
            *plan_id,
            task.id,
            json!({ "name": task.name, "error": reason }),
        ));
        Ok(TaskExecutionResult {
            task_id: task.id,
            task_name: task.name.clone(),
            agent_id: None,
            status: TaskStatus::Failed,
            result: None,
            error: Some(reason),
            attempts: 0,
            execution_time_ms: 0,
        })
    }

    /// Run a task on `agent`, retrying on failure, and record the outcome.
    async fn run_task(
        &self,
        plan_id: &PlanId,
        task: &Task,
        agent: Arc<dyn Agent>,
        capability: &str,
        max_retries: u32,
    ) -> Result<TaskExecutionResult> {
        let started = Instant::now();
        let agent_id = agent.id().clone();

        self.events.publish(&ExecutionEvent::started(
            *plan_id,
            task.id,
            json!({ "name": task.name, "agent_id": agent_id, "capability": capability }),
        ));
        if task.status == TaskStatus::Pending {
            self.planner
                .update_task_status(plan_id, &task.id, TaskStatus::InProgress, None, None)
                .await?;
        }

        let input = TaskInput {
            plan_id: *plan_id,
            task_id: task.id,
            name: task.name.clone(),
            description: task.description.clone(),
            capability: capability.to_string(),
            required_capabilities: task.required_capabilities.clone(),
            context: self.planner.dependency_context(plan_id, &task.id).await?,
        };

        let mut attempts = 0;
        let outcome = loop {
            attempts += 1;
            let attempt_started = Instant::now();
            let result = agent.execute(&input).await;
            let elapsed_ms = attempt_started.elapsed().as_secs_f64() * 1000.0;
            let recorded = match &result {
                Ok(_) => ExecutionOutcome::success(elapsed_ms),
                Err(_) => ExecutionOutcome::failure(elapsed_ms),
            };
            self.discovery
                .update_metrics(&agent_id, capability, recorded)
                .await;

            match result {
                Err(e) if attempts <= max_retries => {
                    warn!(
                        task = %task.name,
                        agent = %agent_id,
                        attempt = attempts,
                        error = %e,
                        "task attempt failed, retrying"
                    );
                }
                other => break other,
            }
        };
        let execution_time_ms = started.elapsed().as_millis() as u64;

        match outcome {
            Ok(output) => {
                self.finish(plan_id, task, TaskStatus::Completed, Some(output.output.clone()), None)
                    .await?;
                self.events.publish(&ExecutionEvent::completed(
                    *plan_id,
                    task.id,
                    json!({
                        "name": task.name,
                        "agent_id": agent_id,
                        "result": output.output,
                        "execution_time_ms": execution_time_ms,
                    }),
                ));
                debug!(task = %task.name, agent = %agent_id, attempts, "task completed");
                Ok(TaskExecutionResult {
                    task_id: task.id,
                    task_name: task.name.clone(),
                    agent_id: Some(agent_id),
                    status: TaskStatus::Completed,
                    result: Some(output.output),
                    error: None,
                    attempts,
                    execution_time_ms,
                })
            }
            Err(e) => {
                let reason = e.to_string();
                self.finish(plan_id, task, TaskStatus::Failed, None, Some(reason.clone()))
                    .await?;
                self.events.publish(&ExecutionEvent::failed(
                    *plan_id,
                    task.id,
                    json!({
                        "name": task.name,
                        "agent_id": agent_id,
                        "error": reason,
                        "execution_time_ms": execution_time_ms,
                    }),
                ));
                warn!(
                    task = %task.name,
                    agent = %agent_id,
                    attempts,
                    error = %reason,
                    "task failed"
                );
                Ok(TaskExecutionResult {
                    task_id: task.id,
                    task_name: task.name.clone(),
                    agent_id: Some(agent_id),
                    status: TaskStatus::Failed,
                    result: None,
                    error: Some(reason),
                    attempts,
                    execution_time_ms,
                })
            }
        }
    }

    async fn finish(
        &self,
        plan_id: &PlanId,
        task: &Task,
        status: TaskStatus,
        result: Option<Value>,
        reason: Option<String>,
    ) -> Result<()> {
        let applied = self
            .planner
            .update_task_status(plan_id, &task.id, status, result, reason)
            .await?;
        if !applied {
            warn!(task = %task.name, status = %status, "task status change was not applied");
        }
        Ok(())
    }

    /// The capability a task is routed on: its first requirement, or the
    /// planner's default.
    fn routing_capability(&self, task: &Task) -> String {
        task.required_capabilities
            .first()
            .cloned()
            .unwrap_or_else(|| self.planner.config().default_capability.clone())
    }
}

impl std::fmt::Debug for TaskExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskExecutor")
            .field("config", &self.config)
            .field("events", &self.events)
            .finish()
    }
}

async fn wait_until(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

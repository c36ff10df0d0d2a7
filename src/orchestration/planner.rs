//! Task planner: turns a goal into a plan graph and owns every plan.
//!
//! Decomposition is breadth-first. Each task popped from the queue is sent to
//! the [`Decomposer`]; its subtasks become children wired by name to their
//! siblings, and are queued in turn until `max_depth` is reached. A failed or
//! trivial decomposition leaves the task as a leaf.
//!
//! All status changes go through [`TaskPlanner::update_task_status`], which
//! is the only place parent propagation happens.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::agent::AgentId;
use crate::config::PlannerConfig;
use crate::core::{PlanId, Task, TaskGraph, TaskId, TaskPlan, TaskStatus};
use crate::error::{Error, Result};
use crate::orchestration::decomposer::{Decomposer, SubtaskSpec};

/// Limits for one `create_plan` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlanOptions {
    /// Decomposition levels below the root. 0 keeps the goal as one task.
    pub max_depth: usize,
    pub max_subtasks: usize,
}

impl Default for PlanOptions {
    fn default() -> Self {
        Self::from(&PlannerConfig::default())
    }
}

impl From<&PlannerConfig> for PlanOptions {
    fn from(config: &PlannerConfig) -> Self {
        Self {
            max_depth: config.max_depth,
            max_subtasks: config.max_subtasks,
        }
    }
}

struct PlanEntry {
    name: String,
    description: String,
    graph: TaskGraph,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl PlanEntry {
    fn snapshot(&self, id: PlanId) -> TaskPlan {
        TaskPlan::snapshot(
            id,
            &self.name,
            &self.description,
            &self.graph,
            self.created_at,
            self.updated_at,
        )
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

pub struct TaskPlanner {
    decomposer: Arc<dyn Decomposer>,
    config: PlannerConfig,
    plans: RwLock<HashMap<PlanId, PlanEntry>>,
}

impl TaskPlanner {
    pub fn new(decomposer: Arc<dyn Decomposer>, config: PlannerConfig) -> Self {
        Self {
            decomposer,
            config,
            plans: RwLock::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &PlannerConfig {
        &self.config
    }

    /// Options derived from the planner config.
    pub fn default_options(&self) -> PlanOptions {
        PlanOptions::from(&self.config)
    }

    // ========== Plan creation ==========

    /// Decompose `description` into a new plan.
    ///
    /// Decomposer failures never fail plan creation; the affected task is
    /// kept as a leaf.
    pub async fn create_plan(
        &self,
        name: &str,
        description: &str,
        options: PlanOptions,
    ) -> Result<TaskPlan> {
        let mut graph = TaskGraph::new();
        let root = Task::new(name, description);
        let root_id = root.id;
        graph.add_task(root);

        let mut queue: VecDeque<(TaskId, usize)> = VecDeque::from([(root_id, 0)]);
        while let Some((task_id, depth)) = queue.pop_front() {
            if depth >= options.max_depth || options.max_subtasks < 2 {
                continue;
            }
            let Some(task) = graph.get_task(&task_id) else {
                continue;
            };
            let goal = task.description.clone();

            let mut subtasks = match self.decomposer.decompose(&goal, options.max_subtasks).await {
                Ok(subtasks) => subtasks,
                Err(e) => {
                    warn!(
                        task = %task_id,
                        error = %e,
                        "decomposition failed, keeping task as leaf"
                    );
                    continue;
                }
            };
            if subtasks.len() > options.max_subtasks {
                debug!(task = %task_id, count = subtasks.len(), "truncating subtasks");
                subtasks.truncate(options.max_subtasks);
            }
            if subtasks.len() < 2 {
                debug!(
                    task = %task_id,
                    count = subtasks.len(),
                    "nothing to split, keeping task as leaf"
                );
                continue;
            }

            for child in Self::add_subtasks(&mut graph, task_id, &subtasks) {
                queue.push_back((child, depth + 1));
            }
        }

        self.assign_default_capabilities(&mut graph);

        let id = PlanId::new();
        let now = Utc::now();
        let entry = PlanEntry {
            name: name.to_string(),
            description: description.to_string(),
            graph,
            created_at: now,
            updated_at: now,
        };
        let plan = entry.snapshot(id);
        info!(
            plan = %id,
            tasks = plan.tasks.len(),
            depth = plan.depth(),
            "created plan"
        );
        self.plans.write().await.insert(id, entry);
        Ok(plan)
    }

    /// Add one decomposition batch under `parent` and wire sibling
    /// dependencies by name. Returns the new task ids.
    fn add_subtasks(
        graph: &mut TaskGraph,
        parent: TaskId,
        subtasks: &[SubtaskSpec],
    ) -> Vec<TaskId> {
        let mut by_name: HashMap<&str, TaskId> = HashMap::new();
        let mut ids = Vec::with_capacity(subtasks.len());

        for spec in subtasks {
            let description = if spec.description.trim().is_empty() {
                spec.name.as_str()
            } else {
                spec.description.as_str()
            };
            let task = Task::new(&spec.name, description)
                .with_priority(spec.priority)
                .with_capabilities(spec.required_capabilities.iter().cloned())
                .with_parent(parent);
            let id = task.id;
            graph.add_task(task);
            if by_name.insert(spec.name.as_str(), id).is_some() {
                warn!(
                    name = %spec.name,
                    "duplicate subtask name, dependencies resolve to the last one"
                );
            }
            ids.push(id);
        }

        for (spec, id) in subtasks.iter().zip(&ids) {
            for dependency in &spec.dependencies {
                let Some(dep_id) = by_name.get(dependency.as_str()) else {
                    warn!(
                        task = %spec.name,
                        dependency = %dependency,
                        "dropping unknown dependency"
                    );
                    continue;
                };
                if let Err(e) = graph.add_dependency(dep_id, id) {
                    warn!(
                        task = %spec.name,
                        dependency = %dependency,
                        error = %e,
                        "dropping invalid dependency"
                    );
                }
            }
        }
        ids
    }

    fn assign_default_capabilities(&self, graph: &mut TaskGraph) {
        let bare: Vec<TaskId> = graph
            .all_tasks()
            .into_iter()
            .filter(|t| t.required_capabilities.is_empty() && graph.is_leaf(&t.id))
            .map(|t| t.id)
            .collect();
        for id in bare {
            if let Some(task) = graph.get_task_mut(&id) {
                task.required_capabilities = vec![self.config.default_capability.clone()];
            }
        }
    }

    // ========== Queries ==========

    pub async fn get_task_plan(&self, plan_id: &PlanId) -> Result<TaskPlan> {
        let plans = self.plans.read().await;
        plans
            .get(plan_id)
            .map(|entry| entry.snapshot(*plan_id))
            .ok_or(Error::PlanNotFound(*plan_id))
    }

    /// All plans, oldest first.
    pub async fn list_plans(&self) -> Vec<TaskPlan> {
        let plans = self.plans.read().await;
        let mut list: Vec<TaskPlan> = plans.iter().map(|(id, e)| e.snapshot(*id)).collect();
        list.sort_by_key(|p| p.created_at);
        list
    }

    pub async fn get_task(&self, plan_id: &PlanId, task_id: &TaskId) -> Result<Task> {
        let plans = self.plans.read().await;
        let entry = plans.get(plan_id).ok_or(Error::PlanNotFound(*plan_id))?;
        entry
            .graph
            .get_task(task_id)
            .cloned()
            .ok_or(Error::TaskNotFound {
                plan_id: *plan_id,
                task_id: *task_id,
            })
    }

    /// Whether a task has no subtasks and can be handed to an agent.
    pub async fn is_leaf(&self, plan_id: &PlanId, task_id: &TaskId) -> Result<bool> {
        let plans = self.plans.read().await;
        let entry = plans.get(plan_id).ok_or(Error::PlanNotFound(*plan_id))?;
        if !entry.graph.contains_task(task_id) {
            return Err(Error::TaskNotFound {
                plan_id: *plan_id,
                task_id: *task_id,
            });
        }
        Ok(entry.graph.is_leaf(task_id))
    }

    /// Pending leaves whose dependencies are all completed, highest
    /// priority first.
    pub async fn get_ready_tasks(&self, plan_id: &PlanId) -> Result<Vec<Task>> {
        let plans = self.plans.read().await;
        let entry = plans.get(plan_id).ok_or(Error::PlanNotFound(*plan_id))?;
        Ok(entry.graph.ready_tasks().into_iter().cloned().collect())
    }

    /// Results of the task's completed dependencies, keyed by task name.
    pub async fn dependency_context(
        &self,
        plan_id: &PlanId,
        task_id: &TaskId,
    ) -> Result<Map<String, Value>> {
        let plans = self.plans.read().await;
        let entry = plans.get(plan_id).ok_or(Error::PlanNotFound(*plan_id))?;
        if !entry.graph.contains_task(task_id) {
            return Err(Error::TaskNotFound {
                plan_id: *plan_id,
                task_id: *task_id,
            });
        }
        Ok(entry
            .graph
            .gating_dependencies(task_id)
            .into_iter()
            .filter(|dep| dep.status == TaskStatus::Completed)
            .map(|dep| (dep.name.clone(), dep.result.clone().unwrap_or(Value::Null)))
            .collect())
    }

    // ========== Mutations ==========

    /// Apply a status change and propagate it to parent tasks.
    ///
    /// Returns `Ok(false)` when the change is not applied, e.g. the task is
    /// already terminal.
    pub async fn update_task_status(
        &self,
        plan_id: &PlanId,
        task_id: &TaskId,
        status: TaskStatus,
        result: Option<Value>,
        failure_reason: Option<String>,
    ) -> Result<bool> {
        let mut plans = self.plans.write().await;
        let entry = plans.get_mut(plan_id).ok_or(Error::PlanNotFound(*plan_id))?;
        if !entry.graph.contains_task(task_id) {
            return Err(Error::TaskNotFound {
                plan_id: *plan_id,
                task_id: *task_id,
            });
        }
        let applied = entry
            .graph
            .update_status(task_id, status, result, failure_reason)?;
        if applied {
            entry.touch();
            debug!(plan = %plan_id, task = %task_id, status = %status, "task status updated");
        }
        Ok(applied)
    }

    /// Record the agent chosen for a task. Only allowed before it starts.
    pub async fn assign_task(
        &self,
        plan_id: &PlanId,
        task_id: &TaskId,
        agent_id: AgentId,
    ) -> Result<()> {
        let mut plans = self.plans.write().await;
        let entry = plans.get_mut(plan_id).ok_or(Error::PlanNotFound(*plan_id))?;
        let task = entry
            .graph
            .get_task_mut(task_id)
            .ok_or(Error::TaskNotFound {
                plan_id: *plan_id,
                task_id: *task_id,
            })?;
        if task.status != TaskStatus::Pending {
            return Err(Error::InvalidTransition {
                from: task.status,
                to: TaskStatus::InProgress,
            });
        }
        task.assign(agent_id);
        entry.touch();
        Ok(())
    }

    /// Fail every pending task that a failed dependency makes unreachable.
    ///
    /// Repeats until no blocked task remains, so failures cascade down
    /// dependency chains. Returns the ids that were failed.
    pub async fn fail_blocked_tasks(&self, plan_id: &PlanId) -> Result<Vec<TaskId>> {
        let mut plans = self.plans.write().await;
        let entry = plans.get_mut(plan_id).ok_or(Error::PlanNotFound(*plan_id))?;
        let mut failed = Vec::new();
        loop {
            let blocked = entry.graph.blocked_tasks();
            if blocked.is_empty() {
                break;
            }
            for (task_id, dependency) in blocked {
                let reason = format!("dependency '{}' failed", dependency);
                if entry
                    .graph
                    .update_status(&task_id, TaskStatus::Failed, None, Some(reason))?
                {
                    failed.push(task_id);
                }
            }
        }
        if !failed.is_empty() {
            entry.touch();
            info!(plan = %plan_id, count = failed.len(), "failed blocked tasks");
        }
        Ok(failed)
    }

    /// Remove a plan. Returns false if it did not exist.
    pub async fn delete_task_plan(&self, plan_id: &PlanId) -> bool {
        let removed = self.plans.write().await.remove(plan_id).is_some();
        if removed {
            info!(plan = %plan_id, "deleted plan");
        }
        removed
    }
}

impl std::fmt::Debug for TaskPlanner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskPlanner")
            .field("config", &self.config)
            .finish()
    }
}

//! Task graph for dependency management and status propagation.
//!
//! The graph is an arena of tasks backed by a petgraph `DiGraph`. Nodes are
//! tasks; an edge `a -> b` means `b` depends on `a`. Ownership (parent and
//! child) is tracked separately and is what drives status propagation.

use crate::core::plan::PlanStatus;
use crate::core::task::{Task, TaskId, TaskStatus};
use crate::error::{Error, Result};
use petgraph::algo::{has_path_connecting, is_cyclic_directed, toposort};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use serde_json::{Map, Value};
use std::collections::HashMap;
use tracing::{debug, warn};

/// The dependency graph of one plan.
pub struct TaskGraph {
    /// The underlying directed graph.
    graph: DiGraph<Task, ()>,
    /// Index mapping from TaskId to NodeIndex for fast lookups.
    task_index: HashMap<TaskId, NodeIndex>,
    /// Owned children per parent, in insertion order.
    children: HashMap<TaskId, Vec<TaskId>>,
}

impl TaskGraph {
    /// Create a new empty TaskGraph.
    pub fn new() -> Self {
        Self {
            graph: DiGraph::new(),
            task_index: HashMap::new(),
            children: HashMap::new(),
        }
    }

    /// Add a task to the graph.
    ///
    /// If the task already exists (same TaskId), returns the existing
    /// NodeIndex. Dependencies declared on the incoming task are wired
    /// through [`TaskGraph::add_dependency`]; any that are invalid are
    /// dropped with a warning.
    pub fn add_task(&mut self, mut task: Task) -> NodeIndex {
        if let Some(&index) = self.task_index.get(&task.id) {
            return index;
        }

        let id = task.id;
        let declared = std::mem::take(&mut task.dependencies);
        if let Some(parent) = task.parent_task_id {
            self.children.entry(parent).or_default().push(id);
        }

        let index = self.graph.add_node(task);
        self.task_index.insert(id, index);

        for dependency in declared {
            if let Err(e) = self.add_dependency(&dependency, &id) {
                warn!(
                    task = %id,
                    dependency = %dependency,
                    error = %e,
                    "dropping invalid dependency"
                );
            }
        }
        index
    }

    /// Record that `dependent` cannot start until `dependency` completes.
    ///
    /// # Errors
    /// Returns a validation error if:
    /// - Either task is not found in the graph
    /// - The edge would create a cycle (including a self edge)
    /// - `dependency` is an ancestor of `dependent`, or one of its owned descendants
    pub fn add_dependency(&mut self, dependency: &TaskId, dependent: &TaskId) -> Result<()> {
        let from_index = *self
            .task_index
            .get(dependency)
            .ok_or_else(|| Error::Validation(format!("Task {} not found in graph", dependency)))?;
        let to_index = *self
            .task_index
            .get(dependent)
            .ok_or_else(|| Error::Validation(format!("Task {} not found in graph", dependent)))?;

        if self.graph.find_edge(from_index, to_index).is_some() {
            return Ok(());
        }

        if from_index == to_index || has_path_connecting(&self.graph, to_index, from_index, None) {
            return Err(Error::Validation(format!(
                "Adding dependency from {} to {} would create a cycle",
                dependency, dependent
            )));
        }

        if self.ancestors(dependent).contains(dependency) {
            return Err(Error::Validation(format!(
                "Task {} cannot depend on its ancestor {}",
                dependent, dependency
            )));
        }

        if self.ancestors(dependency).contains(dependent) {
            return Err(Error::Validation(format!(
                "Task {} cannot depend on its own descendant {}",
                dependent, dependency
            )));
        }

        self.graph.add_edge(from_index, to_index, ());
        if let Some(task) = self.graph.node_weight_mut(to_index) {
            task.dependencies.push(*dependency);
        }
        Ok(())
    }

    /// Get a reference to a task by its ID.
    pub fn get_task(&self, id: &TaskId) -> Option<&Task> {
        self.task_index
            .get(id)
            .and_then(|&index| self.graph.node_weight(index))
    }

    /// Get a mutable reference to a task by its ID.
    pub fn get_task_mut(&mut self, id: &TaskId) -> Option<&mut Task> {
        let index = *self.task_index.get(id)?;
        self.graph.node_weight_mut(index)
    }

    pub fn contains_task(&self, id: &TaskId) -> bool {
        self.task_index.contains_key(id)
    }

    pub fn task_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn dependency_count(&self) -> usize {
        self.graph.edge_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    /// All tasks in insertion order.
    pub fn all_tasks(&self) -> Vec<&Task> {
        self.graph.node_weights().collect()
    }

    /// IDs of tasks without a parent, in insertion order.
    pub fn root_ids(&self) -> Vec<TaskId> {
        self.graph
            .node_weights()
            .filter(|task| task.is_root())
            .map(|task| task.id)
            .collect()
    }

    /// Owned children of a task, in insertion order.
    pub fn children(&self, id: &TaskId) -> &[TaskId] {
        self.children.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// A leaf has no owned children and is executed directly.
    pub fn is_leaf(&self, id: &TaskId) -> bool {
        self.children(id).is_empty()
    }

    /// Parent chain of a task, nearest first.
    pub fn ancestors(&self, id: &TaskId) -> Vec<TaskId> {
        let mut chain = Vec::new();
        let mut current = self.get_task(id).and_then(|t| t.parent_task_id);
        while let Some(parent) = current {
            if chain.contains(&parent) {
                break;
            }
            chain.push(parent);
            current = self.get_task(&parent).and_then(|t| t.parent_task_id);
        }
        chain
    }

    /// Get all tasks that the given task depends on.
    pub fn dependencies_of(&self, id: &TaskId) -> Vec<&Task> {
        self.neighbors(id, Direction::Incoming)
    }

    /// Get all tasks that depend on the given task.
    pub fn dependents_of(&self, id: &TaskId) -> Vec<&Task> {
        self.neighbors(id, Direction::Outgoing)
    }

    fn neighbors(&self, id: &TaskId, direction: Direction) -> Vec<&Task> {
        match self.task_index.get(id) {
            Some(&index) => self
                .graph
                .neighbors_directed(index, direction)
                .filter_map(|n| self.graph.node_weight(n))
                .collect(),
            None => Vec::new(),
        }
    }

    // ========== Scheduling Operations ==========

    /// Dependencies that gate a task: its own plus those of every ancestor.
    ///
    /// A subtask inherits the prerequisites of the task it was decomposed
    /// from, so it cannot start before its parent could have.
    pub fn gating_dependencies(&self, id: &TaskId) -> Vec<&Task> {
        let mut deps = self.dependencies_of(id);
        for ancestor in self.ancestors(id) {
            deps.extend(self.dependencies_of(&ancestor));
        }
        deps
    }

    /// Get all leaf tasks ready to execute.
    ///
    /// A task is ready if it is pending and every gating dependency is
    /// completed. Composite tasks are excluded since their status is derived
    /// from their children. Ordered by descending priority, then insertion
    /// order.
    pub fn ready_tasks(&self) -> Vec<&Task> {
        let mut ready: Vec<&Task> = self
            .graph
            .node_weights()
            .filter(|task| task.status == TaskStatus::Pending && self.is_leaf(&task.id))
            .filter(|task| {
                self.gating_dependencies(&task.id)
                    .iter()
                    .all(|dep| dep.status == TaskStatus::Completed)
            })
            .collect();

        // sort_by is stable, so equal priorities keep insertion order
        ready.sort_by(|a, b| b.priority.cmp(&a.priority));
        ready
    }

    /// Pending leaves that can never become ready because a gating
    /// dependency failed.
    ///
    /// Returns each blocked task with the name of the failed dependency.
    pub fn blocked_tasks(&self) -> Vec<(TaskId, String)> {
        self.graph
            .node_weights()
            .filter(|task| task.status == TaskStatus::Pending && self.is_leaf(&task.id))
            .filter_map(|task| {
                self.gating_dependencies(&task.id)
                    .into_iter()
                    .find(|dep| dep.status == TaskStatus::Failed)
                    .map(|dep| (task.id, dep.name.clone()))
            })
            .collect()
    }

    /// Apply a status change and propagate it to the owning ancestors.
    ///
    /// Terminal fields are written exactly once: a task that is already
    /// completed or failed is left untouched and `Ok(false)` is returned,
    /// as is any other transition the lifecycle does not allow.
    pub fn update_status(
        &mut self,
        id: &TaskId,
        status: TaskStatus,
        result: Option<Value>,
        failure_reason: Option<String>,
    ) -> Result<bool> {
        let task = self
            .get_task_mut(id)
            .ok_or_else(|| Error::Validation(format!("Task {} not found in graph", id)))?;

        if !task.status.can_transition_to(status) {
            debug!(task = %id, from = %task.status, to = %status, "ignoring status update");
            return Ok(false);
        }

        match status {
            TaskStatus::Pending => return Ok(false),
            TaskStatus::InProgress => task.start(),
            TaskStatus::Completed => task.complete(result),
            TaskStatus::Failed => task.fail(failure_reason.as_deref().unwrap_or("failed")),
        }

        let parent = task.parent_task_id;
        if status == TaskStatus::InProgress {
            self.mark_ancestors_started(parent);
        } else {
            self.propagate_terminal(parent);
        }
        Ok(true)
    }

    fn mark_ancestors_started(&mut self, mut current: Option<TaskId>) {
        while let Some(parent_id) = current {
            let Some(parent) = self.get_task_mut(&parent_id) else {
                break;
            };
            if parent.status != TaskStatus::Pending {
                break;
            }
            parent.start();
            current = parent.parent_task_id;
        }
    }

    /// Walk up the parent chain, resolving every parent whose children
    /// are all terminal. Stops at the first parent that is still waiting.
    fn propagate_terminal(&mut self, mut current: Option<TaskId>) {
        while let Some(parent_id) = current {
            let mut results = Map::new();
            let mut failed = Vec::new();

            for child_id in self.children(&parent_id) {
                let Some(child) = self.get_task(child_id) else {
                    continue;
                };
                match child.status {
                    TaskStatus::Completed => {
                        results.insert(
                            child.name.clone(),
                            child.result.clone().unwrap_or(Value::Null),
                        );
                    }
                    TaskStatus::Failed => failed.push(child.name.clone()),
                    TaskStatus::Pending | TaskStatus::InProgress => return,
                }
            }

            let Some(parent) = self.get_task_mut(&parent_id) else {
                return;
            };
            if parent.is_finished() {
                return;
            }

            if failed.is_empty() {
                parent.complete(Some(Value::Object(results)));
            } else {
                parent.fail(&format!("subtasks failed: {}", failed.join(", ")));
            }
            debug!(task = %parent_id, status = %parent.status, "parent status recomputed");
            current = parent.parent_task_id;
        }
    }

    /// Derived status of the whole plan.
    pub fn plan_status(&self) -> PlanStatus {
        let tasks = self.all_tasks();
        if tasks.is_empty() || tasks.iter().all(|t| t.status == TaskStatus::Completed) {
            return PlanStatus::Completed;
        }
        if tasks
            .iter()
            .any(|t| t.is_root() && t.status == TaskStatus::Failed)
        {
            return PlanStatus::Failed;
        }
        if tasks.iter().any(|t| t.status != TaskStatus::Pending) {
            PlanStatus::InProgress
        } else {
            PlanStatus::Pending
        }
    }

    /// Get tasks in topological order (respecting dependencies).
    ///
    /// # Errors
    /// Returns an error if the graph contains a cycle (should never happen
    /// since add_dependency validates against cycles).
    pub fn topological_order(&self) -> Result<Vec<&Task>> {
        let sorted = toposort(&self.graph, None).map_err(|cycle| {
            let task_name = self
                .graph
                .node_weight(cycle.node_id())
                .map(|t| t.name.as_str())
                .unwrap_or("unknown");
            Error::Validation(format!("Cycle detected at task: {}", task_name))
        })?;

        Ok(sorted
            .into_iter()
            .filter_map(|index| self.graph.node_weight(index))
            .collect())
    }

    pub fn is_acyclic(&self) -> bool {
        !is_cyclic_directed(&self.graph)
    }
}

impl Default for TaskGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TaskGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskGraph")
            .field("tasks", &self.task_count())
            .field("dependencies", &self.dependency_count())
            .finish()
    }
}

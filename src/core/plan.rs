//! Plan identifiers, derived plan status and the plan snapshot handed to
//! callers.

use crate::core::graph::TaskGraph;
use crate::core::task::{Task, TaskId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a task plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PlanId(pub Uuid);

impl PlanId {
    /// Create a new unique plan identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Return first 8 characters of the UUID for display.
    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for PlanId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for PlanId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for PlanId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Status of a plan, derived from its tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    #[default]
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl PlanStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, PlanStatus::Completed | PlanStatus::Failed)
    }
}

impl std::fmt::Display for PlanStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PlanStatus::Pending => write!(f, "pending"),
            PlanStatus::InProgress => write!(f, "in_progress"),
            PlanStatus::Completed => write!(f, "completed"),
            PlanStatus::Failed => write!(f, "failed"),
        }
    }
}

/// A point-in-time copy of a plan and all of its tasks.
///
/// Plans are owned by the planner; this snapshot is what callers read.
/// Mutations go through `TaskPlanner::update_task_status`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskPlan {
    pub id: PlanId,
    pub name: String,
    pub description: String,
    pub root_task_ids: Vec<TaskId>,
    /// Every task of the plan in creation order.
    pub tasks: Vec<Task>,
    pub status: PlanStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TaskPlan {
    pub(crate) fn snapshot(
        id: PlanId,
        name: &str,
        description: &str,
        graph: &TaskGraph,
        created_at: DateTime<Utc>,
        updated_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            name: name.to_string(),
            description: description.to_string(),
            root_task_ids: graph.root_ids(),
            tasks: graph.all_tasks().into_iter().cloned().collect(),
            status: graph.plan_status(),
            created_at,
            updated_at,
        }
    }

    pub fn task(&self, id: &TaskId) -> Option<&Task> {
        self.tasks.iter().find(|t| &t.id == id)
    }

    pub fn task_by_name(&self, name: &str) -> Option<&Task> {
        self.tasks.iter().find(|t| t.name == name)
    }

    /// Direct children of a task, in creation order.
    pub fn children_of(&self, id: &TaskId) -> Vec<&Task> {
        self.tasks
            .iter()
            .filter(|t| t.parent_task_id.as_ref() == Some(id))
            .collect()
    }

    /// Tasks without children, i.e. the ones executed by agents.
    pub fn leaves(&self) -> Vec<&Task> {
        self.tasks
            .iter()
            .filter(|t| !self.tasks.iter().any(|c| c.parent_task_id == Some(t.id)))
            .collect()
    }

    /// Length of the longest parent chain, roots being depth 0.
    pub fn depth(&self) -> usize {
        self.tasks
            .iter()
            .map(|task| {
                let mut depth = 0;
                let mut current = task.parent_task_id;
                while let Some(parent) = current {
                    depth += 1;
                    current = self.task(&parent).and_then(|t| t.parent_task_id);
                }
                depth
            })
            .max()
            .unwrap_or(0)
    }
}

//! Task data model for the plan graph.
//!
//! Tasks are the atomic units of work routed to agents. Each task tracks
//! its status, dependencies, owning parent, required capabilities,
//! assignment and terminal outcome.

use crate::agent::AgentId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a task within a plan.
///
/// Uses UUID v4 for generation and provides a short form display
/// for human-readable output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub Uuid);

impl TaskId {
    /// Create a new unique task identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Return first 8 characters of the UUID for display.
    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for TaskId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Task status in its lifecycle.
///
/// `Pending -> InProgress -> {Completed | Failed}`. Completed and Failed
/// are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Task created, waiting for its dependencies or a free slot.
    #[default]
    Pending,
    /// Task is currently being executed by an agent.
    InProgress,
    /// Task completed successfully.
    Completed,
    /// Task failed.
    Failed,
}

impl TaskStatus {
    /// Check if the status is terminal (Completed or Failed).
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }

    /// Whether a task in this status may move to `next`.
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        match (self, next) {
            (TaskStatus::Pending, TaskStatus::InProgress) => true,
            (TaskStatus::Pending | TaskStatus::InProgress, to) => to.is_terminal(),
            _ => false,
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Pending => write!(f, "pending"),
            TaskStatus::InProgress => write!(f, "in_progress"),
            TaskStatus::Completed => write!(f, "completed"),
            TaskStatus::Failed => write!(f, "failed"),
        }
    }
}

/// A single task in a plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Unique identifier for this task.
    pub id: TaskId,
    /// Human-readable name for the task.
    pub name: String,
    /// Detailed description of what the task should accomplish.
    pub description: String,
    /// Current execution status.
    pub status: TaskStatus,
    /// Higher values are dispatched first.
    pub priority: i32,
    /// Tasks that must be completed before this one is ready.
    pub dependencies: Vec<TaskId>,
    /// Owning task, `None` for roots.
    pub parent_task_id: Option<TaskId>,
    /// Capabilities needed to execute this task, most important first.
    pub required_capabilities: Vec<String>,
    /// Agent chosen at dispatch time.
    pub assigned_to: Option<AgentId>,
    /// Output recorded on completion.
    pub result: Option<serde_json::Value>,
    /// Reason recorded on failure.
    pub failure_reason: Option<String>,
    /// When the task was created.
    pub created_at: DateTime<Utc>,
    /// Last mutation.
    pub updated_at: DateTime<Utc>,
    /// When the task started execution.
    pub started_at: Option<DateTime<Utc>>,
    /// When the task reached a terminal state.
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    /// Create a new pending task with the given name and description.
    pub fn new(name: &str, description: &str) -> Self {
        let now = Utc::now();
        Self {
            id: TaskId::new(),
            name: name.to_string(),
            description: description.to_string(),
            status: TaskStatus::Pending,
            priority: 0,
            dependencies: Vec::new(),
            parent_task_id: None,
            required_capabilities: Vec::new(),
            assigned_to: None,
            result: None,
            failure_reason: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_capabilities<I, S>(mut self, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.required_capabilities = capabilities.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_parent(mut self, parent: TaskId) -> Self {
        self.parent_task_id = Some(parent);
        self
    }

    /// Transition to InProgress and record the start time.
    pub fn start(&mut self) {
        let now = Utc::now();
        self.status = TaskStatus::InProgress;
        self.started_at = Some(now);
        self.updated_at = now;
    }

    /// Transition to Completed with the given output.
    pub fn complete(&mut self, result: Option<serde_json::Value>) {
        let now = Utc::now();
        self.status = TaskStatus::Completed;
        self.result = result;
        self.completed_at = Some(now);
        self.updated_at = now;
    }

    /// Transition to Failed with the given reason.
    pub fn fail(&mut self, reason: &str) {
        let now = Utc::now();
        self.status = TaskStatus::Failed;
        self.failure_reason = Some(reason.to_string());
        self.completed_at = Some(now);
        self.updated_at = now;
    }

    /// Assign an agent to this task.
    pub fn assign(&mut self, agent_id: AgentId) {
        self.assigned_to = Some(agent_id);
        self.updated_at = Utc::now();
    }

    /// Check if the task is in a terminal state (Completed or Failed).
    pub fn is_finished(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn is_root(&self) -> bool {
        self.parent_task_id.is_none()
    }
}

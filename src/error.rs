use thiserror::Error;

use crate::agent::AgentId;
use crate::core::{PlanId, TaskId, TaskStatus};

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("No home directory")]
    NoHomeDir,

    #[error("Plan not found: {0}")]
    PlanNotFound(PlanId),

    #[error("Task {task_id} not found in plan {plan_id}")]
    TaskNotFound { plan_id: PlanId, task_id: TaskId },

    #[error("Agent not found: {0}")]
    AgentNotFound(AgentId),

    #[error("Task {0} has no assigned agent")]
    TaskNotAssigned(TaskId),

    #[error("Task {task_id} is assigned to unknown agent {agent_id}")]
    UnknownAssignedAgent { task_id: TaskId, agent_id: AgentId },

    #[error("Decomposition error: {0}")]
    Decomposition(String),

    #[error("Execution error: {0}")]
    Execution(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Invalid status transition from {from} to {to}")]
    InvalidTransition { from: TaskStatus, to: TaskStatus },
}

impl Error {
    /// Unknown plan, task or agent. Fatal to the single operation.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Error::PlanNotFound(_) | Error::TaskNotFound { .. } | Error::AgentNotFound(_)
        )
    }

    /// A task that points at an agent which cannot be resolved.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Error::TaskNotAssigned(_) | Error::UnknownAssignedAgent { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;

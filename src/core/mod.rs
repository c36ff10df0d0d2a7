//! Core domain models for conductor.
//!
//! This module contains the fundamental data structures used throughout
//! the orchestration engine: tasks, the task graph and plan snapshots.

pub mod graph;
pub mod plan;
pub mod task;

pub use graph::TaskGraph;
pub use plan::{PlanId, PlanStatus, TaskPlan};
pub use task::{Task, TaskId, TaskStatus};

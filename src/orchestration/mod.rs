//! Planning and execution.
//!
//! The [`TaskPlanner`] turns a goal into a plan graph through a
//! [`Decomposer`]; the [`TaskExecutor`] drives that graph to a terminal
//! state, routing each task through agent discovery and publishing
//! lifecycle events on its [`EventBus`].

pub mod decomposer;
pub mod events;
pub mod executor;
pub mod planner;

pub use decomposer::{
    parse_subtasks, priority_from_label, CommandDecomposer, Decomposer, SubtaskSpec,
};
pub use events::{EventBus, EventHandler, EventType, ExecutionEvent, SubscriptionId};
pub use executor::{ExecuteOptions, ExecutionReport, TaskExecutionResult, TaskExecutor};
pub use planner::{PlanOptions, TaskPlanner};

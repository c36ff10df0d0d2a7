//! Conductor: a task orchestration engine.
//!
//! A goal is decomposed into a hierarchical task graph, each ready task is
//! routed to the best-scoring agent for its capabilities, and the graph is
//! executed with a bounded number of tasks in flight.

pub mod agent;
pub mod config;
pub mod core;
pub mod discovery;
pub mod error;
pub mod log;
pub mod orchestration;

pub use error::{Error, Result};

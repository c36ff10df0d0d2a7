//! Capability-based agent discovery.
//!
//! - `registry`: the set of known agents
//! - `view`: capability name to providers projection
//! - `similarity`: capability similarity index for fallback
//! - `metrics`: rolling execution statistics
//! - `agent_discovery`: selection, fallback and runtime capabilities

pub mod agent_discovery;
pub mod metrics;
pub mod registry;
pub mod similarity;
pub mod view;

pub use agent_discovery::{
    AgentDiscovery, CapabilityRequest, DiscoveryOptions, DiscoveryResult, FallbackDetails,
    FallbackStrategy, FallbackType, ScoredAgent,
};
pub use metrics::{DiscoveryMetrics, ExecutionOutcome};
pub use registry::{AgentRegistry, InMemoryAgentRegistry};
pub use similarity::{SimilarCapability, SimilarityIndex};
pub use view::{CapabilityRecord, CapabilityView};

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::agent::{Capability, CommandAgent, DEFAULT_AGENT_TIMEOUT_SECS};
use crate::discovery::InMemoryAgentRegistry;
use crate::{Error, Result};

/// Default maximum decomposition depth below the root task.
pub const DEFAULT_MAX_DEPTH: usize = 2;

/// Default maximum number of subtasks per decomposition.
pub const DEFAULT_MAX_SUBTASKS: usize = 5;

/// Capability assigned to leaves that declare none.
pub const DEFAULT_CAPABILITY: &str = "general";

/// Default number of tasks dispatched concurrently.
pub const DEFAULT_PARALLEL_LIMIT: usize = 4;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub planner: PlannerConfig,
    #[serde(default)]
    pub discovery: DiscoveryConfig,
    #[serde(default)]
    pub executor: ExecutorConfig,
    #[serde(default)]
    pub decomposer: DecomposerConfig,
    #[serde(default)]
    pub agents: Vec<AgentConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlannerConfig {
    pub max_depth: usize,
    pub max_subtasks: usize,
    pub default_capability: String,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            max_depth: DEFAULT_MAX_DEPTH,
            max_subtasks: DEFAULT_MAX_SUBTASKS,
            default_capability: DEFAULT_CAPABILITY.to_string(),
        }
    }
}

/// Scoring weights and thresholds used by agent discovery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    pub capability_weight: f64,
    pub performance_weight: f64,
    pub reliability_weight: f64,
    /// Added to the capability score of agents on the caller's preferred list.
    pub preferred_boost: f64,
    /// Minimum similarity for a capability pair to be a fallback candidate.
    pub similarity_threshold: f64,
    /// Minimum similarity for a pair to be recorded as a direct fallback.
    pub fallback_threshold: f64,
    pub max_alternatives: usize,
    /// Latency at which the performance score drops to 0.5.
    pub latency_baseline_ms: f64,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            capability_weight: 0.4,
            performance_weight: 0.3,
            reliability_weight: 0.3,
            preferred_boost: 0.2,
            similarity_threshold: 0.3,
            fallback_threshold: 0.7,
            max_alternatives: 3,
            latency_baseline_ms: 1000.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    pub parallel_limit: usize,
    /// Budget for a whole plan run, unbounded when unset.
    pub timeout_secs: Option<u64>,
    pub max_retries: u32,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            parallel_limit: DEFAULT_PARALLEL_LIMIT,
            timeout_secs: None,
            max_retries: 0,
        }
    }
}

impl ExecutorConfig {
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DecomposerConfig {
    pub command: String,
    pub timeout_secs: u64,
}

impl Default for DecomposerConfig {
    fn default() -> Self {
        Self {
            command: "claude -p --output-format json".to_string(),
            timeout_secs: DEFAULT_AGENT_TIMEOUT_SECS,
        }
    }
}

/// A command agent declared in `[[agents]]`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    pub id: String,
    pub command: String,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub capabilities: Vec<Capability>,
}

impl Config {
    pub fn conductor_dir() -> Result<PathBuf> {
        Ok(dirs::home_dir()
            .ok_or(Error::NoHomeDir)?
            .join(".conductor"))
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::conductor_dir()?.join("conductor.toml"))
    }

    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let path = expand_tilde(&path.to_string_lossy());
        debug!(path = %path.display(), "loading config");
        if !path.exists() {
            debug!("config file not found, using defaults");
            return Ok(Self::default());
        }
        let config: Self = toml::from_str(&fs::read_to_string(&path)?)?;
        config.validate()?;
        debug!(
            agents = config.agents.len(),
            max_depth = config.planner.max_depth,
            parallel_limit = config.executor.parallel_limit,
            "config loaded"
        );
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        let dir = Self::conductor_dir()?;
        if !dir.exists() {
            debug!(dir = %dir.display(), "creating conductor directory");
            fs::create_dir_all(&dir)?;
        }
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        fs::write(path, toml::to_string_pretty(self)?)?;
        debug!(path = %path.display(), "config saved");
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.executor.parallel_limit == 0 {
            return Err(Error::Validation(
                "executor.parallel_limit must be at least 1".to_string(),
            ));
        }
        let mut seen = std::collections::HashSet::new();
        for agent in &self.agents {
            if agent.command.trim().is_empty() {
                return Err(Error::Validation(format!(
                    "agent {} has an empty command",
                    agent.id
                )));
            }
            if !seen.insert(agent.id.as_str()) {
                return Err(Error::Validation(format!(
                    "agent {} is declared twice",
                    agent.id
                )));
            }
        }
        Ok(())
    }

    /// Build a registry holding one command agent per `[[agents]]` entry.
    pub fn build_registry(&self) -> InMemoryAgentRegistry {
        let registry = InMemoryAgentRegistry::new();
        for agent in &self.agents {
            registry.register(Arc::new(CommandAgent::from_config(agent)));
        }
        registry
    }
}

fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

//! Agents: interchangeable executors of named capabilities.
//!
//! An [`Agent`] declares the capabilities it provides and executes a
//! [`TaskInput`]. Two kinds ship with the crate: [`CommandAgent`] shells out
//! to a configured command, [`FnAgent`] wraps an in-process async closure.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::process::Command;
use tracing::debug;

use crate::config::AgentConfig;
use crate::core::{PlanId, TaskId};
use crate::error::{Error, Result};

/// Default timeout for a command agent invocation (10 minutes).
pub const DEFAULT_AGENT_TIMEOUT_SECS: u64 = 600;

/// Identifier an agent is registered under.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentId(pub String);

impl AgentId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for AgentId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for AgentId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl std::fmt::Display for AgentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A named skill an agent declares and a task can require.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capability {
    pub name: String,
    #[serde(default)]
    pub description: String,
}

impl Capability {
    pub fn new(name: &str, description: &str) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
        }
    }

    /// A capability with an empty description.
    pub fn named(name: &str) -> Self {
        Self::new(name, "")
    }
}

/// Everything an agent receives for one task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskInput {
    pub plan_id: PlanId,
    pub task_id: TaskId,
    pub name: String,
    pub description: String,
    /// The capability the task was routed on.
    pub capability: String,
    pub required_capabilities: Vec<String>,
    /// Results of completed dependencies, keyed by task name.
    #[serde(default)]
    pub context: Map<String, Value>,
}

impl TaskInput {
    /// Render the input as a single prompt string.
    pub fn prompt(&self) -> String {
        if self.context.is_empty() {
            return self.description.clone();
        }
        let context = Value::Object(self.context.clone());
        format!(
            "{}\n\nResults from prerequisite tasks:\n{}",
            self.description,
            serde_json::to_string_pretty(&context).unwrap_or_default()
        )
    }
}

/// What an agent returns on success.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentOutput {
    pub output: Value,
}

impl AgentOutput {
    pub fn new(output: impl Into<Value>) -> Self {
        Self {
            output: output.into(),
        }
    }
}

#[async_trait]
pub trait Agent: Send + Sync {
    fn id(&self) -> &AgentId;

    fn capabilities(&self) -> &[Capability];

    fn provides(&self, capability: &str) -> bool {
        self.capabilities().iter().any(|c| c.name == capability)
    }

    /// Run the task. An `Err` is recorded as a task failure.
    async fn execute(&self, input: &TaskInput) -> Result<AgentOutput>;
}

/// Agent backed by an external command.
///
/// The prompt is appended as the final argument. Stdout is parsed as JSON
/// when possible and returned as a string otherwise; a non-zero exit is an
/// execution error.
#[derive(Debug, Clone)]
pub struct CommandAgent {
    id: AgentId,
    capabilities: Vec<Capability>,
    base_command: Vec<String>,
    timeout: Duration,
}

impl CommandAgent {
    pub fn new(id: impl Into<AgentId>, command: &str, capabilities: Vec<Capability>) -> Self {
        Self {
            id: id.into(),
            capabilities,
            base_command: command.split_whitespace().map(String::from).collect(),
            timeout: Duration::from_secs(DEFAULT_AGENT_TIMEOUT_SECS),
        }
    }

    pub fn from_config(config: &AgentConfig) -> Self {
        let agent = Self::new(
            config.id.as_str(),
            &config.command,
            config.capabilities.clone(),
        );
        match config.timeout_secs {
            Some(secs) => agent.with_timeout(Duration::from_secs(secs)),
            None => agent,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn binary(&self) -> &str {
        self.base_command.first().map(|s| s.as_str()).unwrap_or("")
    }

    pub fn command(&self, prompt: Option<&str>) -> Vec<String> {
        let mut cmd = self.base_command.clone();
        if let Some(p) = prompt {
            cmd.push(p.to_string());
        }
        cmd
    }

    pub fn is_available(&self) -> bool {
        which::which(self.binary()).is_ok()
    }
}

#[async_trait]
impl Agent for CommandAgent {
    fn id(&self) -> &AgentId {
        &self.id
    }

    fn capabilities(&self) -> &[Capability] {
        &self.capabilities
    }

    async fn execute(&self, input: &TaskInput) -> Result<AgentOutput> {
        if self.base_command.is_empty() {
            return Err(Error::Validation(format!("agent {} has no command", self.id)));
        }
        debug!(
            agent = %self.id,
            task = %input.task_id,
            binary = self.binary(),
            "running command agent"
        );

        let output = tokio::time::timeout(
            self.timeout,
            Command::new(self.binary())
                .args(&self.base_command[1..])
                .arg(input.prompt())
                .kill_on_drop(true)
                .output(),
        )
        .await
        .map_err(|_| Error::Timeout(self.timeout))??;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let message = if stderr.trim().is_empty() {
                format!(
                    "{} exited with code {}",
                    self.binary(),
                    output.status.code().unwrap_or(-1)
                )
            } else {
                stderr.trim().to_string()
            };
            return Err(Error::Execution(message));
        }

        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        let value = serde_json::from_str::<Value>(&stdout).unwrap_or(Value::String(stdout));
        Ok(AgentOutput::new(value))
    }
}

type AgentFn = dyn Fn(TaskInput) -> BoxFuture<'static, Result<AgentOutput>> + Send + Sync;

/// Agent backed by an async closure.
#[derive(Clone)]
pub struct FnAgent {
    id: AgentId,
    capabilities: Vec<Capability>,
    handler: Arc<AgentFn>,
}

impl FnAgent {
    pub fn new<F, Fut>(id: impl Into<AgentId>, capabilities: Vec<Capability>, handler: F) -> Self
    where
        F: Fn(TaskInput) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<AgentOutput>> + Send + 'static,
    {
        Self {
            id: id.into(),
            capabilities,
            handler: Arc::new(move |input| handler(input).boxed()),
        }
    }
}

impl std::fmt::Debug for FnAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnAgent")
            .field("id", &self.id)
            .field("capabilities", &self.capabilities)
            .finish()
    }
}

#[async_trait]
impl Agent for FnAgent {
    fn id(&self) -> &AgentId {
        &self.id
    }

    fn capabilities(&self) -> &[Capability] {
        &self.capabilities
    }

    async fn execute(&self, input: &TaskInput) -> Result<AgentOutput> {
        (self.handler)(input.clone()).await
    }
}

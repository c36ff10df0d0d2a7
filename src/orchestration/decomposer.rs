//! Goal decomposition through a language model.
//!
//! The planner only sees the [`Decomposer`] trait. [`CommandDecomposer`]
//! runs an LLM CLI in headless mode and parses its answer with
//! [`parse_subtasks`], which accepts the shapes models tend to produce: a
//! bare JSON array, an array inside a ```json fence, or an object carrying
//! the array under `subtasks` or `tasks`.

use std::sync::OnceLock;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use tokio::process::Command;
use tracing::debug;

use crate::config::DecomposerConfig;
use crate::error::{Error, Result};

/// One subtask proposed by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubtaskSpec {
    #[serde(alias = "title")]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, deserialize_with = "deserialize_priority")]
    pub priority: i32,
    /// Names of sibling subtasks that must complete first.
    #[serde(default, alias = "depends_on", alias = "dependsOn")]
    pub dependencies: Vec<String>,
    #[serde(
        default,
        alias = "capabilities",
        alias = "requiredCapabilities"
    )]
    pub required_capabilities: Vec<String>,
}

impl SubtaskSpec {
    pub fn new(name: &str, description: &str) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            priority: 0,
            dependencies: Vec::new(),
            required_capabilities: Vec::new(),
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn depends_on(mut self, name: &str) -> Self {
        self.dependencies.push(name.to_string());
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
}

/// Map a priority label to its numeric value. `normal` is 0.
pub fn priority_from_label(label: &str) -> Option<i32> {
    match label.trim().to_lowercase().as_str() {
        "low" => Some(-1),
        "normal" | "medium" => Some(0),
        "high" => Some(1),
        "critical" | "urgent" => Some(2),
        other => other.parse().ok(),
    }
}

fn deserialize_priority<'de, D>(deserializer: D) -> std::result::Result<i32, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(match value {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f.round() as i64))
            .map(|n| n.clamp(i32::MIN as i64, i32::MAX as i64) as i32)
            .unwrap_or(0),
        Value::String(s) => priority_from_label(&s).unwrap_or(0),
        _ => 0,
    })
}

#[async_trait]
pub trait Decomposer: Send + Sync {
    /// Break `goal` into at most `max_subtasks` subtasks.
    async fn decompose(&self, goal: &str, max_subtasks: usize) -> Result<Vec<SubtaskSpec>>;
}

fn fence_regex() -> Option<&'static Regex> {
    static FENCE: OnceLock<Option<Regex>> = OnceLock::new();
    FENCE
        .get_or_init(|| Regex::new(r"(?s)```(?:json|JSON)?\s*(.*?)```").ok())
        .as_ref()
}

fn subtask_array(value: Value) -> Option<Vec<Value>> {
    match value {
        Value::Array(items) => Some(items),
        Value::Object(mut map) => ["subtasks", "tasks"]
            .iter()
            .find_map(|key| match map.remove(*key) {
                Some(Value::Array(items)) => Some(items),
                _ => None,
            }),
        _ => None,
    }
}

/// Extract subtask specs from model output.
pub fn parse_subtasks(text: &str) -> Result<Vec<SubtaskSpec>> {
    let trimmed = text.trim();
    let mut candidates: Vec<&str> = Vec::new();
    if let Some(caps) = fence_regex().and_then(|re| re.captures(trimmed)) {
        if let Some(body) = caps.get(1) {
            candidates.push(body.as_str().trim());
        }
    }
    candidates.push(trimmed);
    if let (Some(start), Some(end)) = (trimmed.find('['), trimmed.rfind(']')) {
        if start < end {
            candidates.push(&trimmed[start..=end]);
        }
    }

    for candidate in candidates {
        let Ok(value) = serde_json::from_str::<Value>(candidate) else {
            continue;
        };
        let Some(items) = subtask_array(value) else {
            continue;
        };
        return serde_json::from_value(Value::Array(items))
            .map_err(|e| Error::Decomposition(format!("invalid subtask list: {}", e)));
    }

    Err(Error::Decomposition(
        "no subtask list found in model output".to_string(),
    ))
}

/// Decomposer that shells out to an LLM CLI.
#[derive(Debug, Clone)]
pub struct CommandDecomposer {
    base_command: Vec<String>,
    timeout: Duration,
}

impl CommandDecomposer {
    pub fn new(command: &str) -> Self {
        Self {
            base_command: command.split_whitespace().map(String::from).collect(),
            timeout: Duration::from_secs(DecomposerConfig::default().timeout_secs),
        }
    }

    pub fn from_config(config: &DecomposerConfig) -> Self {
        Self::new(&config.command).with_timeout(Duration::from_secs(config.timeout_secs))
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

    pub fn is_available(&self) -> bool {
        which::which(self.binary()).is_ok()
    }

    /// Build the decomposition prompt for `goal`.
    pub fn prompt(goal: &str, max_subtasks: usize) -> String {
        format!(
            r#"You are a task decomposition assistant for a multi-agent system.

## Task to Decompose
{goal}

## Instructions
Break this task into at most {max_subtasks} subtasks. Each subtask must be
achievable by a single agent. Only list a dependency when the subtask needs
the result of another subtask in this list.

## Required Output Format (JSON)
```json
[
  {{
    "name": "short-unique-name",
    "description": "What needs to be done",
    "priority": "low|normal|high|critical",
    "dependencies": ["names of subtasks in this list"],
    "required_capabilities": ["capability names"]
  }}
]
```

If the task cannot be usefully split, return an empty array.
IMPORTANT: Output ONLY the JSON array, no other text."#
        )
    }

    /// Strip the CLI's JSON envelope, returning the model text.
    pub fn unwrap_envelope(stdout: &str) -> Result<String> {
        let Ok(Value::Object(envelope)) = serde_json::from_str::<Value>(stdout.trim()) else {
            return Ok(stdout.to_string());
        };
        let is_error = envelope.get("is_error").and_then(Value::as_bool) == Some(true)
            || envelope.get("subtype").and_then(Value::as_str) == Some("error");
        if is_error {
            let message = envelope
                .get("error")
                .or_else(|| envelope.get("result"))
                .and_then(Value::as_str)
                .unwrap_or("unknown error");
            return Err(Error::Decomposition(message.to_string()));
        }
        match envelope.get("result") {
            Some(Value::String(text)) => Ok(text.clone()),
            _ => Ok(stdout.to_string()),
        }
    }
}

#[async_trait]
impl Decomposer for CommandDecomposer {
    async fn decompose(&self, goal: &str, max_subtasks: usize) -> Result<Vec<SubtaskSpec>> {
        if self.base_command.is_empty() {
            return Err(Error::Validation("decomposer command is empty".to_string()));
        }
        debug!(binary = self.binary(), max_subtasks, "decomposing task");

        let output = tokio::time::timeout(
            self.timeout,
            Command::new(self.binary())
                .args(&self.base_command[1..])
                .arg(Self::prompt(goal, max_subtasks))
                .kill_on_drop(true)
                .output(),
        )
        .await
        .map_err(|_| Error::Timeout(self.timeout))?
        .map_err(Error::Io)?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let message = if stderr.trim().is_empty() {
                format!(
                    "decomposer exited with code {}",
                    output.status.code().unwrap_or(-1)
                )
            } else {
                stderr.trim().to_string()
            };
            return Err(Error::Execution(message));
        }

        let text = Self::unwrap_envelope(&stdout)?;
        let subtasks = parse_subtasks(&text)?;
        debug!(count = subtasks.len(), "decomposition parsed");
        Ok(subtasks)
    }
}

use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::ids::{CallId, SessionId};

/// Lifecycle of a tool call. `Pending` is recorded before any side effect;
/// `Running` only after the permission gate passes and execution starts.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ToolStatus {
    Pending,
    Running,
    Completed,
    Error,
}

impl ToolStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Error)
    }
}

/// Context available to tools during execution.
pub struct ToolContext {
    pub session_id: SessionId,
    pub call_id: CallId,
    pub working_directory: PathBuf,
    /// Cooperative cancellation. Tools should poll or select on this at
    /// their own suspension points; the coordinator stops waiting either way.
    pub abort: CancellationToken,
}

/// What a tool hands back on success.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToolOutput {
    pub title: String,
    pub output: String,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub metadata: serde_json::Value,
}

impl ToolOutput {
    pub fn text(title: impl Into<String>, output: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            output: output.into(),
            metadata: serde_json::Value::Null,
        }
    }
}

/// Description of a tool sent to the model as part of the request.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters_schema: serde_json::Value,
}

/// Trait implemented by each registered capability.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    fn parameters_schema(&self) -> serde_json::Value;

    /// Permission key evaluated against the rule sets before execution.
    fn permission(&self) -> &str {
        self.name()
    }

    /// Pattern evaluated alongside the permission key, derived from the
    /// input (a bash tool returns the command, a file tool the path).
    fn permission_pattern(&self, _input: &serde_json::Value) -> String {
        "*".to_string()
    }

    async fn execute(
        &self,
        input: serde_json::Value,
        ctx: &ToolContext,
    ) -> Result<ToolOutput, ToolError>;

    fn to_definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name().to_string(),
            description: self.description().to_string(),
            parameters_schema: self.parameters_schema(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("execution failed: {0}")]
    ExecutionFailed(String),
    #[error("cancelled")]
    Cancelled,
}

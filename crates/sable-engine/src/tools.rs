use async_trait::async_trait;
use std::time::Duration;

use sable_core::tools::{Tool, ToolContext, ToolError, ToolOutput};

const BASH_DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);
const BASH_MAX_TIMEOUT_MS: u64 = 600_000;
const READ_DEFAULT_LIMIT: usize = 2000;
const READ_MAX_LINE_LEN: usize = 2000;

/// Runs a shell command in the session working directory. Sequenced behind
/// the permission key `bash` with the command itself as the pattern, so rule
/// files can allow `git *` while asking about everything else.
pub struct BashTool {
    timeout: Duration,
}

impl BashTool {
    pub fn new() -> Self {
        Self { timeout: BASH_DEFAULT_TIMEOUT }
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for BashTool {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Tool for BashTool {
    fn name(&self) -> &str {
        "bash"
    }

    fn description(&self) -> &str {
        "Execute a shell command"
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "required": ["command"],
            "properties": {
                "command": {
                    "type": "string",
                    "description": "The shell command to execute"
                },
                "timeout": {
                    "type": "integer",
                    "description": "Timeout in milliseconds (max 600000)"
                }
            }
        })
    }

    fn permission_pattern(&self, input: &serde_json::Value) -> String {
        input
            .get("command")
            .and_then(|v| v.as_str())
            .unwrap_or("*")
            .to_string()
    }

    async fn execute(
        &self,
        input: serde_json::Value,
        ctx: &ToolContext,
    ) -> Result<ToolOutput, ToolError> {
        let command = input["command"]
            .as_str()
            .ok_or_else(|| ToolError::InvalidInput("command is required".into()))?;

        let timeout = input["timeout"]
            .as_u64()
            .map(|ms| Duration::from_millis(ms.min(BASH_MAX_TIMEOUT_MS)))
            .unwrap_or(self.timeout);

        let run = tokio::process::Command::new("bash")
            .arg("-c")
            .arg(command)
            .current_dir(&ctx.working_directory)
            .output();

        let output = tokio::select! {
            _ = ctx.abort.cancelled() => return Err(ToolError::Cancelled),
            result = tokio::time::timeout(timeout, run) => result
                .map_err(|_| ToolError::ExecutionFailed(format!(
                    "command timed out after {}s", timeout.as_secs()
                )))?
                .map_err(|e| ToolError::ExecutionFailed(format!("failed to spawn: {e}")))?,
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        let mut text = stdout.into_owned();
        if !stderr.is_empty() {
            if !text.is_empty() {
                text.push('\n');
            }
            text.push_str(&stderr);
        }
        if !output.status.success() {
            return Err(ToolError::ExecutionFailed(format!(
                "exit status {}: {}",
                output.status.code().unwrap_or(-1),
                text
            )));
        }

        Ok(ToolOutput::text(command, text))
    }
}

/// Reads file contents with line numbers, resolved against the session
/// working directory.
pub struct ReadTool;

#[async_trait]
impl Tool for ReadTool {
    fn name(&self) -> &str {
        "read"
    }

    fn description(&self) -> &str {
        "Read file contents from the filesystem"
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "required": ["path"],
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Path to the file, absolute or relative to the working directory"
                },
                "offset": {
                    "type": "integer",
                    "description": "Line number to start reading from (1-based)"
                },
                "limit": {
                    "type": "integer",
                    "description": "Maximum number of lines to read"
                }
            }
        })
    }

    fn permission_pattern(&self, input: &serde_json::Value) -> String {
        input
            .get("path")
            .and_then(|v| v.as_str())
            .unwrap_or("*")
            .to_string()
    }

    async fn execute(
        &self,
        input: serde_json::Value,
        ctx: &ToolContext,
    ) -> Result<ToolOutput, ToolError> {
        let file_path = input["path"]
            .as_str()
            .ok_or_else(|| ToolError::InvalidInput("path is required".into()))?;

        let path = {
            let p = std::path::Path::new(file_path);
            if p.is_absolute() {
                p.to_path_buf()
            } else {
                ctx.working_directory.join(p)
            }
        };

        let content = tokio::fs::read_to_string(&path).await.map_err(|e| {
            ToolError::ExecutionFailed(format!("failed to read {}: {e}", path.display()))
        })?;

        let offset = input["offset"].as_u64().unwrap_or(1).max(1) as usize;
        let limit = input["limit"].as_u64().unwrap_or(READ_DEFAULT_LIMIT as u64) as usize;

        let lines: Vec<&str> = content.lines().collect();
        let start = (offset - 1).min(lines.len());
        let end = (start + limit).min(lines.len());

        let mut output = String::new();
        for (i, line) in lines[start..end].iter().enumerate() {
            let shown = if line.len() > READ_MAX_LINE_LEN {
                &line[..READ_MAX_LINE_LEN]
            } else {
                line
            };
            output.push_str(&format!("{:>6}\t{}\n", start + i + 1, shown));
        }
        if output.is_empty() {
            output = "(empty file)".to_string();
        }

        Ok(ToolOutput::text(file_path, output))
    }
}

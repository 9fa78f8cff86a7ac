//! [`AgentExecutor`] implementations shipped with the engine.
//!
//! - [`CommandExecutor`] runs a configured external program once per invocation
//! - [`UnavailableExecutor`] refuses everything, so the engine runs degraded

use async_trait::async_trait;
use orch_sdk::{AgentExecutor, ExecutorError};
use serde_json::{json, Value};
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::config::ExecutorConfig;
use crate::yaml::response_value;

/// Spawns `program args...` per invocation.
///
/// The request `{role, task, context}` is written to stdin as JSON; stdout is
/// the answer (JSON, YAML, a fenced block, or plain text).
pub struct CommandExecutor {
    program: String,
    args: Vec<String>,
}

impl CommandExecutor {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }
}

#[async_trait]
impl AgentExecutor for CommandExecutor {
    async fn invoke(&self, role: &str, task: &str, context: &Value) -> Result<Value, ExecutorError> {
        debug!(program = %self.program, role, "Invoking agent command");

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .env("ORCH_ROLE", role)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                warn!(program = %self.program, error = %e, "Agent command failed to start");
                ExecutorError::Unavailable(format!("failed to start {}: {}", self.program, e))
            })?;

        let request = json!({ "role": role, "task": task, "context": context });
        let payload = serde_json::to_vec(&request).map_err(|e| ExecutorError::Malformed {
            role: role.to_string(),
            message: e.to_string(),
        })?;

        // stdin is fed while stdout is drained, so a child that answers as it
        // reads cannot fill both pipes and stall
        let stdin = child.stdin.take();
        let feed = async move {
            if let Some(mut stdin) = stdin {
                // A program that exits without reading stdin is not an error by itself
                if let Err(e) = stdin.write_all(&payload).await {
                    debug!(role, error = %e, "Agent command closed stdin early");
                }
            }
        };

        let ((), output) = tokio::join!(feed, child.wait_with_output());
        let output = output.map_err(|e| ExecutorError::Failed {
            role: role.to_string(),
            message: e.to_string(),
        })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ExecutorError::Failed {
                role: role.to_string(),
                message: format!(
                    "exit code {}: {}",
                    output.status.code().map(|c| c.to_string()).unwrap_or_else(|| "none".into()),
                    stderr.trim()
                ),
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        if stdout.trim().is_empty() {
            return Err(ExecutorError::Malformed {
                role: role.to_string(),
                message: "empty response".to_string(),
            });
        }

        Ok(response_value(&stdout))
    }
}

/// Executor used when nothing is configured
#[derive(Debug, Default, Clone, Copy)]
pub struct UnavailableExecutor;

#[async_trait]
impl AgentExecutor for UnavailableExecutor {
    async fn invoke(&self, role: &str, _task: &str, _context: &Value) -> Result<Value, ExecutorError> {
        Err(ExecutorError::Unavailable(format!("no agent executor configured for role '{}'", role)))
    }
}

/// Executor described by the configuration, or [`UnavailableExecutor`]
pub fn from_config(config: &ExecutorConfig) -> Arc<dyn AgentExecutor> {
    match config.command.as_deref().map(str::trim) {
        Some(program) if !program.is_empty() => {
            info!(program, "Using command agent executor");
            Arc::new(CommandExecutor::new(program, config.args.clone()))
        }
        _ => {
            warn!("No agent command configured; tasks will be deferred");
            Arc::new(UnavailableExecutor)
        }
    }
}

//! Boundary types shared between the orch engine and the hosts that run agents.
//!
//! - [`AgentExecutor`] is the only capability the engine needs from the outside
//!   world: run a task for a named role and hand back a JSON result.
//! - [`OrchLog`] is the structured progress event stream emitted while a
//!   workflow runs, with `log_*!` helper macros.

use serde::{Deserialize, Serialize};
use std::time::Duration;

// Re-export async trait for convenience
pub use async_trait::async_trait;

/// Errors an [`AgentExecutor`] can report.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ExecutorError {
    /// The executor cannot run anything right now (no host, binary missing, ...).
    #[error("agent executor unavailable: {0}")]
    Unavailable(String),

    /// The agent ran but reported a failure.
    #[error("agent '{role}' failed: {message}")]
    Failed { role: String, message: String },

    /// The invocation exceeded its deadline.
    #[error("agent '{role}' timed out after {}s", .after.as_secs())]
    Timeout { role: String, after: Duration },

    /// The agent answered with something the caller could not interpret.
    #[error("agent '{role}' returned a malformed response: {message}")]
    Malformed { role: String, message: String },
}

impl ExecutorError {
    /// True when the failure means "nobody was there to ask", as opposed to an
    /// agent that tried and failed.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, ExecutorError::Unavailable(_))
    }
}

/// Runs one unit of work for a named role.
///
/// Production hosts, test doubles, and fallbacks all implement this one method.
#[async_trait]
pub trait AgentExecutor: Send + Sync {
    async fn invoke(
        &self,
        role: &str,
        task: &str,
        context: &serde_json::Value,
    ) -> Result<serde_json::Value, ExecutorError>;
}

#[async_trait]
impl<T: AgentExecutor + ?Sized> AgentExecutor for std::sync::Arc<T> {
    async fn invoke(
        &self,
        role: &str,
        task: &str,
        context: &serde_json::Value,
    ) -> Result<serde_json::Value, ExecutorError> {
        (**self).invoke(role, task, context).await
    }
}

/// Tracing target used for [`OrchLog`] events.
pub const EVENT_TARGET: &str = "orch::events";

/// Structured progress events emitted by the engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OrchLog {
    /// Phase started
    PhaseStarted {
        phase: usize,
        total_phases: usize,
        task_count: usize,
    },
    /// Phase completed (every task settled)
    PhaseCompleted { phase: usize, succeeded: usize },
    /// Phase finished with at least one failed task
    PhaseFailed {
        phase: usize,
        failed: usize,
        error: String,
    },
    /// Task started
    TaskStarted {
        phase: usize,
        task_id: String,
        role: String,
    },
    /// Task completed
    TaskCompleted {
        task_id: String,
        role: String,
        duration_ms: u64,
    },
    /// Task failed
    TaskFailed {
        task_id: String,
        role: String,
        error: String,
    },
    /// Task could not be dispatched because no executor was reachable
    TaskDeferred {
        task_id: String,
        role: String,
        reason: String,
    },
    /// An agent was asked for something outside task execution
    AgentInvoked {
        role: String,
        purpose: String,
        degraded: bool,
    },
    /// A role recorded its final verdict
    SignOffRecorded { role: String, approved: bool },
}

impl OrchLog {
    /// Emit this event as JSON on the [`EVENT_TARGET`] tracing target
    pub fn emit(&self) {
        if let Ok(json) = serde_json::to_string(self) {
            tracing::info!(target: "orch::events", event = %json);
        }
    }
}

/// Helper macros for progress events
#[macro_export]
macro_rules! log_phase_start {
    ($phase:expr, $total:expr, $count:expr) => {
        $crate::OrchLog::PhaseStarted {
            phase: $phase,
            total_phases: $total,
            task_count: $count,
        }
        .emit();
    };
}

#[macro_export]
macro_rules! log_phase_complete {
    ($phase:expr, $succeeded:expr) => {
        $crate::OrchLog::PhaseCompleted {
            phase: $phase,
            succeeded: $succeeded,
        }
        .emit();
    };
}

#[macro_export]
macro_rules! log_phase_failed {
    ($phase:expr, $failed:expr, $error:expr) => {
        $crate::OrchLog::PhaseFailed {
            phase: $phase,
            failed: $failed,
            error: $error.to_string(),
        }
        .emit();
    };
}

#[macro_export]
macro_rules! log_task_start {
    ($phase:expr, $task_id:expr, $role:expr) => {
        $crate::OrchLog::TaskStarted {
            phase: $phase,
            task_id: $task_id.to_string(),
            role: $role.to_string(),
        }
        .emit();
    };
}

#[macro_export]
macro_rules! log_task_complete {
    ($task_id:expr, $role:expr, $duration_ms:expr) => {
        $crate::OrchLog::TaskCompleted {
            task_id: $task_id.to_string(),
            role: $role.to_string(),
            duration_ms: $duration_ms,
        }
        .emit();
    };
}

#[macro_export]
macro_rules! log_task_failed {
    ($task_id:expr, $role:expr, $error:expr) => {
        $crate::OrchLog::TaskFailed {
            task_id: $task_id.to_string(),
            role: $role.to_string(),
            error: $error.to_string(),
        }
        .emit();
    };
}

#[macro_export]
macro_rules! log_task_deferred {
    ($task_id:expr, $role:expr, $reason:expr) => {
        $crate::OrchLog::TaskDeferred {
            task_id: $task_id.to_string(),
            role: $role.to_string(),
            reason: $reason.to_string(),
        }
        .emit();
    };
}

#[macro_export]
macro_rules! log_agent_invoked {
    ($role:expr, $purpose:expr, $degraded:expr) => {
        $crate::OrchLog::AgentInvoked {
            role: $role.to_string(),
            purpose: $purpose.to_string(),
            degraded: $degraded,
        }
        .emit();
    };
}

#[macro_export]
macro_rules! log_sign_off {
    ($role:expr, $approved:expr) => {
        $crate::OrchLog::SignOffRecorded {
            role: $role.to_string(),
            approved: $approved,
        }
        .emit();
    };
}

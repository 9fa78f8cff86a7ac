//! Error types for the orchestration engine.

use orch_sdk::ExecutorError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum OrchError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Closed: {0}")]
    Closed(String),

    #[error("Task '{task_id}' ({role}) failed: {message}")]
    TaskFailed {
        task_id: String,
        role: String,
        message: String,
    },

    #[error("Circular dependency: {}", .0.join(" -> "))]
    CircularDependency(Vec<String>),

    #[error(transparent)]
    Executor(#[from] ExecutorError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

pub type Result<T> = std::result::Result<T, OrchError>;

//! Common test utilities for engine tests

use async_trait::async_trait;
use orch_engine::cache::{ManualClock, OrchestrationCache};
use orch_engine::config::{CacheConfig, OrchConfig};
use orch_engine::types::Task;
use orch_sdk::{AgentExecutor, ExecutorError};
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

type Script = dyn Fn(&str, &str) -> Result<Value, ExecutorError> + Send + Sync;

/// Executor answering from a closure over `(role, prompt)`, recording every call
pub struct ScriptedExecutor {
    script: Box<Script>,
    calls: Mutex<Vec<(String, String)>>,
}

impl ScriptedExecutor {
    pub fn new<F>(script: F) -> Self
    where
        F: Fn(&str, &str) -> Result<Value, ExecutorError> + Send + Sync + 'static,
    {
        Self {
            script: Box::new(script),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Calls whose prompt contains `fragment`
    pub fn count(&self, fragment: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, prompt)| prompt.contains(fragment))
            .count()
    }
}

#[async_trait]
impl AgentExecutor for ScriptedExecutor {
    async fn invoke(&self, role: &str, task: &str, _context: &Value) -> Result<Value, ExecutorError> {
        self.calls.lock().unwrap().push((role.to_string(), task.to_string()));
        (self.script)(role, task)
    }
}

/// A well-behaved team: two roles per item, two chained tasks per role,
/// every task completes, everyone votes yes and approves.
pub fn cooperative_answer(_role: &str, prompt: &str) -> Result<Value, ExecutorError> {
    if prompt.starts_with("Which roles") {
        Ok(json!({ "roles": ["architect", "developer"] }))
    } else if prompt.starts_with("Break work item") {
        Ok(json!({
            "tasks": [
                { "id": "a", "description": "Design the change", "deliverables": ["design note"] },
                { "id": "b", "description": "Build the change", "dependencies": ["a"] }
            ]
        }))
    } else if prompt.starts_with("Vote on") {
        Ok(json!({ "vote": true }))
    } else if prompt.starts_with("Sign off") {
        Ok(json!({ "approved": true, "feedback": "looks good" }))
    } else {
        Ok(json!({ "summary": "done" }))
    }
}

pub fn cooperative_executor() -> Arc<ScriptedExecutor> {
    Arc::new(ScriptedExecutor::new(cooperative_answer))
}

/// Config whose cache lives under `dir`
pub fn test_config(dir: &TempDir) -> OrchConfig {
    let mut config = OrchConfig::default();
    config.cache = cache_config(dir);
    config
}

pub fn cache_config(dir: &TempDir) -> CacheConfig {
    CacheConfig {
        dir: Some(dir.path().join("cache")),
        ..Default::default()
    }
}

pub async fn manual_cache(dir: &TempDir) -> (Arc<OrchestrationCache>, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::default());
    let cache = OrchestrationCache::open_with_clock(&cache_config(dir), clock.clone()).await;
    (Arc::new(cache), clock)
}

pub fn task(id: &str, role: &str, deps: &[&str]) -> Task {
    Task::new(id, role, format!("Work on {}", id)).with_dependencies(deps.iter().copied())
}

//! Phase-by-phase task execution.
//!
//! Phases are strict barriers: every task of phase N settles before any task of
//! phase N+1 starts. Inside a phase all tasks run concurrently through the
//! [`AgentExecutor`], each under an optional deadline.

pub mod batch;
pub mod phases;

pub use batch::{execute_batch, TaskContext};
pub use phases::{build_phases, find_task_cycle, plan_phases, PhasePlan};

use orch_sdk::{
    log_phase_complete, log_phase_failed, log_phase_start, log_task_complete, log_task_deferred, log_task_failed,
    log_task_start, AgentExecutor, ExecutorError,
};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

use crate::comms::CommunicationHub;
use crate::config::{FailurePolicy, SchedulerConfig};
use crate::error::{OrchError, Result};
use crate::types::{Phase, Task, TaskResult, TaskStatus};

/// Everything that ran, plus the failure that stopped the run under
/// [`FailurePolicy::Halt`]
#[derive(Debug)]
pub struct ScheduleOutcome {
    pub results: Vec<TaskResult>,
    pub phases_run: usize,
    pub halted: Option<OrchError>,
}

pub struct PhaseScheduler {
    executor: Arc<dyn AgentExecutor>,
    settings: SchedulerConfig,
    channel: Option<(Arc<CommunicationHub>, String)>,
}

impl PhaseScheduler {
    pub fn new(executor: Arc<dyn AgentExecutor>, settings: SchedulerConfig) -> Self {
        Self {
            executor,
            settings,
            channel: None,
        }
    }

    /// Publish each task outcome to `channel_id` on `hub`
    pub fn with_channel(mut self, hub: Arc<CommunicationHub>, channel_id: impl Into<String>) -> Self {
        self.channel = Some((hub, channel_id.into()));
        self
    }

    pub fn build_phases(&self, tasks: &[Task]) -> Vec<Phase> {
        build_phases(tasks)
    }

    /// Run all phases; under the halt policy the first failed task is the error
    pub async fn execute(&self, phases: &[Phase]) -> Result<Vec<TaskResult>> {
        let outcome = self.run(phases).await;
        match outcome.halted {
            Some(err) => Err(err),
            None => Ok(outcome.results),
        }
    }

    /// Run all phases and keep partial results when a phase fails
    pub async fn run(&self, phases: &[Phase]) -> ScheduleOutcome {
        let total = phases.len();
        let mut results: Vec<TaskResult> = Vec::new();
        let mut outputs: HashMap<String, Value> = HashMap::new();

        for (idx, phase) in phases.iter().enumerate() {
            let number = idx + 1;
            log_phase_start!(number, total, phase.len());

            let outputs_ref = &outputs;
            let phase_results = execute_batch(number, phase.clone(), self.settings.max_concurrency, move |task, ctx| {
                self.run_task(task, ctx, outputs_ref)
            })
            .await;

            let failed: Vec<&TaskResult> = phase_results
                .iter()
                .filter(|r| r.status == TaskStatus::Failed)
                .collect();
            let first_failure = failed.first().map(|r| OrchError::TaskFailed {
                task_id: r.task_id.clone(),
                role: r.role.clone(),
                message: r.error.clone().unwrap_or_default(),
            });

            if let Some(err) = &first_failure {
                log_phase_failed!(number, failed.len(), err);
            } else {
                log_phase_complete!(number, phase_results.len());
            }

            for result in &phase_results {
                if result.status != TaskStatus::Failed {
                    outputs.insert(result.task_id.clone(), result.output.clone());
                }
            }
            results.extend(phase_results);

            if let Some(err) = first_failure {
                if self.settings.on_failure == FailurePolicy::Halt {
                    warn!(phase = number, error = %err, "Halting after failed phase");
                    return ScheduleOutcome {
                        results,
                        phases_run: number,
                        halted: Some(err),
                    };
                }
            }
        }

        ScheduleOutcome {
            results,
            phases_run: total,
            halted: None,
        }
    }

    async fn run_task(&self, task: Task, ctx: TaskContext, outputs: &HashMap<String, Value>) -> TaskResult {
        log_task_start!(ctx.phase, task.id, task.owner_role);
        debug!(task_id = %task.id, task = ctx.task_number, of = ctx.total_tasks, "Dispatching task");

        let dependency_outputs: serde_json::Map<String, Value> = task
            .dependencies
            .iter()
            .filter_map(|dep| outputs.get(dep).map(|out| (dep.clone(), out.clone())))
            .collect();
        let context = json!({
            "task": task,
            "phase": ctx.phase,
            "dependencyOutputs": dependency_outputs,
        });
        let prompt = task_prompt(&task);

        let started = Instant::now();
        let call = self.executor.invoke(&task.owner_role, &prompt, &context);
        let outcome = match self.settings.task_timeout() {
            Some(limit) => match tokio::time::timeout(limit, call).await {
                Ok(result) => result,
                Err(_) => Err(ExecutorError::Timeout {
                    role: task.owner_role.clone(),
                    after: limit,
                }),
            },
            None => call.await,
        };
        let duration_ms = started.elapsed().as_millis() as u64;

        let result = match outcome {
            Ok(output) => {
                log_task_complete!(task.id, task.owner_role, duration_ms);
                TaskResult {
                    task_id: task.id.clone(),
                    role: task.owner_role.clone(),
                    phase: ctx.phase,
                    status: TaskStatus::Completed,
                    output,
                    error: None,
                    duration_ms,
                }
            }
            Err(e) if e.is_unavailable() => {
                log_task_deferred!(task.id, task.owner_role, e);
                TaskResult {
                    task_id: task.id.clone(),
                    role: task.owner_role.clone(),
                    phase: ctx.phase,
                    status: TaskStatus::Deferred,
                    output: deferred_output(&task, &e),
                    error: Some(e.to_string()),
                    duration_ms,
                }
            }
            Err(e) => {
                log_task_failed!(task.id, task.owner_role, e);
                TaskResult {
                    task_id: task.id.clone(),
                    role: task.owner_role.clone(),
                    phase: ctx.phase,
                    status: TaskStatus::Failed,
                    output: Value::Null,
                    error: Some(e.to_string()),
                    duration_ms,
                }
            }
        };

        self.publish(&result).await;
        result
    }

    async fn publish(&self, result: &TaskResult) {
        let Some((hub, channel_id)) = &self.channel else {
            return;
        };
        let update = json!({
            "taskId": result.task_id,
            "status": result.status,
            "error": result.error,
        });
        if let Err(e) = hub.send_to_channel(channel_id, &result.role, update).await {
            warn!(channel = %channel_id, error = %e, "Failed to publish task result");
        }
    }
}

fn task_prompt(task: &Task) -> String {
    let mut prompt = format!("Task {}: {}", task.id, task.description);
    if !task.deliverables.is_empty() {
        prompt.push_str("\nDeliverables:\n");
        for item in &task.deliverables {
            prompt.push_str(&format!("- {}\n", item));
        }
    }
    if !task.acceptance_criteria.is_empty() {
        prompt.push_str("\nAcceptance criteria:\n");
        for item in &task.acceptance_criteria {
            prompt.push_str(&format!("- {}\n", item));
        }
    }
    prompt
}

/// Placeholder recorded when no executor could take the task
fn deferred_output(task: &Task, reason: &ExecutorError) -> Value {
    json!({
        "status": "deferred",
        "summary": format!("{} not executed: {}", task.id, reason),
        "deliverables": task.deliverables,
        "followUp": format!("Re-run task {} for role {} once an agent executor is available", task.id, task.owner_role),
    })
}

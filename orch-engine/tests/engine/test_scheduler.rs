//! Tests for phase building and phased execution

use super::common::*;
use orch_engine::comms::CommunicationHub;
use orch_engine::config::{FailurePolicy, SchedulerConfig};
use orch_engine::error::OrchError;
use orch_engine::executor::UnavailableExecutor;
use orch_engine::scheduler::*;
use orch_engine::types::TaskStatus;
use orch_sdk::ExecutorError;
use serde_json::json;
use std::sync::Arc;

fn phase_ids(phases: &[orch_engine::types::Phase]) -> Vec<Vec<String>> {
    phases
        .iter()
        .map(|phase| {
            let mut ids: Vec<String> = phase.iter().map(|t| t.id.clone()).collect();
            ids.sort();
            ids
        })
        .collect()
}

// ============================================================================
// Phase Building Tests
// ============================================================================

#[test]
fn test_fan_out_builds_two_phases() {
    let tasks = vec![task("T1", "a", &[]), task("T2", "b", &["T1"]), task("T3", "c", &["T1"])];
    let phases = build_phases(&tasks);

    assert_eq!(phase_ids(&phases), vec![vec!["T1"], vec!["T2", "T3"]]);
}

#[test]
fn test_diamond() {
    let tasks = vec![
        task("d", "x", &["b", "c"]),
        task("b", "x", &["a"]),
        task("c", "x", &["a"]),
        task("a", "x", &[]),
    ];
    let phases = build_phases(&tasks);

    assert_eq!(phase_ids(&phases), vec![vec!["a"], vec!["b", "c"], vec!["d"]]);
}

#[test]
fn test_cycle_forced_into_final_phase() {
    let tasks = vec![task("ok", "x", &[]), task("p", "x", &["q"]), task("q", "x", &["p"])];
    let plan = plan_phases(&tasks);

    assert_eq!(plan.phases.len(), 2);
    assert_eq!(plan.task_count(), 3);
    assert!(plan.is_degraded());
    assert_eq!(find_task_cycle(&tasks).map(|c| c.len()), Some(3));
}

#[test]
fn test_every_task_scheduled_once() {
    let tasks: Vec<_> = (0..20)
        .map(|i| {
            let id = format!("t{}", i);
            let deps: Vec<String> = if i > 0 { vec![format!("t{}", i / 2)] } else { vec![] };
            orch_engine::types::Task::new(id, "dev", "work").with_dependencies(deps)
        })
        .collect();
    let plan = plan_phases(&tasks);

    assert_eq!(plan.task_count(), 20);
    assert!(!plan.is_degraded());
}

// ============================================================================
// Execution Tests
// ============================================================================

#[tokio::test]
async fn test_execute_runs_every_phase() {
    let executor = cooperative_executor();
    let scheduler = PhaseScheduler::new(executor.clone(), SchedulerConfig::default());
    let phases = scheduler.build_phases(&[task("T1", "a", &[]), task("T2", "b", &["T1"]), task("T3", "c", &["T1"])]);

    let results = scheduler.execute(&phases).await.unwrap();

    assert_eq!(results.len(), 3);
    assert!(results.iter().all(|r| r.status == TaskStatus::Completed));
    assert_eq!(results[0].phase, 1);
    assert!(results[1..].iter().all(|r| r.phase == 2));
}

fn failing_on(task_id: &'static str) -> Arc<ScriptedExecutor> {
    Arc::new(ScriptedExecutor::new(move |role, prompt| {
        if prompt.starts_with(&format!("Task {}:", task_id)) {
            Err(ExecutorError::Failed {
                role: role.to_string(),
                message: "compile error".to_string(),
            })
        } else {
            Ok(json!({ "ok": true }))
        }
    }))
}

#[tokio::test]
async fn test_halt_policy_stops_after_failed_phase() {
    let tasks = vec![task("A", "dev", &[]), task("B", "qa", &[]), task("C", "dev", &["A"])];
    let scheduler = PhaseScheduler::new(failing_on("A"), SchedulerConfig::default());
    let phases = scheduler.build_phases(&tasks);

    let outcome = scheduler.run(&phases).await;
    assert_eq!(outcome.phases_run, 1);
    assert_eq!(outcome.results.len(), 2);
    match outcome.halted {
        Some(OrchError::TaskFailed { task_id, role, message }) => {
            assert_eq!(task_id, "A");
            assert_eq!(role, "dev");
            assert!(message.contains("compile error"));
        }
        other => panic!("expected TaskFailed, got {:?}", other),
    }

    assert!(scheduler.execute(&phases).await.is_err());
}

#[tokio::test]
async fn test_continue_policy_runs_remaining_phases() {
    let tasks = vec![task("A", "dev", &[]), task("C", "dev", &["A"])];
    let settings = SchedulerConfig {
        on_failure: FailurePolicy::Continue,
        ..Default::default()
    };
    let scheduler = PhaseScheduler::new(failing_on("A"), settings);

    let results = scheduler.execute(&scheduler.build_phases(&tasks)).await.unwrap();
    assert_eq!(results.len(), 2);
    assert_eq!(results[0].status, TaskStatus::Failed);
    assert_eq!(results[1].status, TaskStatus::Completed);
}

#[tokio::test]
async fn test_unavailable_executor_defers_instead_of_failing() {
    let scheduler = PhaseScheduler::new(Arc::new(UnavailableExecutor), SchedulerConfig::default());
    let phases = scheduler.build_phases(&[task("A", "dev", &[]), task("B", "dev", &["A"])]);

    let outcome = scheduler.run(&phases).await;
    assert!(outcome.halted.is_none());
    assert_eq!(outcome.phases_run, 2);
    assert!(outcome.results.iter().all(|r| r.status == TaskStatus::Deferred));
    assert!(outcome.results[0].output["followUp"].as_str().unwrap().contains("A"));
}

#[tokio::test]
async fn test_results_published_to_channel() {
    let hub = Arc::new(CommunicationHub::new());
    let channel = hub.create_channel("run", ["dev".to_string()]).await;
    let scheduler = PhaseScheduler::new(cooperative_executor(), SchedulerConfig::default())
        .with_channel(hub.clone(), channel.clone());

    scheduler
        .execute(&scheduler.build_phases(&[task("A", "dev", &[])]))
        .await
        .unwrap();

    let channel = hub.channel(&channel).await.unwrap();
    assert_eq!(channel.messages.len(), 1);
    assert_eq!(channel.messages[0].content["taskId"], "A");
}

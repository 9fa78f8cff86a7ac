//! End-to-end orchestration tests with scripted agents

use super::common::*;
use orch_engine::comms::ProtocolStatus;
use orch_engine::config::{CompleteGroup, OrchConfig};
use orch_engine::error::OrchError;
use orch_engine::executor::UnavailableExecutor;
use orch_engine::orchestrator::{Orchestrator, Request};
use orch_engine::plan_doc::write_execution_plan;
use orch_engine::roster::AgentRoster;
use orch_engine::types::TaskStatus;
use orch_sdk::{AgentExecutor, ExecutorError};
use serde_json::json;
use std::sync::Arc;
use tempfile::TempDir;

async fn orchestrator(config: OrchConfig, executor: Arc<dyn AgentExecutor>) -> Orchestrator {
    Orchestrator::new(config, executor).await.unwrap()
}

fn describe(text: &str) -> Request {
    Request::Describe(text.to_string())
}

fn work_item(id: &str) -> Request {
    Request::WorkItem(id.parse().unwrap())
}

// ============================================================================
// Planning Tests
// ============================================================================

#[tokio::test]
async fn test_sequential_request_plans_ordered_phases() {
    let dir = TempDir::new().unwrap();
    let orch = orchestrator(test_config(&dir), cooperative_executor()).await;

    let plan = orch.plan(&describe("do 1.1 then 1.2")).await.unwrap();

    assert_eq!(plan.workflow.stages.len(), 2);
    assert_eq!(plan.roles_by_item["1.1"], vec!["architect", "developer"]);
    assert_eq!(plan.tasks.len(), 8);
    assert_eq!(plan.phase_plan.phases.len(), 4);
    assert!(plan.cycle.is_none());
    assert!(plan.warnings.is_empty());

    // Nothing from the second item starts before the first item is done
    let first_item_phases = &plan.phase_plan.phases[..2];
    assert!(first_item_phases
        .iter()
        .flatten()
        .all(|t| t.work_item.as_ref().map(|w| w.as_str()) == Some("1.1")));
}

#[tokio::test]
async fn test_no_work_items_is_validation_error() {
    let dir = TempDir::new().unwrap();
    let orch = orchestrator(test_config(&dir), cooperative_executor()).await;

    let err = orch.plan(&describe("tidy up the backlog")).await.unwrap_err();
    assert!(matches!(err, OrchError::Validation(_)));
}

#[tokio::test]
async fn test_assignment_and_decomposition_are_cached() {
    let dir = TempDir::new().unwrap();
    let executor = cooperative_executor();
    let orch = orchestrator(test_config(&dir), executor.clone()).await;
    let request = describe("run 4.1 and 4.2 together");

    orch.plan(&request).await.unwrap();
    orch.plan(&request).await.unwrap();

    assert_eq!(executor.count("Which roles"), 2);
    assert_eq!(executor.count("Break work item"), 4);
    assert!(orch.cache().stats().await.hits >= 7);
}

#[tokio::test]
async fn test_roster_filters_assigned_roles() {
    let dir = TempDir::new().unwrap();
    let orch = orchestrator(test_config(&dir), cooperative_executor())
        .await
        .with_roster(AgentRoster::from_roles(["architect", "qa-engineer"]));

    let plan = orch.plan(&work_item("5.1")).await.unwrap();
    assert_eq!(plan.roles_by_item["5.1"], vec!["architect"]);
    assert!(plan.tasks.iter().all(|t| t.owner_role == "architect"));
}

#[tokio::test]
async fn test_complete_groups_pull_in_required_roles() {
    let dir = TempDir::new().unwrap();
    let mut config = test_config(&dir);
    config.safety_checks.complete_groups.insert(
        "security".to_string(),
        CompleteGroup {
            trigger_agents: vec!["architect".to_string()],
            must_include: vec!["security-reviewer".to_string()],
        },
    );
    let orch = orchestrator(config, cooperative_executor()).await;

    let plan = orch.plan(&work_item("6.1")).await.unwrap();
    assert!(plan.roles_by_item["6.1"].contains(&"security-reviewer".to_string()));
    assert!(plan.tasks.iter().any(|t| t.owner_role == "security-reviewer"));
}

#[tokio::test]
async fn test_large_team_requires_confirmation() {
    let dir = TempDir::new().unwrap();
    let executor = Arc::new(ScriptedExecutor::new(|role, prompt| {
        if prompt.starts_with("Which roles") {
            let roles: Vec<String> = (1..=12).map(|i| format!("role-{}", i)).collect();
            Ok(json!({ "roles": roles }))
        } else {
            cooperative_answer(role, prompt)
        }
    }));
    let orch = orchestrator(test_config(&dir), executor).await;

    let plan = orch.plan(&work_item("7.1")).await.unwrap();
    assert_eq!(plan.invocation.agents.len(), 12);
    assert!(plan.invocation.requires_confirmation);
    assert!(!plan.invocation.requires_double_confirmation);
    assert_eq!(plan.invocation.estimated_minutes, 12.0 * 0.5 + 2.0);
}

// ============================================================================
// Cycle Handling Tests
// ============================================================================

fn cyclic_executor() -> Arc<ScriptedExecutor> {
    Arc::new(ScriptedExecutor::new(|role, prompt| {
        if prompt.starts_with("Break work item") {
            Ok(json!([
                { "id": "a", "description": "first", "dependencies": ["b"] },
                { "id": "b", "description": "second", "dependencies": ["a"] }
            ]))
        } else {
            cooperative_answer(role, prompt)
        }
    }))
}

#[tokio::test]
async fn test_cycle_degrades_to_forced_phase() {
    let dir = TempDir::new().unwrap();
    let orch = orchestrator(test_config(&dir), cyclic_executor()).await;

    let plan = orch.plan(&work_item("8.1")).await.unwrap();
    assert!(plan.cycle.is_some());
    assert!(plan.warnings.iter().any(|w| w.contains("Circular")));
    assert_eq!(plan.phase_plan.forced.len(), 4);

    let report = orch.execute(&plan).await.unwrap();
    assert_eq!(report.results.len(), 4);
    assert!(report.succeeded());
}

#[tokio::test]
async fn test_strict_dependencies_reject_cycle() {
    let dir = TempDir::new().unwrap();
    let mut config = test_config(&dir);
    config.scheduler.strict_dependencies = true;
    let orch = orchestrator(config, cyclic_executor()).await;

    let err = orch.plan(&work_item("8.1")).await.unwrap_err();
    match err {
        OrchError::CircularDependency(path) => assert_eq!(path.first(), path.last()),
        other => panic!("expected CircularDependency, got {:?}", other),
    }
}

// ============================================================================
// Execution Tests
// ============================================================================

#[tokio::test]
async fn test_run_completes_and_collects_sign_offs() {
    let dir = TempDir::new().unwrap();
    let orch = orchestrator(test_config(&dir), cooperative_executor()).await;

    let report = orch.run(&describe("do 1.1 then 1.2")).await.unwrap();

    assert_eq!(report.results.len(), 8);
    assert!(report.results.iter().all(|r| r.status == TaskStatus::Completed));
    assert_eq!(report.phases_run, 4);
    assert!(report.succeeded());
    assert!(report.approved);
    assert_eq!(report.sign_offs.len(), 2);
    assert!(report.invocation.success);
    assert_eq!(report.artifacts.len(), 8);

    let review = report.review.as_ref().unwrap();
    assert_eq!(review.protocol_name, "consensus-decision");
    assert_eq!(review.agents, vec!["architect", "developer"]);
    assert_eq!(review.status, ProtocolStatus::Completed);
    assert_eq!(orch.knowledge().query_knowledge("protocol-outcomes", "completed").await.len(), 1);

    let channel = orch.hub().channel(&report.channel_id).await.unwrap();
    assert_eq!(channel.messages.len(), 8);
    let recorded = orch.knowledge().query_knowledge("task-results", "completed").await;
    assert_eq!(recorded.len(), 8);
}

#[tokio::test]
async fn test_rejected_review_blocks_approval() {
    let dir = TempDir::new().unwrap();
    let executor = Arc::new(ScriptedExecutor::new(|role, prompt| {
        if prompt.starts_with("Vote on") {
            Ok(json!({ "vote": false }))
        } else {
            cooperative_answer(role, prompt)
        }
    }));
    let orch = orchestrator(test_config(&dir), executor.clone()).await;

    let report = orch.run(&work_item("1.4")).await.unwrap();

    assert!(report.succeeded());
    assert!(report.sign_offs.iter().all(|s| s.approved));
    assert_eq!(report.review.as_ref().unwrap().status, ProtocolStatus::Aborted);
    assert!(!report.approved);
    assert_eq!(executor.count("Vote on"), 2);
}

#[tokio::test]
async fn test_review_protocol_can_be_switched_off() {
    let dir = TempDir::new().unwrap();
    let mut config = test_config(&dir);
    config.agents.review_protocol = None;
    let executor = cooperative_executor();
    let orch = orchestrator(config, executor.clone()).await;

    let report = orch.run(&work_item("1.5")).await.unwrap();

    assert!(report.review.is_none());
    assert!(report.approved);
    assert_eq!(executor.count("Vote on"), 0);
}

#[tokio::test]
async fn test_unavailable_executor_degrades_gracefully() {
    let dir = TempDir::new().unwrap();
    let orch = orchestrator(test_config(&dir), Arc::new(UnavailableExecutor)).await;

    let plan = orch.plan(&work_item("1.2.3")).await.unwrap();
    let fallback = &orch.config().agents.fallback_roles;
    assert_eq!(&plan.roles_by_item["1.2.3"], fallback);
    assert_eq!(plan.tasks.len(), fallback.len() * 3);
    assert_eq!(plan.phase_plan.phases.len(), 3);

    let report = orch.execute(&plan).await.unwrap();
    assert!(report.succeeded());
    assert_eq!(report.deferred().len(), plan.tasks.len());
    assert!(!report.approved);
    assert!(report.sign_offs.iter().all(|s| !s.issues.is_empty()));
}

#[tokio::test]
async fn test_unusable_cache_dir_does_not_fail_run() {
    let dir = TempDir::new().unwrap();
    let blocker = dir.path().join("plain-file");
    std::fs::write(&blocker, "").unwrap();
    let mut config = OrchConfig::default();
    config.cache.dir = Some(blocker.join("cache"));

    let orch = orchestrator(config, cooperative_executor()).await;
    assert!(!orch.cache().is_enabled());

    let report = orch.run(&work_item("2.4")).await.unwrap();
    assert!(report.succeeded());
    assert_eq!(report.results.len(), 4);
}

#[tokio::test]
async fn test_failed_task_halts_run() {
    let dir = TempDir::new().unwrap();
    let executor = Arc::new(ScriptedExecutor::new(|role, prompt| {
        if role == "developer" && prompt.starts_with("Task ") {
            Err(ExecutorError::Failed {
                role: role.to_string(),
                message: "tests red".to_string(),
            })
        } else {
            cooperative_answer(role, prompt)
        }
    }));
    let orch = orchestrator(test_config(&dir), executor).await;

    let report = orch.run(&work_item("9.1")).await.unwrap();

    assert!(!report.succeeded());
    assert_eq!(report.phases_run, 1);
    assert_eq!(report.results.len(), 2);
    assert_eq!(report.failures().len(), 1);
    assert_eq!(report.failures()[0].role, "developer");
    assert!(report.halted.as_deref().unwrap().contains("tests red"));
}

#[tokio::test]
async fn test_execution_plan_written_to_document() {
    let dir = TempDir::new().unwrap();
    let orch = orchestrator(test_config(&dir), cooperative_executor()).await;
    let plan = orch.plan(&work_item("3.2")).await.unwrap();
    let report = orch.execute(&plan).await.unwrap();

    let doc = dir.path().join("docs/prd-3.2.md");
    write_execution_plan(&doc, &plan.tasks, &report.results).unwrap();

    let text = std::fs::read_to_string(&doc).unwrap();
    assert_eq!(text.matches("| completed |").count(), 4);
}

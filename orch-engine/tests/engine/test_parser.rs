//! Tests for natural-language workflow parsing

use orch_engine::parser::*;
use orch_engine::types::{Stage, WorkItemId};

fn stage_ids(workflow: &ParsedWorkflow, idx: usize) -> Vec<&str> {
    workflow.stages[idx].work_items.iter().map(|id| id.as_str()).collect()
}

fn stage(id: &str, deps: &[&str]) -> Stage {
    Stage {
        id: id.to_string(),
        name: id.to_uppercase(),
        work_items: vec![],
        parallel: false,
        depends_on: deps.iter().map(|d| d.to_string()).collect(),
        description: String::new(),
    }
}

// ============================================================================
// Segment Detection Tests
// ============================================================================

#[test]
fn test_parallel_segment() {
    let workflow = WorkflowParser::default().parse("run 1.1.2.1, 1.1.2.2, and 1.1.2.3 together");

    assert_eq!(workflow.stages.len(), 1);
    assert!(workflow.stages[0].parallel);
    assert_eq!(stage_ids(&workflow, 0), vec!["1.1.2.1", "1.1.2.2", "1.1.2.3"]);
    assert_eq!(workflow.prd_count, 3);
    assert!(workflow.is_valid());
}

#[test]
fn test_sequential_segments() {
    let workflow = WorkflowParser::default().parse("do 1.1.1.1 then do 1.1.1.2");

    assert_eq!(workflow.stages.len(), 2);
    assert_eq!(stage_ids(&workflow, 0), vec!["1.1.1.1"]);
    assert_eq!(stage_ids(&workflow, 1), vec!["1.1.1.2"]);
    assert_eq!(workflow.stages[1].depends_on, vec![workflow.stages[0].id.clone()]);
}

#[test]
fn test_mixed_parallel_then_sequential() {
    let workflow = WorkflowParser::default()
        .parse("build 2.1 and 2.2 in parallel, then 2.3, after that finish with 2.4");

    assert_eq!(workflow.stages.len(), 3);
    assert!(workflow.stages[0].parallel);
    assert_eq!(stage_ids(&workflow, 0), vec!["2.1", "2.2"]);
    assert_eq!(stage_ids(&workflow, 1), vec!["2.3"]);
    assert_eq!(stage_ids(&workflow, 2), vec!["2.4"]);
    assert_eq!(workflow.dependency_graph.edges.len(), 2);
}

#[test]
fn test_repeated_id_only_in_first_stage() {
    let workflow = WorkflowParser::default().parse("do 3.1 then 3.1 and 3.2");

    assert_eq!(workflow.work_items.len(), 2);
    assert_eq!(stage_ids(&workflow, 0), vec!["3.1"]);
    assert_eq!(stage_ids(&workflow, 1), vec!["3.2"]);
}

// ============================================================================
// Extraction Tests
// ============================================================================

#[test]
fn test_parse_is_idempotent() {
    let parser = WorkflowParser::default();
    let text = "run 1.2.1 and 1.2.2 together then 1.3 followed by 1.4.1";

    let first = parser.parse(text);
    let second = parser.parse(text);

    assert_eq!(first.work_items, second.work_items);
    assert_eq!(first.stages, second.stages);
}

#[test]
fn test_prefix_ids_are_distinct() {
    let ids = extract_work_items("start 1.1 and 1.1.2");
    assert_eq!(ids.len(), 2);
    assert_ne!(ids[0], ids[1]);
}

#[test]
fn test_no_ids_reports_validation_error() {
    let workflow = WorkflowParser::default().parse("refactor everything");
    assert!(!workflow.is_valid());
    assert!(workflow.validation_errors[0].contains("No work item IDs"));
}

#[test]
fn test_single_item_workflow() {
    let id: WorkItemId = "1.1.2.3".parse().unwrap();
    let workflow = WorkflowParser::default().single_item(id.clone());

    assert_eq!(workflow.stages.len(), 1);
    assert_eq!(workflow.work_items, vec![id]);
    assert!(!workflow.stages[0].parallel);
}

// ============================================================================
// Validation Tests
// ============================================================================

#[test]
fn test_stage_cycle_names_both_stages() {
    let workflow = WorkflowParser::default().finish(vec![stage("a", &["b"]), stage("b", &["a"])], vec![]);

    assert!(!workflow.validation_errors.is_empty());
    let message = &workflow.validation_errors[0];
    assert!(message.contains("Circular dependency"));
    assert!(message.contains('a') && message.contains('b'));
}

#[test]
fn test_unknown_stage_dependency() {
    let errors = validate_stages(&[stage("a", &["missing"])]);
    assert_eq!(errors.len(), 1);
    assert!(errors[0].contains("missing"));
}

#[test]
fn test_dependency_graph_cycles() {
    let graph = DependencyGraph::from_stages(&[stage("a", &["b"]), stage("b", &["a"]), stage("c", &[])]);
    let cycles = graph.find_cycles();

    assert_eq!(cycles.len(), 1);
    assert!(cycles[0].contains(&"a".to_string()));
    assert!(cycles[0].contains(&"b".to_string()));
}

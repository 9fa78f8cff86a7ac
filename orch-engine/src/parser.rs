//! Natural-language workflow parsing.
//!
//! Turns a free-text request such as
//! `"run 1.1.2.1, 1.1.2.2 together then do 1.1.3.1"` into an ordered stage
//! graph:
//!
//! 1. Extract work item ids (first-seen order, exact-string dedup)
//! 2. Cut the text at sequential keywords (`then`, `after`, `followed by`, ...)
//! 3. One stage per segment, parallel when the segment says so or lists ids
//! 4. Link stages linearly, validate the graph, estimate time and workers
//!
//! Problems are reported in [`ParsedWorkflow::validation_errors`], never thrown.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use tracing::{debug, warn};

use crate::config::ParserConfig;
use crate::types::{Stage, WorkItemId, MAX_WORK_ITEM_SEGMENTS};

static WORK_ITEM_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(?:\bprd[-_#: ]?|\b)(\d+(?:\.\d+)+)\b").expect("valid work item regex")
});

static SEQUENTIAL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(?:then|after|followed\s+by|next|subsequently)\b")
        .expect("valid sequential keyword regex")
});

static PARALLEL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(?:together|parallel|concurrently|simultaneously|at\s+the\s+same\s+time)\b")
        .expect("valid parallel keyword regex")
});

static ID_LIST_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\d+(?:\.\d+)+\s*,\s*(?:and\s+)?\d+(?:\.\d+)+").expect("valid id list regex")
});

/// Edge `from -> to`: `to` cannot start before `from` finishes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphEdge {
    pub from: String,
    pub to: String,
}

/// Stage dependency graph
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DependencyGraph {
    pub nodes: Vec<String>,
    pub edges: Vec<GraphEdge>,
}

impl DependencyGraph {
    pub fn from_stages(stages: &[Stage]) -> Self {
        let nodes = stages.iter().map(|s| s.id.clone()).collect();
        let edges = stages
            .iter()
            .flat_map(|stage| {
                stage.depends_on.iter().map(move |dep| GraphEdge {
                    from: dep.clone(),
                    to: stage.id.clone(),
                })
            })
            .collect();
        Self { nodes, edges }
    }

    /// Every cycle reachable by depth-first search, each as a closed path
    /// (`[a, b, a]`).
    pub fn find_cycles(&self) -> Vec<Vec<String>> {
        // Walk from a stage to the stages it depends on
        let mut depends_on: HashMap<&str, Vec<&str>> = HashMap::new();
        for edge in &self.edges {
            depends_on
                .entry(edge.to.as_str())
                .or_default()
                .push(edge.from.as_str());
        }

        let mut state: HashMap<&str, Visit> = HashMap::new();
        let mut stack: Vec<&str> = Vec::new();
        let mut cycles = Vec::new();

        for node in &self.nodes {
            if !state.contains_key(node.as_str()) {
                visit(node, &depends_on, &mut state, &mut stack, &mut cycles);
            }
        }

        cycles
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Visit {
    OnStack,
    Done,
}

fn visit<'a>(
    node: &'a str,
    adjacency: &HashMap<&'a str, Vec<&'a str>>,
    state: &mut HashMap<&'a str, Visit>,
    stack: &mut Vec<&'a str>,
    cycles: &mut Vec<Vec<String>>,
) {
    state.insert(node, Visit::OnStack);
    stack.push(node);

    if let Some(next_nodes) = adjacency.get(node) {
        for &next in next_nodes {
            match state.get(next) {
                None => visit(next, adjacency, state, stack, cycles),
                Some(Visit::OnStack) => {
                    let start = stack.iter().position(|n| *n == next).unwrap_or(0);
                    let mut cycle: Vec<String> = stack[start..].iter().map(|n| n.to_string()).collect();
                    cycle.push(next.to_string());
                    cycles.push(cycle);
                }
                Some(Visit::Done) => {}
            }
        }
    }

    stack.pop();
    state.insert(node, Visit::Done);
}

/// Worker estimate for a parsed workflow
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentRequirements {
    /// Most workers busy at once
    pub peak_concurrent: usize,
    /// Workers needed over the whole run; stages run one after another, so
    /// this is the largest stage, not the sum
    pub total: usize,
}

/// Result of parsing a free-text request
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParsedWorkflow {
    pub stages: Vec<Stage>,
    pub work_items: Vec<WorkItemId>,
    pub prd_count: usize,
    pub estimated_minutes: f64,
    pub agent_requirements: AgentRequirements,
    pub dependency_graph: DependencyGraph,
    #[serde(default)]
    pub validation_errors: Vec<String>,
}

impl ParsedWorkflow {
    /// Usable for planning: at least one stage and no validation errors
    pub fn is_valid(&self) -> bool {
        !self.stages.is_empty() && self.validation_errors.is_empty()
    }
}

/// Parses descriptions into stage graphs
#[derive(Debug, Clone, Default)]
pub struct WorkflowParser {
    settings: ParserConfig,
}

impl WorkflowParser {
    pub fn new(settings: ParserConfig) -> Self {
        Self { settings }
    }

    pub fn parse(&self, description: &str) -> ParsedWorkflow {
        let (work_items, rejected) = scan_work_items(description);
        let rejected_errors: Vec<String> = rejected
            .iter()
            .map(|raw| {
                format!(
                    "Ignored '{}': work item ids have at most {} segments",
                    raw, MAX_WORK_ITEM_SEGMENTS
                )
            })
            .collect();

        if work_items.is_empty() {
            warn!("No work item ids found in request");
            let mut validation_errors = vec!["No work item IDs found in description".to_string()];
            validation_errors.extend(rejected_errors);
            return ParsedWorkflow {
                validation_errors,
                ..Default::default()
            };
        }

        let segments = segment_description(description);
        let stages = if segments.len() > 1 {
            self.stages_from_segments(&segments)
        } else {
            vec![Stage {
                id: stage_id(1),
                name: "Stage 1".to_string(),
                parallel: work_items.len() > 1,
                work_items: work_items.clone(),
                depends_on: Vec::new(),
                description: description.trim().to_string(),
            }]
        };

        debug!(
            work_items = work_items.len(),
            stages = stages.len(),
            "Parsed workflow description"
        );

        let mut workflow = self.finish(stages, work_items);
        workflow.validation_errors.extend(rejected_errors);
        workflow
    }

    /// Single-stage workflow for one explicitly requested work item
    pub fn single_item(&self, id: WorkItemId) -> ParsedWorkflow {
        let stage = Stage {
            id: stage_id(1),
            name: "Stage 1".to_string(),
            work_items: vec![id.clone()],
            parallel: false,
            depends_on: Vec::new(),
            description: format!("Work item {}", id),
        };
        self.finish(vec![stage], vec![id])
    }

    /// Rebuild graph, validation, and estimates for an arbitrary stage list
    pub fn finish(&self, stages: Vec<Stage>, work_items: Vec<WorkItemId>) -> ParsedWorkflow {
        let dependency_graph = DependencyGraph::from_stages(&stages);
        let validation_errors = validate_stages(&stages);

        ParsedWorkflow {
            estimated_minutes: self.estimate_minutes(&stages),
            agent_requirements: self.estimate_workers(&stages),
            prd_count: work_items.len(),
            work_items,
            dependency_graph,
            validation_errors,
            stages,
        }
    }

    fn stages_from_segments(&self, segments: &[&str]) -> Vec<Stage> {
        let mut seen: HashSet<WorkItemId> = HashSet::new();
        let mut stages: Vec<Stage> = Vec::new();

        for segment in segments {
            let items: Vec<WorkItemId> = extract_work_items(segment)
                .into_iter()
                .filter(|id| seen.insert(id.clone()))
                .collect();

            if items.is_empty() {
                continue;
            }

            let number = stages.len() + 1;
            let depends_on = stages.last().map(|prev| vec![prev.id.clone()]).unwrap_or_default();

            stages.push(Stage {
                id: stage_id(number),
                name: format!("Stage {}", number),
                parallel: is_parallel_segment(segment),
                work_items: items,
                depends_on,
                description: segment.trim().to_string(),
            });
        }

        stages
    }

    /// Parallel stages cost one item plus overhead per item, sequential
    /// stages cost every item in full.
    pub fn estimate_minutes(&self, stages: &[Stage]) -> f64 {
        stages
            .iter()
            .map(|stage| {
                let count = stage.work_items.len() as f64;
                if stage.parallel {
                    self.settings.base_minutes_per_item + self.settings.parallel_overhead_minutes * count
                } else {
                    count * self.settings.base_minutes_per_item
                }
            })
            .sum()
    }

    pub fn estimate_workers(&self, stages: &[Stage]) -> AgentRequirements {
        let peak = stages
            .iter()
            .map(|stage| stage.work_items.len() * self.settings.workers_per_item)
            .max()
            .unwrap_or(0);

        AgentRequirements {
            peak_concurrent: peak,
            total: peak,
        }
    }
}

/// All work item ids in `text`, deduplicated by exact string, first-seen order
pub fn extract_work_items(text: &str) -> Vec<WorkItemId> {
    scan_work_items(text).0
}

/// Work item ids plus the dotted candidates that were rejected as ids
/// (too many segments).
fn scan_work_items(text: &str) -> (Vec<WorkItemId>, Vec<String>) {
    let mut seen = HashSet::new();
    let mut ids = Vec::new();
    let mut rejected = Vec::new();

    for caps in WORK_ITEM_RE.captures_iter(text) {
        let Some(raw) = caps.get(1) else { continue };
        if is_embedded(text, raw.start(), raw.end()) {
            debug!(candidate = raw.as_str(), "Skipping number embedded in a longer token");
            continue;
        }
        match raw.as_str().parse::<WorkItemId>() {
            Ok(id) => {
                if seen.insert(id.clone()) {
                    ids.push(id);
                }
            }
            Err(e) => {
                debug!(candidate = raw.as_str(), error = %e, "Dotted number is not a work item id");
                if !rejected.iter().any(|r| r == raw.as_str()) {
                    rejected.push(raw.as_str().to_string());
                }
            }
        }
    }

    (ids, rejected)
}

/// The regex has no lookbehind, so `v1.2.3` would otherwise yield `2.3`
/// and `1.2.3v` would yield `1.2`.
fn is_embedded(text: &str, start: usize, end: usize) -> bool {
    let before = text[..start].chars().next_back();
    if matches!(before, Some(c) if c == '.' || c.is_ascii_digit()) {
        return true;
    }
    let mut after = text[end..].chars();
    matches!((after.next(), after.next()), (Some('.'), Some(c)) if c.is_ascii_digit())
}

/// Split at sequential keywords; a single element means no keyword was found
pub fn segment_description(text: &str) -> Vec<&str> {
    SEQUENTIAL_RE
        .split(text)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect()
}

fn is_parallel_segment(segment: &str) -> bool {
    PARALLEL_RE.is_match(segment) || ID_LIST_RE.is_match(segment)
}

fn stage_id(number: usize) -> String {
    format!("stage-{}", number)
}

/// Graph checks: unknown stage references and dependency cycles
pub fn validate_stages(stages: &[Stage]) -> Vec<String> {
    let mut errors = Vec::new();
    let known: HashSet<&str> = stages.iter().map(|s| s.id.as_str()).collect();

    for stage in stages {
        for dep in &stage.depends_on {
            if !known.contains(dep.as_str()) {
                errors.push(format!("Stage '{}' depends on unknown stage '{}'", stage.id, dep));
            }
        }
    }

    for cycle in DependencyGraph::from_stages(stages).find_cycles() {
        errors.push(format!("Circular dependency detected: {}", cycle.join(" -> ")));
    }

    errors
}

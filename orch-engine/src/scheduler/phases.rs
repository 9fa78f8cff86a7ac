//! Dependency-ordered grouping of tasks into phases

use serde::Serialize;
use std::collections::{HashMap, HashSet};
use tracing::warn;

use crate::types::{Phase, Task};

/// Phases plus the ids that had to be forced into the final catch-all phase
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PhasePlan {
    pub phases: Vec<Phase>,
    /// Non-empty when dependencies were circular or pointed at unknown tasks
    pub forced: Vec<String>,
}

impl PhasePlan {
    pub fn task_count(&self) -> usize {
        self.phases.iter().map(Vec::len).sum()
    }

    pub fn is_degraded(&self) -> bool {
        !self.forced.is_empty()
    }
}

/// Group tasks so every task's dependencies finish in an earlier phase.
///
/// A pass that places nothing while tasks remain means the rest can never be
/// satisfied (cycle or unknown id). Those tasks are logged and run together as
/// one last phase instead of failing the workflow.
pub fn plan_phases(tasks: &[Task]) -> PhasePlan {
    let mut completed: HashSet<&str> = HashSet::new();
    let mut remaining: Vec<&Task> = tasks.iter().collect();
    let mut plan = PhasePlan::default();

    while !remaining.is_empty() {
        let (ready, blocked): (Vec<&Task>, Vec<&Task>) = remaining
            .into_iter()
            .partition(|task| task.dependencies.iter().all(|dep| completed.contains(dep.as_str())));

        if ready.is_empty() {
            let forced: Vec<String> = blocked.iter().map(|t| t.id.clone()).collect();
            warn!(
                tasks = ?forced,
                "Circular or unresolved dependencies, forcing remaining tasks into a final phase"
            );
            plan.forced = forced;
            plan.phases.push(blocked.into_iter().cloned().collect());
            break;
        }

        // Only tasks from finished phases satisfy dependencies
        completed.extend(ready.iter().map(|t| t.id.as_str()));
        plan.phases.push(ready.into_iter().cloned().collect());
        remaining = blocked;
    }

    plan
}

pub fn build_phases(tasks: &[Task]) -> Vec<Phase> {
    plan_phases(tasks).phases
}

/// First dependency cycle among `tasks`, as a closed id path (`[a, b, a]`).
/// Dependencies on unknown ids are ignored here.
pub fn find_task_cycle(tasks: &[Task]) -> Option<Vec<String>> {
    let by_id: HashMap<&str, &Task> = tasks.iter().map(|t| (t.id.as_str(), t)).collect();
    let mut finished: HashSet<&str> = HashSet::new();
    let mut on_stack: Vec<&str> = Vec::new();

    fn walk<'a>(
        id: &'a str,
        by_id: &HashMap<&'a str, &'a Task>,
        finished: &mut HashSet<&'a str>,
        on_stack: &mut Vec<&'a str>,
    ) -> Option<Vec<String>> {
        if let Some(pos) = on_stack.iter().position(|n| *n == id) {
            let mut cycle: Vec<String> = on_stack[pos..].iter().map(|s| s.to_string()).collect();
            cycle.push(id.to_string());
            return Some(cycle);
        }
        if finished.contains(id) {
            return None;
        }
        let task = by_id.get(id)?;

        on_stack.push(id);
        for dep in &task.dependencies {
            if let Some(cycle) = walk(dep.as_str(), by_id, finished, on_stack) {
                return Some(cycle);
            }
        }
        on_stack.pop();
        finished.insert(id);
        None
    }

    tasks
        .iter()
        .find_map(|task| walk(task.id.as_str(), &by_id, &mut finished, &mut on_stack))
}

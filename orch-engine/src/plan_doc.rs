//! Execution-plan table written into a work item document

use std::collections::HashMap;
use std::path::Path;
use tracing::info;

use crate::error::Result;
use crate::types::{Task, TaskResult};

pub const PLAN_START_MARKER: &str = "<!-- orch:execution-plan:start -->";
pub const PLAN_END_MARKER: &str = "<!-- orch:execution-plan:end -->";

/// Markdown section (markers included) listing every task and its status.
/// Tasks without a result are `pending`.
pub fn render_execution_plan(tasks: &[Task], results: &[TaskResult]) -> String {
    let status: HashMap<&str, String> = results
        .iter()
        .map(|r| (r.task_id.as_str(), r.status.to_string()))
        .collect();

    let mut out = String::new();
    out.push_str(PLAN_START_MARKER);
    out.push_str("\n## Execution Plan\n\n");
    out.push_str("| Task | Role | Description | Dependencies | Deliverables | Status |\n");
    out.push_str("|------|------|-------------|--------------|--------------|--------|\n");

    for task in tasks {
        let row = [
            cell(&task.id),
            cell(&task.owner_role),
            cell(&task.description),
            cell(&task.dependencies.join(", ")),
            cell(&task.deliverables.join(", ")),
            status
                .get(task.id.as_str())
                .cloned()
                .unwrap_or_else(|| "pending".to_string()),
        ];
        out.push_str(&format!("| {} |\n", row.join(" | ")));
    }

    out.push('\n');
    out.push_str(PLAN_END_MARKER);
    out.push('\n');
    out
}

fn cell(text: &str) -> String {
    let flat = text.replace('\n', " ").replace('|', "\\|");
    if flat.trim().is_empty() {
        "-".to_string()
    } else {
        flat
    }
}

/// Replace a previously written plan section in `path`, or append one.
/// Creates the file when missing.
pub fn write_execution_plan(path: &Path, tasks: &[Task], results: &[TaskResult]) -> Result<()> {
    let section = render_execution_plan(tasks, results);
    let existing = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
        Err(e) => return Err(e.into()),
    };

    let updated = match (existing.find(PLAN_START_MARKER), existing.find(PLAN_END_MARKER)) {
        (Some(start), Some(end)) if end > start => {
            let mut after = end + PLAN_END_MARKER.len();
            if existing[after..].starts_with('\n') {
                after += 1;
            }
            format!("{}{}{}", &existing[..start], section, &existing[after..])
        }
        _ if existing.is_empty() => section,
        _ => {
            let separator = if existing.ends_with('\n') { "\n" } else { "\n\n" };
            format!("{}{}{}", existing, separator, section)
        }
    };

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, updated)?;
    info!(path = %path.display(), tasks = tasks.len(), "Wrote execution plan");
    Ok(())
}

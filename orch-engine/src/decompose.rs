//! Role assignment and task decomposition for work items.
//!
//! Both steps ask an agent through the [`AgentExecutor`] and cache the answer.
//! Neither ever fails the workflow: assignment falls back to the configured
//! fallback roles and decomposition to a built-in plan / implement / verify set.

use orch_sdk::{log_agent_invoked, AgentExecutor};
use serde::Deserialize;
use serde_json::json;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::cache::{OrchestrationCache, AGENT_ASSIGNMENT, TASK_DECOMPOSITION};
use crate::config::AgentsConfig;
use crate::error::{OrchError, Result};
use crate::types::{Stage, Task, WorkItemId};
use crate::yaml::decode_response;

#[derive(Deserialize)]
#[serde(untagged)]
enum RolesAnswer {
    List(Vec<String>),
    Wrapped {
        #[serde(alias = "agents")]
        roles: Vec<String>,
    },
}

impl RolesAnswer {
    fn into_roles(self) -> Vec<String> {
        match self {
            RolesAnswer::List(roles) | RolesAnswer::Wrapped { roles } => roles,
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct DraftTask {
    #[serde(default, alias = "taskId")]
    id: Option<String>,
    #[serde(alias = "title")]
    description: String,
    #[serde(default)]
    dependencies: Vec<String>,
    #[serde(default)]
    deliverables: Vec<String>,
    #[serde(default, alias = "acceptance_criteria")]
    acceptance_criteria: Vec<String>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum TasksAnswer {
    List(Vec<DraftTask>),
    Wrapped { tasks: Vec<DraftTask> },
}

pub struct Decomposer {
    executor: Arc<dyn AgentExecutor>,
    cache: Arc<OrchestrationCache>,
    agents: AgentsConfig,
}

impl Decomposer {
    pub fn new(executor: Arc<dyn AgentExecutor>, cache: Arc<OrchestrationCache>, agents: AgentsConfig) -> Self {
        Self {
            executor,
            cache,
            agents,
        }
    }

    /// Roles that should work on `work_item`.
    ///
    /// When `available_roles` is non-empty, answers naming other roles are
    /// filtered out.
    pub async fn assign_roles(&self, work_item: &WorkItemId, available_roles: &[String]) -> Vec<String> {
        let key = json!({ "workItem": work_item, "roles": available_roles });
        let answer = self
            .cache
            .with_cache(AGENT_ASSIGNMENT, &key, || self.ask_roles(work_item, available_roles))
            .await;

        let roles = match answer {
            Ok(roles) => {
                let known: BTreeSet<&str> = available_roles.iter().map(String::as_str).collect();
                let mut seen = BTreeSet::new();
                roles
                    .into_iter()
                    .filter(|r| known.is_empty() || known.contains(r.as_str()))
                    .filter(|r| seen.insert(r.clone()))
                    .collect::<Vec<String>>()
            }
            Err(e) => {
                warn!(work_item = %work_item, error = %e, "Role assignment failed, using fallback roles");
                Vec::new()
            }
        };

        if roles.is_empty() {
            log_agent_invoked!(self.agents.coordinator_role, "assignment", true);
            return self.agents.fallback_roles.clone();
        }

        info!(work_item = %work_item, roles = ?roles, "Assigned roles");
        roles
    }

    async fn ask_roles(&self, work_item: &WorkItemId, available_roles: &[String]) -> Result<Vec<String>> {
        let coordinator = &self.agents.coordinator_role;
        log_agent_invoked!(coordinator, "assignment", false);

        let prompt = format!(
            "Which roles should work on work item {}? Respond with YAML: roles (list of role names).",
            work_item
        );
        let context = json!({ "workItem": work_item, "availableRoles": available_roles });
        let raw = self.executor.invoke(coordinator, &prompt, &context).await?;
        let roles = decode_response::<RolesAnswer>(&raw)?.into_roles();

        if roles.is_empty() {
            return Err(OrchError::Validation(format!("no roles assigned to {}", work_item)));
        }
        Ok(roles)
    }

    /// Tasks `role` performs for `work_item`, with ids unique per item and role
    pub async fn decompose(&self, work_item: &WorkItemId, role: &str) -> Vec<Task> {
        let key = json!({ "workItem": work_item, "role": role });
        let answer = self
            .cache
            .with_cache(TASK_DECOMPOSITION, &key, || self.ask_tasks(work_item, role))
            .await;

        match answer {
            Ok(tasks) => tasks,
            Err(e) => {
                warn!(work_item = %work_item, role, error = %e, "Decomposition failed, using fallback tasks");
                log_agent_invoked!(role, "decomposition", true);
                fallback_tasks(work_item, role)
            }
        }
    }

    async fn ask_tasks(&self, work_item: &WorkItemId, role: &str) -> Result<Vec<Task>> {
        log_agent_invoked!(role, "decomposition", false);

        let prompt = format!(
            "Break work item {} into tasks for the {} role. Respond with YAML: tasks (list of id, \
             description, dependencies, deliverables, acceptanceCriteria).",
            work_item, role
        );
        let context = json!({ "workItem": work_item, "role": role });
        let raw = self.executor.invoke(role, &prompt, &context).await?;

        let drafts = match decode_response::<TasksAnswer>(&raw)? {
            TasksAnswer::List(tasks) | TasksAnswer::Wrapped { tasks } => tasks,
        };
        if drafts.is_empty() {
            return Err(OrchError::Validation(format!("no tasks returned for {} / {}", work_item, role)));
        }

        Ok(normalize_drafts(work_item, role, drafts))
    }
}

/// Give drafts stable ids and rewrite their dependencies to match.
/// Dependencies on ids outside the answer are dropped.
fn normalize_drafts(work_item: &WorkItemId, role: &str, drafts: Vec<DraftTask>) -> Vec<Task> {
    let prefix = format!("{}-{}", work_item.slug(), role);
    let renamed: HashMap<String, String> = drafts
        .iter()
        .enumerate()
        .map(|(idx, draft)| {
            let original = draft.id.clone().unwrap_or_else(|| (idx + 1).to_string());
            (original, format!("{}-{}", prefix, idx + 1))
        })
        .collect();

    drafts
        .into_iter()
        .enumerate()
        .map(|(idx, draft)| {
            let dependencies = draft
                .dependencies
                .iter()
                .filter_map(|dep| {
                    let mapped = renamed.get(dep).cloned();
                    if mapped.is_none() {
                        debug!(dependency = %dep, "Dropping dependency outside decomposition answer");
                    }
                    mapped
                })
                .collect();

            Task {
                id: format!("{}-{}", prefix, idx + 1),
                owner_role: role.to_string(),
                description: draft.description,
                dependencies,
                deliverables: draft.deliverables,
                acceptance_criteria: draft.acceptance_criteria,
                work_item: Some(work_item.clone()),
            }
        })
        .collect()
}

/// Conservative plan -> implement -> verify chain for one role
pub fn fallback_tasks(work_item: &WorkItemId, role: &str) -> Vec<Task> {
    let prefix = format!("{}-{}", work_item.slug(), role);
    let step = |name: &str, description: String, deps: Vec<String>, deliverable: String| Task {
        id: format!("{}-{}", prefix, name),
        owner_role: role.to_string(),
        description,
        dependencies: deps,
        deliverables: vec![deliverable],
        acceptance_criteria: Vec::new(),
        work_item: Some(work_item.clone()),
    };

    let plan = step(
        "plan",
        format!("Plan {} work for {}", role, work_item),
        Vec::new(),
        format!("{} plan for {}", role, work_item),
    );
    let implement = step(
        "implement",
        format!("Carry out {} work for {}", role, work_item),
        vec![plan.id.clone()],
        format!("{} changes for {}", role, work_item),
    );
    let mut verify = step(
        "verify",
        format!("Verify {} work for {}", role, work_item),
        vec![implement.id.clone()],
        format!("{} verification notes for {}", role, work_item),
    );
    verify.acceptance_criteria = vec!["Deliverables reviewed against the work item".to_string()];

    vec![plan, implement, verify]
}

/// Turn stage ordering into task dependencies.
///
/// Root tasks (no dependencies yet) of every item in a stage depend on all
/// tasks of the stages it depends on. Inside a sequential stage, each item's
/// roots also depend on the previous item's tasks.
pub fn link_stages(stages: &[Stage], tasks: &mut [Task]) {
    let mut by_item: HashMap<WorkItemId, Vec<String>> = HashMap::new();
    let mut roots: HashMap<WorkItemId, BTreeSet<String>> = HashMap::new();
    for task in tasks.iter() {
        if let Some(item) = &task.work_item {
            by_item.entry(item.clone()).or_default().push(task.id.clone());
            if task.dependencies.is_empty() {
                roots.entry(item.clone()).or_default().insert(task.id.clone());
            }
        }
    }

    let stage_tasks = |stage: &Stage| -> Vec<String> {
        stage
            .work_items
            .iter()
            .flat_map(|item| by_item.get(item).cloned().unwrap_or_default())
            .collect()
    };

    let mut extra: HashMap<String, Vec<String>> = HashMap::new();
    for stage in stages {
        let upstream: Vec<String> = stages
            .iter()
            .filter(|s| stage.depends_on.contains(&s.id))
            .flat_map(|s| stage_tasks(s))
            .collect();

        for (pos, item) in stage.work_items.iter().enumerate() {
            let mut deps = upstream.clone();
            if !stage.parallel && pos > 0 {
                let previous = &stage.work_items[pos - 1];
                deps.extend(by_item.get(previous).cloned().unwrap_or_default());
            }
            if deps.is_empty() {
                continue;
            }
            for root in roots.get(item).into_iter().flatten() {
                extra.entry(root.clone()).or_default().extend(deps.iter().cloned());
            }
        }
    }

    for task in tasks.iter_mut() {
        if let Some(deps) = extra.remove(&task.id) {
            for dep in deps {
                if !task.dependencies.contains(&dep) {
                    task.dependencies.push(dep);
                }
            }
        }
    }
}

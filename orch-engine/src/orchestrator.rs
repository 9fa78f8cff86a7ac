//! Run-scoped orchestration: plan a request into phases, execute them, and
//! collect sign-offs.
//!
//! Every [`Orchestrator`] owns its own cache handle, hub, knowledge base, and
//! protocol registry, so concurrent runs in one process share nothing implicit.

use futures::future::join_all;
use orch_sdk::AgentExecutor;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cache::{OrchestrationCache, PARSED_WORKFLOW};
use crate::comms::{
    CollaborationProtocols, CommunicationHub, ExecutorResponder, KnowledgeBase, ProtocolInstance, ProtocolStatus,
};
use crate::config::OrchConfig;
use crate::decompose::{link_stages, Decomposer};
use crate::error::{OrchError, Result};
use crate::parser::{ParsedWorkflow, WorkflowParser};
use crate::roster::{
    classify_request, plan_for_agents, verify_invocation, AgentRoster, InvocationPlan, InvocationReport,
};
use crate::scheduler::{find_task_cycle, plan_phases, PhasePlan, PhaseScheduler};
use crate::signoff::{collect_sign_offs, overall_approval, roles_that_ran};
use crate::types::{SignOff, Task, TaskResult, TaskStatus, WorkItemId};

/// What the caller asked for
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Request {
    WorkItem(WorkItemId),
    Describe(String),
}

impl Request {
    pub fn text(&self) -> String {
        match self {
            Request::WorkItem(id) => id.to_string(),
            Request::Describe(text) => text.clone(),
        }
    }
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Request::WorkItem(id) => write!(f, "work item {}", id),
            Request::Describe(text) => write!(f, "\"{}\"", text),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrchestrationPlan {
    pub request: Request,
    pub workflow: ParsedWorkflow,
    pub invocation: InvocationPlan,
    /// Work item -> roles working on it
    pub roles_by_item: BTreeMap<String, Vec<String>>,
    pub tasks: Vec<Task>,
    pub phase_plan: PhasePlan,
    /// Task dependency cycle, if one was found
    pub cycle: Option<Vec<String>>,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrchestrationReport {
    pub channel_id: String,
    pub results: Vec<TaskResult>,
    pub phases_run: usize,
    /// Failure that stopped the run under the halt policy
    pub halted: Option<String>,
    /// Collaboration protocol run over the finished work, if any
    pub review: Option<ProtocolInstance>,
    pub sign_offs: Vec<SignOff>,
    pub approved: bool,
    pub invocation: InvocationReport,
    pub artifacts: Vec<String>,
}

impl OrchestrationReport {
    pub fn failures(&self) -> Vec<&TaskResult> {
        self.results
            .iter()
            .filter(|r| r.status == TaskStatus::Failed)
            .collect()
    }

    pub fn deferred(&self) -> Vec<&TaskResult> {
        self.results
            .iter()
            .filter(|r| r.status == TaskStatus::Deferred)
            .collect()
    }

    /// No halt and no failed task
    pub fn succeeded(&self) -> bool {
        self.halted.is_none() && self.failures().is_empty()
    }
}

pub struct Orchestrator {
    config: OrchConfig,
    executor: Arc<dyn AgentExecutor>,
    cache: Arc<OrchestrationCache>,
    hub: Arc<CommunicationHub>,
    knowledge: Arc<KnowledgeBase>,
    protocols: Arc<CollaborationProtocols>,
    parser: WorkflowParser,
    roster: AgentRoster,
}

impl Orchestrator {
    /// Open the cache (evicting expired entries) and discover the roster when
    /// a team directory is configured.
    pub async fn new(config: OrchConfig, executor: Arc<dyn AgentExecutor>) -> Result<Self> {
        let cache = Arc::new(OrchestrationCache::open(&config.cache).await);
        Self::with_cache(config, executor, cache).await
    }

    pub async fn with_cache(
        config: OrchConfig,
        executor: Arc<dyn AgentExecutor>,
        cache: Arc<OrchestrationCache>,
    ) -> Result<Self> {
        cache.cleanup().await;

        let roster = match &config.agents.team_dir {
            Some(dir) => AgentRoster::discover(dir, &config.agents.excluded_patterns).unwrap_or_else(|e| {
                warn!(error = %e, "Agent discovery failed, continuing without a roster");
                AgentRoster::default()
            }),
            None => AgentRoster::default(),
        };

        let hub = Arc::new(CommunicationHub::new());
        let responder = Arc::new(ExecutorResponder::new(executor.clone()));
        let protocols = Arc::new(CollaborationProtocols::with_builtin_protocols(hub.clone(), responder).await);

        Ok(Self {
            parser: WorkflowParser::new(config.parser.clone()),
            knowledge: Arc::new(KnowledgeBase::new()),
            config,
            executor,
            cache,
            hub,
            protocols,
            roster,
        })
    }

    pub fn with_roster(mut self, roster: AgentRoster) -> Self {
        self.roster = roster;
        self
    }

    pub fn config(&self) -> &OrchConfig {
        &self.config
    }

    pub fn cache(&self) -> &Arc<OrchestrationCache> {
        &self.cache
    }

    pub fn hub(&self) -> &Arc<CommunicationHub> {
        &self.hub
    }

    pub fn knowledge(&self) -> &Arc<KnowledgeBase> {
        &self.knowledge
    }

    pub fn roster(&self) -> &AgentRoster {
        &self.roster
    }

    /// Parse a free-text request, cached per description
    pub async fn parse(&self, description: &str) -> ParsedWorkflow {
        let parser = &self.parser;
        let parsed: std::result::Result<ParsedWorkflow, OrchError> = self
            .cache
            .with_cache(PARSED_WORKFLOW, description, || async { Ok(parser.parse(description)) })
            .await;
        parsed.unwrap_or_else(|_| parser.parse(description))
    }

    /// Run a named collaboration protocol with this run's hub
    pub async fn collaborate(
        &self,
        protocol: &str,
        agents: Vec<String>,
        context: serde_json::Value,
    ) -> Result<ProtocolInstance> {
        self.protocols.start_protocol(protocol, agents, context).await
    }

    pub async fn plan(&self, request: &Request) -> Result<OrchestrationPlan> {
        let (workflow, request_type) = match request {
            Request::WorkItem(id) => (self.parser.single_item(id.clone()), "work_item".to_string()),
            Request::Describe(text) => (
                self.parse(text).await,
                classify_request(text, &self.config.invocation_aliases),
            ),
        };

        if workflow.stages.is_empty() {
            return Err(OrchError::Validation(workflow.validation_errors.join("; ")));
        }

        let mut warnings = workflow.validation_errors.clone();
        let request_text = request.text();
        let decomposer = Decomposer::new(self.executor.clone(), self.cache.clone(), self.config.agents.clone());
        let available = self.roster.valid_roles();

        // Roles per work item, completed by the configured group rules
        let (text, kind) = (request_text.as_str(), request_type.as_str());
        let assignments = join_all(workflow.work_items.iter().map(|item| {
            let decomposer = &decomposer;
            let available = &available;
            async move {
                let roles = decomposer.assign_roles(item, available).await;
                let item_plan = plan_for_agents(text, kind, roles, &self.config);
                (item.clone(), item_plan.agents)
            }
        }))
        .await;

        let mut all_roles: Vec<String> = Vec::new();
        let mut seen = BTreeSet::new();
        for (_, roles) in &assignments {
            all_roles.extend(roles.iter().filter(|r| seen.insert(r.to_string())).cloned());
        }
        let invocation = plan_for_agents(&request_text, &request_type, all_roles, &self.config);
        warnings.extend(invocation.warnings.iter().cloned());

        let decomposed = join_all(assignments.iter().flat_map(|(item, roles)| {
            let decomposer = &decomposer;
            roles
                .iter()
                .map(move |role| async move { decomposer.decompose(item, role).await })
        }))
        .await;
        let mut tasks: Vec<Task> = decomposed.into_iter().flatten().collect();

        link_stages(&workflow.stages, &mut tasks);

        let cycle = find_task_cycle(&tasks);
        if let Some(cycle) = &cycle {
            if self.config.scheduler.strict_dependencies {
                return Err(OrchError::CircularDependency(cycle.clone()));
            }
            warn!(cycle = %cycle.join(" -> "), "Task dependency cycle, phases will degrade");
            warnings.push(format!("Circular task dependency: {}", cycle.join(" -> ")));
        }

        let phase_plan = plan_phases(&tasks);
        if phase_plan.is_degraded() {
            warnings.push(format!(
                "{} task(s) forced into a final phase: {}",
                phase_plan.forced.len(),
                phase_plan.forced.join(", ")
            ));
        }

        info!(
            request = %request,
            stages = workflow.stages.len(),
            tasks = tasks.len(),
            phases = phase_plan.phases.len(),
            "Planned orchestration"
        );

        Ok(OrchestrationPlan {
            request: request.clone(),
            roles_by_item: assignments
                .into_iter()
                .map(|(item, roles)| (item.to_string(), roles))
                .collect(),
            workflow,
            invocation,
            tasks,
            phase_plan,
            cycle,
            warnings,
        })
    }

    pub async fn execute(&self, plan: &OrchestrationPlan) -> Result<OrchestrationReport> {
        let run_id = Uuid::new_v4();
        let channel_id = self
            .hub
            .create_channel(&format!("run-{}", run_id), plan.invocation.agents.iter().cloned())
            .await;
        self.hub
            .broadcast(
                &self.config.agents.coordinator_role,
                json!({
                    "event": "run-started",
                    "request": plan.request.text(),
                    "phases": plan.phase_plan.phases.len(),
                }),
            )
            .await;

        let scheduler = PhaseScheduler::new(self.executor.clone(), self.config.scheduler.clone())
            .with_channel(self.hub.clone(), channel_id.clone());
        let outcome = scheduler.run(&plan.phase_plan.phases).await;

        let mut artifacts = Vec::with_capacity(outcome.results.len());
        for result in &outcome.results {
            let content = serde_json::to_value(result)?;
            artifacts.push(self.knowledge.share_artifact(&result.role, "task-result", content).await);
            self.knowledge
                .add_knowledge(
                    &result.role,
                    "task-results",
                    json!({ "taskId": result.task_id, "status": result.status, "output": result.output }),
                    vec![result.status.to_string()],
                )
                .await;
        }

        let review = self.review_results(&outcome.results).await;
        let review_passed = review
            .as_ref()
            .map_or(true, |instance| instance.status == ProtocolStatus::Completed);

        let sign_offs = collect_sign_offs(&self.executor, &plan.invocation.agents, &outcome.results).await;
        let approved = review_passed && overall_approval(&sign_offs);
        let invocation = verify_invocation(
            &plan.invocation,
            &roles_that_ran(&outcome.results),
            &self.config.agents.critical_agents,
        );

        let halted = outcome.halted.map(|e| e.to_string());
        info!(
            results = outcome.results.len(),
            phases_run = outcome.phases_run,
            approved,
            halted = halted.is_some(),
            "Orchestration finished"
        );

        Ok(OrchestrationReport {
            channel_id,
            results: outcome.results,
            phases_run: outcome.phases_run,
            halted,
            review,
            sign_offs,
            approved,
            invocation,
            artifacts,
        })
    }

    /// Run the configured review protocol with every role that completed a
    /// task as the cast. Needs at least two such roles.
    async fn review_results(&self, results: &[TaskResult]) -> Option<ProtocolInstance> {
        let protocol = self.config.agents.review_protocol.as_deref()?;
        let cast = roles_that_ran(results);
        if cast.len() < 2 {
            debug!(roles = cast.len(), "Too few roles finished work for a review protocol");
            return None;
        }

        let summary: Vec<_> = results
            .iter()
            .map(|r| json!({ "taskId": r.task_id, "role": r.role, "status": r.status }))
            .collect();
        let instance = match self.collaborate(protocol, cast, json!({ "results": summary })).await {
            Ok(instance) => instance,
            Err(e) => {
                warn!(protocol, error = %e, "Review protocol could not start");
                return None;
            }
        };

        self.knowledge
            .add_knowledge(
                &self.config.agents.coordinator_role,
                "protocol-outcomes",
                json!({ "protocol": protocol, "instance": instance.id, "status": instance.status, "steps": instance.results }),
                vec![protocol.to_string()],
            )
            .await;
        info!(protocol, instance = %instance.id, status = ?instance.status, "Review protocol finished");
        Some(instance)
    }

    pub async fn run(&self, request: &Request) -> Result<OrchestrationReport> {
        let plan = self.plan(request).await?;
        self.execute(&plan).await
    }
}

//! Scripted multi-step collaboration between roles.
//!
//! A protocol is a named list of [`ProtocolStep`]s. Steps refer to
//! participating roles by their position in the `agents` list given to
//! [`CollaborationProtocols::start_protocol`], so one definition serves any
//! cast. Steps run strictly in order over the [`CommunicationHub`]; a step
//! whose result is [`StepAction::Abort`] (or a rejection on a step marked
//! `on_reject: abort`) stops the run.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use orch_sdk::{log_agent_invoked, AgentExecutor};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::hub::CommunicationHub;
use crate::error::{OrchError, Result};
use crate::yaml::decode_response;

// ============================================================================
// Definitions
// ============================================================================

/// What happens when a step's verdict is negative
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnReject {
    #[default]
    Continue,
    Abort,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProtocolStep {
    /// `from` asks `to` for information over a short-lived conversation
    Request {
        from: usize,
        to: usize,
        prompt: String,
    },
    /// `reviewer` evaluates `author`'s work
    Review {
        reviewer: usize,
        author: usize,
        subject: String,
        #[serde(default)]
        on_reject: OnReject,
    },
    /// Every voter casts a boolean vote; strict majority approves.
    /// An empty `voters` list means every participating agent.
    Consensus {
        #[serde(default)]
        voters: Vec<usize>,
        proposal: String,
        #[serde(default)]
        on_reject: OnReject,
    },
    /// `from` hands `task` to `to`
    Delegation {
        from: usize,
        to: usize,
        task: String,
        #[serde(default)]
        on_reject: OnReject,
    },
}

impl ProtocolStep {
    fn agent_indices(&self) -> Vec<usize> {
        match self {
            ProtocolStep::Request { from, to, .. } | ProtocolStep::Delegation { from, to, .. } => vec![*from, *to],
            ProtocolStep::Review { reviewer, author, .. } => vec![*reviewer, *author],
            ProtocolStep::Consensus { voters, .. } => voters.clone(),
        }
    }

    fn on_reject(&self) -> OnReject {
        match self {
            ProtocolStep::Request { .. } => OnReject::Continue,
            ProtocolStep::Review { on_reject, .. }
            | ProtocolStep::Consensus { on_reject, .. }
            | ProtocolStep::Delegation { on_reject, .. } => *on_reject,
        }
    }

    fn label(&self) -> &'static str {
        match self {
            ProtocolStep::Request { .. } => "request",
            ProtocolStep::Review { .. } => "review",
            ProtocolStep::Consensus { .. } => "consensus",
            ProtocolStep::Delegation { .. } => "delegation",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepAction {
    Continue,
    Approve,
    Reject,
    Abort,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepResult {
    pub step: usize,
    #[serde(rename = "type")]
    pub kind: String,
    pub action: StepAction,
    pub output: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProtocolStatus {
    Running,
    Completed,
    Aborted,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProtocolInstance {
    pub id: String,
    pub protocol_name: String,
    pub agents: Vec<String>,
    pub context: Value,
    pub current_step: usize,
    pub results: Vec<StepResult>,
    pub status: ProtocolStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

// ============================================================================
// Responders
// ============================================================================

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ReviewVerdict {
    pub approved: bool,
    #[serde(default)]
    pub suggestions: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DelegationReply {
    pub accepted: bool,
    #[serde(default, alias = "estimate_minutes")]
    pub estimate_minutes: Option<f64>,
    #[serde(default)]
    pub notes: Option<String>,
}

/// Produces each role's side of a protocol step
#[async_trait]
pub trait CollaborationResponder: Send + Sync {
    async fn answer(&self, from: &str, to: &str, prompt: &str, context: &Value) -> Result<Value>;

    async fn review(&self, reviewer: &str, author: &str, subject: &str, context: &Value) -> Result<ReviewVerdict>;

    async fn vote(&self, voter: &str, proposal: &str, context: &Value) -> Result<bool>;

    async fn accept_delegation(&self, from: &str, to: &str, task: &str, context: &Value) -> Result<DelegationReply>;
}

/// Answers protocol steps by asking the role through an [`AgentExecutor`]
pub struct ExecutorResponder<E> {
    executor: E,
}

impl<E: AgentExecutor> ExecutorResponder<E> {
    pub fn new(executor: E) -> Self {
        Self { executor }
    }

    async fn ask(&self, role: &str, purpose: &str, prompt: String, context: &Value) -> Result<Value> {
        log_agent_invoked!(role, purpose, false);
        Ok(self.executor.invoke(role, &prompt, context).await?)
    }
}

#[derive(Deserialize)]
struct VoteAnswer {
    #[serde(alias = "approve", alias = "approved")]
    vote: bool,
}

#[async_trait]
impl<E: AgentExecutor> CollaborationResponder for ExecutorResponder<E> {
    async fn answer(&self, from: &str, to: &str, prompt: &str, context: &Value) -> Result<Value> {
        self.ask(to, "request", format!("Request from {}: {}", from, prompt), context)
            .await
    }

    async fn review(&self, reviewer: &str, author: &str, subject: &str, context: &Value) -> Result<ReviewVerdict> {
        let prompt = format!(
            "Review {} by {}. Respond with YAML: approved (bool), suggestions (list).",
            subject, author
        );
        let raw = self.ask(reviewer, "review", prompt, context).await?;
        decode_response(&raw)
    }

    async fn vote(&self, voter: &str, proposal: &str, context: &Value) -> Result<bool> {
        let prompt = format!("Vote on proposal: {}. Respond with YAML: vote (bool).", proposal);
        let raw = self.ask(voter, "consensus", prompt, context).await?;
        match raw {
            Value::Bool(vote) => Ok(vote),
            other => Ok(decode_response::<VoteAnswer>(&other)?.vote),
        }
    }

    async fn accept_delegation(&self, from: &str, to: &str, task: &str, context: &Value) -> Result<DelegationReply> {
        let prompt = format!(
            "{} delegates to you: {}. Respond with YAML: accepted (bool), estimate_minutes, notes.",
            from, task
        );
        let raw = self.ask(to, "delegation", prompt, context).await?;
        decode_response(&raw)
    }
}

// ============================================================================
// Registry and runner
// ============================================================================

/// Protocol definitions plus every instance started from them
pub struct CollaborationProtocols {
    hub: Arc<CommunicationHub>,
    responder: Arc<dyn CollaborationResponder>,
    protocols: RwLock<HashMap<String, Vec<ProtocolStep>>>,
    instances: RwLock<HashMap<String, ProtocolInstance>>,
}

impl CollaborationProtocols {
    pub fn new(hub: Arc<CommunicationHub>, responder: Arc<dyn CollaborationResponder>) -> Self {
        Self {
            hub,
            responder,
            protocols: RwLock::new(HashMap::new()),
            instances: RwLock::new(HashMap::new()),
        }
    }

    /// Registry preloaded with `peer-review`, `consensus-decision`, and `task-handoff`
    pub async fn with_builtin_protocols(hub: Arc<CommunicationHub>, responder: Arc<dyn CollaborationResponder>) -> Self {
        let registry = Self::new(hub, responder);
        for (name, steps) in builtin_protocols() {
            if let Err(e) = registry.define_protocol(name, steps).await {
                warn!(protocol = name, error = %e, "Built-in protocol rejected");
            }
        }
        registry
    }

    pub async fn define_protocol(&self, name: &str, steps: Vec<ProtocolStep>) -> Result<()> {
        if steps.is_empty() {
            return Err(OrchError::Validation(format!("protocol '{}' has no steps", name)));
        }
        for (idx, step) in steps.iter().enumerate() {
            if let ProtocolStep::Consensus { voters, .. } = step {
                let mut seen = HashSet::new();
                if let Some(repeated) = voters.iter().find(|v| !seen.insert(**v)) {
                    return Err(OrchError::Validation(format!(
                        "protocol '{}' step {} lists voter #{} more than once",
                        name, idx, repeated
                    )));
                }
            }
        }
        debug!(protocol = name, steps = steps.len(), "Defined protocol");
        self.protocols.write().await.insert(name.to_string(), steps);
        Ok(())
    }

    pub async fn protocol_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.protocols.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn instance(&self, id: &str) -> Option<ProtocolInstance> {
        self.instances.read().await.get(id).cloned()
    }

    /// Run `name` to completion (or abort) with `agents` as the cast
    pub async fn start_protocol(&self, name: &str, agents: Vec<String>, context: Value) -> Result<ProtocolInstance> {
        let steps = self
            .protocols
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| OrchError::NotFound(format!("protocol '{}'", name)))?;

        for (idx, step) in steps.iter().enumerate() {
            if let Some(bad) = step.agent_indices().into_iter().find(|i| *i >= agents.len()) {
                return Err(OrchError::Validation(format!(
                    "protocol '{}' step {} refers to agent #{} but only {} agents were given",
                    name,
                    idx,
                    bad,
                    agents.len()
                )));
            }
        }

        let mut instance = ProtocolInstance {
            id: format!("protocol-{}", Uuid::new_v4()),
            protocol_name: name.to_string(),
            agents,
            context,
            current_step: 0,
            results: Vec::new(),
            status: ProtocolStatus::Running,
            started_at: Utc::now(),
            finished_at: None,
        };

        info!(protocol = name, instance = %instance.id, agents = ?instance.agents, "Starting protocol");
        self.instances
            .write()
            .await
            .insert(instance.id.clone(), instance.clone());

        for (idx, step) in steps.iter().enumerate() {
            instance.current_step = idx;
            let result = self.run_step(&instance, idx, step).await;

            let halt = result.action == StepAction::Abort
                || (result.action == StepAction::Reject && step.on_reject() == OnReject::Abort);
            instance.results.push(result);

            if halt {
                warn!(protocol = name, instance = %instance.id, step = idx, "Protocol aborted");
                instance.status = ProtocolStatus::Aborted;
                break;
            }
        }

        if instance.status == ProtocolStatus::Running {
            instance.status = ProtocolStatus::Completed;
        }
        instance.finished_at = Some(Utc::now());

        self.instances
            .write()
            .await
            .insert(instance.id.clone(), instance.clone());
        Ok(instance)
    }

    async fn run_step(&self, instance: &ProtocolInstance, idx: usize, step: &ProtocolStep) -> StepResult {
        let context = json!({
            "protocol": instance.protocol_name,
            "context": instance.context,
            "previous": instance.results,
        });
        let agent = |i: usize| instance.agents[i].as_str();

        let outcome = match step {
            ProtocolStep::Request { from, to, prompt } => self.request(agent(*from), agent(*to), prompt, &context).await,
            ProtocolStep::Review {
                reviewer,
                author,
                subject,
                ..
            } => self.review(agent(*reviewer), agent(*author), subject, &context).await,
            ProtocolStep::Consensus { voters, proposal, .. } => {
                let named: Vec<&str> = if voters.is_empty() {
                    instance.agents.iter().map(String::as_str).collect()
                } else {
                    voters.iter().map(|i| agent(*i)).collect()
                };
                // One ballot per distinct agent, even when the cast repeats a name
                let mut seen = HashSet::new();
                let cast: Vec<&str> = named.into_iter().filter(|name| seen.insert(*name)).collect();
                self.consensus(&instance.id, &cast, proposal, &context).await
            }
            ProtocolStep::Delegation { from, to, task, .. } => {
                self.delegate(agent(*from), agent(*to), task, &context).await
            }
        };

        let (action, output) = outcome.unwrap_or_else(|e| {
            warn!(step = idx, kind = step.label(), error = %e, "Protocol step failed");
            (StepAction::Abort, json!({ "error": e.to_string() }))
        });

        StepResult {
            step: idx,
            kind: step.label().to_string(),
            action,
            output,
        }
    }

    async fn request(&self, from: &str, to: &str, prompt: &str, context: &Value) -> Result<(StepAction, Value)> {
        let conversation = self.hub.start_conversation(from, [to], prompt).await;
        self.hub
            .add_to_conversation(&conversation, from, json!(prompt))
            .await?;

        let answer = self.responder.answer(from, to, prompt, context).await?;
        self.hub
            .add_to_conversation(&conversation, to, answer.clone())
            .await?;
        self.hub
            .end_conversation(&conversation, &format!("{} answered {}", to, from))
            .await?;

        Ok((
            StepAction::Continue,
            json!({ "conversationId": conversation, "answer": answer }),
        ))
    }

    async fn review(&self, reviewer: &str, author: &str, subject: &str, context: &Value) -> Result<(StepAction, Value)> {
        self.hub
            .send_direct_message(author, reviewer, json!({ "reviewRequest": subject }))
            .await;

        let verdict = self.responder.review(reviewer, author, subject, context).await?;
        self.hub
            .send_direct_message(reviewer, author, serde_json::to_value(&verdict)?)
            .await;

        let action = if verdict.approved {
            StepAction::Approve
        } else {
            StepAction::Reject
        };
        Ok((action, serde_json::to_value(verdict)?))
    }

    async fn consensus(
        &self,
        instance_id: &str,
        voters: &[&str],
        proposal: &str,
        context: &Value,
    ) -> Result<(StepAction, Value)> {
        let channel = self
            .hub
            .create_channel(&format!("consensus-{}", instance_id), voters.iter().copied())
            .await;
        if let Some(first) = voters.first() {
            self.hub
                .send_to_channel(&channel, first, json!({ "proposal": proposal }))
                .await?;
        }

        let ballots = join_all(
            voters
                .iter()
                .map(|voter| self.responder.vote(voter, proposal, context)),
        )
        .await;

        let mut votes = serde_json::Map::new();
        let mut yes = 0;
        for (voter, ballot) in voters.iter().zip(ballots) {
            let vote = ballot?;
            self.hub
                .send_to_channel(&channel, voter, json!({ "vote": vote }))
                .await?;
            if vote {
                yes += 1;
            }
            votes.insert(voter.to_string(), Value::Bool(vote));
        }

        let action = if is_strict_majority(yes, voters.len()) {
            StepAction::Approve
        } else {
            StepAction::Reject
        };

        Ok((
            action,
            json!({ "votes": votes, "approvals": yes, "total": voters.len() }),
        ))
    }

    async fn delegate(&self, from: &str, to: &str, task: &str, context: &Value) -> Result<(StepAction, Value)> {
        self.hub
            .send_direct_message(from, to, json!({ "delegatedTask": task }))
            .await;

        let reply = self.responder.accept_delegation(from, to, task, context).await?;
        let action = if reply.accepted {
            StepAction::Continue
        } else {
            StepAction::Reject
        };
        Ok((action, serde_json::to_value(reply)?))
    }
}

/// More than half of `total` voted yes
pub fn is_strict_majority(yes: usize, total: usize) -> bool {
    yes * 2 > total
}

fn builtin_protocols() -> Vec<(&'static str, Vec<ProtocolStep>)> {
    vec![
        (
            "peer-review",
            vec![ProtocolStep::Review {
                reviewer: 1,
                author: 0,
                subject: "the submitted deliverable".to_string(),
                on_reject: OnReject::Continue,
            }],
        ),
        (
            "consensus-decision",
            vec![ProtocolStep::Consensus {
                voters: Vec::new(),
                proposal: "the proposed approach".to_string(),
                on_reject: OnReject::Abort,
            }],
        ),
        (
            "task-handoff",
            vec![
                ProtocolStep::Delegation {
                    from: 0,
                    to: 1,
                    task: "the handed-off task".to_string(),
                    on_reject: OnReject::Abort,
                },
                ProtocolStep::Request {
                    from: 1,
                    to: 0,
                    prompt: "Share any context needed to continue the task".to_string(),
                },
            ],
        ),
    ]
}

//! Tests for the hub, knowledge base, and collaboration protocols

use async_trait::async_trait;
use orch_engine::comms::*;
use orch_engine::error::{OrchError, Result};
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::Arc;

/// Votes yes for the listed agents, approves reviews from them, and accepts
/// delegations only when the receiver is listed.
struct FixedResponder {
    yes: HashSet<String>,
}

impl FixedResponder {
    fn new(yes: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            yes: yes.iter().map(|s| s.to_string()).collect(),
        })
    }
}

#[async_trait]
impl CollaborationResponder for FixedResponder {
    async fn answer(&self, _from: &str, to: &str, prompt: &str, _context: &Value) -> Result<Value> {
        Ok(json!({ "from": to, "re": prompt }))
    }

    async fn review(&self, reviewer: &str, _author: &str, _subject: &str, _context: &Value) -> Result<ReviewVerdict> {
        Ok(ReviewVerdict {
            approved: self.yes.contains(reviewer),
            suggestions: vec!["add tests".to_string()],
        })
    }

    async fn vote(&self, voter: &str, _proposal: &str, _context: &Value) -> Result<bool> {
        if voter == "offline" {
            return Err(OrchError::Validation("voter unreachable".to_string()));
        }
        Ok(self.yes.contains(voter))
    }

    async fn accept_delegation(&self, _from: &str, to: &str, _task: &str, _context: &Value) -> Result<DelegationReply> {
        Ok(DelegationReply {
            accepted: self.yes.contains(to),
            estimate_minutes: Some(45.0),
            notes: None,
        })
    }
}

fn agents(names: &[&str]) -> Vec<String> {
    names.iter().map(|s| s.to_string()).collect()
}

async fn protocols(yes: &[&str]) -> (Arc<CommunicationHub>, CollaborationProtocols) {
    let hub = Arc::new(CommunicationHub::new());
    let protocols = CollaborationProtocols::with_builtin_protocols(hub.clone(), FixedResponder::new(yes)).await;
    (hub, protocols)
}

// ============================================================================
// Consensus Tests
// ============================================================================

#[tokio::test]
async fn test_consensus_matches_strict_majority() {
    let team = ["a", "b", "c", "d"];
    let cases: Vec<(Vec<&str>, StepAction)> = vec![
        (vec!["a", "b", "c"], StepAction::Approve),
        (vec!["a", "b"], StepAction::Reject),
        (vec!["a"], StepAction::Reject),
        (vec!["a", "b", "c", "d"], StepAction::Approve),
        (vec![], StepAction::Reject),
    ];

    for (yes, expected) in &cases {
        let (_hub, protocols) = protocols(yes).await;
        let instance = protocols
            .start_protocol("consensus-decision", agents(&team), json!({}))
            .await
            .unwrap();

        assert_eq!(instance.results[0].action, *expected, "yes votes: {:?}", yes);
        assert_eq!(instance.results[0].output["total"], 4);
        let expected_status = if *expected == StepAction::Approve {
            ProtocolStatus::Completed
        } else {
            ProtocolStatus::Aborted
        };
        assert_eq!(instance.status, expected_status);
    }
}

#[tokio::test]
async fn test_consensus_with_explicit_voters() {
    let (_hub, protocols) = protocols(&["b", "c"]).await;
    protocols
        .define_protocol(
            "subset-vote",
            vec![ProtocolStep::Consensus {
                voters: vec![1, 2],
                proposal: "ship it".to_string(),
                on_reject: OnReject::Abort,
            }],
        )
        .await
        .unwrap();

    let instance = protocols
        .start_protocol("subset-vote", agents(&["a", "b", "c"]), json!({}))
        .await
        .unwrap();
    assert_eq!(instance.results[0].action, StepAction::Approve);
}

#[tokio::test]
async fn test_repeated_agent_votes_once() {
    let (_hub, protocols) = protocols(&["a", "c"]).await;
    let instance = protocols
        .start_protocol("consensus-decision", agents(&["a", "a", "b", "c"]), json!({}))
        .await
        .unwrap();

    let output = &instance.results[0].output;
    assert_eq!(output["total"], 3);
    assert_eq!(output["approvals"], 2);
    assert_eq!(output["votes"].as_object().unwrap().len(), 3);
    assert_eq!(instance.results[0].action, StepAction::Approve);
}

#[tokio::test]
async fn test_repeated_voter_index_is_rejected() {
    let (_hub, protocols) = protocols(&["a"]).await;
    let err = protocols
        .define_protocol(
            "double-vote",
            vec![ProtocolStep::Consensus {
                voters: vec![0, 0, 1],
                proposal: "ship it".to_string(),
                on_reject: OnReject::Abort,
            }],
        )
        .await
        .unwrap_err();

    assert!(matches!(err, OrchError::Validation(_)));
    assert!(!protocols.protocol_names().await.contains(&"double-vote".to_string()));
}

#[tokio::test]
async fn test_failed_vote_aborts_instance() {
    let (_hub, protocols) = protocols(&["a"]).await;
    let instance = protocols
        .start_protocol("consensus-decision", agents(&["a", "offline"]), json!({}))
        .await
        .unwrap();

    assert_eq!(instance.status, ProtocolStatus::Aborted);
    assert_eq!(instance.results[0].action, StepAction::Abort);
    assert!(instance.results[0].output["error"].as_str().unwrap().contains("unreachable"));
}

// ============================================================================
// Step Sequencing Tests
// ============================================================================

#[tokio::test]
async fn test_rejected_review_continues_when_configured() {
    let (hub, protocols) = protocols(&[]).await;
    let instance = protocols
        .start_protocol("peer-review", agents(&["author", "reviewer"]), json!({ "artifact": "x" }))
        .await
        .unwrap();

    assert_eq!(instance.results[0].action, StepAction::Reject);
    assert_eq!(instance.status, ProtocolStatus::Completed);
    assert_eq!(hub.messages_for("reviewer").await.len(), 1);
    assert_eq!(hub.messages_for("author").await.len(), 1);
}

#[tokio::test]
async fn test_handoff_runs_both_steps() {
    let (_hub, protocols) = protocols(&["receiver"]).await;
    let instance = protocols
        .start_protocol("task-handoff", agents(&["giver", "receiver"]), json!({}))
        .await
        .unwrap();

    assert_eq!(instance.status, ProtocolStatus::Completed);
    assert_eq!(instance.results.len(), 2);
    assert_eq!(instance.results[0].output["estimateMinutes"], 45.0);
    assert_eq!(instance.results[1].kind, "request");

    let stored = protocols.instance(&instance.id).await.unwrap();
    assert_eq!(stored.status, ProtocolStatus::Completed);
}

#[tokio::test]
async fn test_declined_handoff_aborts_before_request() {
    let (_hub, protocols) = protocols(&[]).await;
    let instance = protocols
        .start_protocol("task-handoff", agents(&["giver", "receiver"]), json!({}))
        .await
        .unwrap();

    assert_eq!(instance.status, ProtocolStatus::Aborted);
    assert_eq!(instance.results.len(), 1);
}

#[tokio::test]
async fn test_protocol_needs_enough_agents() {
    let (_hub, protocols) = protocols(&[]).await;
    let err = protocols
        .start_protocol("peer-review", agents(&["solo"]), json!({}))
        .await
        .unwrap_err();
    assert!(matches!(err, OrchError::Validation(_)));

    let err = protocols.start_protocol("nope", agents(&["a"]), json!({})).await.unwrap_err();
    assert!(matches!(err, OrchError::NotFound(_)));
}

// ============================================================================
// Hub Tests
// ============================================================================

#[tokio::test]
async fn test_channel_delivers_to_other_participants() {
    let hub = CommunicationHub::new();
    let mut dev = hub.subscribe("dev").await;
    let mut qa = hub.subscribe("qa").await;
    let channel = hub.create_channel("build", ["dev", "qa"]).await;

    hub.send_to_channel(&channel, "dev", json!("compiled")).await.unwrap();

    assert_eq!(qa.recv().await.unwrap().content, json!("compiled"));
    assert!(dev.try_recv().is_err());
    assert!(hub.send_to_channel("missing", "dev", json!(1)).await.is_err());
}

#[tokio::test]
async fn test_broadcast_skips_sender() {
    let hub = CommunicationHub::new();
    let mut lead = hub.subscribe("lead").await;
    let mut dev = hub.subscribe("dev").await;

    hub.broadcast("lead", json!({ "event": "start" })).await;

    assert_eq!(dev.recv().await.unwrap().from, "lead");
    assert!(lead.try_recv().is_err());
}

#[tokio::test]
async fn test_closed_conversation_rejects_messages() {
    let hub = CommunicationHub::new();
    let id = hub.start_conversation("pm", ["dev"], "scope").await;
    hub.add_to_conversation(&id, "pm", json!("in or out?")).await.unwrap();

    let ended = hub.end_conversation(&id, "agreed").await.unwrap();
    assert_eq!(ended.messages.len(), 1);
    assert_eq!(ended.status, ConversationStatus::Closed);

    let err = hub.add_to_conversation(&id, "dev", json!("late")).await.unwrap_err();
    assert!(matches!(err, OrchError::Closed(_)));
}

// ============================================================================
// Knowledge Base Tests
// ============================================================================

#[tokio::test]
async fn test_knowledge_query_is_substring_match() {
    let kb = KnowledgeBase::new();
    kb.add_knowledge("architect", "decisions", json!({ "use": "Postgres" }), vec![]).await;
    kb.add_knowledge("dev", "decisions", json!({ "use": "Redis" }), vec![]).await;
    kb.add_knowledge("dev", "notes", json!("postgres tuning"), vec![]).await;

    let hits = kb.query_knowledge("decisions", "postgres").await;
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].agent, "architect");
}

#[tokio::test]
async fn test_artifacts_by_id_and_agent() {
    let kb = KnowledgeBase::new();
    let first = kb.share_artifact("dev", "diff", json!("+ fn main()")).await;
    kb.share_artifact("qa", "report", json!({ "passed": 3 })).await;

    assert_eq!(kb.get_artifact(&first).await.unwrap().from, "dev");
    assert_eq!(kb.get_agent_artifacts("qa").await.len(), 1);
    assert!(kb.get_artifact("artifact-missing").await.is_none());
}

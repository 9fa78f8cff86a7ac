//! Shared artifacts and tagged knowledge for one orchestration run.
//!
//! Small in-memory working set: queries are a linear case-insensitive
//! substring scan over each entry's JSON form.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KnowledgeEntry {
    pub agent: String,
    pub category: String,
    pub content: serde_json::Value,
    #[serde(default)]
    pub tags: Vec<String>,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Artifact {
    pub id: String,
    pub from: String,
    /// Free-form label such as `task-result`
    pub kind: String,
    pub content: serde_json::Value,
    pub shared_at: DateTime<Utc>,
}

#[derive(Default)]
pub struct KnowledgeBase {
    /// `(agent, category)` -> entries, append-only
    knowledge: RwLock<HashMap<(String, String), Vec<KnowledgeEntry>>>,
    artifacts: RwLock<Vec<Artifact>>,
}

impl KnowledgeBase {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_knowledge(&self, agent: &str, category: &str, content: serde_json::Value, tags: Vec<String>) {
        let entry = KnowledgeEntry {
            agent: agent.to_string(),
            category: category.to_string(),
            content,
            tags,
            recorded_at: Utc::now(),
        };
        self.knowledge
            .write()
            .await
            .entry((agent.to_string(), category.to_string()))
            .or_default()
            .push(entry);
    }

    /// Entries in `category` (from any agent) whose JSON contains `query`
    pub async fn query_knowledge(&self, category: &str, query: &str) -> Vec<KnowledgeEntry> {
        let needle = query.to_lowercase();
        let knowledge = self.knowledge.read().await;

        let mut found: Vec<KnowledgeEntry> = knowledge
            .iter()
            .filter(|((_, c), _)| c == category)
            .flat_map(|(_, entries)| entries.iter())
            .filter(|entry| {
                serde_json::to_string(entry)
                    .map(|json| json.to_lowercase().contains(&needle))
                    .unwrap_or(false)
            })
            .cloned()
            .collect();

        found.sort_by_key(|entry| entry.recorded_at);
        found
    }

    pub async fn share_artifact(&self, from: &str, kind: &str, content: serde_json::Value) -> String {
        let id = format!("artifact-{}", Uuid::new_v4());
        debug!(artifact_id = %id, from, kind, "Shared artifact");
        self.artifacts.write().await.push(Artifact {
            id: id.clone(),
            from: from.to_string(),
            kind: kind.to_string(),
            content,
            shared_at: Utc::now(),
        });
        id
    }

    pub async fn get_artifact(&self, artifact_id: &str) -> Option<Artifact> {
        self.artifacts
            .read()
            .await
            .iter()
            .find(|a| a.id == artifact_id)
            .cloned()
    }

    pub async fn get_agent_artifacts(&self, agent: &str) -> Vec<Artifact> {
        self.artifacts
            .read()
            .await
            .iter()
            .filter(|a| a.from == agent)
            .cloned()
            .collect()
    }
}

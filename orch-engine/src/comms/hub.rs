//! In-process message hub.
//!
//! Roles register with [`CommunicationHub::subscribe`] and receive every
//! message addressed to them on an unbounded channel. Sends are fire-and-forget:
//! a message to a role with no live subscriber is only recorded, and per-sender
//! emission order is the only ordering guarantee.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{OrchError, Result};

/// Where a message was sent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MessageScope {
    Channel { channel_id: String },
    Direct { to: String },
    Broadcast,
    Conversation { conversation_id: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub from: String,
    pub scope: MessageScope,
    pub content: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl Message {
    fn new(from: &str, scope: MessageScope, content: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            from: from.to_string(),
            scope,
            content,
            timestamp: Utc::now(),
        }
    }
}

/// Named group of roles; lives as long as the hub
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Channel {
    pub id: String,
    pub name: String,
    pub participants: BTreeSet<String>,
    pub messages: Vec<Message>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationStatus {
    Active,
    Closed,
}

/// Explicitly started and ended exchange between roles
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: String,
    pub initiator: String,
    pub participants: BTreeSet<String>,
    pub topic: String,
    pub messages: Vec<Message>,
    pub status: ConversationStatus,
    /// Set when the conversation is ended
    pub summary: Option<String>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

#[derive(Default)]
pub struct CommunicationHub {
    subscribers: RwLock<HashMap<String, Vec<mpsc::UnboundedSender<Message>>>>,
    channels: RwLock<HashMap<String, Channel>>,
    conversations: RwLock<HashMap<String, Conversation>>,
    /// Direct and broadcast messages, in send order
    log: RwLock<Vec<Message>>,
}

impl CommunicationHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Receive everything addressed to `role` from now on
    pub async fn subscribe(&self, role: &str) -> mpsc::UnboundedReceiver<Message> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers
            .write()
            .await
            .entry(role.to_string())
            .or_default()
            .push(tx);
        rx
    }

    pub async fn create_channel<I, S>(&self, name: &str, participants: I) -> String
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let id = format!("channel-{}", Uuid::new_v4());
        let channel = Channel {
            id: id.clone(),
            name: name.to_string(),
            participants: participants.into_iter().map(Into::into).collect(),
            messages: Vec::new(),
            created_at: Utc::now(),
        };
        debug!(channel_id = %id, name, participants = channel.participants.len(), "Created channel");
        self.channels.write().await.insert(id.clone(), channel);
        id
    }

    pub async fn channel(&self, channel_id: &str) -> Option<Channel> {
        self.channels.read().await.get(channel_id).cloned()
    }

    /// Record on the channel and deliver to every other participant
    pub async fn send_to_channel(&self, channel_id: &str, from: &str, content: serde_json::Value) -> Result<Message> {
        let message = Message::new(
            from,
            MessageScope::Channel {
                channel_id: channel_id.to_string(),
            },
            content,
        );

        let recipients: Vec<String> = {
            let mut channels = self.channels.write().await;
            let channel = channels
                .get_mut(channel_id)
                .ok_or_else(|| OrchError::NotFound(format!("channel '{}'", channel_id)))?;
            channel.messages.push(message.clone());
            channel.participants.iter().filter(|p| *p != from).cloned().collect()
        };

        self.deliver(&recipients, &message).await;
        Ok(message)
    }

    pub async fn send_direct_message(&self, from: &str, to: &str, content: serde_json::Value) -> Message {
        let message = Message::new(from, MessageScope::Direct { to: to.to_string() }, content);
        self.log.write().await.push(message.clone());
        self.deliver(&[to.to_string()], &message).await;
        message
    }

    /// Deliver to every subscribed role except the sender
    pub async fn broadcast(&self, from: &str, content: serde_json::Value) -> Message {
        let message = Message::new(from, MessageScope::Broadcast, content);
        self.log.write().await.push(message.clone());

        let recipients: Vec<String> = self
            .subscribers
            .read()
            .await
            .keys()
            .filter(|role| role.as_str() != from)
            .cloned()
            .collect();
        self.deliver(&recipients, &message).await;
        message
    }

    /// Direct and broadcast messages that reached `role`, oldest first
    pub async fn messages_for(&self, role: &str) -> Vec<Message> {
        self.log
            .read()
            .await
            .iter()
            .filter(|m| match &m.scope {
                MessageScope::Direct { to } => to == role,
                MessageScope::Broadcast => m.from != role,
                _ => false,
            })
            .cloned()
            .collect()
    }

    pub async fn start_conversation<I, S>(&self, initiator: &str, participants: I, topic: &str) -> String
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let id = format!("conversation-{}", Uuid::new_v4());
        let mut members: BTreeSet<String> = participants.into_iter().map(Into::into).collect();
        members.insert(initiator.to_string());

        let conversation = Conversation {
            id: id.clone(),
            initiator: initiator.to_string(),
            participants: members,
            topic: topic.to_string(),
            messages: Vec::new(),
            status: ConversationStatus::Active,
            summary: None,
            started_at: Utc::now(),
            ended_at: None,
        };
        debug!(conversation_id = %id, initiator, topic, "Started conversation");
        self.conversations.write().await.insert(id.clone(), conversation);
        id
    }

    pub async fn add_to_conversation(
        &self,
        conversation_id: &str,
        from: &str,
        content: serde_json::Value,
    ) -> Result<Message> {
        let message = Message::new(
            from,
            MessageScope::Conversation {
                conversation_id: conversation_id.to_string(),
            },
            content,
        );

        let recipients: Vec<String> = {
            let mut conversations = self.conversations.write().await;
            let conversation = conversations
                .get_mut(conversation_id)
                .ok_or_else(|| OrchError::NotFound(format!("conversation '{}'", conversation_id)))?;
            if conversation.status == ConversationStatus::Closed {
                return Err(OrchError::Closed(format!("conversation '{}'", conversation_id)));
            }
            conversation.messages.push(message.clone());
            conversation
                .participants
                .iter()
                .filter(|p| *p != from)
                .cloned()
                .collect()
        };

        self.deliver(&recipients, &message).await;
        Ok(message)
    }

    pub async fn end_conversation(&self, conversation_id: &str, summary: &str) -> Result<Conversation> {
        let mut conversations = self.conversations.write().await;
        let conversation = conversations
            .get_mut(conversation_id)
            .ok_or_else(|| OrchError::NotFound(format!("conversation '{}'", conversation_id)))?;

        if conversation.status == ConversationStatus::Closed {
            return Err(OrchError::Closed(format!("conversation '{}'", conversation_id)));
        }

        conversation.status = ConversationStatus::Closed;
        conversation.summary = Some(summary.to_string());
        conversation.ended_at = Some(Utc::now());
        debug!(conversation_id, messages = conversation.messages.len(), "Ended conversation");
        Ok(conversation.clone())
    }

    pub async fn conversation(&self, conversation_id: &str) -> Option<Conversation> {
        self.conversations.read().await.get(conversation_id).cloned()
    }

    async fn deliver(&self, recipients: &[String], message: &Message) {
        let mut subscribers = self.subscribers.write().await;
        for role in recipients {
            if let Some(senders) = subscribers.get_mut(role) {
                senders.retain(|tx| tx.send(message.clone()).is_ok());
                if senders.is_empty() {
                    warn!(role = %role, "All subscribers for role dropped");
                    subscribers.remove(role);
                }
            }
        }
    }
}

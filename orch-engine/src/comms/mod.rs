//! Coordination between concurrently running roles.
//!
//! - [`hub`]: channels, direct messages, broadcast, and conversations
//! - [`protocol`]: scripted request / review / consensus / delegation sequences
//! - [`knowledge`]: shared artifacts and tagged knowledge for one run

pub mod hub;
pub mod knowledge;
pub mod protocol;

pub use hub::{Channel, CommunicationHub, Conversation, ConversationStatus, Message, MessageScope};
pub use knowledge::{Artifact, KnowledgeBase, KnowledgeEntry};
pub use protocol::{
    CollaborationProtocols, CollaborationResponder, DelegationReply, ExecutorResponder, OnReject,
    ProtocolInstance, ProtocolStatus, ProtocolStep, ReviewVerdict, StepAction, StepResult,
};

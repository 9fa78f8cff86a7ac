//! Workflow orchestration engine: turns work-item requests into phased task
//! graphs and runs them across role-based agents.

pub mod cache;
pub mod cli;
pub mod comms;
pub mod config;
pub mod decompose;
pub mod error;
pub mod executor;
pub mod orchestrator;
pub mod parser;
pub mod plan_doc;
pub mod roster;
pub mod scheduler;
pub mod signoff;
pub mod types;
pub mod yaml;

pub use cache::{CacheStats, OrchestrationCache};
pub use comms::{CollaborationProtocols, CommunicationHub, KnowledgeBase};
pub use config::OrchConfig;
pub use error::{OrchError, Result};
pub use orchestrator::{OrchestrationPlan, OrchestrationReport, Orchestrator, Request};
pub use parser::{ParsedWorkflow, WorkflowParser};
pub use scheduler::PhaseScheduler;
pub use types::{Phase, SignOff, Stage, Task, TaskResult, TaskStatus, WorkItemId};

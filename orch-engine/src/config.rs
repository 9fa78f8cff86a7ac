//! Engine configuration loaded from `orch-config.yaml`.
//!
//! Every section has defaults, so a missing file (or a partial one) still
//! produces a usable configuration.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

use crate::error::{OrchError, Result};

/// File name looked up in the working directory when no path is given
pub const DEFAULT_CONFIG_FILE: &str = "orch-config.yaml";

/// Environment variable pointing at a config file
pub const CONFIG_ENV_VAR: &str = "ORCH_CONFIG";

/// Environment variable overriding `executor.command`
pub const AGENT_COMMAND_ENV_VAR: &str = "ORCH_AGENT_COMMAND";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchConfig {
    pub cache: CacheConfig,
    pub parser: ParserConfig,
    pub scheduler: SchedulerConfig,
    pub agents: AgentsConfig,
    pub executor: ExecutorConfig,

    /// Request type -> agents to invoke
    pub invocation_rules: BTreeMap<String, InvocationRule>,

    /// Request type -> phrases that select it
    pub invocation_aliases: BTreeMap<String, Vec<String>>,

    /// Named agent lists
    pub presets: BTreeMap<String, InvocationRule>,

    pub safety_checks: SafetyChecks,
    pub resource_management: ResourceManagement,
}

impl OrchConfig {
    /// Load configuration: explicit path, then `$ORCH_CONFIG`, then
    /// `./orch-config.yaml`, then defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let candidate = match path {
            Some(p) => Some(p.to_path_buf()),
            None => std::env::var(CONFIG_ENV_VAR)
                .ok()
                .map(PathBuf::from)
                .or_else(|| {
                    let local = PathBuf::from(DEFAULT_CONFIG_FILE);
                    local.exists().then_some(local)
                }),
        };

        let mut config = match candidate {
            Some(p) => {
                info!(path = %p.display(), "Loading configuration");
                let text = std::fs::read_to_string(&p).map_err(|e| {
                    OrchError::Config(format!("Failed to read {}: {}", p.display(), e))
                })?;
                Self::from_yaml(&text)?
            }
            None => {
                debug!("No configuration file found, using defaults");
                Self::default()
            }
        };

        if let Ok(command) = std::env::var(AGENT_COMMAND_ENV_VAR) {
            if !command.trim().is_empty() {
                config.executor.command = Some(command);
            }
        }

        Ok(config)
    }

    pub fn from_yaml(text: &str) -> Result<Self> {
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(text).map_err(|e| OrchError::Config(format!("Invalid configuration: {}", e)))
    }
}

// ============================================================================
// Cache
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Cache root; platform cache dir when unset
    pub dir: Option<PathBuf>,

    /// TTL for types without an explicit entry
    pub default_ttl_secs: u64,

    /// Per-type TTL overrides, merged over the built-in table
    pub ttl_secs: HashMap<String, u64>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            dir: None,
            default_ttl_secs: 3600,
            ttl_secs: HashMap::new(),
        }
    }
}

impl CacheConfig {
    pub fn resolve_dir(&self) -> PathBuf {
        if let Some(dir) = &self.dir {
            return dir.clone();
        }
        directories::ProjectDirs::from("com", "orch", "orch")
            .map(|dirs| dirs.cache_dir().to_path_buf())
            .unwrap_or_else(|| PathBuf::from(".orch-cache"))
    }
}

// ============================================================================
// Parser
// ============================================================================

/// Estimation constants for parsed workflows
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ParserConfig {
    pub base_minutes_per_item: f64,
    pub parallel_overhead_minutes: f64,
    pub workers_per_item: usize,
}

impl Default for ParserConfig {
    fn default() -> Self {
        Self {
            base_minutes_per_item: 30.0,
            parallel_overhead_minutes: 5.0,
            workers_per_item: 3,
        }
    }
}

// ============================================================================
// Scheduler
// ============================================================================

/// What the scheduler does once a phase has a failed task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    #[default]
    Halt,
    Continue,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Per-task deadline; `None` disables it
    pub task_timeout_secs: Option<u64>,

    /// Upper bound on tasks running at once inside a phase
    pub max_concurrency: Option<usize>,

    pub on_failure: FailurePolicy,

    /// Treat a task dependency cycle as fatal instead of degrading
    pub strict_dependencies: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            task_timeout_secs: Some(600),
            max_concurrency: None,
            on_failure: FailurePolicy::Halt,
            strict_dependencies: false,
        }
    }
}

impl SchedulerConfig {
    pub fn task_timeout(&self) -> Option<Duration> {
        self.task_timeout_secs.map(Duration::from_secs)
    }
}

// ============================================================================
// Agents
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentsConfig {
    /// Directory of `<role>.md` agent definitions
    pub team_dir: Option<PathBuf>,

    /// File name fragments skipped during discovery
    pub excluded_patterns: Vec<String>,

    /// Roles that must take part in every full-team invocation
    pub critical_agents: Vec<String>,

    /// Conservative assignment when the coordinator cannot be asked
    pub fallback_roles: Vec<String>,

    /// Role asked to assign work items to roles
    pub coordinator_role: String,

    /// Collaboration protocol run by the roles that finished work, before
    /// sign-off; `null` skips it
    pub review_protocol: Option<String>,
}

impl Default for AgentsConfig {
    fn default() -> Self {
        Self {
            team_dir: None,
            excluded_patterns: ["rca-", "template-", "README", "test-", "draft-"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            critical_agents: Vec::new(),
            fallback_roles: ["project-manager", "software-engineer", "qa-engineer"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            coordinator_role: "project-manager".to_string(),
            review_protocol: Some("consensus-decision".to_string()),
        }
    }
}

// ============================================================================
// Executor
// ============================================================================

/// External program backing the process executor
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    pub command: Option<String>,
    pub args: Vec<String>,
}

// ============================================================================
// Invocation planning
// ============================================================================

/// Agents selected by a rule or preset
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvocationRule {
    pub agents: AgentSelection,
    #[serde(default)]
    pub description: Option<String>,
}

/// Either every discovered agent (`agents: all`) or an explicit list
#[derive(Debug, Clone, PartialEq)]
pub enum AgentSelection {
    All,
    List(Vec<String>),
}

impl Serialize for AgentSelection {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            AgentSelection::All => serializer.serialize_str("all"),
            AgentSelection::List(list) => list.serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for AgentSelection {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Keyword(String),
            List(Vec<String>),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Keyword(word) if word == "all" => Ok(AgentSelection::All),
            Raw::Keyword(word) => Err(serde::de::Error::custom(format!(
                "expected `all` or a list of agents, found \"{}\"",
                word
            ))),
            Raw::List(list) => Ok(AgentSelection::List(list)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SafetyChecks {
    pub require_confirmation_above: usize,
    pub require_double_confirmation_above: usize,
    pub complete_groups: BTreeMap<String, CompleteGroup>,
}

impl Default for SafetyChecks {
    fn default() -> Self {
        Self {
            require_confirmation_above: 10,
            require_double_confirmation_above: 25,
            complete_groups: BTreeMap::new(),
        }
    }
}

/// When any trigger agent is invoked, every `must_include` agent joins too
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CompleteGroup {
    pub trigger_agents: Vec<String>,
    pub must_include: Vec<String>,
}

/// Time estimation for invocation plans, in minutes
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceManagement {
    pub time_per_agent: f64,
    pub time_overhead: f64,
}

impl Default for ResourceManagement {
    fn default() -> Self {
        Self {
            time_per_agent: 0.5,
            time_overhead: 2.0,
        }
    }
}

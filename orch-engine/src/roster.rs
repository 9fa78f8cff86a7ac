//! Agent roster discovery and invocation planning.
//!
//! A team directory holds one `<role>.md` definition per agent, optionally with
//! YAML front matter. Discovery turns it into an [`AgentRoster`]; invocation
//! planning decides which roles a request needs and checks afterwards that
//! they all actually ran.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::config::{AgentSelection, InvocationRule, OrchConfig};
use crate::error::{OrchError, Result};

/// Above this many agents the plan carries a size warning
pub const LARGE_INVOCATION: usize = 25;

/// Completion rate under which verification reports an issue
pub const MIN_COMPLETION_RATE: f64 = 0.9;

static AI_ML_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(?:ai|ml)\b").expect("valid ai/ml keyword regex"));

static BROAD_REVIEW_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(?:review|evaluate|assess|analy[sz]e)").expect("valid review keyword regex")
});

// ============================================================================
// Discovery
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentDefinition {
    /// File stem, used as the role name
    pub slug: String,
    /// Human-readable name (`security-architect` -> `Security Architect`)
    pub name: String,
    pub path: PathBuf,
    pub valid: bool,
    /// SHA-256 of the file contents
    #[serde(default)]
    pub checksum: Option<String>,
    /// Front matter, or an empty object
    #[serde(default)]
    pub metadata: serde_json::Value,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentRoster {
    pub team_dir: Option<PathBuf>,
    pub agents: BTreeMap<String, AgentDefinition>,
}

impl AgentRoster {
    /// Scan `team_dir` for `*.md` agent definitions
    pub fn discover(team_dir: &Path, excluded_patterns: &[String]) -> Result<Self> {
        if !team_dir.is_dir() {
            return Err(OrchError::NotFound(format!("team directory {}", team_dir.display())));
        }

        let mut agents = BTreeMap::new();
        for entry in std::fs::read_dir(team_dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("md") {
                continue;
            }
            let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if excluded_patterns.iter().any(|p| file_name.contains(p.as_str())) {
                debug!(file = file_name, "Excluding agent file");
                continue;
            }
            let Some(slug) = path.file_stem().and_then(|s| s.to_str()).map(str::to_string) else {
                continue;
            };

            let definition = load_definition(&slug, &path);
            agents.insert(slug, definition);
        }

        info!(
            team_dir = %team_dir.display(),
            agents = agents.len(),
            "Discovered agents"
        );

        Ok(Self {
            team_dir: Some(team_dir.to_path_buf()),
            agents,
        })
    }

    /// Roster without a backing directory
    pub fn from_roles<I, S>(roles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let agents = roles
            .into_iter()
            .map(Into::into)
            .map(|slug: String| {
                let definition = AgentDefinition {
                    name: display_name(&slug),
                    slug: slug.clone(),
                    path: PathBuf::new(),
                    valid: true,
                    checksum: None,
                    metadata: serde_json::Value::Object(Default::default()),
                    error: None,
                };
                (slug, definition)
            })
            .collect();
        Self { team_dir: None, agents }
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn valid_roles(&self) -> Vec<String> {
        self.agents
            .values()
            .filter(|a| a.valid)
            .map(|a| a.slug.clone())
            .collect()
    }

    pub fn invalid_agents(&self) -> Vec<&AgentDefinition> {
        self.agents.values().filter(|a| !a.valid).collect()
    }

    pub fn is_valid_role(&self, role: &str) -> bool {
        self.agents.get(role).map(|a| a.valid).unwrap_or(false)
    }

    /// Critical roles that are absent or invalid
    pub fn missing_critical(&self, critical: &[String]) -> Vec<String> {
        critical
            .iter()
            .filter(|role| !self.is_valid_role(role))
            .cloned()
            .collect()
    }

    /// Completeness issues; empty means the roster is complete
    pub fn validate_completeness(&self, expected: Option<usize>, critical: &[String]) -> Vec<String> {
        let mut issues = Vec::new();

        if let Some(expected) = expected {
            if expected != self.len() {
                issues.push(format!("Expected {} agents, found {}", expected, self.len()));
            }
        }
        for role in critical {
            if !self.agents.contains_key(role) {
                issues.push(format!("CRITICAL: Missing required agent: {}", role));
            }
        }
        for agent in self.invalid_agents() {
            issues.push(format!("Invalid agent file: {}", agent.slug));
        }

        issues
    }
}

fn load_definition(slug: &str, path: &Path) -> AgentDefinition {
    let mut definition = AgentDefinition {
        slug: slug.to_string(),
        name: display_name(slug),
        path: path.to_path_buf(),
        valid: false,
        checksum: None,
        metadata: serde_json::Value::Object(Default::default()),
        error: None,
    };

    match std::fs::read_to_string(path) {
        Ok(content) => {
            definition.checksum = Some(hex::encode(Sha256::digest(content.as_bytes())));
            definition.metadata = front_matter(&content);
            definition.valid = true;
        }
        Err(e) => {
            warn!(agent = slug, error = %e, "Failed to read agent definition");
            definition.error = Some(e.to_string());
        }
    }

    definition
}

/// YAML front matter between leading `---` lines; unparsable front matter is ignored
fn front_matter(content: &str) -> serde_json::Value {
    let empty = serde_json::Value::Object(Default::default());
    let Some(rest) = content.strip_prefix("---") else {
        return empty;
    };
    let Some(end) = rest.find("\n---") else {
        return empty;
    };

    match serde_yaml::from_str::<serde_json::Value>(&rest[..end]) {
        Ok(value @ serde_json::Value::Object(_)) => value,
        Ok(_) => empty,
        Err(e) => {
            debug!(error = %e, "Ignoring unparsable front matter");
            empty
        }
    }
}

/// `security-architect` -> `Security Architect`
pub fn display_name(slug: &str) -> String {
    slug.split(['-', '_'])
        .filter(|w| !w.is_empty())
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars.flat_map(char::to_lowercase)).collect(),
                None => String::new(),
            }
        })
        .collect::<Vec<String>>()
        .join(" ")
}

// ============================================================================
// Invocation planning
// ============================================================================

/// Request type for free text: configured alias phrases first, then keywords
pub fn classify_request(text: &str, aliases: &BTreeMap<String, Vec<String>>) -> String {
    let lower = text.to_lowercase();

    for (request_type, phrases) in aliases {
        if phrases.iter().any(|p| !p.is_empty() && lower.contains(&p.to_lowercase())) {
            return request_type.clone();
        }
    }

    let kind = if lower.contains("security") {
        "security_review"
    } else if lower.contains("leadership") || lower.contains("executive") {
        "leadership_review"
    } else if lower.contains("technical") && lower.contains("review") {
        "technical_review"
    } else if lower.contains("product") {
        "product_review"
    } else if AI_ML_RE.is_match(&lower) {
        "ai_ml_review"
    } else if lower.contains("compliance") {
        "compliance_review"
    } else if BROAD_REVIEW_RE.is_match(&lower) {
        "whole_team"
    } else {
        "custom"
    };
    kind.to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvocationPlan {
    pub request_text: String,
    pub request_type: String,
    pub agents: Vec<String>,
    pub estimated_minutes: f64,
    pub requires_confirmation: bool,
    pub requires_double_confirmation: bool,
    pub critical_agents_included: bool,
    pub missing_critical: Vec<String>,
    /// Roles pulled in by complete-group rules
    pub added_for_completeness: Vec<String>,
    pub warnings: Vec<String>,
}

/// Plan the agents for a free-text request
pub fn create_invocation_plan(text: &str, roster: &AgentRoster, config: &OrchConfig) -> InvocationPlan {
    let request_type = classify_request(text, &config.invocation_aliases);
    let agents = agents_for_request(&request_type, roster, config);
    plan_for_agents(text, &request_type, agents, config)
}

fn agents_for_request(request_type: &str, roster: &AgentRoster, config: &OrchConfig) -> Vec<String> {
    let resolve = |rule: &InvocationRule| match &rule.agents {
        AgentSelection::All => roster.valid_roles(),
        AgentSelection::List(list) => list.clone(),
    };

    if matches!(request_type, "whole_team" | "all") {
        return roster.valid_roles();
    }
    if let Some(rule) = config.invocation_rules.get(request_type) {
        return resolve(rule);
    }
    if let Some(preset) = config.presets.get(request_type) {
        return resolve(preset);
    }
    debug!(request_type, "No rule or preset for request type, using whole roster");
    roster.valid_roles()
}

/// Apply completeness groups, estimates, and safety thresholds to `agents`
pub fn plan_for_agents(text: &str, request_type: &str, agents: Vec<String>, config: &OrchConfig) -> InvocationPlan {
    let mut seen = BTreeSet::new();
    let mut agents: Vec<String> = agents.into_iter().filter(|a| seen.insert(a.clone())).collect();

    let mut added = Vec::new();
    for group in config.safety_checks.complete_groups.values() {
        let triggered = group.trigger_agents.iter().any(|t| seen.contains(t));
        if !triggered {
            continue;
        }
        for required in &group.must_include {
            if seen.insert(required.clone()) {
                added.push(required.clone());
            }
        }
    }
    agents.extend(added.iter().cloned());

    let missing_critical: Vec<String> = config
        .agents
        .critical_agents
        .iter()
        .filter(|c| !seen.contains(*c))
        .cloned()
        .collect();

    let resources = &config.resource_management;
    let estimated_minutes = agents.len() as f64 * resources.time_per_agent + resources.time_overhead;
    let checks = &config.safety_checks;

    let mut warnings = Vec::new();
    if !missing_critical.is_empty() {
        warnings.push(format!("CRITICAL agents missing: {}", missing_critical.join(", ")));
    }
    if !added.is_empty() {
        warnings.push(format!("Added for completeness: {}", added.join(", ")));
    }
    if agents.len() > LARGE_INVOCATION {
        warnings.push(format!(
            "Large invocation: {} agents will take ~{:.1} minutes",
            agents.len(),
            estimated_minutes
        ));
    }

    InvocationPlan {
        request_text: text.to_string(),
        request_type: request_type.to_string(),
        requires_confirmation: agents.len() > checks.require_confirmation_above,
        requires_double_confirmation: agents.len() > checks.require_double_confirmation_above,
        critical_agents_included: missing_critical.is_empty(),
        estimated_minutes,
        agents,
        missing_critical,
        added_for_completeness: added,
        warnings,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvocationReport {
    pub invoked: Vec<String>,
    pub skipped: Vec<String>,
    pub completion_rate: f64,
    pub success: bool,
    pub issues: Vec<String>,
}

/// Compare the planned agents with the ones that actually ran
pub fn verify_invocation(plan: &InvocationPlan, invoked: &[String], critical: &[String]) -> InvocationReport {
    let ran: BTreeSet<&str> = invoked.iter().map(String::as_str).collect();
    let (invoked, skipped): (Vec<String>, Vec<String>) =
        plan.agents.iter().cloned().partition(|a| ran.contains(a.as_str()));

    let completion_rate = if plan.agents.is_empty() {
        0.0
    } else {
        invoked.len() as f64 / plan.agents.len() as f64
    };

    let mut issues = Vec::new();
    let critical_skipped: Vec<&str> = critical
        .iter()
        .filter(|c| skipped.contains(c))
        .map(String::as_str)
        .collect();
    let success = critical_skipped.is_empty();
    if !success {
        issues.push(format!("Critical agents were skipped: {}", critical_skipped.join(", ")));
    }
    if completion_rate < MIN_COMPLETION_RATE {
        issues.push(format!("Low completion rate: {:.1}%", completion_rate * 100.0));
    }

    InvocationReport {
        invoked,
        skipped,
        completion_rate,
        success,
        issues,
    }
}

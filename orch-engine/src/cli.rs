//! `orch` command-line interface.
//!
//! Thin layer over [`Orchestrator`]: argument parsing, plan display,
//! confirmation prompts, and exit codes (0 success, 1 anything else).

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use dialoguer::{Confirm, Input};
use std::path::PathBuf;
use std::process::ExitCode;

use crate::cache::OrchestrationCache;
use crate::config::OrchConfig;
use crate::executor;
use crate::orchestrator::{OrchestrationPlan, OrchestrationReport, Orchestrator, Request};
use crate::parser::WorkflowParser;
use crate::plan_doc::write_execution_plan;
use crate::roster::{create_invocation_plan, AgentRoster};
use crate::types::WorkItemId;

/// Workflow orchestration for multi-role agent teams
#[derive(Parser, Debug)]
#[command(name = "orch", version, about = "Workflow orchestration for multi-role agent teams")]
pub struct Cli {
    /// Configuration file (defaults to $ORCH_CONFIG, then ./orch-config.yaml)
    #[arg(long, global = true, env = "ORCH_CONFIG", value_name = "PATH")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Plan and run a work item or a free-text multi-item request
    Start(StartArgs),

    /// Parse a free-text request and print the stage graph as YAML
    Parse {
        /// Request text, e.g. "run 1.1.2.1 and 1.1.2.2 together then 1.1.3.1"
        text: String,
    },

    /// Inspect or maintain the orchestration cache
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },

    /// Discover agent definitions and check for missing critical agents
    Discover {
        /// Team directory (defaults to agents.team_dir from the config)
        #[arg(long, value_name = "DIR")]
        team_dir: Option<PathBuf>,

        /// Also show which agents a request would invoke
        #[arg(long, value_name = "TEXT")]
        request: Option<String>,
    },
}

#[derive(Subcommand, Debug)]
pub enum CacheAction {
    /// Print hit/miss statistics
    Stats,
    /// Evict expired entries
    Cleanup,
    /// Remove every entry
    Clear,
    /// Remove every entry of one type
    InvalidateType {
        #[arg(value_name = "TYPE")]
        kind: String,
    },
}

#[derive(Args, Debug, Clone, Default)]
pub struct StartArgs {
    /// Work item id (dotted numeric, e.g. 1.1.2.3)
    pub work_item: Option<String>,

    /// Free-text request referencing several work items
    #[arg(long, value_name = "TEXT", conflicts_with = "work_item")]
    pub describe: Option<String>,

    /// Run without routine confirmation
    #[arg(long, conflicts_with = "manual")]
    pub autonomous: bool,

    /// Confirm before dispatching (default)
    #[arg(long)]
    pub manual: bool,

    /// Skip every confirmation, including large-invocation safety checks
    #[arg(long)]
    pub force: bool,

    /// Answer yes to the routine confirmation
    #[arg(long, short = 'y')]
    pub yes: bool,

    /// Print the plan and stop
    #[arg(long)]
    pub dry_run: bool,

    /// Write the execution-plan table into this document
    #[arg(long, value_name = "PATH")]
    pub doc: Option<PathBuf>,
}

impl StartArgs {
    pub fn request(&self) -> Result<Request> {
        match (&self.work_item, &self.describe) {
            (Some(id), _) => {
                let id: WorkItemId = id.parse()?;
                Ok(Request::WorkItem(id))
            }
            (None, Some(text)) if !text.trim().is_empty() => Ok(Request::Describe(text.clone())),
            _ => bail!("Provide a work item id (e.g. 1.1.2.3) or --describe \"...\""),
        }
    }

    fn routine_confirmation(&self) -> bool {
        !(self.autonomous || self.yes || self.force)
    }
}

pub async fn run(cli: Cli) -> Result<ExitCode> {
    let config = OrchConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;

    match cli.command {
        Commands::Start(args) => start(config, args).await,
        Commands::Parse { text } => parse(config, &text),
        Commands::Cache { action } => cache(config, action).await,
        Commands::Discover { team_dir, request } => discover(config, team_dir, request.as_deref()),
    }
}

async fn start(config: OrchConfig, args: StartArgs) -> Result<ExitCode> {
    let request = args.request()?;
    let executor = executor::from_config(&config.executor);
    let orchestrator = Orchestrator::new(config, executor).await?;

    let plan = orchestrator
        .plan(&request)
        .await
        .with_context(|| format!("Could not plan {}", request))?;
    print_plan(&plan);

    if args.dry_run {
        if let Some(doc) = &args.doc {
            write_execution_plan(doc, &plan.tasks, &[])?;
        }
        return Ok(ExitCode::SUCCESS);
    }

    if !confirm(&args, &plan)? {
        println!("Cancelled.");
        return Ok(ExitCode::FAILURE);
    }

    let report = orchestrator.execute(&plan).await?;
    print_report(&report);

    if let Some(doc) = &args.doc {
        write_execution_plan(doc, &plan.tasks, &report.results)?;
        println!("Execution plan written to {}", doc.display());
    }

    Ok(if report.succeeded() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn confirm(args: &StartArgs, plan: &OrchestrationPlan) -> Result<bool> {
    if args.force {
        return Ok(true);
    }

    let invocation = &plan.invocation;
    if invocation.requires_double_confirmation {
        println!(
            "\nLARGE INVOCATION: {} agents, ~{:.1} minutes",
            invocation.agents.len(),
            invocation.estimated_minutes
        );
        let typed: String = Input::new()
            .with_prompt("Type 'YES' to proceed")
            .allow_empty(true)
            .interact_text()
            .context("Confirmation requires an interactive terminal (use --force)")?;
        return Ok(typed == "YES");
    }

    if invocation.requires_confirmation || args.routine_confirmation() {
        return Confirm::new()
            .with_prompt(format!(
                "Dispatch {} task(s) across {} phase(s) to {} role(s)?",
                plan.tasks.len(),
                plan.phase_plan.phases.len(),
                invocation.agents.len()
            ))
            .default(true)
            .interact()
            .context("Confirmation requires an interactive terminal (use --yes or --autonomous)");
    }

    Ok(true)
}

fn print_plan(plan: &OrchestrationPlan) {
    let workflow = &plan.workflow;
    println!("\nOrchestration plan for {}", plan.request);
    println!(
        "  {} work item(s), {} stage(s), ~{:.0} minutes, up to {} concurrent workers",
        workflow.prd_count,
        workflow.stages.len(),
        workflow.estimated_minutes,
        workflow.agent_requirements.peak_concurrent
    );

    for stage in &workflow.stages {
        let items: Vec<&str> = stage.work_items.iter().map(|i| i.as_str()).collect();
        println!(
            "  {} [{}]: {}",
            stage.name,
            if stage.parallel { "parallel" } else { "sequential" },
            items.join(", ")
        );
    }

    println!("\nRoles ({}):", plan.invocation.agents.len());
    for (item, roles) in &plan.roles_by_item {
        println!("  {}: {}", item, roles.join(", "));
    }

    for (idx, phase) in plan.phase_plan.phases.iter().enumerate() {
        println!("\nPhase {} ({} task(s))", idx + 1, phase.len());
        for task in phase {
            println!("  {} [{}] {}", task.id, task.owner_role, task.description);
        }
    }

    if !plan.warnings.is_empty() {
        println!("\nWarnings:");
        for warning in &plan.warnings {
            println!("  - {}", warning);
        }
    }
}

fn print_report(report: &OrchestrationReport) {
    println!(
        "\nRan {} task(s) in {} phase(s)",
        report.results.len(),
        report.phases_run
    );

    for failure in report.failures() {
        println!(
            "  FAILED {} ({}): {}",
            failure.task_id,
            failure.role,
            failure.error.as_deref().unwrap_or("unknown error")
        );
    }
    let deferred = report.deferred();
    if !deferred.is_empty() {
        println!("  {} task(s) deferred: no agent executor available", deferred.len());
    }
    if let Some(halted) = &report.halted {
        println!("  Halted: {}", halted);
    }

    if let Some(review) = &report.review {
        println!("\nReview ({}): {:?}", review.protocol_name, review.status);
    }

    println!("\nSign-offs:");
    for sign_off in &report.sign_offs {
        let verdict = if sign_off.approved { "approved" } else { "rejected" };
        println!("  {}: {}", sign_off.agent, verdict);
        for issue in &sign_off.issues {
            println!("    - {}", issue);
        }
    }
    println!(
        "Overall: {}",
        if report.approved { "approved" } else { "not approved" }
    );

    for issue in &report.invocation.issues {
        println!("  ! {}", issue);
    }
}

fn parse(config: OrchConfig, text: &str) -> Result<ExitCode> {
    let workflow = WorkflowParser::new(config.parser).parse(text);
    print!("{}", serde_yaml::to_string(&workflow)?);
    Ok(if workflow.is_valid() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

async fn cache(config: OrchConfig, action: CacheAction) -> Result<ExitCode> {
    let cache = OrchestrationCache::open(&config.cache).await;
    if !cache.is_enabled() {
        bail!("Cache directory {} is not usable", cache.root().display());
    }

    match action {
        CacheAction::Stats => {
            let stats = cache.stats().await;
            println!("Cache: {}", cache.root().display());
            print!("{}", serde_yaml::to_string(&stats)?);
        }
        CacheAction::Cleanup => {
            println!("Evicted {} expired entries", cache.cleanup().await);
        }
        CacheAction::Clear => {
            println!("Removed {} entries", cache.clear().await);
        }
        CacheAction::InvalidateType { kind } => {
            println!("Removed {} '{}' entries", cache.invalidate_type(&kind).await, kind);
        }
    }

    Ok(ExitCode::SUCCESS)
}

fn discover(config: OrchConfig, team_dir: Option<PathBuf>, request: Option<&str>) -> Result<ExitCode> {
    let Some(dir) = team_dir.or(config.agents.team_dir.clone()) else {
        bail!("No team directory given (use --team-dir or agents.team_dir)");
    };

    let roster = AgentRoster::discover(&dir, &config.agents.excluded_patterns)?;
    let critical = &config.agents.critical_agents;

    println!("Agent discovery: {}", dir.display());
    println!("  {} agent(s), {} valid", roster.len(), roster.valid_roles().len());
    for agent in roster.agents.values() {
        let mark = if agent.valid { "ok" } else { "INVALID" };
        println!("  [{}] {} ({})", mark, agent.name, agent.slug);
    }

    let issues = roster.validate_completeness(None, critical);
    for issue in &issues {
        println!("  ! {}", issue);
    }

    if let Some(text) = request {
        let plan = create_invocation_plan(text, &roster, &config);
        println!(
            "\nRequest type '{}': {} agent(s), ~{:.1} minutes",
            plan.request_type,
            plan.agents.len(),
            plan.estimated_minutes
        );
        println!("  {}", plan.agents.join(", "));
        if plan.requires_double_confirmation {
            println!("  Requires double confirmation");
        } else if plan.requires_confirmation {
            println!("  Requires confirmation");
        }
        for warning in &plan.warnings {
            println!("  - {}", warning);
        }
    }

    let missing = roster.missing_critical(critical);
    if missing.is_empty() {
        Ok(ExitCode::SUCCESS)
    } else {
        println!("Critical agents missing: {}", missing.join(", "));
        Ok(ExitCode::FAILURE)
    }
}

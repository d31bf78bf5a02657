//! mochi: multi-task orchestrator for external AI coding agents.
//!
//! Reads a task file (or a forge issue), spins up an isolated workspace per
//! task, drives each through the worker/reviewer refinement loop, and
//! dispatches the outcome as a pull request, report, or file.

use std::path::PathBuf;
use std::{env, process};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};

use mochi::config::RunConfig;
use mochi::io::forge::GhForge;
use mochi::io::runner::CliAgentRunner;
use mochi::io::scm::GitScm;
use mochi::output::Mode;
use mochi::workspace::WorkspaceManager;
use mochi::{exit_codes, logging, scheduler};

#[derive(Parser)]
#[command(
    name = "mochi",
    version,
    about = "Multi-task AI coding agent orchestrator",
    long_about = "MOCHI reads a task file (PRD.md or a forge issue), creates an isolated\n\
                  workspace per task, invokes an AI agent in each workspace, iterates under\n\
                  reviewer guidance, and dispatches the result (PR, report, or file)."
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    #[command(flatten)]
    run: RunArgs,
}

#[derive(Subcommand)]
enum Command {
    /// Remove stale workspace registrations and manifest entries.
    ///
    /// Use after a crashed or interrupted run leaves orphaned state.
    Prune,
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Path to the task file (markdown with a tasks section)
    #[arg(
        short,
        long,
        visible_alias = "prd",
        visible_alias = "plan",
        default_value = "PRD.md"
    )]
    input: PathBuf,

    /// Pull tasks from a forge issue number (requires gh)
    #[arg(long, default_value_t = 0)]
    issue: u32,

    /// Default worker model (provider picked from the name prefix)
    #[arg(long, default_value = "claude-sonnet-4-6")]
    model: String,

    /// Reviewer model; enables the refinement loop when set
    #[arg(long, default_value = "")]
    reviewer_model: String,

    /// Maximum time in seconds to wait for a single agent invocation
    #[arg(long, default_value_t = 300)]
    timeout: u64,

    /// Run tasks one at a time instead of in parallel
    #[arg(long)]
    sequential: bool,

    /// Run only the task matching this slug
    #[arg(long = "task", default_value = "")]
    task_filter: String,

    /// Preview what would run without making any changes
    #[arg(long)]
    dry_run: bool,

    /// Stream agent output live in addition to the log file
    #[arg(long)]
    verbose: bool,

    /// Keep workspaces on disk after the run
    #[arg(long)]
    keep_workspaces: bool,

    /// What to do with each completed task
    #[arg(long, value_enum, default_value_t = Mode::PullRequest)]
    output_mode: Mode,

    /// Directory for report/file outputs
    #[arg(long, default_value = "output")]
    output_dir: PathBuf,

    /// Ref to base each workspace on
    #[arg(long, default_value = "main")]
    base_ref: String,

    /// Prefix for per-task branches
    #[arg(long, default_value = "feature")]
    branch_prefix: String,

    /// Directory that holds per-task workspaces
    #[arg(long, default_value = ".workspaces")]
    workspace_root: PathBuf,

    /// Directory for agent logs
    #[arg(long, default_value = "logs")]
    log_dir: PathBuf,

    /// Maximum worker iterations per task
    #[arg(long, default_value_t = 1)]
    max_iterations: u32,

    /// Max concurrent workspaces (0 = unlimited)
    #[arg(long, default_value_t = 0)]
    max_workspaces: u32,
}

fn main() {
    logging::init();
    let cli = Cli::parse();
    let code = match cli.command {
        Some(Command::Prune) => cmd_prune(),
        None => cmd_run(cli.run),
    };
    process::exit(code);
}

fn cmd_run(args: RunArgs) -> i32 {
    match try_run(args) {
        Ok(summary) if summary.failed == 0 => exit_codes::OK,
        Ok(_) => exit_codes::FAILURE,
        Err(err) => {
            eprintln!("Error: {err:#}");
            exit_codes::FAILURE
        }
    }
}

fn try_run(args: RunArgs) -> Result<scheduler::RunSummary> {
    let cfg = build_config(args)?;
    scheduler::check_dependencies(&cfg, scheduler::tool_on_path)?;

    let scm = GitScm::new(&cfg.repo_root);
    let forge = GhForge::new(&cfg.repo_root);
    scheduler::run(&cfg, &CliAgentRunner, &scm, &forge)
}

fn build_config(args: RunArgs) -> Result<RunConfig> {
    let repo_root = env::current_dir().context("determine working directory")?;
    let cfg = RunConfig {
        repo_root,
        input_file: args.input,
        issue_number: args.issue,
        model: args.model,
        reviewer_model: args.reviewer_model,
        timeout_secs: args.timeout,
        sequential: args.sequential,
        task_filter: args.task_filter,
        dry_run: args.dry_run,
        verbose: args.verbose,
        keep_workspaces: args.keep_workspaces,
        output_mode: args.output_mode,
        output_dir: args.output_dir,
        base_ref: args.base_ref,
        branch_prefix: args.branch_prefix,
        workspace_root: args.workspace_root,
        log_dir: args.log_dir,
        max_iterations: args.max_iterations,
        max_workspaces: args.max_workspaces,
    };
    cfg.validate()?;
    Ok(cfg)
}

fn cmd_prune() -> i32 {
    match try_prune() {
        Ok(removed) => {
            if removed.is_empty() {
                println!("Nothing to prune.");
            } else {
                for slug in &removed {
                    println!("  pruned  {slug}");
                }
                println!("Pruned {} stale workspace(s).", removed.len());
            }
            exit_codes::OK
        }
        Err(err) => {
            eprintln!("Error: {err:#}");
            exit_codes::FAILURE
        }
    }
}

fn try_prune() -> Result<Vec<String>> {
    let repo_root = env::current_dir().context("determine working directory")?;
    let defaults = RunConfig::default();
    let manager = WorkspaceManager::new(
        &repo_root,
        &defaults.base_ref,
        &defaults.branch_prefix,
        &defaults.workspace_root,
    );
    let scm = GitScm::new(&repo_root);
    manager.prune(&scm)
}

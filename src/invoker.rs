//! Worker agent invocation inside a workspace.
//!
//! Builds the worker prompt from the task plus prior memory, runs the agent
//! under a deadline, and captures the transcript into a per-iteration log
//! file. Failures are encoded in the returned [`AgentResult`], never raised.

use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::Result;
use chrono::Local;
use minijinja::{Environment, context};
use tracing::warn;

use crate::io::runner::{AgentRunner, RunRequest};
use crate::io::scm::Scm;
use crate::memory::MemoryContext;

const WORKER_TEMPLATE: &str = include_str!("prompts/worker.md");

/// Parameters for one worker invocation.
#[derive(Debug)]
pub struct InvokeOptions<'a> {
    pub workspace_path: &'a Path,
    /// Task title plus description, joined by a blank line.
    pub task_text: &'a str,
    pub model: &'a str,
    pub slug: &'a str,
    pub iteration: u32,
    pub max_iterations: u32,
    pub memory: &'a MemoryContext,
    pub timeout: Duration,
    pub log_dir: &'a Path,
    pub verbose: bool,
}

/// Why an invocation failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentError {
    Timeout { secs: u64 },
    SpawnFailure(String),
    NonZeroExit(Option<i32>),
    LogIo(String),
}

impl fmt::Display for AgentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AgentError::Timeout { secs } => write!(f, "agent timed out after {secs}s"),
            AgentError::SpawnFailure(msg) => write!(f, "cannot run agent: {msg}"),
            AgentError::NonZeroExit(code) => write!(f, "agent exited with status {code:?}"),
            AgentError::LogIo(msg) => write!(f, "agent log error: {msg}"),
        }
    }
}

/// Outcome of a single worker run.
#[derive(Debug, Clone)]
pub struct AgentResult {
    pub slug: String,
    pub success: bool,
    pub duration: Duration,
    pub log_path: PathBuf,
    /// Combined stdout+stderr captured from the agent.
    pub output: String,
    pub error: Option<AgentError>,
}

/// `<slug>.log` for single-iteration runs, `<slug>-iter<N>.log` otherwise.
pub fn log_file_name(slug: &str, iteration: u32, max_iterations: u32) -> String {
    if max_iterations > 1 {
        format!("{slug}-iter{iteration}.log")
    } else {
        format!("{slug}.log")
    }
}

/// Run one agent pass. Never errors: every failure mode lands in the result.
pub fn invoke<R: AgentRunner, S: Scm>(
    runner: &R,
    scm: &S,
    opts: &InvokeOptions<'_>,
) -> AgentResult {
    let start = Instant::now();
    let iteration = opts.iteration.max(1);
    let log_path = opts
        .log_dir
        .join(log_file_name(opts.slug, iteration, opts.max_iterations));

    if let Err(err) = write_log_header(&log_path, opts.slug, opts.model) {
        return AgentResult {
            slug: opts.slug.to_string(),
            success: false,
            duration: start.elapsed(),
            log_path,
            output: String::new(),
            error: Some(AgentError::LogIo(format!("{err:#}"))),
        };
    }

    let branch = scm
        .current_branch(opts.workspace_path)
        .unwrap_or_else(|_| "unknown".to_string());
    let prompt = build_prompt(opts, &branch);

    let request = RunRequest {
        model: opts.model.to_string(),
        prompt,
        workdir: opts.workspace_path.to_path_buf(),
        log_path: log_path.clone(),
        timeout: opts.timeout,
        echo: opts.verbose,
    };

    let result = match runner.run(&request) {
        Err(err) => AgentResult {
            slug: opts.slug.to_string(),
            success: false,
            duration: start.elapsed(),
            log_path: log_path.clone(),
            output: String::new(),
            error: Some(AgentError::SpawnFailure(format!("{err:#}"))),
        },
        Ok(run) => {
            let error = if run.timed_out {
                Some(AgentError::Timeout {
                    secs: opts.timeout.as_secs(),
                })
            } else if run.exit_code != Some(0) {
                Some(AgentError::NonZeroExit(run.exit_code))
            } else {
                None
            };
            AgentResult {
                slug: opts.slug.to_string(),
                success: error.is_none(),
                duration: start.elapsed(),
                log_path: log_path.clone(),
                output: run.output,
                error,
            }
        }
    };

    if let Err(err) = write_log_footer(
        &log_path,
        opts.slug,
        opts.model,
        result.duration,
        result.error.as_ref(),
    ) {
        warn!(slug = opts.slug, error = %format!("{err:#}"), "agent log footer write failed");
    }

    result
}

fn build_prompt(opts: &InvokeOptions<'_>, branch: &str) -> String {
    let mut env = Environment::new();
    env.add_template("worker", WORKER_TEMPLATE)
        .expect("worker template should be valid");
    let template = env
        .get_template("worker")
        .expect("worker template registered");
    template
        .render(context! {
            workspace_path => opts.workspace_path.display().to_string(),
            branch => branch,
            task => opts.task_text,
            has_memory => opts.memory.has_any(),
            feedback => opts.memory.feedback.trim(),
            progress => opts.memory.progress.trim(),
            agents => opts.memory.agents.trim(),
            iteration => opts.iteration.max(1),
            max_iterations => opts.max_iterations.max(1),
        })
        .expect("worker template rendering should not fail")
}

/// Truncate the log and stamp the start line.
fn write_log_header(path: &Path, slug: &str, model: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut file = File::create(path)?;
    writeln!(
        file,
        "[AGENT START] {} | task={} | model={}",
        Local::now().format("%Y-%m-%d %H:%M:%S"),
        slug,
        model
    )?;
    writeln!(file, "{}", "─".repeat(60))?;
    Ok(())
}

fn write_log_footer(
    path: &Path,
    slug: &str,
    model: &str,
    duration: Duration,
    error: Option<&AgentError>,
) -> Result<()> {
    let mut file = OpenOptions::new().append(true).open(path)?;
    writeln!(file, "{}", "─".repeat(60))?;
    let status = match error {
        None => "exit=0".to_string(),
        Some(err) => format!("exit=1 error={err}"),
    };
    writeln!(
        file,
        "[AGENT END] {} | task={} | model={} | duration={}s | {}",
        Local::now().format("%Y-%m-%d %H:%M:%S"),
        slug,
        model,
        duration.as_secs(),
        status
    )?;
    Ok(())
}

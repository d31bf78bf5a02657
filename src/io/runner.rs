//! Agent-runner abstraction over the external AI CLIs.
//!
//! The [`AgentRunner`] trait decouples the invoker and reviewer from the
//! actual agent backend. Tests use scripted runners that return predetermined
//! outputs without spawning processes.

use std::fs::OpenOptions;
use std::path::PathBuf;
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, info, instrument};

use crate::io::process::{CAPTURE_LIMIT_BYTES, Sink, run_with_deadline};
use crate::parser::slugify;

/// Deadline for opportunistic title generation, deliberately far below any
/// sensible task timeout so a stuck generator cannot delay the run.
pub const TITLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Parameters for one agent invocation.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub model: String,
    pub prompt: String,
    /// Working directory for the agent process.
    pub workdir: PathBuf,
    /// Log file receiving the streamed transcript (appended to).
    pub log_path: PathBuf,
    pub timeout: Duration,
    /// Also mirror output to the parent's stdout.
    pub echo: bool,
}

/// Raw outcome of an agent process.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    /// Combined stdout+stderr.
    pub output: String,
    pub exit_code: Option<i32>,
    pub timed_out: bool,
}

impl RunOutcome {
    pub fn success(&self) -> bool {
        !self.timed_out && self.exit_code == Some(0)
    }
}

/// Abstraction over agent execution backends.
pub trait AgentRunner {
    /// Run the agent to completion under the request's deadline. An `Err`
    /// means the process could not be started or captured at all; agent-level
    /// failure (non-zero exit, timeout) is reported in the outcome.
    fn run(&self, request: &RunRequest) -> Result<RunOutcome>;

    /// Produce a short branch-safe slug describing `context`.
    fn generate_title(&self, model: &str, context: &str) -> Result<String>;
}

/// Provider CLI selected from the model name.
pub fn provider_for(model: &str) -> &'static str {
    if model.starts_with("gemini-") {
        "gemini"
    } else {
        "claude"
    }
}

/// Runner that spawns the provider CLI non-interactively.
///
///   claude  -> claude --dangerously-skip-permissions -p <prompt>
///   gemini  -> gemini --model <model> -p <prompt>
pub struct CliAgentRunner;

impl CliAgentRunner {
    fn command(model: &str, prompt: &str) -> Command {
        match provider_for(model) {
            "gemini" => {
                let mut cmd = Command::new("gemini");
                cmd.args(["--model", model, "-p", prompt]);
                cmd
            }
            _ => {
                let mut cmd = Command::new("claude");
                cmd.args(["--dangerously-skip-permissions", "-p", prompt]);
                cmd
            }
        }
    }
}

impl AgentRunner for CliAgentRunner {
    #[instrument(skip_all, fields(model = %request.model, timeout_secs = request.timeout.as_secs()))]
    fn run(&self, request: &RunRequest) -> Result<RunOutcome> {
        info!(workdir = %request.workdir.display(), "starting agent");
        let log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&request.log_path)
            .with_context(|| format!("open agent log {}", request.log_path.display()))?;

        let mut cmd = Self::command(&request.model, &request.prompt);
        cmd.current_dir(&request.workdir);

        let output = run_with_deadline(
            cmd,
            request.timeout,
            Sink::new(Some(log), request.echo, CAPTURE_LIMIT_BYTES),
        )
        .with_context(|| format!("run {} agent", provider_for(&request.model)))?;

        debug!(exit_code = ?output.status.code(), timed_out = output.timed_out, "agent finished");
        Ok(RunOutcome {
            output: output.combined,
            exit_code: output.status.code(),
            timed_out: output.timed_out,
        })
    }

    fn generate_title(&self, model: &str, context: &str) -> Result<String> {
        let prompt = format!(
            "Generate a short git branch name (3-5 words, kebab-case, lowercase) \
             describing this task. Respond with the branch name only.\n\n{context}"
        );
        let cmd = Self::command(model, &prompt);
        let output = run_with_deadline(cmd, TITLE_TIMEOUT, Sink::new(None, false, 64 * 1024))
            .context("run title generator")?;

        if output.timed_out {
            return Err(anyhow!(
                "title generation timed out after {}s",
                TITLE_TIMEOUT.as_secs()
            ));
        }
        if !output.status.success() {
            return Err(anyhow!(
                "title generation failed with status {:?}",
                output.status.code()
            ));
        }

        let line = output
            .combined
            .lines()
            .map(str::trim)
            .find(|l| !l.is_empty())
            .ok_or_else(|| anyhow!("title generator produced no output"))?;
        let slug = slugify(line);
        if slug.is_empty() {
            return Err(anyhow!("title generator returned no usable name"));
        }
        Ok(slug)
    }
}

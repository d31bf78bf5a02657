//! Reviewer invocation and verdict parsing.
//!
//! The reviewer adjudicates whether the worker's output satisfies the task,
//! replying `DONE` or `RETRY: <feedback>`. Parsing is deliberately lenient so
//! extra model chatter does not break the loop.

use std::fs::File;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use minijinja::{Environment, context};

use crate::io::runner::{AgentRunner, RunRequest};
use crate::memory::{WORKER_OUTPUT_LIMIT, truncate_chars};

const REVIEWER_TEMPLATE: &str = include_str!("prompts/reviewer.md");

/// Parameters for one reviewer invocation.
#[derive(Debug)]
pub struct ReviewOptions<'a> {
    pub workspace_path: &'a Path,
    pub task_text: &'a str,
    pub model: &'a str,
    pub slug: &'a str,
    pub worker_output: &'a str,
    pub iteration: u32,
    pub max_iterations: u32,
    pub timeout: Duration,
    pub log_dir: &'a Path,
    pub verbose: bool,
}

/// The reviewer's verdict.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    pub done: bool,
    pub feedback: String,
    /// Full captured reviewer output.
    pub raw: String,
}

/// Invoke the reviewer model. Timeout and spawn failures yield an error and
/// no decision; the loop treats them as "no verdict".
pub fn review<R: AgentRunner>(runner: &R, opts: &ReviewOptions<'_>) -> Result<Decision> {
    let prompt = build_review_prompt(opts);
    let log_path = opts
        .log_dir
        .join(format!("{}-reviewer-iter{}.log", opts.slug, opts.iteration));
    File::create(&log_path)
        .with_context(|| format!("create reviewer log {}", log_path.display()))?;

    let outcome = runner.run(&RunRequest {
        model: opts.model.to_string(),
        prompt,
        workdir: opts.workspace_path.to_path_buf(),
        log_path,
        timeout: opts.timeout,
        echo: opts.verbose,
    })?;

    if outcome.timed_out {
        return Err(anyhow!(
            "reviewer timed out after {}s",
            opts.timeout.as_secs()
        ));
    }
    if !outcome.success() {
        return Err(anyhow!(
            "reviewer exited with status {:?}",
            outcome.exit_code
        ));
    }

    Ok(parse_decision(&outcome.output))
}

/// Scan the output for the first `DONE` or `RETRY:` line. With no clear
/// signal the whole trimmed output becomes retry feedback.
pub fn parse_decision(output: &str) -> Decision {
    for line in output.lines() {
        let trimmed = line.trim();
        let upper = trimmed.to_uppercase();
        if upper == "DONE" {
            return Decision {
                done: true,
                feedback: String::new(),
                raw: output.to_string(),
            };
        }
        if upper.starts_with("RETRY:") {
            // The marker is ASCII, so the original casing starts at byte 6.
            let feedback = trimmed["RETRY:".len()..].trim().to_string();
            return Decision {
                done: false,
                feedback,
                raw: output.to_string(),
            };
        }
    }
    Decision {
        done: false,
        feedback: output.trim().to_string(),
        raw: output.to_string(),
    }
}

fn build_review_prompt(opts: &ReviewOptions<'_>) -> String {
    let mut env = Environment::new();
    env.add_template("reviewer", REVIEWER_TEMPLATE)
        .expect("reviewer template should be valid");
    let template = env
        .get_template("reviewer")
        .expect("reviewer template registered");
    template
        .render(context! {
            task => opts.task_text,
            worker_output => truncate_chars(opts.worker_output, WORKER_OUTPUT_LIMIT),
            iteration => opts.iteration,
            max_iterations => opts.max_iterations,
        })
        .expect("reviewer template rendering should not fail")
}

//! Worker/reviewer refinement loop for a single task.
//!
//! Each iteration loads the workspace memory, runs the worker, optionally
//! asks the reviewer for a verdict, and persists memory for the next pass.
//! Iterations are strictly sequential within a task.

use std::path::Path;
use std::time::Duration;

use tracing::{debug, warn};

use crate::invoker::{self, AgentResult, InvokeOptions};
use crate::io::runner::AgentRunner;
use crate::io::scm::Scm;
use crate::memory::{self, IterationData, IterationStatus, MemoryContext};
use crate::parser::Task;
use crate::reviewer::{self, ReviewOptions};
use crate::workspace::WorkspaceEntry;

/// Parameters for one task's refinement loop.
#[derive(Debug)]
pub struct LoopOptions<'a> {
    pub task: &'a Task,
    pub entry: &'a WorkspaceEntry,
    /// Reviewer model; empty disables the reviewer.
    pub reviewer_model: &'a str,
    pub max_iterations: u32,
    pub timeout: Duration,
    pub log_dir: &'a Path,
    pub verbose: bool,
}

/// Outcome of a full refinement loop for one task.
#[derive(Debug, Clone)]
pub struct LoopResult {
    pub final_result: AgentResult,
    /// Iterations actually used, 1..=max_iterations.
    pub iterations: u32,
    pub final_memory: MemoryContext,
}

/// Drive worker -> reviewer -> memory cycles up to the iteration bound.
///
/// With no reviewer and a bound of 1 this is a single worker invocation.
/// Worker failure stops the loop immediately; reviewer failure is a warning
/// and the iteration counts as "no verdict".
pub fn run_refinement_loop<R: AgentRunner, S: Scm>(
    runner: &R,
    scm: &S,
    opts: &LoopOptions<'_>,
) -> LoopResult {
    let max_iter = opts.max_iterations.max(1);
    let task_text = opts.task.full_text();
    let loop_enabled = !opts.reviewer_model.is_empty() || max_iter > 1;

    let mut last_result: Option<AgentResult> = None;
    let mut final_memory = MemoryContext::default();
    let mut iterations = 0;

    for iter in 1..=max_iter {
        iterations = iter;
        let ctx = memory::load(&opts.entry.path);

        if opts.verbose && loop_enabled {
            println!("  [loop] {} iteration {iter}/{max_iter}", opts.task.slug);
        }

        let result = invoker::invoke(
            runner,
            scm,
            &InvokeOptions {
                workspace_path: &opts.entry.path,
                task_text: &task_text,
                model: &opts.task.model,
                slug: &opts.task.slug,
                iteration: iter,
                max_iterations: max_iter,
                memory: &ctx,
                timeout: opts.timeout,
                log_dir: opts.log_dir,
                verbose: opts.verbose,
            },
        );

        let mut done = false;
        let mut notes = String::new();

        if !opts.reviewer_model.is_empty() && result.success {
            match reviewer::review(
                runner,
                &ReviewOptions {
                    workspace_path: &opts.entry.path,
                    task_text: &task_text,
                    model: opts.reviewer_model,
                    slug: &opts.task.slug,
                    worker_output: &result.output,
                    iteration: iter,
                    max_iterations: max_iter,
                    timeout: opts.timeout,
                    log_dir: opts.log_dir,
                    verbose: opts.verbose,
                },
            ) {
                Ok(decision) => {
                    debug!(slug = %opts.task.slug, iter, done = decision.done, "reviewer verdict");
                    done = decision.done;
                    notes = decision.feedback;
                }
                Err(err) => {
                    println!(
                        "  ⚠ reviewer error for {} iter {iter}: {err:#}",
                        opts.task.slug
                    );
                }
            }
        } else {
            done = result.success;
        }
        if !result.success {
            // Fail fast: a broken worker will not improve by iterating.
            done = true;
        }

        let status = if !result.success {
            IterationStatus::Failed
        } else if done {
            IterationStatus::Done
        } else {
            IterationStatus::InProgress
        };

        if let Err(err) = memory::write(
            &opts.entry.path,
            &IterationData {
                iteration: iter,
                task: task_text.clone(),
                worker_output: result.output.clone(),
                reviewer_notes: notes,
                status,
            },
        ) {
            warn!(slug = %opts.task.slug, error = %format!("{err:#}"), "memory write failed");
        }
        final_memory = memory::load(&opts.entry.path);

        last_result = Some(result);
        if done {
            break;
        }
    }

    LoopResult {
        final_result: last_result.expect("loop runs at least one iteration"),
        iterations,
        final_memory,
    }
}

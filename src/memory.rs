//! Per-workspace memory store for the refinement loop.
//!
//! Four markdown files live at the workspace root and carry context between
//! iterations: `PROGRESS.md`, `MEMORY.md`, `AGENTS.md`, `FEEDBACK.md`. Each
//! iteration rewrites all four from scratch; iteration N reads only what
//! iteration N-1 wrote.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};

const FILE_PROGRESS: &str = "PROGRESS.md";
const FILE_MEMORY: &str = "MEMORY.md";
const FILE_AGENTS: &str = "AGENTS.md";
const FILE_FEEDBACK: &str = "FEEDBACK.md";

/// Worker output persisted to `MEMORY.md` is capped at this many characters.
pub const WORKER_OUTPUT_LIMIT: usize = 4_000;

/// Content of all memory files for one workspace iteration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemoryContext {
    pub progress: String,
    pub memory: String,
    pub agents: String,
    pub feedback: String,
}

impl MemoryContext {
    /// True if at least one memory file has content. Gates whether the worker
    /// prompt includes a previous-iterations section.
    pub fn has_any(&self) -> bool {
        !self.progress.is_empty()
            || !self.memory.is_empty()
            || !self.agents.is_empty()
            || !self.feedback.is_empty()
    }
}

/// Status recorded for an iteration in `PROGRESS.md`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IterationStatus {
    InProgress,
    Done,
    Failed,
}

impl IterationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            IterationStatus::InProgress => "in-progress",
            IterationStatus::Done => "done",
            IterationStatus::Failed => "failed",
        }
    }
}

/// Data to persist after a single iteration.
#[derive(Debug, Clone)]
pub struct IterationData {
    pub iteration: u32,
    pub task: String,
    pub worker_output: String,
    pub reviewer_notes: String,
    pub status: IterationStatus,
}

/// Read all four memory files from the workspace. Missing files become empty
/// strings.
pub fn load(workspace_path: &Path) -> MemoryContext {
    MemoryContext {
        progress: read_or_empty(&workspace_path.join(FILE_PROGRESS)),
        memory: read_or_empty(&workspace_path.join(FILE_MEMORY)),
        agents: read_or_empty(&workspace_path.join(FILE_AGENTS)),
        feedback: read_or_empty(&workspace_path.join(FILE_FEEDBACK)),
    }
}

/// Rewrite all four memory files from the iteration data.
pub fn write(workspace_path: &Path, data: &IterationData) -> Result<()> {
    let progress = format!(
        "# Task Progress\n\n**Task:** {}\n\n**Iteration:** {}\n\n**Status:** {}\n",
        data.task,
        data.iteration,
        data.status.as_str()
    );

    let memory = format!(
        "# Worker Memory\n\n## Iteration {} Output\n\n{}\n",
        data.iteration,
        truncate_chars(&data.worker_output, WORKER_OUTPUT_LIMIT)
    );

    let agents = build_agents_file(data);

    let feedback = if data.reviewer_notes.is_empty() {
        String::new()
    } else {
        format!(
            "# Reviewer Feedback\n\n## Iteration {}\n\n{}\n",
            data.iteration, data.reviewer_notes
        )
    };

    for (name, content) in [
        (FILE_PROGRESS, progress),
        (FILE_MEMORY, memory),
        (FILE_AGENTS, agents),
        (FILE_FEEDBACK, feedback),
    ] {
        let path = workspace_path.join(name);
        fs::write(&path, content).with_context(|| format!("write {}", path.display()))?;
    }
    Ok(())
}

fn build_agents_file(data: &IterationData) -> String {
    let mut out = String::from("# Agent Learnings\n\n");
    out.push_str(&format!(
        "Iteration {} completed with status: {}\n\n",
        data.iteration,
        data.status.as_str()
    ));
    if !data.reviewer_notes.is_empty() {
        out.push_str("## Key Feedback Points\n\n");
        out.push_str(&data.reviewer_notes);
        out.push_str("\n\n");
    }
    out.push_str("## Instructions for Next Iteration\n\n");
    out.push_str("- Review FEEDBACK.md before starting work\n");
    out.push_str("- Address all reviewer notes\n");
    out.push_str("- Build on previous iteration's progress in MEMORY.md\n");
    out
}

fn read_or_empty(path: &Path) -> String {
    fs::read_to_string(path).unwrap_or_default()
}

/// Hard-truncate to `max` characters with an inline marker. Char-boundary
/// safe; the marker is only appended when something was cut.
pub(crate) fn truncate_chars(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    let kept: String = s.chars().take(max).collect();
    format!("{kept}\n...[truncated]")
}

//! Output dispatch for completed tasks.
//!
//! The dispatch mode is a closed set validated at configuration time: either
//! the branch becomes a pull request through the forge, or a structured
//! report/file lands in the output directory. Three accepted modes are
//! currently no-ops.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use chrono::Local;
use clap::ValueEnum;

use crate::invoker::{AgentResult, log_file_name};
use crate::io::forge::{Forge, build_pr_body};
use crate::io::scm::Scm;
use crate::memory::MemoryContext;
use crate::parser::Task;
use crate::workspace::WorkspaceEntry;

/// What to do with the final worker output of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Mode {
    PullRequest,
    Report,
    File,
    /// Accepted but not implemented yet.
    Audit,
    /// Accepted but not implemented yet.
    KnowledgeBase,
    /// Accepted but not implemented yet.
    Issue,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::PullRequest => "pull-request",
            Mode::Report => "report",
            Mode::File => "file",
            Mode::Audit => "audit",
            Mode::KnowledgeBase => "knowledge-base",
            Mode::Issue => "issue",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Mode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pull-request" => Ok(Mode::PullRequest),
            "report" => Ok(Mode::Report),
            "file" => Ok(Mode::File),
            "audit" => Ok(Mode::Audit),
            "knowledge-base" => Ok(Mode::KnowledgeBase),
            "issue" => Ok(Mode::Issue),
            other => bail!("unknown output mode {other:?}"),
        }
    }
}

/// Everything needed to dispatch one task's final output.
#[derive(Debug)]
pub struct DispatchOptions<'a> {
    pub mode: Mode,
    pub task: &'a Task,
    pub entry: &'a WorkspaceEntry,
    pub result: &'a AgentResult,
    pub memory: &'a MemoryContext,
    pub iterations: u32,
    pub output_dir: &'a Path,
    pub log_dir: &'a Path,
}

/// What dispatch did, for the scheduler's per-task result line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatched {
    PullRequest { url: String },
    Wrote { path: PathBuf },
    Noop,
}

/// Dispatch one successful task's output in the configured mode.
pub fn dispatch<S: Scm, F: Forge>(
    scm: &S,
    forge: &F,
    opts: &DispatchOptions<'_>,
) -> Result<Dispatched> {
    match opts.mode {
        Mode::PullRequest => dispatch_pull_request(scm, forge, opts),
        Mode::Report => write_output_file(
            opts,
            &format!("{}-report.md", opts.task.slug),
            build_report_content(opts),
        ),
        Mode::File => write_output_file(
            opts,
            &format!("{}.md", opts.task.slug),
            build_file_content(opts),
        ),
        Mode::Audit | Mode::KnowledgeBase | Mode::Issue => Ok(Dispatched::Noop),
    }
}

fn dispatch_pull_request<S: Scm, F: Forge>(
    scm: &S,
    forge: &F,
    opts: &DispatchOptions<'_>,
) -> Result<Dispatched> {
    scm.push_branch(&opts.entry.branch)
        .with_context(|| format!("push branch {}", opts.entry.branch))?;

    // The final iteration's log carries the iter suffix only for looped runs.
    let log_path = opts
        .log_dir
        .join(log_file_name(&opts.task.slug, opts.iterations, opts.iterations));
    let body = build_pr_body(&opts.task.title, &log_path);
    let url = forge
        .create_pull_request(&opts.task.title, &body, &opts.entry.branch)
        .with_context(|| format!("create pull request for {}", opts.task.slug))?;
    Ok(Dispatched::PullRequest { url })
}

fn write_output_file(
    opts: &DispatchOptions<'_>,
    filename: &str,
    content: String,
) -> Result<Dispatched> {
    fs::create_dir_all(opts.output_dir)
        .with_context(|| format!("create output dir {}", opts.output_dir.display()))?;
    let path = opts.output_dir.join(filename);
    fs::write(&path, content).with_context(|| format!("write output {}", path.display()))?;
    Ok(Dispatched::Wrote { path })
}

fn build_file_content(opts: &DispatchOptions<'_>) -> String {
    let mut out = format!("# Task Output: {}\n\n", opts.task.slug);
    out.push_str(&format!("**Task:** {}\n\n", opts.task.title));
    out.push_str(&format!("**Model:** {}\n\n", opts.task.model));
    out.push_str(&format!("**Iterations:** {}\n\n", opts.iterations));
    out.push_str(&format!(
        "**Generated:** {}\n\n",
        Local::now().format("%Y-%m-%d %H:%M:%S")
    ));
    out.push_str("---\n\n## Output\n\n");
    out.push_str(&opts.result.output);
    out.push('\n');
    out
}

fn build_report_content(opts: &DispatchOptions<'_>) -> String {
    let mut out = format!("# Task Report: {}\n\n", opts.task.slug);
    out.push_str(&format!("**Task:** {}\n\n", opts.task.title));
    out.push_str(&format!("**Model:** {}\n\n", opts.task.model));
    out.push_str(&format!("**Iterations completed:** {}\n\n", opts.iterations));
    out.push_str(&format!(
        "**Generated:** {}\n\n",
        Local::now().format("%Y-%m-%d %H:%M:%S")
    ));
    out.push_str("---\n\n");

    if !opts.task.description.is_empty() {
        out.push_str(&opts.task.description);
        out.push_str("\n\n");
    }
    if !opts.memory.progress.is_empty() {
        out.push_str("## Progress Summary\n\n");
        out.push_str(&opts.memory.progress);
        out.push_str("\n\n");
    }

    out.push_str("## Final Output\n\n");
    out.push_str(&opts.result.output);
    out.push_str("\n\n");

    if !opts.memory.memory.is_empty() {
        out.push_str("## Worker Memory\n\n");
        out.push_str(&opts.memory.memory);
        out.push_str("\n\n");
    }
    if !opts.memory.agents.is_empty() {
        out.push_str("## Agent Learnings\n\n");
        out.push_str(&opts.memory.agents);
        out.push('\n');
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{MemForge, MemScm};
    use crate::workspace::WorkspaceStatus;
    use std::time::Duration;

    fn fixtures(output_dir: &Path) -> (Task, WorkspaceEntry, AgentResult) {
        let task = Task {
            title: "Add auth".to_string(),
            description: "Use sessions.".to_string(),
            slug: "add-auth".to_string(),
            model: "claude-sonnet-4-6".to_string(),
        };
        let entry = WorkspaceEntry {
            slug: task.slug.clone(),
            path: output_dir.join("ws"),
            branch: "feature/add-auth".to_string(),
            status: WorkspaceStatus::Done,
        };
        let result = AgentResult {
            slug: task.slug.clone(),
            success: true,
            duration: Duration::from_secs(12),
            log_path: output_dir.join("add-auth.log"),
            output: "implemented auth".to_string(),
            error: None,
        };
        (task, entry, result)
    }

    #[test]
    fn unknown_modes_are_rejected_at_parse_time() {
        assert!("pull-request".parse::<Mode>().is_ok());
        assert!("knowledge-base".parse::<Mode>().is_ok());
        let err = "research-report".parse::<Mode>().unwrap_err();
        assert!(err.to_string().contains("unknown output mode"));
    }

    #[test]
    fn file_mode_writes_task_metadata_and_output() {
        let temp = tempfile::tempdir().expect("tempdir");
        let out_dir = temp.path().join("out");
        let (task, entry, result) = fixtures(temp.path());
        let memory = MemoryContext::default();

        let dispatched = dispatch(
            &MemScm::with_ref("main"),
            &MemForge::default(),
            &DispatchOptions {
                mode: Mode::File,
                task: &task,
                entry: &entry,
                result: &result,
                memory: &memory,
                iterations: 1,
                output_dir: &out_dir,
                log_dir: temp.path(),
            },
        )
        .expect("dispatch");

        let Dispatched::Wrote { path } = dispatched else {
            panic!("expected a written file");
        };
        assert!(path.ends_with("add-auth.md"));
        let content = fs::read_to_string(&path).expect("read output");
        assert!(content.contains("# Task Output: add-auth"));
        assert!(content.contains("implemented auth"));
    }

    #[test]
    fn report_mode_includes_only_non_empty_memory_sections() {
        let temp = tempfile::tempdir().expect("tempdir");
        let out_dir = temp.path().join("out");
        let (task, entry, result) = fixtures(temp.path());
        let memory = MemoryContext {
            progress: "iteration notes".to_string(),
            ..MemoryContext::default()
        };

        let dispatched = dispatch(
            &MemScm::with_ref("main"),
            &MemForge::default(),
            &DispatchOptions {
                mode: Mode::Report,
                task: &task,
                entry: &entry,
                result: &result,
                memory: &memory,
                iterations: 2,
                output_dir: &out_dir,
                log_dir: temp.path(),
            },
        )
        .expect("dispatch");

        let Dispatched::Wrote { path } = dispatched else {
            panic!("expected a written report");
        };
        let content = fs::read_to_string(&path).expect("read report");
        assert!(content.contains("# Task Report: add-auth"));
        assert!(content.contains("## Progress Summary"));
        assert!(!content.contains("## Worker Memory"));
        assert!(!content.contains("## Agent Learnings"));
    }

    #[test]
    fn pull_request_mode_pushes_then_opens_a_pr() {
        let temp = tempfile::tempdir().expect("tempdir");
        let (task, entry, result) = fixtures(temp.path());
        let memory = MemoryContext::default();
        let scm = MemScm::with_ref("main");
        let forge = MemForge::default();

        let dispatched = dispatch(
            &scm,
            &forge,
            &DispatchOptions {
                mode: Mode::PullRequest,
                task: &task,
                entry: &entry,
                result: &result,
                memory: &memory,
                iterations: 1,
                output_dir: temp.path(),
                log_dir: temp.path(),
            },
        )
        .expect("dispatch");

        assert!(matches!(dispatched, Dispatched::PullRequest { .. }));
        assert_eq!(scm.pushed(), vec!["feature/add-auth".to_string()]);
        let prs = forge.created();
        assert_eq!(prs.len(), 1);
        assert_eq!(prs[0].0, "Add auth");
        assert!(prs[0].1.contains("MOCHI"));
    }

    #[test]
    fn stub_modes_are_noops() {
        let temp = tempfile::tempdir().expect("tempdir");
        let (task, entry, result) = fixtures(temp.path());
        let memory = MemoryContext::default();

        for mode in [Mode::Audit, Mode::KnowledgeBase, Mode::Issue] {
            let dispatched = dispatch(
                &MemScm::with_ref("main"),
                &MemForge::default(),
                &DispatchOptions {
                    mode,
                    task: &task,
                    entry: &entry,
                    result: &result,
                    memory: &memory,
                    iterations: 1,
                    output_dir: temp.path(),
                    log_dir: temp.path(),
                },
            )
            .expect("dispatch");
            assert_eq!(dispatched, Dispatched::Noop);
        }
    }
}

//! Whole-run orchestration.
//!
//! Resolves the task source, parses tasks, creates workspaces up front, then
//! dispatches per-task refinement loops either sequentially or on scoped
//! threads under an optional concurrency ceiling. Output dispatch, cleanup,
//! and the summary run after every loop has joined.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Condvar, Mutex, mpsc};
use std::{env, fs, thread};

use anyhow::{Context, Result, bail};
use tracing::{debug, warn};

use crate::config::{DEFAULT_INPUT, RunConfig};
use crate::io::forge::Forge;
use crate::io::runner::AgentRunner;
use crate::io::scm::Scm;
use crate::output::{self, DispatchOptions, Dispatched, Mode};
use crate::parser::{self, Task};
use crate::refine::{self, LoopOptions, LoopResult};
use crate::workspace::{WorkspaceEntry, WorkspaceManager, WorkspaceStatus};

/// Slugs this long are assumed to be auto-generated sentence slugs and get a
/// refinement attempt.
const LONG_SLUG_LEN: usize = 50;

/// Probed when the configured input equals the default and is missing.
const CANDIDATE_INPUTS: &[&str] = &[
    "PLAN.md",
    "plan.md",
    "input.md",
    "tasks.md",
    "docs/PLAN.md",
    "docs/PRD.md",
    "examples/PRD.md",
];

/// Final tally of a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub succeeded: usize,
    pub failed: usize,
}

/// Verify required external tools are present. `have` answers whether a tool
/// is on PATH so tests can substitute the probe.
pub fn check_dependencies(cfg: &RunConfig, have: impl Fn(&str) -> bool) -> Result<()> {
    let mut needed = vec![("git", "https://git-scm.com")];
    if cfg.model.starts_with("gemini-") {
        needed.push(("gemini", "https://ai.google.dev/gemini-api/docs/gemini-cli"));
    } else {
        needed.push(("claude", "https://claude.ai/code"));
    }
    if cfg.output_mode == Mode::PullRequest || cfg.issue_number > 0 {
        needed.push(("gh", "https://cli.github.com"));
    }

    let missing: Vec<_> = needed.into_iter().filter(|(name, _)| !have(name)).collect();
    if missing.is_empty() {
        return Ok(());
    }

    let names: Vec<&str> = missing.iter().map(|(name, _)| *name).collect();
    let mut msg = format!("missing required tools: {}", names.join(", "));
    for (name, url) in &missing {
        msg.push_str(&format!("\n  → install {name} from {url}"));
    }
    bail!(msg)
}

/// PATH probe for [`check_dependencies`].
pub fn tool_on_path(name: &str) -> bool {
    let Some(paths) = env::var_os("PATH") else {
        return false;
    };
    env::split_paths(&paths).any(|dir| is_executable(&dir.join(name)))
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    fs::metadata(path)
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

/// Execute a full run: resolve, parse, create workspaces, dispatch loops,
/// dispatch output, clean up, and summarize.
///
/// Setup failures abort with an error; per-task failures are folded into the
/// summary so the caller can collapse them into the exit code.
pub fn run<R, S, F>(cfg: &RunConfig, runner: &R, scm: &S, forge: &F) -> Result<RunSummary>
where
    R: AgentRunner + Sync,
    S: Scm + Sync,
    F: Forge + Sync,
{
    let (task_file, _issue_guard) = resolve_task_file(cfg, forge)?;
    let mut tasks = parser::parse_file(&task_file)?;

    if !cfg.task_filter.is_empty() {
        tasks.retain(|task| task.slug == cfg.task_filter);
        if tasks.is_empty() {
            bail!("no task found with slug {:?}", cfg.task_filter);
        }
    }

    for task in &mut tasks {
        if task.model.is_empty() {
            task.model = cfg.model.clone();
        }
    }
    uniquify_slugs(&mut tasks);
    refine_long_slugs(cfg, runner, &mut tasks);

    let slugs: Vec<&str> = tasks.iter().map(|task| task.slug.as_str()).collect();
    print_section(&format!(
        "Found {} task(s): {}",
        tasks.len(),
        slugs.join(", ")
    ));

    if cfg.dry_run {
        print_dry_run(cfg, &tasks);
        return Ok(RunSummary::default());
    }

    let log_dir = cfg.repo_root.join(&cfg.log_dir);
    fs::create_dir_all(&log_dir)
        .with_context(|| format!("create log dir {}", log_dir.display()))?;
    let output_dir = cfg.repo_root.join(&cfg.output_dir);

    let manager = WorkspaceManager::new(
        &cfg.repo_root,
        &cfg.base_ref,
        &cfg.branch_prefix,
        &cfg.workspace_root,
    );

    print_section("Creating workspaces...");
    let mut entries = Vec::with_capacity(tasks.len());
    for task in &tasks {
        // Abort on the first failure; earlier workspaces stay for inspection.
        let entry = match manager.create(scm, &task.slug) {
            Ok(entry) => entry,
            Err(err) => {
                println!("  ✗ {:<30} {err:#}", task.slug);
                return Err(err);
            }
        };
        println!("  ✓ {:<30} ({})", entry.path.display(), entry.branch);
        entries.push(entry);
    }

    print_section("Invoking agents...");
    let loop_results = dispatch_loops(cfg, runner, scm, &manager, &tasks, &entries, &log_dir);

    dispatch_output(cfg, scm, forge, &tasks, &entries, &loop_results, &output_dir, &log_dir);

    if !cfg.keep_workspaces {
        print_section("Cleaning up workspaces...");
        for task in &tasks {
            if let Err(err) = manager.destroy(scm, &task.slug) {
                println!("  ⚠ cleanup failed for {}: {err:#}", task.slug);
            }
        }
    }

    let summary = summarize(&loop_results);
    print_summary(summary);
    Ok(summary)
}

/// Run every task's refinement loop, in order or concurrently.
fn dispatch_loops<R, S>(
    cfg: &RunConfig,
    runner: &R,
    scm: &S,
    manager: &WorkspaceManager,
    tasks: &[Task],
    entries: &[WorkspaceEntry],
    log_dir: &Path,
) -> Vec<LoopResult>
where
    R: AgentRunner + Sync,
    S: Scm + Sync,
{
    let run_one = |task: &Task, entry: &WorkspaceEntry| -> LoopResult {
        println!("  ⟳  {:<28} [{}]", task.slug, task.model);
        if let Err(err) = manager.update_status(&task.slug, WorkspaceStatus::Running) {
            warn!(slug = %task.slug, error = %format!("{err:#}"), "status update failed");
        }
        let result = refine::run_refinement_loop(
            runner,
            scm,
            &LoopOptions {
                task,
                entry,
                reviewer_model: &cfg.reviewer_model,
                max_iterations: cfg.max_iterations.max(1),
                timeout: cfg.timeout(),
                log_dir,
                verbose: cfg.verbose,
            },
        );
        let status = if result.final_result.success {
            WorkspaceStatus::Done
        } else {
            WorkspaceStatus::Failed
        };
        if let Err(err) = manager.update_status(&task.slug, status) {
            warn!(slug = %task.slug, error = %format!("{err:#}"), "status update failed");
        }
        print_loop_result(&result);
        result
    };

    if cfg.sequential {
        return tasks
            .iter()
            .zip(entries)
            .map(|(task, entry)| run_one(task, entry))
            .collect();
    }

    let ceiling = cfg.max_workspaces as usize;
    let semaphore = (ceiling > 0 && ceiling < tasks.len()).then(|| {
        println!("  Concurrency limited to {ceiling} workspace(s)");
        Semaphore::new(ceiling)
    });

    let (tx, rx) = mpsc::channel();
    thread::scope(|scope| {
        for (idx, (task, entry)) in tasks.iter().zip(entries).enumerate() {
            let tx = tx.clone();
            let semaphore = semaphore.as_ref();
            let run_one = &run_one;
            scope.spawn(move || {
                let _permit = semaphore.map(Semaphore::acquire);
                let result = run_one(task, entry);
                let _ = tx.send((idx, result));
            });
        }
    });
    drop(tx);

    let mut slots: Vec<Option<LoopResult>> = tasks.iter().map(|_| None).collect();
    for (idx, result) in rx {
        slots[idx] = Some(result);
    }
    slots
        .into_iter()
        .map(|slot| slot.expect("every dispatched task reports a result"))
        .collect()
}

/// Dispatch output for each successful task; failures warn and continue.
#[allow(clippy::too_many_arguments)]
fn dispatch_output<S: Scm, F: Forge>(
    cfg: &RunConfig,
    scm: &S,
    forge: &F,
    tasks: &[Task],
    entries: &[WorkspaceEntry],
    loop_results: &[LoopResult],
    output_dir: &Path,
    log_dir: &Path,
) {
    print_section(&format!("Dispatching output ({})...", cfg.output_mode));
    for ((task, entry), result) in tasks.iter().zip(entries).zip(loop_results) {
        if !result.final_result.success {
            println!("  ⚠ Skipping output for {:<24} (agent failed)", task.slug);
            continue;
        }
        let dispatched = output::dispatch(
            scm,
            forge,
            &DispatchOptions {
                mode: cfg.output_mode,
                task,
                entry,
                result: &result.final_result,
                memory: &result.final_memory,
                iterations: result.iterations,
                output_dir,
                log_dir,
            },
        );
        match dispatched {
            Ok(Dispatched::PullRequest { url }) => println!("  ✓ {:<30} {url}", task.slug),
            Ok(Dispatched::Wrote { path }) => {
                println!("  ✓ {:<30} written to {}", task.slug, path.display())
            }
            Ok(Dispatched::Noop) => {}
            Err(err) => println!("  ✗ Output failed for {}: {err:#}", task.slug),
        }
    }
}

/// Resolve where tasks come from: a fetched issue body, the configured file,
/// or the first existing candidate when the default is missing.
fn resolve_task_file<F: Forge>(
    cfg: &RunConfig,
    forge: &F,
) -> Result<(PathBuf, Option<TempTaskFile>)> {
    if cfg.issue_number > 0 {
        let path = forge
            .fetch_issue_body(cfg.issue_number)
            .with_context(|| format!("fetch issue #{}", cfg.issue_number))?;
        return Ok((path.clone(), Some(TempTaskFile { path })));
    }

    if cfg.input_file.as_os_str().is_empty() {
        bail!("no task file specified — use --input <path>");
    }

    let configured = cfg.repo_root.join(&cfg.input_file);
    if cfg.input_file == Path::new(DEFAULT_INPUT) && !configured.exists() {
        for candidate in CANDIDATE_INPUTS {
            let path = cfg.repo_root.join(candidate);
            if path.exists() {
                debug!(path = %path.display(), "using candidate task file");
                return Ok((path, None));
            }
        }
    }

    Ok((configured, None))
}

/// Deletes a fetched issue-body file when the run is over.
struct TempTaskFile {
    path: PathBuf,
}

impl Drop for TempTaskFile {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

/// Give duplicate slugs `-2`, `-3`, ... suffixes so no two workspaces can
/// share a path or branch within one run.
fn uniquify_slugs(tasks: &mut [Task]) {
    let mut seen: HashSet<String> = HashSet::new();
    for task in tasks {
        if seen.insert(task.slug.clone()) {
            continue;
        }
        // Leave room for the suffix under the 100-char slug cap.
        let base = if task.slug.len() > 90 {
            task.slug[..90].trim_end_matches('-').to_string()
        } else {
            task.slug.clone()
        };
        for n in 2.. {
            let candidate = format!("{base}-{n}");
            if seen.insert(candidate.clone()) {
                task.slug = candidate;
                break;
            }
        }
    }
}

/// Opportunistically replace unwieldy auto-generated slugs, in parallel.
/// Failures are logged and the original slug stays.
fn refine_long_slugs<R: AgentRunner + Sync>(cfg: &RunConfig, runner: &R, tasks: &mut [Task]) {
    if !tasks.iter().any(|task| task.slug.len() >= LONG_SLUG_LEN) {
        return;
    }
    print_section("Refining branch titles...");

    let updates: Vec<(usize, Result<String>)> = thread::scope(|scope| {
        let handles: Vec<_> = tasks
            .iter()
            .enumerate()
            .filter(|(_, task)| task.slug.len() >= LONG_SLUG_LEN)
            .map(|(idx, task)| {
                scope.spawn(move || (idx, runner.generate_title(&task.model, &task.full_text())))
            })
            .collect();
        handles
            .into_iter()
            .map(|handle| handle.join().expect("title thread panicked"))
            .collect()
    });

    for (idx, update) in updates {
        match update {
            Ok(slug) if !slug.is_empty() => {
                debug!(idx, slug = %slug, "refined slug");
                tasks[idx].slug = slug;
            }
            Ok(_) => {}
            Err(err) => {
                if cfg.verbose {
                    println!("  ⚠ Failed to generate title for task {}: {err:#}", idx + 1);
                }
                debug!(idx, error = %format!("{err:#}"), "slug refinement failed");
            }
        }
    }
}

fn summarize(loop_results: &[LoopResult]) -> RunSummary {
    let succeeded = loop_results
        .iter()
        .filter(|result| result.final_result.success)
        .count();
    RunSummary {
        succeeded,
        failed: loop_results.len() - succeeded,
    }
}

fn print_dry_run(cfg: &RunConfig, tasks: &[Task]) {
    println!("\n[MOCHI DRY RUN] The following would be executed:\n");
    if cfg.max_workspaces > 0 {
        println!("  Max concurrent workspaces: {}\n", cfg.max_workspaces);
    }
    for (idx, task) in tasks.iter().enumerate() {
        println!("  Task {}: {:?}", idx + 1, task.title);
        println!("    Branch:      {}/{}", cfg.branch_prefix, task.slug);
        println!(
            "    Workspace:   {}/{}",
            cfg.workspace_root.display(),
            task.slug
        );
        println!("    Model:       {}", task.model);
        println!("    Log:         {}/{}.log", cfg.log_dir.display(), task.slug);
        if !cfg.reviewer_model.is_empty() {
            println!(
                "    Reviewer:    {} (max {} iterations)",
                cfg.reviewer_model, cfg.max_iterations
            );
        }
        println!("    Output mode: {}\n", cfg.output_mode);
    }
    println!("No changes made.");
}

fn print_loop_result(result: &LoopResult) {
    let worker = &result.final_result;
    let secs = worker.duration.as_secs();
    if worker.success {
        if result.iterations > 1 {
            println!(
                "  ✓ {:<30} done  ({secs}s, {} iterations)",
                worker.slug, result.iterations
            );
        } else {
            println!("  ✓ {:<30} done  ({secs}s)", worker.slug);
        }
    } else {
        println!(
            "  ✗ {:<30} FAILED ({secs}s) — see {}",
            worker.slug,
            worker.log_path.display()
        );
    }
}

fn print_section(message: &str) {
    println!("\n[MOCHI] {message}");
}

fn print_summary(summary: RunSummary) {
    println!();
    println!("─────────────────────────────────────────────────");
    println!(
        "[MOCHI] Run complete: {} succeeded, {} failed",
        summary.succeeded, summary.failed
    );
    println!("─────────────────────────────────────────────────");
}

/// Counting semaphore bounding in-flight refinement loops.
struct Semaphore {
    permits: Mutex<usize>,
    available: Condvar,
}

struct SemaphorePermit<'a> {
    semaphore: &'a Semaphore,
}

impl Semaphore {
    fn new(permits: usize) -> Self {
        Self {
            permits: Mutex::new(permits),
            available: Condvar::new(),
        }
    }

    fn acquire(&self) -> SemaphorePermit<'_> {
        let mut permits = self.permits.lock().expect("semaphore lock poisoned");
        while *permits == 0 {
            permits = self
                .available
                .wait(permits)
                .expect("semaphore lock poisoned");
        }
        *permits -= 1;
        SemaphorePermit { semaphore: self }
    }
}

impl Drop for SemaphorePermit<'_> {
    fn drop(&mut self) {
        let mut permits = self
            .semaphore
            .permits
            .lock()
            .expect("semaphore lock poisoned");
        *permits += 1;
        self.semaphore.available.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn task(slug: &str) -> Task {
        Task {
            title: slug.replace('-', " "),
            description: String::new(),
            slug: slug.to_string(),
            model: String::new(),
        }
    }

    #[test]
    fn missing_tools_are_reported_together_with_hints() {
        let cfg = RunConfig::default();
        let err = check_dependencies(&cfg, |_| false).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("git"));
        assert!(msg.contains("claude"));
        assert!(msg.contains("gh"));
        assert!(msg.contains("install"));
    }

    #[test]
    fn gemini_models_require_the_gemini_cli() {
        let cfg = RunConfig {
            model: "gemini-2.5-pro".to_string(),
            output_mode: Mode::File,
            ..RunConfig::default()
        };
        let err = check_dependencies(&cfg, |name| name == "git").unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("gemini"));
        assert!(!msg.contains("gh"));
    }

    #[test]
    fn dependencies_pass_when_everything_is_present() {
        let cfg = RunConfig::default();
        check_dependencies(&cfg, |_| true).expect("all tools present");
    }

    #[test]
    fn duplicate_slugs_get_numeric_suffixes() {
        let mut tasks = vec![task("fix"), task("fix"), task("fix"), task("other")];
        uniquify_slugs(&mut tasks);
        let slugs: Vec<&str> = tasks.iter().map(|t| t.slug.as_str()).collect();
        assert_eq!(slugs, vec!["fix", "fix-2", "fix-3", "other"]);
    }

    #[test]
    fn uniquified_slugs_respect_the_length_cap() {
        let long = "a".repeat(100);
        let mut tasks = vec![task(&long), task(&long)];
        uniquify_slugs(&mut tasks);
        assert!(tasks[1].slug.len() <= 100);
        assert_ne!(tasks[0].slug, tasks[1].slug);
    }

    #[test]
    fn candidate_inputs_are_probed_when_default_is_missing() {
        let temp = tempfile::tempdir().expect("tempdir");
        std::fs::write(temp.path().join("tasks.md"), "## Tasks\n- a\n").expect("write");
        let cfg = RunConfig {
            repo_root: temp.path().to_path_buf(),
            ..RunConfig::default()
        };

        let (path, guard) =
            resolve_task_file(&cfg, &crate::test_support::MemForge::default()).expect("resolve");
        assert!(path.ends_with("tasks.md"));
        assert!(guard.is_none());
    }

    #[test]
    fn configured_non_default_input_is_not_probed() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = RunConfig {
            repo_root: temp.path().to_path_buf(),
            input_file: PathBuf::from("my-tasks.md"),
            ..RunConfig::default()
        };

        let (path, _) =
            resolve_task_file(&cfg, &crate::test_support::MemForge::default()).expect("resolve");
        assert!(path.ends_with("my-tasks.md"));
    }

    #[test]
    fn issue_bodies_are_fetched_into_a_temp_file_and_cleaned_up() {
        let forge = crate::test_support::MemForge::default();
        forge.set_issue_body(88, "## Tasks\n- from issue\n");
        let cfg = RunConfig {
            issue_number: 88,
            ..RunConfig::default()
        };

        let (path, guard) = resolve_task_file(&cfg, &forge).expect("resolve");
        assert!(path.exists());
        drop(guard);
        assert!(!path.exists());
    }

    #[test]
    fn long_slugs_are_refined_and_failures_keep_the_original() {
        let runner = crate::test_support::ScriptedRunner::default();
        runner.push_title("short-name");
        runner.push_title_error("generator offline");

        let long_a = "very-".repeat(12) + "long";
        let long_b = "also-".repeat(12) + "long";
        let mut tasks = vec![task(&long_a), task(&long_b), task("short")];
        let cfg = RunConfig::default();

        refine_long_slugs(&cfg, &runner, &mut tasks);

        let refined: Vec<&str> = tasks.iter().map(|t| t.slug.as_str()).collect();
        assert!(refined.contains(&"short-name"));
        assert!(refined.contains(&"short"));
        // One generator call failed; that task keeps its original slug.
        assert!(
            refined.iter().any(|slug| *slug == long_a || *slug == long_b),
            "failed refinement should keep the original slug: {refined:?}"
        );
    }

    #[test]
    fn semaphore_bounds_concurrent_holders() {
        let semaphore = Arc::new(Semaphore::new(2));
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        thread::scope(|scope| {
            for _ in 0..8 {
                let semaphore = Arc::clone(&semaphore);
                let in_flight = Arc::clone(&in_flight);
                let peak = Arc::clone(&peak);
                scope.spawn(move || {
                    let _permit = semaphore.acquire();
                    let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    thread::sleep(Duration::from_millis(10));
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                });
            }
        });

        assert!(peak.load(Ordering::SeqCst) <= 2);
    }
}

//! Code-forge capability and its `gh` implementation.

use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use std::{env, fs};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument};

/// Lines of the final iteration log included in a pull-request body.
pub const PR_LOG_TAIL_LINES: usize = 20;

/// Abstraction over the code forge.
pub trait Forge {
    /// Fetch an issue body into a file and return its path.
    fn fetch_issue_body(&self, number: u32) -> Result<PathBuf>;
    /// Open a pull request for `branch`; returns its URL.
    fn create_pull_request(&self, title: &str, body: &str, branch: &str) -> Result<String>;
}

/// Shells out to the `gh` CLI rooted at the repository.
#[derive(Debug, Clone)]
pub struct GhForge {
    repo_root: PathBuf,
}

impl GhForge {
    pub fn new(repo_root: impl Into<PathBuf>) -> Self {
        Self {
            repo_root: repo_root.into(),
        }
    }

    fn run_checked(&self, args: &[&str]) -> Result<Output> {
        let output = Command::new("gh")
            .args(args)
            .current_dir(&self.repo_root)
            .output()
            .with_context(|| format!("spawn gh {}", args.join(" ")))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!(
                "gh {} failed: {}",
                args.join(" "),
                stderr.trim()
            ));
        }
        Ok(output)
    }
}

impl Forge for GhForge {
    #[instrument(skip_all, fields(number))]
    fn fetch_issue_body(&self, number: u32) -> Result<PathBuf> {
        let out = self.run_checked(&[
            "issue",
            "view",
            &number.to_string(),
            "--json",
            "body",
            "--jq",
            ".body",
        ])?;
        let body = String::from_utf8_lossy(&out.stdout).into_owned();
        if body.trim().is_empty() {
            return Err(anyhow!("issue #{number} has an empty body"));
        }

        let path = env::temp_dir().join(format!("mochi-issue-{number}.md"));
        fs::write(&path, body).with_context(|| format!("write issue body {}", path.display()))?;
        debug!(path = %path.display(), "fetched issue body");
        Ok(path)
    }

    fn create_pull_request(&self, title: &str, body: &str, branch: &str) -> Result<String> {
        let out = self.run_checked(&[
            "pr", "create", "--title", title, "--body", body, "--head", branch,
        ])?;
        Ok(String::from_utf8_lossy(&out.stdout).trim().to_string())
    }
}

/// Build a pull-request body from the task title and the tail of the final
/// iteration log. The log section is omitted when the log is missing or
/// empty.
pub fn build_pr_body(task_title: &str, log_path: &Path) -> String {
    let mut body = String::from("## Summary\n\n");
    body.push_str(task_title);
    body.push('\n');

    let tail = read_log_tail(log_path, PR_LOG_TAIL_LINES);
    if !tail.is_empty() {
        body.push_str("\n## Agent Log\n\n```\n");
        body.push_str(&tail);
        body.push_str("\n```\n");
    }

    body.push_str("\n---\nOpened automatically by MOCHI.\n");
    body
}

/// Last `max_lines` lines of the file, or empty when unreadable.
pub fn read_log_tail(path: &Path, max_lines: usize) -> String {
    let Ok(contents) = fs::read_to_string(path) else {
        return String::new();
    };
    let lines: Vec<&str> = contents.lines().collect();
    let start = lines.len().saturating_sub(max_lines);
    lines[start..].join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn pr_body_without_log_skips_agent_log_section() {
        let body = build_pr_body("Add user authentication", Path::new("/nonexistent/path.log"));

        assert!(body.contains("Add user authentication"));
        assert!(body.contains("MOCHI"));
        assert!(!body.contains("## Agent Log"));
    }

    #[test]
    fn pr_body_with_log_includes_agent_log_section() {
        let temp = tempfile::tempdir().expect("tempdir");
        let log_path = temp.path().join("fix-bug.log");
        fs::write(&log_path, "agent output line 1\nagent output line 2\n").expect("write log");

        let body = build_pr_body("Fix the bug", &log_path);

        assert!(body.contains("## Agent Log"));
        assert!(body.contains("agent output line 1"));
    }

    #[test]
    fn log_tail_of_missing_file_is_empty() {
        assert_eq!(read_log_tail(Path::new("/nonexistent/log.log"), 20), "");
    }

    #[test]
    fn log_tail_keeps_short_files_whole() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("short.log");
        fs::write(&path, "line 1\nline 2\nline 3\n").expect("write");

        let tail = read_log_tail(&path, 20);
        assert!(tail.contains("line 1"));
        assert!(tail.contains("line 3"));
    }

    #[test]
    fn log_tail_truncates_to_last_twenty_lines() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("long.log");
        let mut file = fs::File::create(&path).expect("create");
        for i in 1..=25 {
            writeln!(file, "line {i}").expect("write line");
        }
        drop(file);

        let tail = read_log_tail(&path, 20);
        assert_eq!(tail.lines().count(), 20);
        assert!(!tail.contains("line 5\n"));
        assert!(tail.contains("line 25"));
    }
}

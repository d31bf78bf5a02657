//! Source-control capability and its git implementation.
//!
//! The workspace manager drives isolation through this narrow trait so tests
//! can substitute an in-memory SCM without spawning processes.

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument};

/// One workspace known to the SCM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkspaceListing {
    pub path: PathBuf,
    pub branch: String,
}

/// Abstraction over the source-control tool.
pub trait Scm {
    fn ref_exists(&self, ref_name: &str) -> Result<bool>;
    fn branch_exists(&self, branch: &str) -> Result<bool>;
    /// Current branch of the checkout at `path`. Errors on detached HEAD.
    fn current_branch(&self, path: &Path) -> Result<String>;
    /// Create a branched workspace at `path` based on `base_ref`.
    fn create_workspace(&self, path: &Path, branch: &str, base_ref: &str) -> Result<()>;
    /// Force-remove the workspace at `path`.
    fn remove_workspace(&self, path: &Path) -> Result<()>;
    fn list_workspaces(&self) -> Result<Vec<WorkspaceListing>>;
    fn push_branch(&self, branch: &str) -> Result<()>;
    fn delete_branch(&self, branch: &str) -> Result<()>;
    /// Drop stale workspace registrations on the SCM side.
    fn prune(&self) -> Result<()>;
}

/// Shells out to `git` rooted at the repository.
#[derive(Debug, Clone)]
pub struct GitScm {
    repo_root: PathBuf,
}

impl GitScm {
    pub fn new(repo_root: impl Into<PathBuf>) -> Self {
        Self {
            repo_root: repo_root.into(),
        }
    }

    fn run(&self, args: &[&str]) -> Result<Output> {
        Command::new("git")
            .args(args)
            .current_dir(&self.repo_root)
            .output()
            .with_context(|| format!("spawn git {}", args.join(" ")))
    }

    fn run_checked(&self, args: &[&str]) -> Result<Output> {
        let output = self.run(args)?;
        if !output.status.success() {
            return Err(anyhow!(
                "git {} failed: {}",
                args.join(" "),
                combined_stdio(&output)
            ));
        }
        Ok(output)
    }

    fn run_capture(&self, args: &[&str]) -> Result<String> {
        let output = self.run_checked(args)?;
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

impl Scm for GitScm {
    fn ref_exists(&self, ref_name: &str) -> Result<bool> {
        let status = self
            .run(&["rev-parse", "--verify", "--quiet", ref_name])?
            .status;
        Ok(status.success())
    }

    fn branch_exists(&self, branch: &str) -> Result<bool> {
        let status = self
            .run(&[
                "show-ref",
                "--verify",
                "--quiet",
                &format!("refs/heads/{branch}"),
            ])?
            .status;
        Ok(status.success())
    }

    fn current_branch(&self, path: &Path) -> Result<String> {
        let path_arg = path.display().to_string();
        let out = self.run_capture(&["-C", &path_arg, "branch", "--show-current"])?;
        let name = out.trim().to_string();
        if name.is_empty() {
            return Err(anyhow!("detached HEAD in {}", path.display()));
        }
        Ok(name)
    }

    #[instrument(skip_all, fields(branch, base_ref))]
    fn create_workspace(&self, path: &Path, branch: &str, base_ref: &str) -> Result<()> {
        debug!(path = %path.display(), "adding worktree");
        let path_arg = path.display().to_string();
        self.run_checked(&["worktree", "add", "-b", branch, &path_arg, base_ref])?;
        Ok(())
    }

    fn remove_workspace(&self, path: &Path) -> Result<()> {
        let path_arg = path.display().to_string();
        self.run_checked(&["worktree", "remove", "--force", &path_arg])?;
        Ok(())
    }

    fn list_workspaces(&self) -> Result<Vec<WorkspaceListing>> {
        let out = self.run_capture(&["worktree", "list", "--porcelain"])?;
        Ok(parse_worktree_list(&out))
    }

    fn push_branch(&self, branch: &str) -> Result<()> {
        self.run_checked(&["push", "--set-upstream", "origin", branch])?;
        Ok(())
    }

    fn delete_branch(&self, branch: &str) -> Result<()> {
        self.run_checked(&["branch", "-D", branch])?;
        Ok(())
    }

    fn prune(&self) -> Result<()> {
        self.run_checked(&["worktree", "prune"])?;
        Ok(())
    }
}

fn combined_stdio(output: &Output) -> String {
    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    let combined = format!("{}\n{}", stdout.trim(), stderr.trim());
    combined.trim().to_string()
}

/// Parse `git worktree list --porcelain` output. Bare and detached entries
/// carry no `branch` line and are skipped.
fn parse_worktree_list(out: &str) -> Vec<WorkspaceListing> {
    let mut listings = Vec::new();
    let mut path: Option<PathBuf> = None;
    for line in out.lines() {
        if let Some(p) = line.strip_prefix("worktree ") {
            path = Some(PathBuf::from(p.trim()));
        } else if let Some(b) = line.strip_prefix("branch ") {
            if let Some(path) = path.take() {
                let branch = b
                    .trim()
                    .strip_prefix("refs/heads/")
                    .unwrap_or(b.trim())
                    .to_string();
                listings.push(WorkspaceListing { path, branch });
            }
        } else if line.trim().is_empty() {
            path = None;
        }
    }
    listings
}

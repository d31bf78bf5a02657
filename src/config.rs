//! Runtime configuration for a mochi run.
//!
//! The record is populated by the CLI and validated once up front; nothing
//! reads flags after this point.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Result, bail};

use crate::output::Mode;

/// Default task-file path; triggers candidate probing when missing.
pub const DEFAULT_INPUT: &str = "PRD.md";

/// All runtime configuration for one run.
#[derive(Debug, Clone)]
pub struct RunConfig {
    /// Repository the run is anchored at (the invocation directory).
    pub repo_root: PathBuf,
    pub input_file: PathBuf,
    /// Forge issue to pull tasks from; 0 = unset.
    pub issue_number: u32,
    /// Default worker model for tasks without a `[model:...]` override.
    pub model: String,
    /// Reviewer model; empty disables the refinement reviewer.
    pub reviewer_model: String,
    /// Per-invocation agent deadline in seconds.
    pub timeout_secs: u64,
    pub sequential: bool,
    /// Run only the task with this slug; empty = all tasks.
    pub task_filter: String,
    pub dry_run: bool,
    pub verbose: bool,
    pub keep_workspaces: bool,
    pub output_mode: Mode,
    pub output_dir: PathBuf,
    pub base_ref: String,
    pub branch_prefix: String,
    pub workspace_root: PathBuf,
    pub log_dir: PathBuf,
    /// Worker iterations per task; 1 = single pass.
    pub max_iterations: u32,
    /// Concurrency ceiling; 0 = unlimited.
    pub max_workspaces: u32,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            repo_root: PathBuf::from("."),
            input_file: PathBuf::from(DEFAULT_INPUT),
            issue_number: 0,
            model: "claude-sonnet-4-6".to_string(),
            reviewer_model: String::new(),
            timeout_secs: 300,
            sequential: false,
            task_filter: String::new(),
            dry_run: false,
            verbose: false,
            keep_workspaces: false,
            output_mode: Mode::PullRequest,
            output_dir: PathBuf::from("output"),
            base_ref: "main".to_string(),
            branch_prefix: "feature".to_string(),
            workspace_root: PathBuf::from(".workspaces"),
            log_dir: PathBuf::from("logs"),
            max_iterations: 1,
            max_workspaces: 0,
        }
    }
}

impl RunConfig {
    pub fn validate(&self) -> Result<()> {
        if self.timeout_secs == 0 {
            bail!("timeout must be > 0 seconds");
        }
        if self.max_iterations == 0 {
            bail!("max-iterations must be >= 1");
        }
        if self.model.trim().is_empty() {
            bail!("model must not be empty");
        }
        if self.branch_prefix.trim().is_empty() || self.branch_prefix.contains(char::is_whitespace)
        {
            bail!("branch-prefix must be a non-empty token");
        }
        if self.workspace_root.as_os_str().is_empty() {
            bail!("workspace-root must not be empty");
        }
        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        RunConfig::default().validate().expect("defaults are valid");
    }

    #[test]
    fn zero_timeout_is_rejected() {
        let cfg = RunConfig {
            timeout_secs: 0,
            ..RunConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn zero_iterations_are_rejected() {
        let cfg = RunConfig {
            max_iterations: 0,
            ..RunConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn branch_prefix_with_spaces_is_rejected() {
        let cfg = RunConfig {
            branch_prefix: "my prefix".to_string(),
            ..RunConfig::default()
        };
        assert!(cfg.validate().is_err());
    }
}

//! Test-only fakes for the external capabilities.
//!
//! Scripted runners return predetermined outputs without spawning processes;
//! the in-memory SCM and forge track calls so tests can assert on them. The
//! in-memory SCM still creates real directories so memory files and logs have
//! somewhere to live.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Result, anyhow, bail};

use crate::io::forge::Forge;
use crate::io::runner::{AgentRunner, RunOutcome, RunRequest};
use crate::io::scm::{Scm, WorkspaceListing};

/// One scripted agent invocation.
#[derive(Debug, Clone)]
pub struct ScriptedRun {
    pub output: String,
    pub exit_code: i32,
    pub timed_out: bool,
}

impl ScriptedRun {
    pub fn ok(output: &str) -> Self {
        Self {
            output: output.to_string(),
            exit_code: 0,
            timed_out: false,
        }
    }

    pub fn failed(exit_code: i32, output: &str) -> Self {
        Self {
            output: output.to_string(),
            exit_code,
            timed_out: false,
        }
    }

    pub fn timed_out() -> Self {
        Self {
            output: String::new(),
            exit_code: -1,
            timed_out: true,
        }
    }
}

/// Agent runner that replays scripted outcomes in order and records every
/// request it receives. Running past the script is an error, which surfaces
/// as a spawn failure.
#[derive(Default)]
pub struct ScriptedRunner {
    runs: Mutex<VecDeque<ScriptedRun>>,
    titles: Mutex<VecDeque<Result<String, String>>>,
    requests: Mutex<Vec<RunRequest>>,
}

impl ScriptedRunner {
    pub fn push_run(&self, run: ScriptedRun) {
        self.runs.lock().expect("runs lock").push_back(run);
    }

    pub fn push_title(&self, title: &str) {
        self.titles
            .lock()
            .expect("titles lock")
            .push_back(Ok(title.to_string()));
    }

    pub fn push_title_error(&self, message: &str) {
        self.titles
            .lock()
            .expect("titles lock")
            .push_back(Err(message.to_string()));
    }

    /// Every run request seen so far, in order.
    pub fn requests(&self) -> Vec<RunRequest> {
        self.requests.lock().expect("requests lock").clone()
    }
}

impl AgentRunner for ScriptedRunner {
    fn run(&self, request: &RunRequest) -> Result<RunOutcome> {
        self.requests
            .lock()
            .expect("requests lock")
            .push(request.clone());
        let run = self
            .runs
            .lock()
            .expect("runs lock")
            .pop_front()
            .ok_or_else(|| anyhow!("no scripted run left"))?;
        Ok(RunOutcome {
            output: run.output,
            exit_code: Some(run.exit_code),
            timed_out: run.timed_out,
        })
    }

    fn generate_title(&self, _model: &str, _context: &str) -> Result<String> {
        match self.titles.lock().expect("titles lock").pop_front() {
            Some(Ok(title)) => Ok(title),
            Some(Err(message)) => Err(anyhow!(message)),
            None => Err(anyhow!("no scripted title left")),
        }
    }
}

#[derive(Default)]
struct MemScmState {
    refs: BTreeSet<String>,
    branches: BTreeSet<String>,
    /// Workspace path -> branch.
    workspaces: BTreeMap<PathBuf, String>,
    pushed: Vec<String>,
    /// Workspace creation fails when the path contains one of these.
    fail_create_containing: Vec<String>,
}

/// In-memory SCM backed by real directories.
#[derive(Default)]
pub struct MemScm {
    state: Mutex<MemScmState>,
}

impl MemScm {
    /// SCM whose only existing ref is `ref_name`.
    pub fn with_ref(ref_name: &str) -> Self {
        let scm = Self::default();
        scm.state
            .lock()
            .expect("scm lock")
            .refs
            .insert(ref_name.to_string());
        scm
    }

    pub fn add_branch(&self, name: &str) {
        self.state
            .lock()
            .expect("scm lock")
            .branches
            .insert(name.to_string());
    }

    pub fn has_branch(&self, name: &str) -> bool {
        self.state.lock().expect("scm lock").branches.contains(name)
    }

    pub fn workspace_count(&self) -> usize {
        self.state.lock().expect("scm lock").workspaces.len()
    }

    /// Drop a workspace registration without touching the directory.
    pub fn forget_workspace(&self, path: &Path) {
        self.state.lock().expect("scm lock").workspaces.remove(path);
    }

    pub fn pushed(&self) -> Vec<String> {
        self.state.lock().expect("scm lock").pushed.clone()
    }

    /// Make `create_workspace` fail for paths containing `needle`.
    pub fn fail_create_containing(&self, needle: &str) {
        self.state
            .lock()
            .expect("scm lock")
            .fail_create_containing
            .push(needle.to_string());
    }
}

impl Scm for MemScm {
    fn ref_exists(&self, ref_name: &str) -> Result<bool> {
        let state = self.state.lock().expect("scm lock");
        Ok(state.refs.contains(ref_name) || state.branches.contains(ref_name))
    }

    fn branch_exists(&self, branch: &str) -> Result<bool> {
        Ok(self.has_branch(branch))
    }

    fn current_branch(&self, path: &Path) -> Result<String> {
        self.state
            .lock()
            .expect("scm lock")
            .workspaces
            .get(path)
            .cloned()
            .ok_or_else(|| anyhow!("no workspace at {}", path.display()))
    }

    fn create_workspace(&self, path: &Path, branch: &str, base_ref: &str) -> Result<()> {
        let mut state = self.state.lock().expect("scm lock");
        if !state.refs.contains(base_ref) && !state.branches.contains(base_ref) {
            bail!("unknown base ref {base_ref:?}");
        }
        let path_str = path.display().to_string();
        if state
            .fail_create_containing
            .iter()
            .any(|needle| path_str.contains(needle))
        {
            bail!("scripted workspace creation failure for {path_str}");
        }
        fs::create_dir_all(path)?;
        state.branches.insert(branch.to_string());
        state.workspaces.insert(path.to_path_buf(), branch.to_string());
        Ok(())
    }

    fn remove_workspace(&self, path: &Path) -> Result<()> {
        let mut state = self.state.lock().expect("scm lock");
        if state.workspaces.remove(path).is_none() {
            bail!("{} is not a registered workspace", path.display());
        }
        if path.exists() {
            fs::remove_dir_all(path)?;
        }
        Ok(())
    }

    fn list_workspaces(&self) -> Result<Vec<WorkspaceListing>> {
        Ok(self
            .state
            .lock()
            .expect("scm lock")
            .workspaces
            .iter()
            .map(|(path, branch)| WorkspaceListing {
                path: path.clone(),
                branch: branch.clone(),
            })
            .collect())
    }

    fn push_branch(&self, branch: &str) -> Result<()> {
        self.state
            .lock()
            .expect("scm lock")
            .pushed
            .push(branch.to_string());
        Ok(())
    }

    fn delete_branch(&self, branch: &str) -> Result<()> {
        self.state.lock().expect("scm lock").branches.remove(branch);
        Ok(())
    }

    fn prune(&self) -> Result<()> {
        Ok(())
    }
}

/// In-memory forge that records created pull requests.
#[derive(Default)]
pub struct MemForge {
    issue_bodies: Mutex<BTreeMap<u32, String>>,
    /// (title, body, branch) triples.
    created: Mutex<Vec<(String, String, String)>>,
}

impl MemForge {
    pub fn set_issue_body(&self, number: u32, body: &str) {
        self.issue_bodies
            .lock()
            .expect("forge lock")
            .insert(number, body.to_string());
    }

    pub fn created(&self) -> Vec<(String, String, String)> {
        self.created.lock().expect("forge lock").clone()
    }
}

impl Forge for MemForge {
    fn fetch_issue_body(&self, number: u32) -> Result<PathBuf> {
        let body = self
            .issue_bodies
            .lock()
            .expect("forge lock")
            .get(&number)
            .cloned()
            .ok_or_else(|| anyhow!("no issue #{number}"))?;
        let path = std::env::temp_dir().join(format!("mochi-test-issue-{number}.md"));
        fs::write(&path, body)?;
        Ok(path)
    }

    fn create_pull_request(&self, title: &str, body: &str, branch: &str) -> Result<String> {
        self.created.lock().expect("forge lock").push((
            title.to_string(),
            body.to_string(),
            branch.to_string(),
        ));
        Ok(format!("https://example.invalid/pull/{branch}"))
    }
}

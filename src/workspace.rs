//! Isolated per-task workspaces and the durable manifest that tracks them.
//!
//! The manifest is a single JSON document at the repository root mapping slug
//! to workspace entry. Every mutation is a locked load-mutate-save that
//! rewrites the whole file; the lock must cover the full sequence because
//! concurrent task loops update statuses through the same manager.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result, anyhow, bail};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use crate::io::scm::Scm;

/// Manifest location relative to the repository root.
pub const MANIFEST_FILE: &str = ".mochi_manifest.json";

/// Lifecycle state of a tracked workspace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkspaceStatus {
    Pending,
    Running,
    Done,
    Failed,
}

/// One workspace tracked by the manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkspaceEntry {
    pub slug: String,
    pub path: PathBuf,
    pub branch: String,
    pub status: WorkspaceStatus,
}

/// Creates and destroys per-task workspaces and keeps the manifest durable.
#[derive(Debug)]
pub struct WorkspaceManager {
    base_ref: String,
    branch_prefix: String,
    workspace_root: PathBuf,
    manifest_path: PathBuf,
    lock: Mutex<()>,
}

impl WorkspaceManager {
    /// `workspace_root` may be relative; it is anchored at `repo_root`.
    pub fn new(repo_root: &Path, base_ref: &str, branch_prefix: &str, workspace_root: &Path) -> Self {
        let workspace_root = if workspace_root.is_absolute() {
            workspace_root.to_path_buf()
        } else {
            repo_root.join(workspace_root)
        };
        Self {
            base_ref: base_ref.to_string(),
            branch_prefix: branch_prefix.to_string(),
            workspace_root,
            manifest_path: repo_root.join(MANIFEST_FILE),
            lock: Mutex::new(()),
        }
    }

    /// Create (or reuse) the workspace for `slug` and record it as pending.
    #[instrument(skip_all, fields(slug))]
    pub fn create<S: Scm>(&self, scm: &S, slug: &str) -> Result<WorkspaceEntry> {
        if !scm.ref_exists(&self.base_ref)? {
            bail!(
                "base ref {:?} does not exist (the repository may have no commits yet). \
                 Create an initial commit, e.g. `git commit --allow-empty -m \"Initial commit\"`, \
                 or pass an existing ref with --base-ref",
                self.base_ref
            );
        }

        let path = self.workspace_root.join(slug);
        fs::create_dir_all(&self.workspace_root).with_context(|| {
            format!("create workspace root {}", self.workspace_root.display())
        })?;

        // A workspace already registered at this path is reused as-is.
        if scm
            .list_workspaces()?
            .iter()
            .any(|w| same_path(&w.path, &path))
        {
            debug!(path = %path.display(), "reusing registered workspace");
            let branch = scm.current_branch(&path)?;
            let entry = WorkspaceEntry {
                slug: slug.to_string(),
                path,
                branch,
                status: WorkspaceStatus::Pending,
            };
            self.save_entry(&entry)?;
            return Ok(entry);
        }

        if path.exists() {
            debug!(path = %path.display(), "removing stale workspace directory");
            fs::remove_dir_all(&path)
                .with_context(|| format!("remove stale workspace {}", path.display()))?;
        }

        let branch = self.resolve_branch(scm, slug)?;
        scm.create_workspace(&path, &branch, &self.base_ref)
            .with_context(|| format!("create workspace for {slug:?}"))?;

        let entry = WorkspaceEntry {
            slug: slug.to_string(),
            path,
            branch,
            status: WorkspaceStatus::Pending,
        };
        self.save_entry(&entry)?;
        Ok(entry)
    }

    /// Remove the workspace, best-effort delete its branch, and drop the
    /// manifest entry. An already-deleted workspace is reported, not fatal.
    #[instrument(skip_all, fields(slug))]
    pub fn destroy<S: Scm>(&self, scm: &S, slug: &str) -> Result<()> {
        let entry = self.get_entry(slug)?;

        if let Err(err) = scm.remove_workspace(&entry.path) {
            if entry.path.exists() {
                return Err(err.context(format!("remove workspace {}", entry.path.display())));
            }
            warn!(slug, "workspace already gone; dropping manifest entry");
        }

        if let Err(err) = scm.delete_branch(&entry.branch) {
            debug!(branch = %entry.branch, error = %format!("{err:#}"), "branch delete skipped");
        }

        self.remove_entry(slug)
    }

    pub fn update_status(&self, slug: &str, status: WorkspaceStatus) -> Result<()> {
        self.with_manifest(|manifest| {
            let entry = manifest
                .get_mut(slug)
                .ok_or_else(|| anyhow!("no workspace entry found for slug {slug:?}"))?;
            entry.status = status;
            Ok(())
        })
    }

    pub fn get_entry(&self, slug: &str) -> Result<WorkspaceEntry> {
        self.read_manifest(|manifest| {
            manifest
                .get(slug)
                .cloned()
                .ok_or_else(|| anyhow!("no workspace entry found for slug {slug:?}"))
        })
    }

    /// Ask the SCM to prune its stale registrations, then drop manifest
    /// entries whose paths no longer exist. Returns the removed slugs.
    pub fn prune<S: Scm>(&self, scm: &S) -> Result<Vec<String>> {
        scm.prune().context("prune stale registrations")?;
        self.with_manifest(|manifest| {
            let stale: Vec<String> = manifest
                .iter()
                .filter(|(_, entry)| !entry.path.exists())
                .map(|(slug, _)| slug.clone())
                .collect();
            for slug in &stale {
                manifest.remove(slug);
            }
            Ok(stale)
        })
    }

    /// `branch_prefix/slug`, suffixed `-2`, `-3`, ... past existing branches.
    fn resolve_branch<S: Scm>(&self, scm: &S, slug: &str) -> Result<String> {
        let base = format!("{}/{}", self.branch_prefix, slug);
        if !scm.branch_exists(&base)? {
            return Ok(base);
        }
        for i in 2..100 {
            let candidate = format!("{base}-{i}");
            if !scm.branch_exists(&candidate)? {
                return Ok(candidate);
            }
        }
        Ok(base)
    }

    fn save_entry(&self, entry: &WorkspaceEntry) -> Result<()> {
        self.with_manifest(|manifest| {
            manifest.insert(entry.slug.clone(), entry.clone());
            Ok(())
        })
    }

    fn remove_entry(&self, slug: &str) -> Result<()> {
        self.with_manifest(|manifest| {
            manifest.remove(slug);
            Ok(())
        })
    }

    fn with_manifest<T>(
        &self,
        f: impl FnOnce(&mut BTreeMap<String, WorkspaceEntry>) -> Result<T>,
    ) -> Result<T> {
        let _guard = self
            .lock
            .lock()
            .map_err(|_| anyhow!("manifest lock poisoned"))?;
        let mut manifest = self.load_manifest()?;
        let value = f(&mut manifest)?;
        self.save_manifest(&manifest)?;
        Ok(value)
    }

    fn read_manifest<T>(
        &self,
        f: impl FnOnce(&BTreeMap<String, WorkspaceEntry>) -> Result<T>,
    ) -> Result<T> {
        let _guard = self
            .lock
            .lock()
            .map_err(|_| anyhow!("manifest lock poisoned"))?;
        let manifest = self.load_manifest()?;
        f(&manifest)
    }

    fn load_manifest(&self) -> Result<BTreeMap<String, WorkspaceEntry>> {
        if !self.manifest_path.exists() {
            return Ok(BTreeMap::new());
        }
        let contents = fs::read_to_string(&self.manifest_path)
            .with_context(|| format!("read manifest {}", self.manifest_path.display()))?;
        if contents.trim().is_empty() {
            return Ok(BTreeMap::new());
        }
        serde_json::from_str(&contents)
            .with_context(|| format!("parse manifest {}", self.manifest_path.display()))
    }

    /// Atomically rewrite the whole manifest (temp file + rename).
    fn save_manifest(&self, manifest: &BTreeMap<String, WorkspaceEntry>) -> Result<()> {
        let mut buf = serde_json::to_string_pretty(manifest).context("serialize manifest")?;
        buf.push('\n');
        let tmp = self.manifest_path.with_extension("json.tmp");
        fs::write(&tmp, &buf).with_context(|| format!("write temp manifest {}", tmp.display()))?;
        fs::rename(&tmp, &self.manifest_path)
            .with_context(|| format!("replace manifest {}", self.manifest_path.display()))?;
        Ok(())
    }
}

fn same_path(a: &Path, b: &Path) -> bool {
    if a == b {
        return true;
    }
    match (a.canonicalize(), b.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

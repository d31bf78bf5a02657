//! Workspace manager integration tests against a real git repository.

use std::fs;
use std::path::Path;
use std::process::Command;

use mochi::io::scm::{GitScm, Scm};
use mochi::workspace::{MANIFEST_FILE, WorkspaceManager, WorkspaceStatus};

/// Temporary git repository with one initial commit on `main`.
struct TestRepo {
    dir: tempfile::TempDir,
}

impl TestRepo {
    fn new() -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let repo = Self { dir };
        repo.git(&["init"]);
        repo.git(&["config", "user.email", "mochi@test.invalid"]);
        repo.git(&["config", "user.name", "mochi test"]);
        repo.git(&["commit", "--allow-empty", "-m", "Initial commit"]);
        repo.git(&["branch", "-M", "main"]);
        repo
    }

    fn root(&self) -> &Path {
        self.dir.path()
    }

    fn git(&self, args: &[&str]) {
        let output = Command::new("git")
            .args(args)
            .current_dir(self.root())
            .output()
            .expect("spawn git");
        assert!(
            output.status.success(),
            "git {args:?} failed: {}",
            String::from_utf8_lossy(&output.stderr)
        );
    }

    fn manager(&self) -> WorkspaceManager {
        WorkspaceManager::new(self.root(), "main", "feature", Path::new(".workspaces"))
    }
}

#[test]
fn create_produces_a_branched_worktree() {
    let repo = TestRepo::new();
    let scm = GitScm::new(repo.root());
    let wm = repo.manager();

    let entry = wm.create(&scm, "add-auth").expect("create");

    assert!(entry.path.is_dir());
    assert_eq!(entry.branch, "feature/add-auth");
    assert_eq!(entry.status, WorkspaceStatus::Pending);
    assert_eq!(
        scm.current_branch(&entry.path).expect("current branch"),
        "feature/add-auth"
    );
    assert!(
        scm.list_workspaces()
            .expect("list")
            .iter()
            .any(|w| w.branch == "feature/add-auth")
    );
    assert!(repo.root().join(MANIFEST_FILE).is_file());
}

#[test]
fn branch_collisions_pick_the_next_free_suffix() {
    let repo = TestRepo::new();
    repo.git(&["branch", "feature/t"]);
    repo.git(&["branch", "feature/t-2"]);
    let scm = GitScm::new(repo.root());
    let wm = repo.manager();

    let entry = wm.create(&scm, "t").expect("create");
    assert_eq!(entry.branch, "feature/t-3");
}

#[test]
fn create_reuses_an_existing_registered_worktree() {
    let repo = TestRepo::new();
    let scm = GitScm::new(repo.root());
    let wm = repo.manager();

    let first = wm.create(&scm, "t").expect("first create");
    let second = wm.create(&scm, "t").expect("second create");

    assert_eq!(second.path, first.path);
    assert_eq!(second.branch, first.branch);
    assert_eq!(second.status, WorkspaceStatus::Pending);
}

#[test]
fn destroy_removes_worktree_branch_and_entry() {
    let repo = TestRepo::new();
    let scm = GitScm::new(repo.root());
    let wm = repo.manager();

    let entry = wm.create(&scm, "t").expect("create");
    wm.destroy(&scm, "t").expect("destroy");

    assert!(!entry.path.exists());
    assert!(!scm.branch_exists(&entry.branch).expect("branch check"));
    assert!(wm.get_entry("t").is_err());
}

#[test]
fn prune_reconciles_manifest_with_disk() {
    let repo = TestRepo::new();
    let scm = GitScm::new(repo.root());
    let wm = repo.manager();

    wm.create(&scm, "keep").expect("create keep");
    let gone = wm.create(&scm, "gone").expect("create gone");
    fs::remove_dir_all(&gone.path).expect("remove workspace out of band");

    let removed = wm.prune(&scm).expect("prune");
    assert_eq!(removed, vec!["gone".to_string()]);
    assert!(wm.get_entry("keep").is_ok());
    assert!(wm.get_entry("gone").is_err());
}

#[test]
fn missing_base_ref_aborts_with_remedy() {
    let repo = TestRepo::new();
    let scm = GitScm::new(repo.root());
    let wm = WorkspaceManager::new(repo.root(), "release", "feature", Path::new(".workspaces"));

    let err = wm.create(&scm, "t").unwrap_err();
    let msg = format!("{err:#}");
    assert!(msg.contains("release"));
    assert!(msg.contains("--base-ref"));
}

#[test]
fn status_updates_survive_in_the_manifest_file() {
    let repo = TestRepo::new();
    let scm = GitScm::new(repo.root());
    let wm = repo.manager();

    wm.create(&scm, "t").expect("create");
    wm.update_status("t", WorkspaceStatus::Done).expect("update");

    let raw = fs::read_to_string(repo.root().join(MANIFEST_FILE)).expect("read manifest");
    assert!(raw.contains("\"done\""));
}

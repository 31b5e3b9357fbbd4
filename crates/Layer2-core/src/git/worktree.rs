//! Checkout isolation via git worktrees
//!
//! The first active write session of a project works in the main checkout.
//! Any further concurrent write session gets its own branch-backed worktree:
//!
//! ```text
//! /projects/app/                     # main checkout
//! ├── .git/
//! ├── src/
//! └── .berth-worktrees/
//!     └── <session-id>/              # branch berth/session-<session-id>
//! ```
//!
//! Per-session lifecycle: `NoWorktree → Created → Active → Removed`.

use super::ops::GitOps;
use berth_foundation::{
    require_project, require_session, Error, GitConfig, IsolationStore, Project, Result, Session,
};
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// Directory under the project root holding session worktrees
pub const WORKTREE_DIR: &str = ".berth-worktrees";

/// Prefix of session branches
pub const BRANCH_PREFIX: &str = "berth/session-";

/// `<project>/.berth-worktrees/<session-id>`
pub fn worktree_dir(project_root: &Path, session_id: &str) -> PathBuf {
    project_root.join(WORKTREE_DIR).join(session_id)
}

/// `berth/session-<session-id>`
pub fn branch_name(session_id: &str) -> String {
    format!("{}{}", BRANCH_PREFIX, session_id)
}

/// What a sweep cleaned up
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// Sessions (terminal or deleted) whose worktree was removed
    pub removed: Vec<String>,
    /// Sessions whose recorded worktree had vanished; record cleared
    pub cleared_stale: Vec<String>,
    /// Worktree directories with no owning session
    pub orphan_dirs: Vec<PathBuf>,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        self.removed.is_empty() && self.cleared_stale.is_empty() && self.orphan_dirs.is_empty()
    }
}

/// Assigns working directories to sessions
#[derive(Clone)]
pub struct WorktreeManager {
    store: Arc<dyn IsolationStore>,
    config: GitConfig,
    project_locks: Arc<parking_lot::Mutex<HashMap<String, Arc<Mutex<()>>>>>,
}

impl WorktreeManager {
    pub fn new(store: Arc<dyn IsolationStore>, config: GitConfig) -> Self {
        Self {
            store,
            config,
            project_locks: Arc::new(parking_lot::Mutex::new(HashMap::new())),
        }
    }

    fn project_lock(&self, project_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.project_locks.lock();
        Arc::clone(locks.entry(project_id.to_string()).or_default())
    }

    fn git(&self, root: &Path) -> GitOps {
        GitOps::new(root, self.config.timeout)
    }

    // ========================================================================
    // Decision
    // ========================================================================

    /// True iff another active write session of the project occupies the
    /// main checkout. Explore sessions and non-git projects never need one.
    pub async fn needs_worktree(&self, session: &Session) -> Result<bool> {
        let project = require_project(self.store.as_ref(), &session.project_id)?;
        self.needs_worktree_in(session, &project).await
    }

    async fn needs_worktree_in(&self, session: &Session, project: &Project) -> Result<bool> {
        if session.mode.is_read_only() {
            return Ok(false);
        }
        if !GitOps::is_repo(&project.root_path, self.config.timeout).await {
            return Ok(false);
        }

        let occupied = self
            .store
            .list_active_write_sessions(&project.id)?
            .iter()
            .any(|other| other.id != session.id && other.live_worktree().is_none());
        Ok(occupied)
    }

    /// Decide, create if needed, record, and return the effective working
    /// directory. Serialized per project so two sessions starting together
    /// cannot both claim the main checkout.
    pub async fn assign(&self, session_id: &str) -> Result<PathBuf> {
        let session = require_session(self.store.as_ref(), session_id)?;
        let lock = self.project_lock(&session.project_id);
        let _guard = lock.lock().await;

        // Re-read under the lock
        let session = require_session(self.store.as_ref(), session_id)?;
        let project = require_project(self.store.as_ref(), &session.project_id)?;

        if let Some(live) = session.live_worktree() {
            debug!(session_id = %session_id, path = %live.display(), "Reusing worktree");
            return Ok(live.to_path_buf());
        }
        if let Some(stale) = &session.worktree_path {
            debug!(session_id = %session_id, path = %stale.display(), "Clearing stale worktree record");
            self.store.set_worktree_path(session_id, None)?;
        }

        if !self.needs_worktree_in(&session, &project).await? {
            return Ok(project.root_path.clone());
        }

        match self.create_worktree(&session).await {
            Ok(path) => Ok(path),
            Err(e) => {
                error!(session_id = %session_id, error = %e, "Worktree creation failed");
                Err(e)
            }
        }
    }

    // ========================================================================
    // Create / remove
    // ========================================================================

    /// Create (or adopt) the session's worktree and record it
    pub async fn create_worktree(&self, session: &Session) -> Result<PathBuf> {
        let project = require_project(self.store.as_ref(), &session.project_id)?;
        let git = GitOps::open(&project.root_path, self.config.timeout).await?;
        let dir = worktree_dir(&project.root_path, &session.id);
        let branch = branch_name(&session.id);

        if dir.join(".git").exists() {
            debug!(session_id = %session.id, "Adopting existing worktree directory");
        } else {
            tokio::fs::create_dir_all(project.root_path.join(WORKTREE_DIR)).await?;
            // Registrations of externally deleted worktrees block `worktree add`
            if let Err(e) = git.worktree_prune().await {
                debug!(error = %e, "worktree prune failed");
            }

            if git.branch_exists(&branch).await {
                git.worktree_add_existing(&dir, &branch).await?;
            } else {
                git.worktree_add_new_branch(&dir, &branch, "HEAD").await?;
            }
        }

        self.ensure_excluded(&git).await?;
        self.store.set_worktree_path(&session.id, Some(&dir))?;

        info!(
            session_id = %session.id,
            branch = %branch,
            path = %dir.display(),
            "Created worktree"
        );
        Ok(dir)
    }

    /// Keep the worktree directory out of the main checkout's status
    async fn ensure_excluded(&self, git: &GitOps) -> Result<()> {
        let info_dir = git.common_dir().await?.join("info");
        tokio::fs::create_dir_all(&info_dir).await?;

        let exclude = info_dir.join("exclude");
        let pattern = format!("{}/", WORKTREE_DIR);
        let current = match tokio::fs::read_to_string(&exclude).await {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(e.into()),
        };

        if current.lines().any(|line| line.trim() == pattern) {
            return Ok(());
        }

        let mut updated = current;
        if !updated.is_empty() && !updated.ends_with('\n') {
            updated.push('\n');
        }
        updated.push_str(&pattern);
        updated.push('\n');
        tokio::fs::write(&exclude, updated).await?;
        Ok(())
    }

    /// Remove the session's worktree and branch, then clear the record.
    ///
    /// Each step is attempted independently; the main checkout is never touched.
    pub async fn remove_worktree(&self, session: &Session) -> Result<()> {
        let project = require_project(self.store.as_ref(), &session.project_id)?;
        let dir = session
            .worktree_path
            .clone()
            .unwrap_or_else(|| worktree_dir(&project.root_path, &session.id));

        if dir == project.root_path {
            warn!(session_id = %session.id, "Recorded worktree is the main checkout; not removing");
        } else {
            self.remove_checkout(&project.root_path, &dir, &branch_name(&session.id))
                .await;
        }

        match self.store.set_worktree_path(&session.id, None) {
            Ok(()) | Err(Error::SessionNotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn remove_checkout(&self, root: &Path, dir: &Path, branch: &str) {
        let git = self.git(root);

        if dir.exists() {
            if let Err(e) = git.worktree_remove(dir).await {
                warn!(path = %dir.display(), error = %e, "worktree remove failed, pruning");
                if let Err(e) = tokio::fs::remove_dir_all(dir).await {
                    warn!(path = %dir.display(), error = %e, "Failed to delete worktree directory");
                }
                if let Err(e) = git.worktree_prune().await {
                    warn!(error = %e, "worktree prune failed");
                }
            }
        } else if let Err(e) = git.worktree_prune().await {
            debug!(error = %e, "worktree prune failed");
        }

        if git.branch_exists(branch).await {
            match git.delete_branch(branch).await {
                Ok(()) => debug!(branch = %branch, "Deleted session branch"),
                Err(e) => warn!(branch = %branch, error = %e, "Failed to delete session branch"),
            }
        }
    }

    // ========================================================================
    // Sweep
    // ========================================================================

    /// Remove worktrees of terminal or deleted sessions and clear stale records
    pub async fn sweep(&self) -> Result<SweepReport> {
        let mut report = SweepReport::default();

        for session in self.store.list_sessions_with_worktrees()? {
            if session.status.is_terminal() {
                self.remove_worktree(&session).await?;
                report.removed.push(session.id);
            } else if session.live_worktree().is_none() {
                self.store.set_worktree_path(&session.id, None)?;
                report.cleared_stale.push(session.id);
            }
        }

        for project in self.store.list_projects()? {
            let base = project.root_path.join(WORKTREE_DIR);
            let mut entries = match tokio::fs::read_dir(&base).await {
                Ok(entries) => entries,
                Err(_) => continue,
            };

            while let Some(entry) = entries.next_entry().await? {
                let Some(session_id) = entry.file_name().to_str().map(str::to_string) else {
                    continue;
                };
                let owner = self.store.get_session(&session_id)?;
                let orphaned = match &owner {
                    None => true,
                    Some(s) => s.status.is_terminal(),
                };
                if !orphaned {
                    continue;
                }

                let dir = entry.path();
                self.remove_checkout(&project.root_path, &dir, &branch_name(&session_id))
                    .await;
                if owner.is_none() {
                    report.orphan_dirs.push(dir);
                } else if !report.removed.contains(&session_id) {
                    report.removed.push(session_id);
                }
            }
        }

        if !report.is_empty() {
            info!(
                removed = report.removed.len(),
                stale = report.cleared_stale.len(),
                orphans = report.orphan_dirs.len(),
                "Worktree sweep finished"
            );
        }
        Ok(report)
    }

    /// Live worktree if present, else the project root
    pub fn effective_working_dir(&self, session: &Session) -> Result<PathBuf> {
        let project = require_project(self.store.as_ref(), &session.project_id)?;
        Ok(session.effective_working_dir(&project))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::git::ops::run_git;
    use berth_foundation::{SessionMode, SessionStatus, Storage};
    use std::time::Duration;

    const TIMEOUT: Duration = Duration::from_secs(30);

    async fn init_repo(dir: &Path) {
        run_git(dir, &["init", "-q"], TIMEOUT).await.unwrap();
        std::fs::write(dir.join("README.md"), "hello\n").unwrap();
        run_git(dir, &["add", "."], TIMEOUT).await.unwrap();
        run_git(
            dir,
            &[
                "-c",
                "user.name=Berth Test",
                "-c",
                "user.email=test@berth.dev",
                "commit",
                "-q",
                "-m",
                "init",
            ],
            TIMEOUT,
        )
        .await
        .unwrap();
    }

    struct Fixture {
        repo: tempfile::TempDir,
        store: Arc<Storage>,
        manager: WorktreeManager,
    }

    async fn fixture(git: bool) -> Fixture {
        let repo = tempfile::tempdir().unwrap();
        if git {
            init_repo(repo.path()).await;
        }
        let store = Arc::new(Storage::in_memory().unwrap());
        store
            .insert_project(&Project::new("p1", "app", repo.path()))
            .unwrap();
        let manager = WorktreeManager::new(store.clone(), GitConfig::default());
        Fixture {
            repo,
            store,
            manager,
        }
    }

    fn add_session(f: &Fixture, id: &str, mode: SessionMode, status: SessionStatus) -> Session {
        let session = Session::new(id, "p1", mode).with_status(status);
        f.store.insert_session(&session).unwrap();
        session
    }

    #[tokio::test]
    async fn test_explore_never_needs_worktree() {
        let f = fixture(true).await;
        add_session(&f, "w1", SessionMode::Write, SessionStatus::InProgress);
        let explore = add_session(&f, "e1", SessionMode::Explore, SessionStatus::InProgress);
        assert!(!f.manager.needs_worktree(&explore).await.unwrap());
    }

    #[tokio::test]
    async fn test_non_git_project_never_needs_worktree() {
        let f = fixture(false).await;
        add_session(&f, "w1", SessionMode::Write, SessionStatus::InProgress);
        let second = add_session(&f, "w2", SessionMode::Write, SessionStatus::InProgress);
        assert!(!f.manager.needs_worktree(&second).await.unwrap());
        assert_eq!(f.manager.assign("w2").await.unwrap(), f.repo.path());
    }

    #[tokio::test]
    async fn test_first_writer_uses_main_checkout() {
        let f = fixture(true).await;
        let first = add_session(&f, "w1", SessionMode::Write, SessionStatus::InProgress);
        assert!(!f.manager.needs_worktree(&first).await.unwrap());
        assert_eq!(f.manager.assign("w1").await.unwrap(), f.repo.path());
    }

    #[tokio::test]
    async fn test_second_writer_gets_worktree() {
        let f = fixture(true).await;
        add_session(&f, "w1", SessionMode::Write, SessionStatus::InProgress);
        let second = add_session(&f, "w2", SessionMode::Write, SessionStatus::InProgress);
        assert!(f.manager.needs_worktree(&second).await.unwrap());

        let path = f.manager.assign("w2").await.unwrap();
        assert_eq!(path, worktree_dir(f.repo.path(), "w2"));
        assert!(path.join("README.md").exists());

        let recorded = f.store.get_session("w2").unwrap().unwrap();
        assert_eq!(recorded.worktree_path.as_deref(), Some(path.as_path()));

        // Second assign reuses it
        assert_eq!(f.manager.assign("w2").await.unwrap(), path);

        let git = GitOps::new(f.repo.path(), TIMEOUT);
        assert!(git.branch_exists("berth/session-w2").await);
        // Excluded from the main checkout's status
        assert!(!git.is_dirty().await.unwrap());
    }

    #[tokio::test]
    async fn test_writes_in_worktree_leave_main_checkout_untouched() {
        let f = fixture(true).await;
        add_session(&f, "w1", SessionMode::Write, SessionStatus::InProgress);
        add_session(&f, "w2", SessionMode::Write, SessionStatus::InProgress);
        let path = f.manager.assign("w2").await.unwrap();

        std::fs::write(path.join("README.md"), "changed in worktree\n").unwrap();
        std::fs::write(path.join("new.txt"), "new\n").unwrap();

        let main = std::fs::read_to_string(f.repo.path().join("README.md")).unwrap();
        assert_eq!(main, "hello\n");
        assert!(!f.repo.path().join("new.txt").exists());
        assert!(!GitOps::new(f.repo.path(), TIMEOUT).is_dirty().await.unwrap());
    }

    #[tokio::test]
    async fn test_create_worktree_is_adopted_on_repeat() {
        let f = fixture(true).await;
        let session = add_session(&f, "w1", SessionMode::Write, SessionStatus::InProgress);

        let first = f.manager.create_worktree(&session).await.unwrap();
        let second = f.manager.create_worktree(&session).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first, worktree_dir(f.repo.path(), "w1"));

        let exclude =
            std::fs::read_to_string(f.repo.path().join(".git/info/exclude")).unwrap();
        let pattern = format!("{}/", WORKTREE_DIR);
        assert_eq!(exclude.lines().filter(|l| l.trim() == pattern).count(), 1);
    }

    #[tokio::test]
    async fn test_remove_deletes_directory_and_branch() {
        let f = fixture(true).await;
        add_session(&f, "w1", SessionMode::Write, SessionStatus::InProgress);
        add_session(&f, "w2", SessionMode::Write, SessionStatus::InProgress);
        let path = f.manager.assign("w2").await.unwrap();

        let session = f.store.get_session("w2").unwrap().unwrap();
        f.manager.remove_worktree(&session).await.unwrap();

        assert!(!path.exists());
        assert!(!GitOps::new(f.repo.path(), TIMEOUT)
            .branch_exists("berth/session-w2")
            .await);
        assert_eq!(f.store.get_session("w2").unwrap().unwrap().worktree_path, None);
        assert!(f.repo.path().join("README.md").exists());
    }

    #[tokio::test]
    async fn test_externally_deleted_worktree_falls_back_and_recreates() {
        let f = fixture(true).await;
        add_session(&f, "w1", SessionMode::Write, SessionStatus::InProgress);
        add_session(&f, "w2", SessionMode::Write, SessionStatus::InProgress);
        let path = f.manager.assign("w2").await.unwrap();

        std::fs::remove_dir_all(&path).unwrap();
        let session = f.store.get_session("w2").unwrap().unwrap();
        assert_eq!(
            f.manager.effective_working_dir(&session).unwrap(),
            f.repo.path()
        );

        // Next assign clears the stale record and recreates on the same branch
        assert_eq!(f.manager.assign("w2").await.unwrap(), path);
        assert!(path.join("README.md").exists());
    }

    #[tokio::test]
    async fn test_sweep_removes_terminal_and_clears_stale() {
        let f = fixture(true).await;
        add_session(&f, "w1", SessionMode::Write, SessionStatus::InProgress);
        add_session(&f, "w2", SessionMode::Write, SessionStatus::InProgress);
        add_session(&f, "w3", SessionMode::Write, SessionStatus::InProgress);
        let done_path = f.manager.assign("w2").await.unwrap();
        let stale_path = f.manager.assign("w3").await.unwrap();

        f.store.update_session_status("w2", SessionStatus::Done).unwrap();
        std::fs::remove_dir_all(&stale_path).unwrap();

        let report = f.manager.sweep().await.unwrap();
        assert_eq!(report.removed, vec!["w2".to_string()]);
        assert_eq!(report.cleared_stale, vec!["w3".to_string()]);
        assert!(!done_path.exists());
        assert_eq!(f.store.get_session("w3").unwrap().unwrap().worktree_path, None);
    }

    #[tokio::test]
    async fn test_sweep_removes_orphan_directories() {
        let f = fixture(true).await;
        add_session(&f, "w1", SessionMode::Write, SessionStatus::InProgress);
        add_session(&f, "w2", SessionMode::Write, SessionStatus::InProgress);
        let path = f.manager.assign("w2").await.unwrap();
        f.store.delete_session("w2").unwrap();

        let report = f.manager.sweep().await.unwrap();
        assert_eq!(report.orphan_dirs, vec![path.clone()]);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_concurrent_assign_gives_one_worktree() {
        let f = fixture(true).await;
        add_session(&f, "w1", SessionMode::Write, SessionStatus::InProgress);
        add_session(&f, "w2", SessionMode::Write, SessionStatus::InProgress);

        let (a, b) = tokio::join!(f.manager.assign("w1"), f.manager.assign("w2"));
        let (a, b) = (a.unwrap(), b.unwrap());

        let in_main = [&a, &b]
            .iter()
            .filter(|p| p.as_path() == f.repo.path())
            .count();
        assert_eq!(in_main, 1);
        assert_ne!(a, b);
    }
}

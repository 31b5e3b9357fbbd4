//! Git Operations
//!
//! Async wrappers over the `git` CLI. Every invocation captures its exit
//! status and runs under a wall-clock timeout.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Error)]
pub enum GitError {
    #[error("Not a git repository: {0}")]
    NotARepository(PathBuf),

    #[error("git {command} failed: {stderr}")]
    CommandFailed { command: String, stderr: String },

    #[error("git {command} timed out after {secs}s")]
    TimedOut { command: String, secs: u64 },

    #[error("Branch not found: {0}")]
    BranchNotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<GitError> for berth_foundation::Error {
    fn from(err: GitError) -> Self {
        match err {
            GitError::TimedOut { .. } => berth_foundation::Error::Timeout(err.to_string()),
            GitError::Io(e) => berth_foundation::Error::Git(format!("cannot run git: {}", e)),
            other => berth_foundation::Error::Git(other.to_string()),
        }
    }
}

/// Run `git <args>` in `dir`, returning trimmed stdout
pub async fn run_git(dir: &Path, args: &[&str], timeout: Duration) -> Result<String, GitError> {
    let command = args.join(" ");
    debug!(dir = %dir.display(), "git {}", command);

    let child = Command::new("git")
        .args(args)
        .current_dir(dir)
        .env("GIT_TERMINAL_PROMPT", "0")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output();

    let output = match tokio::time::timeout(timeout, child).await {
        Ok(result) => result?,
        Err(_) => {
            return Err(GitError::TimedOut {
                command,
                secs: timeout.as_secs(),
            })
        }
    };

    if output.status.success() {
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    } else {
        Err(GitError::CommandFailed {
            command,
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }
}

// ============================================================================
// Git Operations
// ============================================================================

/// Git operations handler for one checkout
#[derive(Debug, Clone)]
pub struct GitOps {
    /// Directory git runs in
    root: PathBuf,
    timeout: Duration,
}

impl GitOps {
    /// Handler for `root` without checking it is a repository
    pub fn new(root: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            root: root.into(),
            timeout,
        }
    }

    /// Handler for a directory that must be inside a work tree
    pub async fn open(path: impl AsRef<Path>, timeout: Duration) -> Result<Self, GitError> {
        let path = path.as_ref();
        if !Self::is_repo(path, timeout).await {
            return Err(GitError::NotARepository(path.to_path_buf()));
        }
        Ok(Self::new(path, timeout))
    }

    /// Check if directory is inside a git work tree
    pub async fn is_repo(path: impl AsRef<Path>, timeout: Duration) -> bool {
        let path = path.as_ref();
        if !path.is_dir() {
            return false;
        }
        matches!(
            run_git(path, &["rev-parse", "--is-inside-work-tree"], timeout).await,
            Ok(out) if out == "true"
        )
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Run a git command in the root
    pub async fn run(&self, args: &[&str]) -> Result<String, GitError> {
        run_git(&self.root, args, self.timeout).await
    }

    /// Shared `.git` directory (the main repository's, even from a worktree)
    pub async fn common_dir(&self) -> Result<PathBuf, GitError> {
        let dir = PathBuf::from(self.run(&["rev-parse", "--git-common-dir"]).await?);
        Ok(if dir.is_absolute() {
            dir
        } else {
            self.root.join(dir)
        })
    }

    pub async fn branch_exists(&self, branch: &str) -> bool {
        let reference = format!("refs/heads/{}", branch);
        self.run(&["rev-parse", "--verify", "--quiet", &reference])
            .await
            .is_ok()
    }

    /// `git worktree add -b <branch> <dir> <base>`
    pub async fn worktree_add_new_branch(
        &self,
        dir: &Path,
        branch: &str,
        base: &str,
    ) -> Result<(), GitError> {
        let dir = dir.to_string_lossy();
        self.run(&["worktree", "add", "-b", branch, &dir, base])
            .await
            .map(|_| ())
    }

    /// `git worktree add <dir> <branch>` for a branch that already exists
    pub async fn worktree_add_existing(&self, dir: &Path, branch: &str) -> Result<(), GitError> {
        if !self.branch_exists(branch).await {
            return Err(GitError::BranchNotFound(branch.to_string()));
        }
        let dir = dir.to_string_lossy();
        self.run(&["worktree", "add", &dir, branch]).await.map(|_| ())
    }

    /// `git worktree remove --force <dir>`
    pub async fn worktree_remove(&self, dir: &Path) -> Result<(), GitError> {
        let dir = dir.to_string_lossy();
        self.run(&["worktree", "remove", "--force", &dir])
            .await
            .map(|_| ())
    }

    /// Drop administrative entries of worktrees whose directory is gone
    pub async fn worktree_prune(&self) -> Result<(), GitError> {
        self.run(&["worktree", "prune"]).await.map(|_| ())
    }

    /// `git branch -D <branch>`
    pub async fn delete_branch(&self, branch: &str) -> Result<(), GitError> {
        self.run(&["branch", "-D", branch]).await.map(|_| ())
    }

    /// Check if there are uncommitted changes
    pub async fn is_dirty(&self) -> Result<bool, GitError> {
        Ok(!self.run(&["status", "--porcelain"]).await?.is_empty())
    }
}

//! Git Integration Module
//!
//! Checkout isolation for concurrent write sessions:
//! - `ops`: async `git` CLI wrapper with timeouts
//! - `worktree`: per-session worktree assignment, removal and sweep

pub mod ops;
pub mod worktree;

pub use ops::{run_git, GitError, GitOps};
pub use worktree::{
    branch_name, worktree_dir, SweepReport, WorktreeManager, BRANCH_PREFIX, WORKTREE_DIR,
};

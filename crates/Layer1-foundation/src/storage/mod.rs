//! Storage module for Berth
//!
//! - `types`: Session / Project / Agent 레코드
//! - `db`: SQLite 구현 (`Storage`)
//!
//! The store is the single authority for which worktree and which resumable
//! token a session owns. Everything else derives from it.

mod db;
mod types;

use crate::Result;
use std::path::Path;

pub use db::Storage;
pub use types::{Agent, Project, Session, SessionMode, SessionStatus};

/// Persistence seam used by the isolation layer
pub trait IsolationStore: Send + Sync {
    fn insert_project(&self, project: &Project) -> Result<()>;
    fn get_project(&self, id: &str) -> Result<Option<Project>>;
    fn list_projects(&self) -> Result<Vec<Project>>;

    fn insert_agent(&self, agent: &Agent) -> Result<()>;
    fn get_agent(&self, id: &str) -> Result<Option<Agent>>;

    fn insert_session(&self, session: &Session) -> Result<()>;
    fn get_session(&self, id: &str) -> Result<Option<Session>>;
    fn update_session_status(&self, id: &str, status: crate::SessionStatus) -> Result<()>;
    fn set_worktree_path(&self, id: &str, path: Option<&Path>) -> Result<()>;
    fn set_agent_session_token(&self, id: &str, token: Option<&str>) -> Result<()>;

    /// In-progress, non-read-only sessions of one project
    fn list_active_write_sessions(&self, project_id: &str) -> Result<Vec<Session>>;
    /// Sessions that have a recorded worktree path (live or stale)
    fn list_sessions_with_worktrees(&self) -> Result<Vec<Session>>;
    /// Returns false if nothing was deleted
    fn delete_session(&self, id: &str) -> Result<bool>;
}

/// Fetch a session or fail with `SessionNotFound`
pub fn require_session(store: &dyn IsolationStore, id: &str) -> Result<Session> {
    store
        .get_session(id)?
        .ok_or_else(|| crate::Error::SessionNotFound(id.to_string()))
}

/// Fetch a project or fail with `ProjectNotFound`
pub fn require_project(store: &dyn IsolationStore, id: &str) -> Result<Project> {
    store
        .get_project(id)?
        .ok_or_else(|| crate::Error::ProjectNotFound(id.to_string()))
}

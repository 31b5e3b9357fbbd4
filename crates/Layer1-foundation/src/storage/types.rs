//! Isolation store records
//!
//! Session / Project / Agent 레코드와 닫힌 열거형(mode, status).

use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;

// ============================================================================
// Session Mode / Status
// ============================================================================

/// What a session is allowed to do to its project
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionMode {
    /// Read-only exploration; never needs an isolated checkout
    Explore,
    /// May modify the working tree
    Write,
}

impl SessionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Explore => "explore",
            Self::Write => "write",
        }
    }

    pub fn is_read_only(&self) -> bool {
        matches!(self, Self::Explore)
    }
}

impl FromStr for SessionMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "explore" => Ok(Self::Explore),
            "write" => Ok(Self::Write),
            other => Err(Error::InvalidInput(format!("unknown session mode: {}", other))),
        }
    }
}

impl std::fmt::Display for SessionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Session lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Backlog,
    InProgress,
    Review,
    Done,
    Cancelled,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Backlog => "backlog",
            Self::InProgress => "in_progress",
            Self::Review => "review",
            Self::Done => "done",
            Self::Cancelled => "cancelled",
        }
    }

    /// Terminal states release their worktree and container
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Cancelled)
    }

    /// Counts as occupying a checkout
    pub fn is_active(&self) -> bool {
        matches!(self, Self::InProgress)
    }
}

impl FromStr for SessionStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "backlog" => Ok(Self::Backlog),
            "in_progress" => Ok(Self::InProgress),
            "review" => Ok(Self::Review),
            "done" => Ok(Self::Done),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(Error::InvalidInput(format!(
                "unknown session status: {}",
                other
            ))),
        }
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Records
// ============================================================================

/// A project whose root directory agent sessions work against
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Project {
    pub id: String,
    pub name: String,
    pub root_path: PathBuf,
    /// Project-level default image
    pub default_image: Option<String>,
}

impl Project {
    pub fn new(id: impl Into<String>, name: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            root_path: root.into(),
            default_image: None,
        }
    }

    pub fn with_default_image(mut self, image: impl Into<String>) -> Self {
        self.default_image = Some(image.into());
        self
    }
}

/// Agent persona assigned to sessions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Agent {
    pub id: String,
    pub name: String,
    /// Agent-level image preference
    pub image: Option<String>,
}

impl Agent {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            image: None,
        }
    }

    pub fn with_image(mut self, image: impl Into<String>) -> Self {
        self.image = Some(image.into());
        self
    }
}

/// One user-facing unit of agent work against a project
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub project_id: String,
    pub agent_id: Option<String>,
    pub mode: SessionMode,
    pub status: SessionStatus,
    /// Image assigned to this session explicitly
    pub image: Option<String>,
    /// Raw recorded worktree path; may be stale
    pub worktree_path: Option<PathBuf>,
    /// Resumable agent-session token; only valid while the container lives
    pub agent_session_token: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Session {
    pub fn new(id: impl Into<String>, project_id: impl Into<String>, mode: SessionMode) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            project_id: project_id.into(),
            agent_id: None,
            mode,
            status: SessionStatus::Backlog,
            image: None,
            worktree_path: None,
            agent_session_token: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_agent(mut self, agent_id: impl Into<String>) -> Self {
        self.agent_id = Some(agent_id.into());
        self
    }

    pub fn with_status(mut self, status: SessionStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_image(mut self, image: impl Into<String>) -> Self {
        self.image = Some(image.into());
        self
    }

    pub fn with_worktree(mut self, path: impl Into<PathBuf>) -> Self {
        self.worktree_path = Some(path.into());
        self
    }

    /// Worktree path only if it still exists on disk
    pub fn live_worktree(&self) -> Option<&Path> {
        self.worktree_path.as_deref().filter(|p| p.exists())
    }

    /// Effective working directory: live worktree, else the project root.
    ///
    /// Recomputed on every call; external cleanup can remove a worktree at any time.
    pub fn effective_working_dir(&self, project: &Project) -> PathBuf {
        self.live_worktree()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| project.root_path.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_and_status_round_trip_strings() {
        assert_eq!("explore".parse::<SessionMode>().unwrap(), SessionMode::Explore);
        assert_eq!(
            "in_progress".parse::<SessionStatus>().unwrap(),
            SessionStatus::InProgress
        );
        assert!("paused".parse::<SessionStatus>().is_err());
        assert!(SessionStatus::Done.is_terminal());
        assert!(!SessionStatus::Review.is_terminal());
    }

    #[test]
    fn test_effective_working_dir_falls_back_when_worktree_missing() {
        let root = tempfile::tempdir().unwrap();
        let project = Project::new("p1", "app", root.path());
        let session = Session::new("s1", "p1", SessionMode::Write)
            .with_worktree(root.path().join(".berth-worktrees/s1"));

        assert_eq!(session.effective_working_dir(&project), root.path());

        std::fs::create_dir_all(root.path().join(".berth-worktrees/s1")).unwrap();
        assert_eq!(
            session.effective_working_dir(&project),
            root.path().join(".berth-worktrees/s1")
        );
    }
}

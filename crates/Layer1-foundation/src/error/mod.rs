//! Error types for Berth
//!
//! 모든 에러를 중앙에서 관리

use thiserror::Error;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Berth 에러 타입
#[derive(Error, Debug)]
pub enum Error {
    // ========================================================================
    // 컨트롤 소켓 / 컨테이너
    // ========================================================================
    #[error("Docker control socket unreachable: {0}")]
    DockerUnavailable(String),

    #[error("Image not found: {image}")]
    ImageNotFound { image: String, remediation: String },

    #[error("Failed to create container for session {session_id}: {reason}")]
    ContainerCreation { session_id: String, reason: String },

    #[error("Container not found: {0}")]
    ContainerNotFound(String),

    #[error("Exec failed: {0}")]
    Exec(String),

    #[error("Network error: {0}")]
    Network(String),

    // ========================================================================
    // Git / 워크트리
    // ========================================================================
    #[error("Git error: {0}")]
    Git(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    // ========================================================================
    // 저장소 관련
    // ========================================================================
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Project not found: {0}")]
    ProjectNotFound(String),

    // ========================================================================
    // 설정 / 입력
    // ========================================================================
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    // ========================================================================
    // 외부 에러 변환
    // ========================================================================
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    // ========================================================================
    // 기타
    // ========================================================================
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Missing image error with the build command the operator should run
    pub fn image_not_found(image: impl Into<String>) -> Self {
        let image = image.into();
        let remediation = format!(
            "Build or pull the image first, e.g. `docker build -t {} .` or `docker pull {}`",
            image, image
        );
        Error::ImageNotFound { image, remediation }
    }

    /// Container creation error helper
    pub fn container_creation(session_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::ContainerCreation {
            session_id: session_id.into(),
            reason: reason.into(),
        }
    }

    /// How to fix it, for the variants a user can act on
    pub fn remediation(&self) -> Option<String> {
        match self {
            Error::DockerUnavailable(_) => Some(
                "Check that the Docker daemon is running and that /var/run/docker.sock \
                 is mounted and readable by this process"
                    .to_string(),
            ),
            Error::ImageNotFound { remediation, .. } => Some(remediation.clone()),
            Error::Network(_) => Some(
                "Inspect `docker network ls`; remove a conflicting network with \
                 `docker network rm <name>` and retry"
                    .to_string(),
            ),
            Error::Git(_) => Some(
                "Make sure `git` is installed and the project directory is a healthy repository \
                 (`git worktree prune` clears stale entries)"
                    .to_string(),
            ),
            Error::Config(_) => {
                Some("Fix the named BERTH_* environment variable and restart".to_string())
            }
            _ => None,
        }
    }
}

// ============================================================================
// From 구현 (추가 변환)
// ============================================================================

impl From<String> for Error {
    fn from(s: String) -> Self {
        Error::Internal(s)
    }
}

impl From<&str> for Error {
    fn from(s: &str) -> Self {
        Error::Internal(s.to_string())
    }
}

//! # berth-foundation
//!
//! Foundation layer for Berth:
//! - Error: 에러 분류와 해결 안내 (remediation)
//! - Config: `BERTH_*` 환경변수 기반 설정
//! - Storage: Session / Project / Agent 격리 레코드 (SQLite)
//!
//! ## 아키텍처
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │  berth-cli  (serve / health / run / reconcile / relay)   │
//! │                          │                               │
//! │  berth-core   Worktree Manager · Tool Bridge · Runtime   │
//! │                          │                               │
//! │  berth-task   Container Manager · Exec · Image · Health  │
//! │                          │                               │
//! │  berth-foundation   Error · Config · IsolationStore      │
//! └──────────────────────────────────────────────────────────┘
//! ```

pub mod config;
pub mod error;
pub mod storage;

// ============================================================================
// Error
// ============================================================================
pub use error::{Error, Result};

// ============================================================================
// Config (설정)
// ============================================================================
pub use config::{
    parse_memory, BerthConfig, BridgeConfig, GitConfig, SandboxConfig, BRIDGE_PATH,
    CONTAINER_CREDENTIALS, CONTAINER_WORKSPACE, DEFAULT_NETWORK, FALLBACK_IMAGE,
};

// ============================================================================
// Storage (저장소)
// ============================================================================
pub use storage::{
    require_project, require_session, Agent, IsolationStore, Project, Session, SessionMode,
    SessionStatus, Storage,
};

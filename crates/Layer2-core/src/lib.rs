//! berth-core: Core Runtime for Berth
//!
//! Layer2 - 세션 격리 런타임 레이어
//!
//! # 주요 모듈
//!
//! - `git`: 세션별 worktree 할당 / 제거 / sweep
//! - `bridge`: 컨테이너 ↔ 호스트 JSON-RPC 도구 브릿지
//! - `runtime`: Agent turn 실행 (이미지 → 작업 디렉토리 → 컨테이너 → exec)
//!
//! # 사용 예시
//!
//! ```ignore
//! use berth_core::{AgentRuntime, TurnRequest, WorktreeManager};
//! use berth_task::{ContainerManager, DockerControl};
//!
//! let socket = Arc::new(DockerControl::connect(&config.sandbox)?);
//! let containers = ContainerManager::new(socket, store.clone(), config.sandbox.clone());
//! let worktrees = WorktreeManager::new(store.clone(), config.git.clone());
//! let runtime = AgentRuntime::new(store, containers, worktrees, config);
//!
//! let outcome = runtime.run_turn(TurnRequest::new("s1", "fix the failing test")).await?;
//! println!("exit: {:?}", outcome.exit_code);
//! ```

// Core modules
pub mod bridge;
pub mod git;
pub mod runtime;

// ============================================================================
// Git (worktree 격리)
// ============================================================================
pub use git::{
    branch_name, run_git, worktree_dir, GitError, GitOps, SweepReport, WorktreeManager,
    BRANCH_PREFIX, WORKTREE_DIR,
};

// ============================================================================
// Bridge (도구 브릿지)
// ============================================================================
pub use bridge::{
    bridge_router, companion_env, mcp_config, run_relay, serve, BridgeContext, BridgeReply,
    BridgeService, JsonRpcError, JsonRpcRequest, JsonRpcResponse, Relay, SessionToolHandler,
    ToolCall, ToolContent, ToolDescriptor, ToolHandler, ToolResult, COMPANION_COMMAND,
    COMPANION_SCRIPT,
};

// ============================================================================
// Runtime (Agent turn)
// ============================================================================
pub use runtime::{AgentEvent, AgentRuntime, TurnOutcome, TurnRequest};

//! # berth-task
//!
//! Container lifecycle and execution layer for Berth.
//!
//! ## Features
//!
//! - One resource-limited container per session, reused across turns
//! - Idle despawn driven by a generation-checked timer
//! - Exec with demultiplexed stdout / stderr and per-command cancel
//! - Image resolution and validation
//! - Orphan reconciliation at startup
//! - Health probe for the control socket, image and network

pub mod container;
pub mod state;

// Container system
pub use container::{
    container_name, health_check, ActivityGuard, ContainerHandle, ContainerManager,
    ContainerRegistry, ContainerSpec, ContainerSummary, ControlSocket, DockerControl, ExecCancel,
    ExecChannel, ExecChunk, ExecCompletion, ExecOutput, ExecSession, ExecSpec, ExecStatus,
    HealthStatus, ImageResolver, LineBuffer, WorkspaceBinding, CONTAINER_PREFIX, MANAGED_LABEL,
    SESSION_LABEL,
};

// State machine
pub use state::ContainerState;

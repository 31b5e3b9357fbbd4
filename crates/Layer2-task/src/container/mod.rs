//! Container isolation layer
//!
//! - `client`: control-socket seam (`ControlSocket`)
//! - `docker`: bollard implementation
//! - `image`: image resolution and validation
//! - `manager`: per-session container lifecycle
//! - `exec`: command execution inside a live container
//! - `health`: host readiness probe

pub mod client;
pub mod docker;
pub mod exec;
pub mod health;
pub mod image;
pub mod manager;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use client::{
    container_name, ContainerSpec, ContainerSummary, ControlSocket, ExecChunk, ExecOutput,
    ExecSpec, ExecStatus, CONTAINER_PREFIX, MANAGED_LABEL, SESSION_LABEL,
};
pub use docker::DockerControl;
pub use exec::{ExecCancel, ExecChannel, ExecCompletion, ExecSession, LineBuffer};
pub use health::{health_check, HealthStatus};
pub use image::ImageResolver;
pub use manager::{
    ActivityGuard, ContainerHandle, ContainerManager, ContainerRegistry, WorkspaceBinding,
};

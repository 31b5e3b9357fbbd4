//! Control socket seam
//!
//! Everything the isolation layer needs from the container engine, expressed
//! as one trait so the lifecycle logic can run against Docker or a test double.

use async_trait::async_trait;
use berth_foundation::Result;
use futures::stream::BoxStream;
use std::collections::HashMap;
use std::time::Duration;

/// Label every managed container carries
pub const MANAGED_LABEL: &str = "berth.managed";

/// Label holding the owning session id
pub const SESSION_LABEL: &str = "berth.session";

/// Prefix of generated container names
pub const CONTAINER_PREFIX: &str = "berth-session-";

/// Deterministic container name for a session
pub fn container_name(session_id: &str) -> String {
    let safe: String = session_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '-'
            }
        })
        .collect();
    format!("{}{}", CONTAINER_PREFIX, safe)
}

/// Everything needed to create one agent container
#[derive(Debug, Clone, Default)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub cmd: Vec<String>,
    pub env: Vec<String>,
    pub working_dir: Option<String>,
    /// `host:container[:ro]` bind strings
    pub binds: Vec<String>,
    pub labels: HashMap<String, String>,
    pub memory: Option<i64>,
    pub cpu_quota: Option<i64>,
    pub cpu_period: Option<i64>,
    pub pids_limit: Option<i64>,
    pub runtime: Option<String>,
    pub network: Option<String>,
    pub extra_hosts: Vec<String>,
}

/// Summary row from a container listing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSummary {
    pub id: String,
    /// Names without the leading `/`
    pub names: Vec<String>,
    pub labels: HashMap<String, String>,
}

impl ContainerSummary {
    pub fn is_managed(&self) -> bool {
        self.labels.get(MANAGED_LABEL).map(String::as_str) == Some("true")
            || self.names.iter().any(|n| n.starts_with(CONTAINER_PREFIX))
    }
}

/// One command to run inside a live container
#[derive(Debug, Clone, Default)]
pub struct ExecSpec {
    pub cmd: Vec<String>,
    pub env: Vec<String>,
    pub working_dir: Option<String>,
}

/// A demultiplexed chunk of exec output
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecChunk {
    Stdout(Vec<u8>),
    Stderr(Vec<u8>),
}

/// Attached exec output
pub type ExecOutput = BoxStream<'static, Result<ExecChunk>>;

/// Exec inspection result
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecStatus {
    pub running: bool,
    pub pid: Option<i64>,
    pub exit_code: Option<i64>,
}

/// Container engine operations used by the isolation layer
#[async_trait]
pub trait ControlSocket: Send + Sync {
    /// Round-trip to the daemon
    async fn ping(&self) -> Result<()>;

    /// Ok if the image is present locally
    async fn inspect_image(&self, image: &str) -> Result<()>;

    /// `Some(running)` for an existing container, `None` if it does not exist
    async fn container_running(&self, id_or_name: &str) -> Result<Option<bool>>;

    /// Create a container and return its id
    async fn create_container(&self, spec: &ContainerSpec) -> Result<String>;

    async fn start_container(&self, id: &str) -> Result<()>;

    /// Stop with a grace period; an already-stopped or missing container is Ok
    async fn stop_container(&self, id: &str, grace: Duration) -> Result<()>;

    /// Force-remove; a missing container is Ok
    async fn remove_container(&self, id_or_name: &str) -> Result<()>;

    /// All containers (running or not) that look managed by Berth
    async fn list_managed_containers(&self) -> Result<Vec<ContainerSummary>>;

    /// Resolves once the container is no longer running, with its exit code
    async fn wait_container(&self, id: &str) -> Result<i64>;

    async fn network_exists(&self, name: &str) -> Result<bool>;

    /// Create a bridge network; "already exists" is Ok
    async fn create_network(&self, name: &str) -> Result<()>;

    /// Create an exec and return its id
    async fn create_exec(&self, container_id: &str, spec: &ExecSpec) -> Result<String>;

    /// Start an attached exec
    async fn start_exec(&self, exec_id: &str) -> Result<ExecOutput>;

    async fn inspect_exec(&self, exec_id: &str) -> Result<ExecStatus>;
}

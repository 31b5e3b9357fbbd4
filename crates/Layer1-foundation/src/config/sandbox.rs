//! Sandbox / Bridge / Git configuration
//!
//! 모든 값은 `BERTH_*` 환경변수에서 읽는다.

use super::env;
use crate::Result;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Image used when nothing else names one
pub const FALLBACK_IMAGE: &str = "berth-agent:latest";

/// Shared bridge network every agent container joins
pub const DEFAULT_NETWORK: &str = "berth-net";

/// Path of the tool bridge endpoint on the host
pub const BRIDGE_PATH: &str = "/api/bridge";

/// Mount point of the session's working directory inside the container
pub const CONTAINER_WORKSPACE: &str = "/workspace";

/// Mount point of the read-only credentials directory inside the container
pub const CONTAINER_CREDENTIALS: &str = "/credentials";

const DEFAULT_AGENT_COMMAND: &str = r#"claude -p "$BERTH_PROMPT" ${BERTH_RESUME_TOKEN:+--resume "$BERTH_RESUME_TOKEN"} --mcp-config "$BERTH_MCP_CONFIG" --output-format stream-json --verbose"#;

// ============================================================================
// Sandbox
// ============================================================================

/// Container sandbox configuration
#[derive(Debug, Clone, Serialize)]
pub struct SandboxConfig {
    /// Process-wide default image (`BERTH_DEFAULT_IMAGE`)
    pub default_image: Option<String>,
    /// Memory limit in bytes (`BERTH_MEMORY_LIMIT`, e.g. `4g`)
    pub memory_limit: Option<i64>,
    /// CPU limit in cores (`BERTH_CPU_LIMIT`)
    pub cpu_limit: Option<f64>,
    /// Max processes inside the container (`BERTH_PIDS_LIMIT`)
    pub pids_limit: Option<i64>,
    /// Alternate low-level runtime, e.g. `runsc` (`BERTH_RUNTIME`)
    pub runtime: Option<String>,
    /// Shared bridge network name (`BERTH_NETWORK`)
    pub network: String,
    /// Docker socket path override (`BERTH_DOCKER_SOCKET`)
    pub docker_socket: Option<PathBuf>,
    /// Mount the Docker socket into agent containers (`BERTH_DOCKER_SOCKET_ACCESS`)
    pub docker_socket_access: bool,
    /// Idle period before a container is despawned (`BERTH_IDLE_TIMEOUT_SECS`)
    pub idle_timeout: Duration,
    /// Grace period for `docker stop` before force removal (`BERTH_STOP_GRACE_SECS`)
    pub stop_grace: Duration,
    /// Projects directory as seen by this process (`BERTH_PROJECTS_DIR`)
    pub projects_dir: Option<PathBuf>,
    /// Same directory as seen by the Docker host (`BERTH_HOST_PROJECTS_DIR`)
    pub host_projects_dir: Option<PathBuf>,
    /// Credentials directory as seen by this process (`BERTH_CREDENTIALS_DIR`)
    pub credentials_dir: Option<PathBuf>,
    /// Same directory as seen by the Docker host (`BERTH_HOST_CREDENTIALS_DIR`)
    pub host_credentials_dir: Option<PathBuf>,
    /// Shell command that runs the agent inside the container (`BERTH_AGENT_COMMAND`)
    pub agent_command: String,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            default_image: None,
            memory_limit: Some(4 * 1024 * 1024 * 1024),
            cpu_limit: Some(2.0),
            pids_limit: Some(512),
            runtime: None,
            network: DEFAULT_NETWORK.to_string(),
            docker_socket: None,
            docker_socket_access: false,
            idle_timeout: Duration::from_secs(15 * 60),
            stop_grace: Duration::from_secs(10),
            projects_dir: None,
            host_projects_dir: None,
            credentials_dir: None,
            host_credentials_dir: None,
            agent_command: DEFAULT_AGENT_COMMAND.to_string(),
        }
    }
}

impl SandboxConfig {
    pub(crate) fn resolve<F>(lookup: &F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let cpu_limit = match env::parsed_or(lookup, "BERTH_CPU_LIMIT", 2.0_f64)? {
            c if c > 0.0 => Some(c),
            _ => None,
        };
        let pids_limit = match env::parsed_or(lookup, "BERTH_PIDS_LIMIT", 512_i64)? {
            p if p > 0 => Some(p),
            _ => None,
        };

        Ok(Self {
            default_image: env::optional(lookup, "BERTH_DEFAULT_IMAGE"),
            memory_limit: env::memory_or(lookup, "BERTH_MEMORY_LIMIT", "4g")?,
            cpu_limit,
            pids_limit,
            runtime: env::optional(lookup, "BERTH_RUNTIME"),
            network: env::string_or(lookup, "BERTH_NETWORK", DEFAULT_NETWORK),
            docker_socket: env::path(lookup, "BERTH_DOCKER_SOCKET"),
            docker_socket_access: env::bool_or(lookup, "BERTH_DOCKER_SOCKET_ACCESS", false)?,
            idle_timeout: Duration::from_secs(env::parsed_or(
                lookup,
                "BERTH_IDLE_TIMEOUT_SECS",
                defaults.idle_timeout.as_secs(),
            )?),
            stop_grace: Duration::from_secs(env::parsed_or(
                lookup,
                "BERTH_STOP_GRACE_SECS",
                defaults.stop_grace.as_secs(),
            )?),
            projects_dir: env::path(lookup, "BERTH_PROJECTS_DIR"),
            host_projects_dir: env::path(lookup, "BERTH_HOST_PROJECTS_DIR"),
            credentials_dir: env::path(lookup, "BERTH_CREDENTIALS_DIR"),
            host_credentials_dir: env::path(lookup, "BERTH_HOST_CREDENTIALS_DIR"),
            agent_command: env::string_or(lookup, "BERTH_AGENT_COMMAND", DEFAULT_AGENT_COMMAND),
        })
    }

    /// CPU quota / period pair for the Docker host config (period 100ms)
    pub fn cpu_quota(&self) -> Option<(i64, i64)> {
        const PERIOD: i64 = 100_000;
        self.cpu_limit
            .map(|cores| ((cores * PERIOD as f64).round() as i64, PERIOD))
    }

    /// Translate a path under `projects_dir` into the equivalent host path.
    ///
    /// This process usually runs in a sibling container, so bind sources
    /// must be expressed in the Docker host's filesystem.
    pub fn host_project_path(&self, path: &Path) -> PathBuf {
        translate(path, self.projects_dir.as_deref(), self.host_projects_dir.as_deref())
    }

    /// Host path of the credentials directory, if credentials are configured
    pub fn host_credentials_path(&self) -> Option<PathBuf> {
        match (&self.credentials_dir, &self.host_credentials_dir) {
            (_, Some(host)) => Some(host.clone()),
            (Some(local), None) => Some(local.clone()),
            (None, None) => None,
        }
    }
}

fn translate(path: &Path, internal_root: Option<&Path>, host_root: Option<&Path>) -> PathBuf {
    match (internal_root, host_root) {
        (Some(internal), Some(host)) => match path.strip_prefix(internal) {
            Ok(rel) => host.join(rel),
            Err(_) => path.to_path_buf(),
        },
        _ => path.to_path_buf(),
    }
}

// ============================================================================
// Bridge
// ============================================================================

/// Tool bridge endpoint configuration
#[derive(Debug, Clone, Serialize)]
pub struct BridgeConfig {
    /// Address the endpoint binds to (`BERTH_BRIDGE_BIND`)
    pub bind: String,
    /// Port the endpoint listens on (`BERTH_BRIDGE_PORT`)
    pub port: u16,
    /// Host name containers use to reach the endpoint (`BERTH_BRIDGE_HOST`)
    pub host: String,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".to_string(),
            port: 7420,
            host: "host.docker.internal".to_string(),
        }
    }
}

impl BridgeConfig {
    pub(crate) fn resolve<F>(lookup: &F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        Ok(Self {
            bind: env::string_or(lookup, "BERTH_BRIDGE_BIND", &defaults.bind),
            port: env::parsed_or(lookup, "BERTH_BRIDGE_PORT", defaults.port)?,
            host: env::string_or(lookup, "BERTH_BRIDGE_HOST", &defaults.host),
        })
    }

    /// URL of the endpoint as reached from inside a container
    pub fn endpoint_url(&self) -> String {
        format!("http://{}:{}{}", self.host, self.port, BRIDGE_PATH)
    }
}

// ============================================================================
// Git
// ============================================================================

/// Version-control subprocess configuration
#[derive(Debug, Clone, Serialize)]
pub struct GitConfig {
    /// Wall-clock limit for one git invocation (`BERTH_GIT_TIMEOUT_SECS`)
    pub timeout: Duration,
}

impl Default for GitConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
        }
    }
}

impl GitConfig {
    pub(crate) fn resolve<F>(lookup: &F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        Ok(Self {
            timeout: Duration::from_secs(env::parsed_or(lookup, "BERTH_GIT_TIMEOUT_SECS", 30_u64)?),
        })
    }
}

//! Config - 통합 설정 관리
//!
//! - `env.rs` - 환경변수 파서
//! - `sandbox.rs` - 컨테이너 / 브리지 / git 설정

mod env;
mod sandbox;

pub use env::parse_memory;
pub use sandbox::{
    BridgeConfig, GitConfig, SandboxConfig, BRIDGE_PATH, CONTAINER_CREDENTIALS,
    CONTAINER_WORKSPACE, DEFAULT_NETWORK, FALLBACK_IMAGE,
};

use crate::Result;
use serde::Serialize;
use std::path::PathBuf;

/// Berth 통합 설정
#[derive(Debug, Clone, Serialize)]
pub struct BerthConfig {
    /// Where the isolation store lives (`BERTH_DATA_DIR`, default `~/.berth`)
    pub data_dir: PathBuf,
    pub sandbox: SandboxConfig,
    pub bridge: BridgeConfig,
    pub git: GitConfig,
}

impl BerthConfig {
    /// Load from the process environment
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let data_dir = env::path(&lookup, "BERTH_DATA_DIR").unwrap_or_else(default_data_dir);

        Ok(Self {
            data_dir,
            sandbox: SandboxConfig::resolve(&lookup)?,
            bridge: BridgeConfig::resolve(&lookup)?,
            git: GitConfig::resolve(&lookup)?,
        })
    }
}

fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".berth")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_lookup_data_dir() {
        let config = BerthConfig::from_lookup(|k| match k {
            "BERTH_DATA_DIR" => Some("/var/lib/berth".to_string()),
            _ => None,
        })
        .unwrap();
        assert_eq!(config.data_dir, PathBuf::from("/var/lib/berth"));
        assert_eq!(config.git.timeout.as_secs(), 30);
    }
}

//! Container state machine
//!
//! ```text
//! Creating ──▶ Running ──▶ Despawning
//!                 │
//!                 └──────▶ Exited
//! ```

use serde::{Deserialize, Serialize};

/// Lifecycle state of one tracked container
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContainerState {
    /// Create/start in flight
    Creating,

    /// Started and registered; idle timer armed
    Running,

    /// Teardown started (idle expiry or explicit despawn)
    Despawning,

    /// The container process ended on its own
    Exited,
}

impl ContainerState {
    /// Whether `next` is a legal successor of this state
    pub fn can_transition_to(&self, next: ContainerState) -> bool {
        use ContainerState::*;
        matches!(
            (self, next),
            (Creating, Running)
                | (Creating, Despawning)
                | (Running, Despawning)
                | (Running, Exited)
                | (Exited, Despawning)
        )
    }

    /// Usable for exec
    pub fn is_live(&self) -> bool {
        matches!(self, ContainerState::Running)
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            ContainerState::Creating => "Creating",
            ContainerState::Running => "Running",
            ContainerState::Despawning => "Despawning",
            ContainerState::Exited => "Exited",
        }
    }
}

impl std::fmt::Display for ContainerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.display_name())
    }
}

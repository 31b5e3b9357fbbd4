//! Process-wide wiring: config → store → Docker → managers → runtime

use berth_core::{AgentRuntime, WorktreeManager};
use berth_foundation::{BerthConfig, IsolationStore, Storage};
use berth_task::{ContainerManager, ControlSocket, DockerControl};
use std::sync::Arc;

/// Everything a command needs, built once per invocation
pub struct App {
    pub config: BerthConfig,
    pub store: Arc<dyn IsolationStore>,
    pub socket: Arc<dyn ControlSocket>,
    pub containers: ContainerManager,
    pub worktrees: WorktreeManager,
    pub runtime: AgentRuntime,
}

impl App {
    pub fn open(config: BerthConfig) -> anyhow::Result<Self> {
        let store: Arc<dyn IsolationStore> = Arc::new(Storage::new(&config.data_dir)?);
        let socket: Arc<dyn ControlSocket> = Arc::new(DockerControl::connect(&config.sandbox)?);

        let containers =
            ContainerManager::new(Arc::clone(&socket), Arc::clone(&store), config.sandbox.clone());
        let worktrees = WorktreeManager::new(Arc::clone(&store), config.git.clone());
        let runtime = AgentRuntime::new(
            Arc::clone(&store),
            containers.clone(),
            worktrees.clone(),
            config.clone(),
        );

        Ok(Self {
            config,
            store,
            socket,
            containers,
            worktrees,
            runtime,
        })
    }

    /// Store only, for commands that never talk to Docker
    pub fn open_store(config: &BerthConfig) -> anyhow::Result<Arc<dyn IsolationStore>> {
        Ok(Arc::new(Storage::new(&config.data_dir)?))
    }
}

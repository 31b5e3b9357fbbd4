//! Container lifecycle manager
//!
//! One running, resource-limited container per session:
//! - `ensure_container`: reuse or create (per-session lock)
//! - `touch`: re-arm the idle timer after activity
//! - `begin_activity`: hold off idle expiry while a command runs
//! - `despawn`: stop, remove, forget the resumable token
//! - `reconcile_orphans`: reclaim managed containers nobody tracks
//!
//! The registry is a derived cache. It starts empty after a restart and
//! every decision re-checks the daemon before trusting an entry.

use super::client::{
    container_name, ContainerSpec, ControlSocket, MANAGED_LABEL, SESSION_LABEL,
};
use super::image::ImageResolver;
use crate::state::ContainerState;
use berth_foundation::{
    Error, IsolationStore, Result, SandboxConfig, CONTAINER_CREDENTIALS, CONTAINER_WORKSPACE,
};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Host alias that lets a container reach services on the Docker host
const HOST_GATEWAY: &str = "host.docker.internal:host-gateway";

const DOCKER_SOCKET: &str = "/var/run/docker.sock";

// ============================================================================
// Public types
// ============================================================================

/// A live container owned by one session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerHandle {
    pub session_id: String,
    pub container_id: String,
    pub name: String,
}

/// What gets mounted at `/workspace`
#[derive(Debug, Clone)]
pub struct WorkspaceBinding {
    /// Effective working directory as seen by this process
    pub dir: PathBuf,
    /// Mount without write access (explore sessions)
    pub read_only: bool,
}

/// Keeps a container busy while held; idle expiry is postponed until
/// every guard is dropped
#[derive(Debug)]
pub struct ActivityGuard {
    in_flight: Arc<AtomicUsize>,
}

impl Drop for ActivityGuard {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

impl WorkspaceBinding {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            read_only: false,
        }
    }

    pub fn read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }
}

// ============================================================================
// Registry
// ============================================================================

struct ContainerEntry {
    container_id: String,
    name: String,
    state: ContainerState,
    /// Identity of this entry; a recreated container gets a new one
    generation: u64,
    /// Identity of the current idle-timer arm
    timer_token: u64,
    idle_timer: Option<JoinHandle<()>>,
    exit_watcher: Option<JoinHandle<()>>,
    /// Commands currently running in the container
    in_flight: Arc<AtomicUsize>,
}

impl ContainerEntry {
    fn handle(&self, session_id: &str) -> ContainerHandle {
        ContainerHandle {
            session_id: session_id.to_string(),
            container_id: self.container_id.clone(),
            name: self.name.clone(),
        }
    }

    fn is_busy(&self) -> bool {
        self.in_flight.load(Ordering::SeqCst) > 0
    }

    fn transition(&mut self, next: ContainerState) {
        debug_assert!(
            self.state.can_transition_to(next),
            "illegal container transition {} -> {}",
            self.state,
            next
        );
        self.state = next;
    }

    fn abort_tasks(&mut self) {
        if let Some(timer) = self.idle_timer.take() {
            timer.abort();
        }
        if let Some(watcher) = self.exit_watcher.take() {
            watcher.abort();
        }
    }
}

/// Live container entries plus per-session locks
#[derive(Default)]
pub struct ContainerRegistry {
    entries: RwLock<HashMap<String, ContainerEntry>>,
    locks: parking_lot::Mutex<HashMap<String, Arc<Mutex<()>>>>,
    sequence: AtomicU64,
}

impl ContainerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_seq(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Lock serializing lifecycle operations for one session
    fn session_lock(&self, session_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock();
        Arc::clone(locks.entry(session_id.to_string()).or_default())
    }

    /// Drop locks nobody holds or waits on
    fn prune_locks(&self) {
        self.locks.lock().retain(|_, lock| Arc::strong_count(lock) > 1);
    }

    /// Session ids with a tracked container
    pub async fn tracked_sessions(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.entries.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }
}

// ============================================================================
// ContainerManager
// ============================================================================

/// Creates, reuses and despawns per-session containers
#[derive(Clone)]
pub struct ContainerManager {
    socket: Arc<dyn ControlSocket>,
    images: ImageResolver,
    store: Arc<dyn IsolationStore>,
    config: Arc<SandboxConfig>,
    registry: Arc<ContainerRegistry>,
}

impl ContainerManager {
    pub fn new(
        socket: Arc<dyn ControlSocket>,
        store: Arc<dyn IsolationStore>,
        config: SandboxConfig,
    ) -> Self {
        let images = ImageResolver::new(Arc::clone(&socket), config.default_image.clone());
        Self {
            socket,
            images,
            store,
            config: Arc::new(config),
            registry: Arc::new(ContainerRegistry::new()),
        }
    }

    pub fn images(&self) -> &ImageResolver {
        &self.images
    }

    pub fn socket(&self) -> Arc<dyn ControlSocket> {
        Arc::clone(&self.socket)
    }

    pub async fn tracked_sessions(&self) -> Vec<String> {
        self.registry.tracked_sessions().await
    }

    // ========================================================================
    // ensure / touch
    // ========================================================================

    /// Return the session's running container, creating it if needed
    pub async fn ensure_container(
        &self,
        session_id: &str,
        image: &str,
        binding: &WorkspaceBinding,
        env: &[String],
    ) -> Result<ContainerHandle> {
        let lock = self.registry.session_lock(session_id);
        let _guard = lock.lock().await;

        if let Some(handle) = self.reuse_existing(session_id).await? {
            debug!(session_id = %session_id, container = %handle.name, "Reusing container");
            self.arm_idle_timer(session_id).await;
            return Ok(handle);
        }

        self.images.require(image).await?;
        self.ensure_network().await?;

        let name = container_name(session_id);
        self.socket
            .remove_container(&name)
            .await
            .map_err(|e| creation_error(session_id, e))?;

        let spec = self.container_spec(session_id, &name, image, binding, env);
        let container_id = self
            .socket
            .create_container(&spec)
            .await
            .map_err(|e| creation_error(session_id, e))?;

        let generation = self.registry.next_seq();
        self.registry.entries.write().await.insert(
            session_id.to_string(),
            ContainerEntry {
                container_id: container_id.clone(),
                name: name.clone(),
                state: ContainerState::Creating,
                generation,
                timer_token: 0,
                idle_timer: None,
                exit_watcher: None,
                in_flight: Arc::new(AtomicUsize::new(0)),
            },
        );

        if let Err(e) = self.socket.start_container(&container_id).await {
            self.registry.entries.write().await.remove(session_id);
            if let Err(cleanup) = self.socket.remove_container(&container_id).await {
                warn!(session_id = %session_id, error = %cleanup, "Cleanup after failed start failed");
            }
            return Err(creation_error(session_id, e));
        }

        let handle = {
            let mut entries = self.registry.entries.write().await;
            let Some(entry) = entries.get_mut(session_id) else {
                return Err(Error::container_creation(
                    session_id,
                    "entry vanished during start",
                ));
            };
            entry.transition(ContainerState::Running);
            entry.exit_watcher = Some(self.spawn_exit_watcher(
                session_id,
                &container_id,
                generation,
            ));
            entry.handle(session_id)
        };

        self.arm_idle_timer(session_id).await;

        info!(
            session_id = %session_id,
            container = %name,
            image = %image,
            "Container started"
        );
        Ok(handle)
    }

    /// Re-arm the idle timer after activity
    pub async fn touch(&self, session_id: &str) {
        self.arm_idle_timer(session_id).await;
    }

    /// Mark the session's container busy until the guard drops.
    ///
    /// None when no live container is tracked for the session.
    pub async fn begin_activity(&self, session_id: &str) -> Option<ActivityGuard> {
        let entries = self.registry.entries.read().await;
        let entry = entries.get(session_id).filter(|e| e.state.is_live())?;
        entry.in_flight.fetch_add(1, Ordering::SeqCst);
        Some(ActivityGuard {
            in_flight: Arc::clone(&entry.in_flight),
        })
    }

    async fn reuse_existing(&self, session_id: &str) -> Result<Option<ContainerHandle>> {
        let current = {
            let entries = self.registry.entries.read().await;
            entries
                .get(session_id)
                .map(|e| (e.handle(session_id), e.state))
        };

        let Some((handle, state)) = current else {
            return Ok(None);
        };

        if state.is_live() && self.socket.container_running(&handle.container_id).await? == Some(true)
        {
            return Ok(Some(handle));
        }

        debug!(session_id = %session_id, container = %handle.name, %state, "Discarding stale entry");
        if let Some(mut entry) = self.registry.entries.write().await.remove(session_id) {
            entry.abort_tasks();
        }
        Ok(None)
    }

    async fn ensure_network(&self) -> Result<()> {
        let network = &self.config.network;
        let exists = self
            .socket
            .network_exists(network)
            .await
            .map_err(network_error)?;
        if exists {
            return Ok(());
        }
        self.socket.create_network(network).await.map_err(network_error)
    }

    fn container_spec(
        &self,
        session_id: &str,
        name: &str,
        image: &str,
        binding: &WorkspaceBinding,
        env: &[String],
    ) -> ContainerSpec {
        let host_dir = self.config.host_project_path(&binding.dir);
        let mut binds = vec![format!(
            "{}:{}{}",
            host_dir.display(),
            CONTAINER_WORKSPACE,
            if binding.read_only { ":ro" } else { "" }
        )];
        if let Some(credentials) = self.config.host_credentials_path() {
            binds.push(format!("{}:{}:ro", credentials.display(), CONTAINER_CREDENTIALS));
        }
        if self.config.docker_socket_access {
            binds.push(format!("{}:{}", DOCKER_SOCKET, DOCKER_SOCKET));
        }

        let labels = HashMap::from([
            (MANAGED_LABEL.to_string(), "true".to_string()),
            (SESSION_LABEL.to_string(), session_id.to_string()),
        ]);

        let (cpu_quota, cpu_period) = match self.config.cpu_quota() {
            Some((quota, period)) => (Some(quota), Some(period)),
            None => (None, None),
        };

        ContainerSpec {
            name: name.to_string(),
            image: image.to_string(),
            cmd: vec!["sleep".into(), "infinity".into()],
            env: env.to_vec(),
            working_dir: Some(CONTAINER_WORKSPACE.to_string()),
            binds,
            labels,
            memory: self.config.memory_limit,
            cpu_quota,
            cpu_period,
            pids_limit: self.config.pids_limit,
            runtime: self.config.runtime.clone(),
            network: Some(self.config.network.clone()),
            extra_hosts: vec![HOST_GATEWAY.to_string()],
        }
    }

    // ========================================================================
    // Idle timer / exit watcher
    // ========================================================================

    async fn arm_idle_timer(&self, session_id: &str) {
        let token = self.registry.next_seq();
        let mut entries = self.registry.entries.write().await;
        let Some(entry) = entries.get_mut(session_id) else {
            return;
        };
        if !entry.state.is_live() {
            return;
        }

        if let Some(previous) = entry.idle_timer.take() {
            previous.abort();
        }
        entry.timer_token = token;

        let generation = entry.generation;
        let timeout = self.config.idle_timeout;
        let manager = self.clone();
        let session_id = session_id.to_string();
        entry.idle_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            manager.expire(&session_id, generation, token).await;
        }));
    }

    /// Idle expiry: `Running + timeout elapsed → Despawning`.
    /// A busy container gets a fresh timeout instead.
    fn expire<'a>(
        &'a self,
        session_id: &'a str,
        generation: u64,
        token: u64,
    ) -> impl std::future::Future<Output = ()> + Send + 'a {
        async move {
        let lock = self.registry.session_lock(session_id);
        let guard = lock.lock().await;

        let entry = {
            let mut entries = self.registry.entries.write().await;
            let Some(current) = entries.get_mut(session_id).filter(|e| {
                e.generation == generation && e.timer_token == token && e.state.is_live()
            }) else {
                debug!(session_id = %session_id, "Stale idle timer ignored");
                return;
            };
            if current.is_busy() {
                // This task is the timer; detach it so re-arming does not cancel us
                drop(current.idle_timer.take());
                None
            } else {
                entries.remove(session_id)
            }
        };
        let Some(mut entry) = entry else {
            debug!(session_id = %session_id, "Container busy, idle timer re-armed");
            drop(guard);
            self.arm_idle_timer(session_id).await;
            return;
        };

        entry.transition(ContainerState::Despawning);
        // This task is the timer; dropping the handle detaches instead of cancelling
        drop(entry.idle_timer.take());
        if let Some(watcher) = entry.exit_watcher.take() {
            watcher.abort();
        }

        info!(session_id = %session_id, container = %entry.name, "Idle timeout elapsed, despawning");
        if let Err(e) = self.teardown(session_id, &entry.container_id).await {
            warn!(session_id = %session_id, error = %e, "Idle despawn failed");
        }

        drop(guard);
        drop(lock);
        self.registry.prune_locks();
        }
    }

    fn spawn_exit_watcher(
        &self,
        session_id: &str,
        container_id: &str,
        generation: u64,
    ) -> JoinHandle<()> {
        let manager = self.clone();
        let session_id = session_id.to_string();
        let container_id = container_id.to_string();
        tokio::spawn(async move {
            match manager.socket.wait_container(&container_id).await {
                Ok(code) => manager.on_exit(&session_id, generation, code).await,
                Err(e) => {
                    debug!(session_id = %session_id, error = %e, "Exit watch ended without a status")
                }
            }
        })
    }

    /// Unexpected exit: forget the entry so the next ensure recreates
    async fn on_exit(&self, session_id: &str, generation: u64, exit_code: i64) {
        {
            let mut entries = self.registry.entries.write().await;
            let current = entries.get(session_id).is_some_and(|e| {
                e.generation == generation && e.state != ContainerState::Despawning
            });
            if !current {
                return;
            }
            if let Some(mut entry) = entries.remove(session_id) {
                entry.transition(ContainerState::Exited);
                if let Some(timer) = entry.idle_timer.take() {
                    timer.abort();
                }
                // This task is the watcher
                drop(entry.exit_watcher.take());
            }
        }

        warn!(session_id = %session_id, exit_code, "Container exited unexpectedly");
        self.clear_token(session_id);
    }

    // ========================================================================
    // despawn / reconcile
    // ========================================================================

    /// Tear down the session's container. Idempotent; works for untracked
    /// sessions too (removal by generated name).
    pub async fn despawn(&self, session_id: &str) -> Result<()> {
        let lock = self.registry.session_lock(session_id);
        let guard = lock.lock().await;

        let entry = self.registry.entries.write().await.remove(session_id);
        let target = match entry {
            Some(mut entry) => {
                entry.abort_tasks();
                entry.transition(ContainerState::Despawning);
                entry.container_id
            }
            None => container_name(session_id),
        };

        let result = self.teardown(session_id, &target).await;
        if result.is_ok() {
            info!(session_id = %session_id, "Container despawned");
        }

        drop(guard);
        drop(lock);
        self.registry.prune_locks();
        result
    }

    /// Despawn every tracked container (shutdown)
    pub async fn despawn_all(&self) -> Result<()> {
        for session_id in self.tracked_sessions().await {
            if let Err(e) = self.despawn(&session_id).await {
                warn!(session_id = %session_id, error = %e, "Despawn during shutdown failed");
            }
        }
        Ok(())
    }

    async fn teardown(&self, session_id: &str, container: &str) -> Result<()> {
        if let Err(e) = self.socket.stop_container(container, self.config.stop_grace).await {
            warn!(session_id = %session_id, error = %e, "Graceful stop failed, forcing removal");
        }
        let removed = self.socket.remove_container(container).await;
        self.clear_token(session_id);
        removed
    }

    /// The resumable token dies with the container
    fn clear_token(&self, session_id: &str) {
        match self.store.set_agent_session_token(session_id, None) {
            Ok(()) | Err(Error::SessionNotFound(_)) => {}
            Err(e) => warn!(session_id = %session_id, error = %e, "Failed to clear agent session token"),
        }
    }

    /// Force-remove managed containers that no entry tracks. Returns how many.
    pub async fn reconcile_orphans(&self) -> Result<usize> {
        let (tracked_ids, tracked_names): (HashSet<String>, HashSet<String>) = {
            let entries = self.registry.entries.read().await;
            (
                entries.values().map(|e| e.container_id.clone()).collect(),
                entries.values().map(|e| e.name.clone()).collect(),
            )
        };

        let mut removed = 0;
        for container in self.socket.list_managed_containers().await? {
            let tracked = tracked_ids.contains(&container.id)
                || container.names.iter().any(|n| tracked_names.contains(n));
            if tracked {
                continue;
            }

            match self.socket.remove_container(&container.id).await {
                Ok(()) => {
                    info!(container = ?container.names, "Removed orphaned container");
                    removed += 1;
                }
                Err(e) => warn!(container = ?container.names, error = %e, "Failed to remove orphan"),
            }
        }
        Ok(removed)
    }
}

fn creation_error(session_id: &str, err: Error) -> Error {
    match err {
        Error::DockerUnavailable(_) | Error::ContainerCreation { .. } => err,
        other => Error::container_creation(session_id, other.to_string()),
    }
}

fn network_error(err: Error) -> Error {
    match err {
        Error::DockerUnavailable(_) | Error::Network(_) => err,
        other => Error::Network(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::client::ExecSpec;
    use crate::container::exec::ExecChannel;
    use crate::container::testing::{ExecScript, MockControlSocket};
    use berth_foundation::{Project, Session, SessionMode, Storage};
    use std::time::Duration;

    const IMAGE: &str = "berth-agent:latest";

    struct Fixture {
        socket: Arc<MockControlSocket>,
        store: Arc<Storage>,
        manager: ContainerManager,
    }

    fn fixture_with(config: SandboxConfig) -> Fixture {
        let socket = Arc::new(MockControlSocket::new().with_image(IMAGE));
        let store = Arc::new(Storage::in_memory().unwrap());
        store
            .insert_project(&Project::new("p1", "app", "/projects/app"))
            .unwrap();
        store
            .insert_session(&Session::new("s1", "p1", SessionMode::Write))
            .unwrap();
        let manager = ContainerManager::new(socket.clone(), store.clone(), config);
        Fixture {
            socket,
            store,
            manager,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(SandboxConfig::default())
    }

    fn binding() -> WorkspaceBinding {
        WorkspaceBinding::new("/projects/app")
    }

    async fn state_of(manager: &ContainerManager, session_id: &str) -> Option<ContainerState> {
        manager.registry.entries.read().await.get(session_id).map(|e| e.state)
    }

    async fn in_flight(manager: &ContainerManager, session_id: &str) -> usize {
        manager
            .registry
            .entries
            .read()
            .await
            .get(session_id)
            .map_or(0, |e| e.in_flight.load(Ordering::SeqCst))
    }

    #[tokio::test]
    async fn test_ensure_twice_reuses_container() {
        let f = fixture();
        let first = f.manager.ensure_container("s1", IMAGE, &binding(), &[]).await.unwrap();
        let second = f.manager.ensure_container("s1", IMAGE, &binding(), &[]).await.unwrap();

        assert_eq!(first.container_id, second.container_id);
        assert_eq!(f.socket.created_specs().len(), 1);
        assert_eq!(f.manager.tracked_sessions().await, vec!["s1".to_string()]);
    }

    #[tokio::test]
    async fn test_container_spec_limits_and_labels() {
        let config = SandboxConfig {
            runtime: Some("runsc".into()),
            docker_socket_access: true,
            projects_dir: Some("/projects".into()),
            host_projects_dir: Some("/srv/projects".into()),
            credentials_dir: Some("/creds".into()),
            ..Default::default()
        };
        let f = fixture_with(config);
        let handle = f
            .manager
            .ensure_container("s1", IMAGE, &binding(), &["A=1".to_string()])
            .await
            .unwrap();

        assert_eq!(handle.name, "berth-session-s1");
        let spec = &f.socket.created_specs()[0];
        assert_eq!(spec.cmd, vec!["sleep", "infinity"]);
        assert_eq!(spec.labels.get(MANAGED_LABEL).map(String::as_str), Some("true"));
        assert_eq!(spec.labels.get(SESSION_LABEL).map(String::as_str), Some("s1"));
        assert!(spec.binds.contains(&"/srv/projects/app:/workspace".to_string()));
        assert!(spec.binds.contains(&"/creds:/credentials:ro".to_string()));
        assert!(spec.binds.iter().any(|b| b.starts_with("/var/run/docker.sock:")));
        assert_eq!(spec.memory, Some(4 * 1024 * 1024 * 1024));
        assert_eq!(spec.cpu_quota, Some(200_000));
        assert_eq!(spec.pids_limit, Some(512));
        assert_eq!(spec.runtime.as_deref(), Some("runsc"));
        assert_eq!(spec.network.as_deref(), Some("berth-net"));
        assert_eq!(spec.extra_hosts, vec![HOST_GATEWAY.to_string()]);
        assert_eq!(spec.env, vec!["A=1".to_string()]);
    }

    #[tokio::test]
    async fn test_read_only_binding() {
        let f = fixture();
        f.manager
            .ensure_container("s1", IMAGE, &binding().read_only(true), &[])
            .await
            .unwrap();
        assert_eq!(f.socket.created_specs()[0].binds[0], "/projects/app:/workspace:ro");
    }

    #[tokio::test]
    async fn test_missing_image_creates_nothing() {
        let f = fixture();
        let err = f
            .manager
            .ensure_container("s1", "absent:1", &binding(), &[])
            .await
            .unwrap_err();

        assert!(matches!(err, Error::ImageNotFound { .. }));
        assert!(f.socket.created_specs().is_empty());
        assert!(f.manager.tracked_sessions().await.is_empty());
    }

    #[tokio::test]
    async fn test_socket_unreachable_is_typed_error() {
        let f = fixture();
        f.socket.set_reachable(false);
        let err = f
            .manager
            .ensure_container("s1", IMAGE, &binding(), &[])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::DockerUnavailable(_)));
        assert!(f.socket.created_specs().is_empty());
    }

    #[tokio::test]
    async fn test_network_created_once() {
        let f = fixture();
        f.manager.ensure_container("s1", IMAGE, &binding(), &[]).await.unwrap();
        f.store
            .insert_session(&Session::new("s2", "p1", SessionMode::Write))
            .unwrap();
        f.manager.ensure_container("s2", IMAGE, &binding(), &[]).await.unwrap();

        let creates = f
            .socket
            .calls()
            .iter()
            .filter(|c| c.starts_with("create_network"))
            .count();
        assert_eq!(creates, 1);
    }

    #[tokio::test]
    async fn test_despawn_clears_token_and_is_idempotent() {
        let f = fixture();
        f.store.set_agent_session_token("s1", Some("resume-me")).unwrap();
        f.manager.ensure_container("s1", IMAGE, &binding(), &[]).await.unwrap();

        f.manager.despawn("s1").await.unwrap();
        assert!(f.manager.tracked_sessions().await.is_empty());
        assert_eq!(f.socket.live_containers(), 0);
        let session = f.store.get_session("s1").unwrap().unwrap();
        assert_eq!(session.agent_session_token, None);

        f.manager.despawn("s1").await.unwrap();
        f.manager.despawn("never-existed").await.unwrap();
    }

    #[tokio::test]
    async fn test_stale_entry_is_recreated() {
        let f = fixture();
        let first = f.manager.ensure_container("s1", IMAGE, &binding(), &[]).await.unwrap();
        // Stopped behind our back, exit not yet observed
        f.socket.stop_silently(&first.container_id);

        let second = f.manager.ensure_container("s1", IMAGE, &binding(), &[]).await.unwrap();
        assert_ne!(first.container_id, second.container_id);
    }

    #[tokio::test]
    async fn test_unexpected_exit_drops_entry() {
        let f = fixture();
        f.store.set_agent_session_token("s1", Some("tok")).unwrap();
        let handle = f.manager.ensure_container("s1", IMAGE, &binding(), &[]).await.unwrap();

        f.socket.simulate_exit(&handle.container_id, 137);
        for _ in 0..50 {
            if f.manager.tracked_sessions().await.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        assert!(f.manager.tracked_sessions().await.is_empty());
        let session = f.store.get_session("s1").unwrap().unwrap();
        assert_eq!(session.agent_session_token, None);
    }

    #[tokio::test]
    async fn test_idle_timeout_despawns() {
        let f = fixture_with(SandboxConfig {
            idle_timeout: Duration::from_millis(50),
            stop_grace: Duration::ZERO,
            ..Default::default()
        });
        f.manager.ensure_container("s1", IMAGE, &binding(), &[]).await.unwrap();

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(f.manager.tracked_sessions().await.is_empty());
        assert_eq!(f.socket.live_containers(), 0);
    }

    #[tokio::test]
    async fn test_touch_postpones_idle_despawn() {
        let f = fixture_with(SandboxConfig {
            idle_timeout: Duration::from_millis(200),
            ..Default::default()
        });
        f.manager.ensure_container("s1", IMAGE, &binding(), &[]).await.unwrap();

        for _ in 0..4 {
            tokio::time::sleep(Duration::from_millis(100)).await;
            f.manager.touch("s1").await;
        }
        assert_eq!(f.manager.tracked_sessions().await, vec!["s1".to_string()]);
    }

    #[tokio::test]
    async fn test_running_command_holds_off_idle_despawn() {
        let f = fixture_with(SandboxConfig {
            idle_timeout: Duration::from_millis(100),
            stop_grace: Duration::ZERO,
            ..Default::default()
        });
        let handle = f.manager.ensure_container("s1", IMAGE, &binding(), &[]).await.unwrap();

        f.socket.script_exec(ExecScript::new(0).stdout("working\n").hold_open());
        let activity = f.manager.begin_activity("s1").await.unwrap();
        let session = ExecChannel::new(f.socket.clone())
            .execute(&handle, ExecSpec::default())
            .await
            .unwrap();
        assert_eq!(in_flight(&f.manager, "s1").await, 1);

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(f.manager.tracked_sessions().await, vec!["s1".to_string()]);
        assert!(f.socket.exists(&handle.container_id));
        assert_eq!(
            state_of(&f.manager, "s1").await,
            Some(ContainerState::Running)
        );

        session.cancel.cancel().await;
        session.completion.wait().await.unwrap();
        drop(activity);
        assert_eq!(in_flight(&f.manager, "s1").await, 0);

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(f.manager.tracked_sessions().await.is_empty());
        assert!(!f.socket.exists(&handle.container_id));
    }

    #[tokio::test]
    async fn test_begin_activity_needs_live_container() {
        let f = fixture();
        assert!(f.manager.begin_activity("s1").await.is_none());

        f.manager.ensure_container("s1", IMAGE, &binding(), &[]).await.unwrap();
        let first = f.manager.begin_activity("s1").await.unwrap();
        let second = f.manager.begin_activity("s1").await.unwrap();
        assert_eq!(in_flight(&f.manager, "s1").await, 2);
        drop(first);
        drop(second);
        assert_eq!(in_flight(&f.manager, "s1").await, 0);
    }

    #[tokio::test]
    async fn test_stale_timer_does_not_despawn_newer_entry() {
        let f = fixture();
        let first = f.manager.ensure_container("s1", IMAGE, &binding(), &[]).await.unwrap();
        let (old_generation, old_token) = {
            let entries = f.manager.registry.entries.read().await;
            let e = &entries["s1"];
            (e.generation, e.timer_token)
        };

        f.manager.despawn("s1").await.unwrap();
        let second = f.manager.ensure_container("s1", IMAGE, &binding(), &[]).await.unwrap();
        assert_ne!(first.container_id, second.container_id);

        // A timer from the previous entry fires late
        f.manager.expire("s1", old_generation, old_token).await;

        assert_eq!(
            state_of(&f.manager, "s1").await,
            Some(ContainerState::Running)
        );
        assert_eq!(
            f.socket.container_running(&second.container_id).await.unwrap(),
            Some(true)
        );
    }

    #[tokio::test]
    async fn test_reconcile_removes_untracked_managed_only() {
        let f = fixture();
        let tracked = f.manager.ensure_container("s1", IMAGE, &binding(), &[]).await.unwrap();
        let orphan = f.socket.add_container("berth-session-old", true);
        let foreign = f.socket.add_container("postgres", false);

        let removed = f.manager.reconcile_orphans().await.unwrap();

        assert_eq!(removed, 1);
        assert!(f.socket.exists(&tracked.container_id));
        assert!(!f.socket.exists(&orphan));
        assert!(f.socket.exists(&foreign));
    }
}

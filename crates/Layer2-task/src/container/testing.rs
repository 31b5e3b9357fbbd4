//! In-memory `ControlSocket` for tests
//!
//! Records every call as a short string and keeps just enough container,
//! network and exec state to drive the lifecycle logic.

use super::client::{
    ContainerSpec, ContainerSummary, ControlSocket, ExecChunk, ExecOutput, ExecSpec, ExecStatus,
    MANAGED_LABEL,
};
use async_trait::async_trait;
use berth_foundation::{Error, Result};
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};

/// Exit code reported for an exec killed with SIGTERM
const SIGTERM_EXIT: i64 = 143;

/// Scripted output of the next non-kill exec
#[derive(Debug, Clone, Default)]
pub struct ExecScript {
    chunks: Vec<ExecChunk>,
    exit_code: i64,
    hold_open: bool,
}

impl ExecScript {
    pub fn new(exit_code: i64) -> Self {
        Self {
            exit_code,
            ..Default::default()
        }
    }

    pub fn stdout(mut self, text: &str) -> Self {
        self.chunks.push(ExecChunk::Stdout(text.as_bytes().to_vec()));
        self
    }

    pub fn stderr(mut self, text: &str) -> Self {
        self.chunks.push(ExecChunk::Stderr(text.as_bytes().to_vec()));
        self
    }

    /// Keep the stream open after the chunks until the process is killed
    pub fn hold_open(mut self) -> Self {
        self.hold_open = true;
        self
    }
}

struct MockContainer {
    name: String,
    labels: HashMap<String, String>,
    running: bool,
    exit: watch::Sender<Option<i64>>,
}

struct MockExec {
    pid: i64,
    script: ExecScript,
    finished: Arc<AtomicBool>,
    exit_code: Arc<AtomicI64>,
    release: Arc<Notify>,
}

/// Test double for the Docker control socket
pub struct MockControlSocket {
    calls: Mutex<Vec<String>>,
    reachable: AtomicBool,
    images: Mutex<HashSet<String>>,
    networks: Mutex<HashSet<String>>,
    containers: Mutex<HashMap<String, MockContainer>>,
    specs: Mutex<Vec<ContainerSpec>>,
    scripts: Mutex<VecDeque<ExecScript>>,
    execs: Mutex<HashMap<String, MockExec>>,
    next_id: AtomicU64,
}

impl Default for MockControlSocket {
    fn default() -> Self {
        Self::new()
    }
}

impl MockControlSocket {
    pub fn new() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            reachable: AtomicBool::new(true),
            images: Mutex::new(HashSet::new()),
            networks: Mutex::new(HashSet::new()),
            containers: Mutex::new(HashMap::new()),
            specs: Mutex::new(Vec::new()),
            scripts: Mutex::new(VecDeque::new()),
            execs: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn with_image(self, image: &str) -> Self {
        self.images.lock().insert(image.to_string());
        self
    }

    pub fn with_network(self, network: &str) -> Self {
        self.networks.lock().insert(network.to_string());
        self
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    pub fn script_exec(&self, script: ExecScript) {
        self.scripts.lock().push_back(script);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    pub fn created_specs(&self) -> Vec<ContainerSpec> {
        self.specs.lock().clone()
    }

    pub fn exists(&self, id: &str) -> bool {
        self.containers.lock().contains_key(id)
    }

    pub fn live_containers(&self) -> usize {
        self.containers.lock().values().filter(|c| c.running).count()
    }

    /// Register a running container that was not created through the trait
    pub fn add_container(&self, name: &str, managed: bool) -> String {
        let id = self.next_id("cid");
        let mut labels = HashMap::new();
        if managed {
            labels.insert(MANAGED_LABEL.to_string(), "true".to_string());
        }
        let (exit, _) = watch::channel(None);
        self.containers.lock().insert(
            id.clone(),
            MockContainer {
                name: name.to_string(),
                labels,
                running: true,
                exit,
            },
        );
        id
    }

    /// The container's process ends; waiters see `code`
    pub fn simulate_exit(&self, id: &str, code: i64) {
        if let Some(c) = self.containers.lock().get_mut(id) {
            c.running = false;
            c.exit.send_replace(Some(code));
        }
    }

    /// Mark stopped without waking waiters
    pub fn stop_silently(&self, id: &str) {
        if let Some(c) = self.containers.lock().get_mut(id) {
            c.running = false;
        }
    }

    fn record(&self, call: String) {
        self.calls.lock().push(call);
    }

    fn next_id(&self, prefix: &str) -> String {
        format!("{}-{}", prefix, self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    fn check_reachable(&self) -> Result<()> {
        if self.reachable.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Error::DockerUnavailable(
                "connection refused: /var/run/docker.sock".to_string(),
            ))
        }
    }

    /// Container id for an id or a name
    fn resolve(&self, id_or_name: &str) -> Option<String> {
        let containers = self.containers.lock();
        if containers.contains_key(id_or_name) {
            return Some(id_or_name.to_string());
        }
        containers
            .iter()
            .find(|(_, c)| c.name == id_or_name)
            .map(|(id, _)| id.clone())
    }

    fn kill_pid(&self, pid: i64) {
        let execs = self.execs.lock();
        if let Some(target) = execs.values().find(|e| e.pid == pid) {
            target.exit_code.store(SIGTERM_EXIT, Ordering::SeqCst);
            target.release.notify_one();
        }
    }
}

#[async_trait]
impl ControlSocket for MockControlSocket {
    async fn ping(&self) -> Result<()> {
        self.record("ping".into());
        self.check_reachable()
    }

    async fn inspect_image(&self, image: &str) -> Result<()> {
        self.record(format!("inspect_image {}", image));
        self.check_reachable()?;
        if self.images.lock().contains(image) {
            Ok(())
        } else {
            Err(Error::image_not_found(image))
        }
    }

    async fn container_running(&self, id_or_name: &str) -> Result<Option<bool>> {
        self.record(format!("container_running {}", id_or_name));
        self.check_reachable()?;
        let id = self.resolve(id_or_name);
        Ok(id.and_then(|id| self.containers.lock().get(&id).map(|c| c.running)))
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String> {
        self.record(format!("create_container {}", spec.name));
        self.check_reachable()?;
        if self.resolve(&spec.name).is_some() {
            return Err(Error::Internal(format!(
                "create container: Conflict. The container name \"/{}\" is already in use (HTTP 409)",
                spec.name
            )));
        }
        let id = self.next_id("cid");
        let (exit, _) = watch::channel(None);
        self.containers.lock().insert(
            id.clone(),
            MockContainer {
                name: spec.name.clone(),
                labels: spec.labels.clone(),
                running: false,
                exit,
            },
        );
        self.specs.lock().push(spec.clone());
        Ok(id)
    }

    async fn start_container(&self, id: &str) -> Result<()> {
        self.record(format!("start_container {}", id));
        self.check_reachable()?;
        match self.containers.lock().get_mut(id) {
            Some(c) => {
                c.running = true;
                Ok(())
            }
            None => Err(Error::ContainerNotFound(id.to_string())),
        }
    }

    async fn stop_container(&self, id: &str, _grace: Duration) -> Result<()> {
        self.record(format!("stop_container {}", id));
        self.check_reachable()?;
        if let Some(id) = self.resolve(id) {
            self.simulate_exit(&id, 0);
        }
        Ok(())
    }

    async fn remove_container(&self, id_or_name: &str) -> Result<()> {
        self.record(format!("remove_container {}", id_or_name));
        self.check_reachable()?;
        if let Some(id) = self.resolve(id_or_name) {
            if let Some(c) = self.containers.lock().remove(&id) {
                c.exit.send_replace(Some(137));
            }
        }
        Ok(())
    }

    async fn list_managed_containers(&self) -> Result<Vec<ContainerSummary>> {
        self.record("list_managed_containers".into());
        self.check_reachable()?;
        Ok(self
            .containers
            .lock()
            .iter()
            .map(|(id, c)| ContainerSummary {
                id: id.clone(),
                names: vec![c.name.clone()],
                labels: c.labels.clone(),
            })
            .filter(ContainerSummary::is_managed)
            .collect())
    }

    async fn wait_container(&self, id: &str) -> Result<i64> {
        self.check_reachable()?;
        let mut rx = match self.containers.lock().get(id) {
            Some(c) => c.exit.subscribe(),
            None => return Err(Error::ContainerNotFound(id.to_string())),
        };
        loop {
            if let Some(code) = *rx.borrow_and_update() {
                return Ok(code);
            }
            // Sender dropped without a code: the container record vanished
            if rx.changed().await.is_err() {
                return Ok(-1);
            }
        }
    }

    async fn network_exists(&self, name: &str) -> Result<bool> {
        self.record(format!("network_exists {}", name));
        self.check_reachable()?;
        Ok(self.networks.lock().contains(name))
    }

    async fn create_network(&self, name: &str) -> Result<()> {
        self.record(format!("create_network {}", name));
        self.check_reachable()?;
        self.networks.lock().insert(name.to_string());
        Ok(())
    }

    async fn create_exec(&self, container_id: &str, spec: &ExecSpec) -> Result<String> {
        self.record(format!("create_exec {}", spec.cmd.join(" ")));
        self.check_reachable()?;
        if self.container_running(container_id).await? != Some(true) {
            return Err(Error::Exec(format!("container {} is not running", container_id)));
        }

        let is_kill = spec.cmd.first().map(String::as_str) == Some("kill");
        let script = if is_kill {
            if let Some(pid) = spec.cmd.last().and_then(|p| p.parse::<i64>().ok()) {
                self.kill_pid(pid);
            }
            ExecScript::new(0)
        } else {
            self.scripts.lock().pop_front().unwrap_or_default()
        };

        let id = self.next_id("exec");
        let pid = 100 + self.next_id.load(Ordering::SeqCst) as i64;
        self.execs.lock().insert(
            id.clone(),
            MockExec {
                pid,
                exit_code: Arc::new(AtomicI64::new(script.exit_code)),
                script,
                finished: Arc::new(AtomicBool::new(false)),
                release: Arc::new(Notify::new()),
            },
        );
        Ok(id)
    }

    async fn start_exec(&self, exec_id: &str) -> Result<ExecOutput> {
        self.record(format!("start_exec {}", exec_id));
        self.check_reachable()?;
        let execs = self.execs.lock();
        let exec = execs
            .get(exec_id)
            .ok_or_else(|| Error::Exec(format!("no such exec: {}", exec_id)))?;

        let hold = exec.script.hold_open;
        let finished = Arc::clone(&exec.finished);
        let release = Arc::clone(&exec.release);
        let tail = stream::once(async move {
            if hold {
                release.notified().await;
            }
            finished.store(true, Ordering::SeqCst);
        })
        .filter_map(|()| async { None::<Result<ExecChunk>> });

        let chunks: Vec<Result<ExecChunk>> =
            exec.script.chunks.iter().cloned().map(Ok).collect();
        Ok(stream::iter(chunks).chain(tail).boxed())
    }

    async fn inspect_exec(&self, exec_id: &str) -> Result<ExecStatus> {
        self.check_reachable()?;
        let execs = self.execs.lock();
        let exec = execs
            .get(exec_id)
            .ok_or_else(|| Error::Exec(format!("no such exec: {}", exec_id)))?;
        let finished = exec.finished.load(Ordering::SeqCst);
        Ok(ExecStatus {
            running: !finished,
            pid: Some(exec.pid),
            exit_code: finished.then(|| exec.exit_code.load(Ordering::SeqCst)),
        })
    }
}

//! Container layer integration tests
//!
//! `ControlSocket`을 크레이트 외부에서 구현해서 seam을 검증하고,
//! 실제 Docker 테스트는 수동 실행: cargo test -p berth-task --test docker_live -- --ignored

use async_trait::async_trait;
use berth_foundation::{Error, IsolationStore, Project, Result, SandboxConfig, Session, SessionMode, Storage};
use berth_task::{
    health_check, ContainerManager, ContainerSpec, ContainerSummary, ControlSocket, DockerControl,
    ExecChannel, ExecOutput, ExecSpec, ExecStatus, LineBuffer, WorkspaceBinding,
};
use std::sync::Arc;
use std::time::Duration;

/// Daemon that never answers
struct DownSocket;

fn down<T>() -> Result<T> {
    Err(Error::DockerUnavailable("connection refused".into()))
}

#[async_trait]
impl ControlSocket for DownSocket {
    async fn ping(&self) -> Result<()> {
        down()
    }
    async fn inspect_image(&self, _image: &str) -> Result<()> {
        down()
    }
    async fn container_running(&self, _id_or_name: &str) -> Result<Option<bool>> {
        down()
    }
    async fn create_container(&self, _spec: &ContainerSpec) -> Result<String> {
        down()
    }
    async fn start_container(&self, _id: &str) -> Result<()> {
        down()
    }
    async fn stop_container(&self, _id: &str, _grace: Duration) -> Result<()> {
        down()
    }
    async fn remove_container(&self, _id_or_name: &str) -> Result<()> {
        down()
    }
    async fn list_managed_containers(&self) -> Result<Vec<ContainerSummary>> {
        down()
    }
    async fn wait_container(&self, _id: &str) -> Result<i64> {
        down()
    }
    async fn network_exists(&self, _name: &str) -> Result<bool> {
        down()
    }
    async fn create_network(&self, _name: &str) -> Result<()> {
        down()
    }
    async fn create_exec(&self, _container_id: &str, _spec: &ExecSpec) -> Result<String> {
        down()
    }
    async fn start_exec(&self, _exec_id: &str) -> Result<ExecOutput> {
        down()
    }
    async fn inspect_exec(&self, _exec_id: &str) -> Result<ExecStatus> {
        down()
    }
}

fn store_with_session() -> Arc<Storage> {
    let store = Storage::in_memory().unwrap();
    store
        .insert_project(&Project::new("p1", "app", std::env::temp_dir()))
        .unwrap();
    store
        .insert_session(&Session::new("s1", "p1", SessionMode::Write))
        .unwrap();
    Arc::new(store)
}

#[tokio::test]
async fn test_unreachable_daemon_surfaces_remediation() {
    let socket: Arc<dyn ControlSocket> = Arc::new(DownSocket);
    let manager = ContainerManager::new(socket.clone(), store_with_session(), SandboxConfig::default());

    let err = manager
        .ensure_container(
            "s1",
            "berth-agent:latest",
            &WorkspaceBinding::new(std::env::temp_dir()),
            &[],
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::DockerUnavailable(_)));
    assert!(err.remediation().unwrap().contains("docker.sock"));
    assert!(manager.tracked_sessions().await.is_empty());

    assert!(manager.reconcile_orphans().await.is_err());

    let health = health_check(socket.as_ref(), "berth-agent:latest", "berth-net").await;
    assert!(!health.socket_connected);
    assert!(!health.is_healthy());
}

// ============================================================================
// Live Docker
// ============================================================================

fn live_image() -> String {
    std::env::var("BERTH_TEST_IMAGE").unwrap_or_else(|_| "alpine:latest".to_string())
}

#[tokio::test]
#[ignore] // 실제 Docker + 로컬 이미지 필요
async fn test_live_container_exec_and_despawn() {
    let config = SandboxConfig {
        network: "berth-test-net".into(),
        stop_grace: Duration::from_secs(1),
        ..Default::default()
    };
    let socket: Arc<dyn ControlSocket> = Arc::new(DockerControl::connect(&config).unwrap());
    let image = live_image();
    if socket.inspect_image(&image).await.is_err() {
        eprintln!("image {} not present, skipping", image);
        return;
    }

    let workspace = tempfile::tempdir().unwrap();
    std::fs::write(workspace.path().join("marker.txt"), "from host\n").unwrap();

    let manager = ContainerManager::new(socket.clone(), store_with_session(), config);
    let handle = manager
        .ensure_container("s1", &image, &WorkspaceBinding::new(workspace.path()), &[])
        .await
        .unwrap();
    let again = manager
        .ensure_container("s1", &image, &WorkspaceBinding::new(workspace.path()), &[])
        .await
        .unwrap();
    assert_eq!(handle.container_id, again.container_id);

    let exec = ExecChannel::new(socket.clone());
    let mut session = exec
        .execute(
            &handle,
            ExecSpec {
                cmd: vec!["cat".into(), "/workspace/marker.txt".into()],
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let mut lines = Vec::new();
    let mut buffer = LineBuffer::new();
    while let Some(chunk) = session.stdout.recv().await {
        lines.extend(buffer.push(&chunk));
    }
    assert_eq!(lines, vec!["from host"]);
    assert_eq!(session.completion.wait().await.unwrap(), Some(0));

    manager.despawn("s1").await.unwrap();
    assert_eq!(socket.container_running(&handle.container_id).await.unwrap(), None);
}

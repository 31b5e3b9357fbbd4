//! Docker control socket - `ControlSocket` over bollard

use super::client::{
    ContainerSpec, ContainerSummary, ControlSocket, ExecChunk, ExecOutput, ExecSpec, ExecStatus,
    CONTAINER_PREFIX,
};
use async_trait::async_trait;
use berth_foundation::{Error, Result, SandboxConfig};
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, ListContainersOptions, LogOutput,
    RemoveContainerOptions, StartContainerOptions, StopContainerOptions, WaitContainerOptions,
};
use bollard::errors::Error as DockerError;
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::models::HostConfig;
use bollard::network::{CreateNetworkOptions, InspectNetworkOptions};
use bollard::Docker;
use futures::StreamExt;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info};

/// Docker Engine client
#[derive(Clone)]
pub struct DockerControl {
    docker: Docker,
}

impl DockerControl {
    /// Connect to the configured socket, or the platform default.
    ///
    /// Connecting is lazy in bollard; reachability is only known after `ping`.
    pub fn connect(config: &SandboxConfig) -> Result<Self> {
        let docker = match config.docker_socket.as_deref() {
            #[cfg(unix)]
            Some(path) => Docker::connect_with_unix(
                &path.to_string_lossy(),
                120,
                bollard::API_DEFAULT_VERSION,
            ),
            _ => Docker::connect_with_local_defaults(),
        }
        .map_err(|e| Error::DockerUnavailable(format!("cannot open control socket: {}", e)))?;

        Ok(Self { docker })
    }
}

/// HTTP status of a daemon-side error, if the daemon answered at all
fn status_of(err: &DockerError) -> Option<u16> {
    match err {
        DockerError::DockerResponseServerError { status_code, .. } => Some(*status_code),
        _ => None,
    }
}

/// Daemon answered → operation error; anything else → socket unreachable
fn docker_error(context: &str, err: DockerError) -> Error {
    match err {
        DockerError::DockerResponseServerError {
            status_code,
            message,
        } => Error::Internal(format!("{}: {} (HTTP {})", context, message, status_code)),
        other => Error::DockerUnavailable(format!("{}: {}", context, other)),
    }
}

fn non_empty(values: &[String]) -> Option<Vec<String>> {
    if values.is_empty() {
        None
    } else {
        Some(values.to_vec())
    }
}

fn chunk_from_log(output: LogOutput) -> ExecChunk {
    match output {
        LogOutput::StdErr { message } => ExecChunk::Stderr(message.to_vec()),
        LogOutput::StdOut { message }
        | LogOutput::Console { message }
        | LogOutput::StdIn { message } => ExecChunk::Stdout(message.to_vec()),
    }
}

#[async_trait]
impl ControlSocket for DockerControl {
    async fn ping(&self) -> Result<()> {
        self.docker
            .ping()
            .await
            .map(|_| ())
            .map_err(|e| Error::DockerUnavailable(format!("ping failed: {}", e)))
    }

    async fn inspect_image(&self, image: &str) -> Result<()> {
        match self.docker.inspect_image(image).await {
            Ok(_) => Ok(()),
            Err(e) if status_of(&e) == Some(404) => Err(Error::image_not_found(image)),
            Err(e) => Err(docker_error("inspect image", e)),
        }
    }

    async fn container_running(&self, id_or_name: &str) -> Result<Option<bool>> {
        match self
            .docker
            .inspect_container(id_or_name, None::<InspectContainerOptions>)
            .await
        {
            Ok(info) => Ok(Some(
                info.state.and_then(|s| s.running).unwrap_or(false),
            )),
            Err(e) if status_of(&e) == Some(404) => Ok(None),
            Err(e) => Err(docker_error("inspect container", e)),
        }
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String> {
        let host_config = HostConfig {
            binds: non_empty(&spec.binds),
            memory: spec.memory,
            cpu_quota: spec.cpu_quota,
            cpu_period: spec.cpu_period,
            pids_limit: spec.pids_limit,
            runtime: spec.runtime.clone(),
            network_mode: spec.network.clone(),
            extra_hosts: non_empty(&spec.extra_hosts),
            auto_remove: Some(false),
            ..Default::default()
        };

        let config = Config {
            image: Some(spec.image.clone()),
            cmd: Some(spec.cmd.clone()),
            env: Some(spec.env.clone()),
            working_dir: spec.working_dir.clone(),
            labels: Some(spec.labels.clone()),
            host_config: Some(host_config),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: spec.name.clone(),
            ..Default::default()
        };

        let response = self
            .docker
            .create_container(Some(options), config)
            .await
            .map_err(|e| docker_error("create container", e))?;

        debug!(container = %spec.name, id = %response.id, "Created container");
        Ok(response.id)
    }

    async fn start_container(&self, id: &str) -> Result<()> {
        self.docker
            .start_container(id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| docker_error("start container", e))
    }

    async fn stop_container(&self, id: &str, grace: Duration) -> Result<()> {
        let options = StopContainerOptions {
            t: grace.as_secs() as i64,
        };
        match self.docker.stop_container(id, Some(options)).await {
            Ok(()) => Ok(()),
            // 304: already stopped, 404: already gone
            Err(e) if matches!(status_of(&e), Some(304) | Some(404)) => Ok(()),
            Err(e) => Err(docker_error("stop container", e)),
        }
    }

    async fn remove_container(&self, id_or_name: &str) -> Result<()> {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        match self.docker.remove_container(id_or_name, Some(options)).await {
            Ok(()) => Ok(()),
            // 404: gone, 409: removal already in progress
            Err(e) if matches!(status_of(&e), Some(404) | Some(409)) => Ok(()),
            Err(e) => Err(docker_error("remove container", e)),
        }
    }

    async fn list_managed_containers(&self) -> Result<Vec<ContainerSummary>> {
        let mut filters = HashMap::new();
        filters.insert("name".to_string(), vec![CONTAINER_PREFIX.to_string()]);

        let options = ListContainersOptions::<String> {
            all: true,
            filters,
            ..Default::default()
        };

        let containers = self
            .docker
            .list_containers(Some(options))
            .await
            .map_err(|e| docker_error("list containers", e))?;

        Ok(containers
            .into_iter()
            .map(|c| ContainerSummary {
                id: c.id.unwrap_or_default(),
                names: c
                    .names
                    .unwrap_or_default()
                    .into_iter()
                    .map(|n| n.trim_start_matches('/').to_string())
                    .collect(),
                labels: c.labels.unwrap_or_default(),
            })
            .filter(ContainerSummary::is_managed)
            .collect())
    }

    async fn wait_container(&self, id: &str) -> Result<i64> {
        let mut stream = self.docker.wait_container(
            id,
            Some(WaitContainerOptions {
                condition: "not-running",
            }),
        );
        match stream.next().await {
            Some(Ok(response)) => Ok(response.status_code),
            // Non-zero exits arrive as an error item carrying the code
            Some(Err(DockerError::DockerContainerWaitError { code, .. })) => Ok(code),
            Some(Err(e)) => Err(docker_error("wait container", e)),
            None => Ok(-1),
        }
    }

    async fn network_exists(&self, name: &str) -> Result<bool> {
        match self
            .docker
            .inspect_network(name, None::<InspectNetworkOptions<String>>)
            .await
        {
            Ok(_) => Ok(true),
            Err(e) if status_of(&e) == Some(404) => Ok(false),
            Err(e) => Err(docker_error("inspect network", e)),
        }
    }

    async fn create_network(&self, name: &str) -> Result<()> {
        let options = CreateNetworkOptions {
            name: name.to_string(),
            driver: "bridge".to_string(),
            check_duplicate: true,
            ..Default::default()
        };
        match self.docker.create_network(options).await {
            Ok(_) => {
                info!(network = %name, "Created bridge network");
                Ok(())
            }
            // Another session created it first
            Err(DockerError::DockerResponseServerError {
                status_code,
                message,
            }) if status_code == 409 || message.contains("already exists") => Ok(()),
            Err(e) => Err(Error::Network(format!(
                "failed to create network {}: {}",
                name, e
            ))),
        }
    }

    async fn create_exec(&self, container_id: &str, spec: &ExecSpec) -> Result<String> {
        let options = CreateExecOptions::<String> {
            cmd: Some(spec.cmd.clone()),
            env: Some(spec.env.clone()),
            working_dir: spec.working_dir.clone(),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            ..Default::default()
        };
        self.docker
            .create_exec(container_id, options)
            .await
            .map(|created| created.id)
            .map_err(|e| match docker_error("create exec", e) {
                Error::Internal(msg) => Error::Exec(msg),
                other => other,
            })
    }

    async fn start_exec(&self, exec_id: &str) -> Result<ExecOutput> {
        let results = self
            .docker
            .start_exec(exec_id, None)
            .await
            .map_err(|e| match docker_error("start exec", e) {
                Error::Internal(msg) => Error::Exec(msg),
                other => other,
            })?;

        match results {
            StartExecResults::Attached { output, .. } => Ok(output
                .map(|item| {
                    item.map(chunk_from_log)
                        .map_err(|e| Error::Exec(format!("exec stream: {}", e)))
                })
                .boxed()),
            StartExecResults::Detached => Err(Error::Exec("exec started detached".to_string())),
        }
    }

    async fn inspect_exec(&self, exec_id: &str) -> Result<ExecStatus> {
        let info = self
            .docker
            .inspect_exec(exec_id)
            .await
            .map_err(|e| match docker_error("inspect exec", e) {
                Error::Internal(msg) => Error::Exec(msg),
                other => other,
            })?;

        Ok(ExecStatus {
            running: info.running.unwrap_or(false),
            pid: info.pid.filter(|p| *p > 0),
            exit_code: info.exit_code,
        })
    }
}

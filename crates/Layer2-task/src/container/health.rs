//! Health status of the isolation layer

use super::client::ControlSocket;
use berth_foundation::Error;
use serde::{Deserialize, Serialize};

/// Snapshot of what agent sessions need from the host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthStatus {
    pub socket_connected: bool,
    pub image_available: bool,
    pub network_exists: bool,
    pub image: String,
    pub network: String,
    /// Set only when sessions cannot start
    pub error: Option<String>,
    /// Non-blocking findings with a fix
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
}

impl HealthStatus {
    pub fn is_healthy(&self) -> bool {
        self.error.is_none()
    }
}

fn with_remediation(err: &Error) -> String {
    match err.remediation() {
        Some(fix) => format!("{}. {}", err, fix),
        None => err.to_string(),
    }
}

/// Probe the control socket, the default image and the shared network
pub async fn health_check(socket: &dyn ControlSocket, image: &str, network: &str) -> HealthStatus {
    let mut status = HealthStatus {
        socket_connected: false,
        image_available: false,
        network_exists: false,
        image: image.to_string(),
        network: network.to_string(),
        error: None,
        warning: None,
    };

    if let Err(e) = socket.ping().await {
        let err = match e {
            Error::DockerUnavailable(_) => e,
            other => Error::DockerUnavailable(other.to_string()),
        };
        status.error = Some(with_remediation(&err));
        return status;
    }
    status.socket_connected = true;

    match socket.inspect_image(image).await {
        Ok(()) => status.image_available = true,
        Err(e @ Error::ImageNotFound { .. }) => status.error = Some(with_remediation(&e)),
        Err(_) => status.error = Some(with_remediation(&Error::image_not_found(image))),
    }

    match socket.network_exists(network).await {
        Ok(true) => status.network_exists = true,
        // Created on first container start; not fatal
        Ok(false) => {
            status.warning = Some(format!(
                "Network {} not found; it is created on first session start, or run `docker network create {}`",
                network, network
            ))
        }
        Err(e) => {
            status.warning = Some(format!("Network {} could not be inspected: {}", network, e))
        }
    }

    status
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::testing::MockControlSocket;

    #[tokio::test]
    async fn test_socket_unreachable() {
        let socket = MockControlSocket::new();
        socket.set_reachable(false);

        let status = health_check(&socket, "berth-agent:latest", "berth-net").await;
        assert!(!status.socket_connected);
        assert!(!status.image_available);
        let error = status.error.unwrap();
        assert!(error.contains("socket"));
        assert!(error.contains("docker.sock"));
    }

    #[tokio::test]
    async fn test_image_missing() {
        let socket = MockControlSocket::new().with_network("berth-net");

        let status = health_check(&socket, "berth-agent:latest", "berth-net").await;
        assert!(status.socket_connected);
        assert!(!status.image_available);
        assert!(status.network_exists);
        let error = status.error.unwrap();
        assert!(error.contains("not found"));
        assert!(error.contains("docker build -t berth-agent:latest ."));
    }

    #[tokio::test]
    async fn test_all_present() {
        let socket = MockControlSocket::new()
            .with_image("berth-agent:latest")
            .with_network("berth-net");

        let status = health_check(&socket, "berth-agent:latest", "berth-net").await;
        assert!(status.is_healthy());
        assert!(status.socket_connected && status.image_available && status.network_exists);
        assert_eq!(status.warning, None);
    }

    #[tokio::test]
    async fn test_missing_network_is_only_a_warning() {
        let socket = MockControlSocket::new().with_image("berth-agent:latest");

        let status = health_check(&socket, "berth-agent:latest", "berth-net").await;
        assert!(status.is_healthy());
        assert!(!status.network_exists);
        assert!(status.warning.unwrap().contains("docker network create berth-net"));
    }

    #[test]
    fn test_serializes_camel_case() {
        let status = HealthStatus {
            socket_connected: true,
            image_available: true,
            network_exists: true,
            image: "i".into(),
            network: "n".into(),
            error: None,
            warning: None,
        };
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["socketConnected"], true);
        assert_eq!(json["imageAvailable"], true);
        assert!(json["error"].is_null());
        assert!(json.get("warning").is_none());
    }
}

//! Image resolver & validator
//!
//! 이미지 우선순위: override → session → agent → project → 전역 기본값 → fallback

use super::client::ControlSocket;
use berth_foundation::{Agent, Error, Project, Result, Session, FALLBACK_IMAGE};
use std::sync::Arc;
use tracing::{debug, warn};

/// Picks the image for a session and checks it is present locally
#[derive(Clone)]
pub struct ImageResolver {
    socket: Arc<dyn ControlSocket>,
    default_image: Option<String>,
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

impl ImageResolver {
    pub fn new(socket: Arc<dyn ControlSocket>, default_image: Option<String>) -> Self {
        Self {
            socket,
            default_image,
        }
    }

    /// First non-empty of: explicit override (argument, then the session's own
    /// image), agent preference, project default, configured default, fallback.
    pub fn resolve(
        &self,
        session: &Session,
        agent: Option<&Agent>,
        project: Option<&Project>,
        override_image: Option<&str>,
    ) -> String {
        let image = non_empty(override_image)
            .or_else(|| non_empty(session.image.as_deref()))
            .or_else(|| agent.and_then(|a| non_empty(a.image.as_deref())))
            .or_else(|| project.and_then(|p| non_empty(p.default_image.as_deref())))
            .or_else(|| non_empty(self.default_image.as_deref()))
            .unwrap_or(FALLBACK_IMAGE)
            .to_string();

        debug!(session_id = %session.id, image = %image, "Resolved image");
        image
    }

    /// True if the image is present; any error counts as absent
    pub async fn validate_exists(&self, image: &str) -> bool {
        match self.socket.inspect_image(image).await {
            Ok(()) => true,
            Err(e) => {
                debug!(image = %image, error = %e, "Image inspect failed");
                false
            }
        }
    }

    /// Fail with `ImageNotFound` (and the build command) unless present.
    /// An unreachable daemon stays `DockerUnavailable`.
    pub async fn require(&self, image: &str) -> Result<()> {
        match self.socket.inspect_image(image).await {
            Ok(()) => Ok(()),
            Err(e @ Error::DockerUnavailable(_)) => Err(e),
            Err(e) => {
                warn!(image = %image, error = %e, "Image not available locally");
                Err(Error::image_not_found(image))
            }
        }
    }
}

//! Engine socket connection handling.
//!
//! Connects to the local container engine with a fixed strategy ladder and
//! verifies the connection with a ping before handing it out.

use crate::container::{ProvisionError, Result};
use bollard::Docker;
use std::sync::Arc;
use tracing::{debug, info};

/// Connection to the local container engine.
#[derive(Clone)]
pub struct EngineClient {
    docker: Arc<Docker>,
}

impl EngineClient {
    /// Connect and verify.
    ///
    /// Strategy order:
    /// 1. Explicit socket path (`ENGINE_SOCKET_PATH`)
    /// 2. Local defaults (Unix socket / DOCKER_HOST)
    /// 3. Rootless then system Podman sockets
    ///
    /// # Errors
    ///
    /// Returns `EngineUnreachable` if no strategy yields a live engine.
    pub async fn connect(socket_path: Option<&str>) -> Result<Self> {
        let docker = Self::connect_docker(socket_path).await?;
        let client = Self {
            docker: Arc::new(docker),
        };
        client.ping().await?;
        Ok(client)
    }

    async fn connect_docker(socket_path: Option<&str>) -> Result<Docker> {
        if let Some(path) = socket_path {
            let addr = if path.contains("://") {
                path.to_string()
            } else {
                format!("unix://{}", path)
            };
            debug!("Connecting to engine socket: {}", addr);
            return Docker::connect_with_socket(&addr, 120, bollard::API_DEFAULT_VERSION)
                .map_err(|e| ProvisionError::EngineUnreachable(e.to_string()));
        }

        debug!("Attempting to connect to container engine via local defaults...");
        match Docker::connect_with_local_defaults() {
            Ok(docker) => {
                info!("Connected to container engine via local defaults");
                return Ok(docker);
            }
            Err(e) => {
                debug!("Local defaults failed: {}", e);
            }
        }

        // Rootless Podman socket
        if let Ok(home) = std::env::var("HOME") {
            let podman_socket = format!("unix://{}/run/podman/podman.sock", home);
            debug!("Trying Podman socket: {}", podman_socket);
            match Docker::connect_with_socket(&podman_socket, 120, bollard::API_DEFAULT_VERSION) {
                Ok(docker) => {
                    info!("Connected to Podman via rootless socket");
                    return Ok(docker);
                }
                Err(e) => {
                    debug!("Podman rootless socket failed: {}", e);
                }
            }
        }

        // System Podman socket
        let system_socket = "unix:///run/podman/podman.sock";
        debug!("Trying system Podman socket: {}", system_socket);
        match Docker::connect_with_socket(system_socket, 120, bollard::API_DEFAULT_VERSION) {
            Ok(docker) => {
                info!("Connected to Podman via system socket");
                return Ok(docker);
            }
            Err(e) => {
                debug!("Podman system socket failed: {}", e);
            }
        }

        Err(ProvisionError::EngineUnreachable(
            "no container engine reachable; is Docker or Podman running?".to_string(),
        ))
    }

    /// Ping the engine to verify connectivity.
    pub async fn ping(&self) -> Result<()> {
        self.docker
            .ping()
            .await
            .map_err(|e| ProvisionError::EngineUnreachable(e.to_string()))?;
        debug!("Container engine ping successful");
        Ok(())
    }

    /// Check if an image exists locally.
    pub async fn image_exists(&self, image: &str) -> Result<bool> {
        match self.docker.inspect_image(image).await {
            Ok(_) => Ok(true),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(false),
            Err(e) => Err(ProvisionError::Engine(e)),
        }
    }

    /// Direct access to the underlying bollard client.
    pub fn docker(&self) -> &Docker {
        &self.docker
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    #[ignore] // Requires Docker/Podman to be running
    async fn test_client_connection() {
        let client = EngineClient::connect(None).await.unwrap();
        client.ping().await.unwrap();
    }
}

//! Docker implementation of the container runtime

use crate::runtime::{ContainerRuntime, ContainerSpec, RuntimeError};
use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, RemoveContainerOptions, StartContainerOptions,
    StopContainerOptions,
};
use bollard::errors::Error as BollardError;
use bollard::image::CreateImageOptions;
use bollard::models::{HostConfig, PortBinding};
use bollard::Docker;
use futures::StreamExt;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info};

/// Seconds bollard waits on a single Docker API call
const API_TIMEOUT_SECS: u64 = 120;

/// Container runtime backed by the Docker Engine API
#[derive(Clone)]
pub struct DockerRuntime {
    client: Docker,
}

impl DockerRuntime {
    /// Connect to the Docker daemon
    ///
    /// Connection priority:
    /// 1. Explicit docker_host parameter
    /// 2. DOCKER_HOST environment variable
    /// 3. Common socket paths (platform-specific)
    pub async fn connect(docker_host: Option<&str>) -> anyhow::Result<Self> {
        let client = if let Some(host) = docker_host {
            Self::connect_to_host(host).map_err(|e| {
                anyhow::anyhow!(
                    "Failed to connect to Docker at '{}': {}. \
                     Ensure Docker is running and the socket path is correct.",
                    host,
                    e
                )
            })?
        } else if let Ok(host) = std::env::var("DOCKER_HOST") {
            Self::connect_to_host(&host).map_err(|e| {
                anyhow::anyhow!(
                    "Failed to connect to Docker via DOCKER_HOST='{}': {}",
                    host,
                    e
                )
            })?
        } else {
            Self::connect_with_defaults().await?
        };

        client.ping().await.map_err(|e| {
            anyhow::anyhow!(
                "Docker daemon is not responding: {}. \
                 Ensure Docker Desktop, Colima, or dockerd is running.",
                e
            )
        })?;

        debug!("Connected to Docker daemon");
        Ok(Self { client })
    }

    fn connect_to_host(host: &str) -> anyhow::Result<Docker> {
        if let Some(socket_path) = host.strip_prefix("unix://") {
            Docker::connect_with_socket(socket_path, API_TIMEOUT_SECS, bollard::API_DEFAULT_VERSION)
                .map_err(|e| {
                    anyhow::anyhow!("Cannot connect to Unix socket '{}': {}", socket_path, e)
                })
        } else if host.starts_with("tcp://") || host.starts_with("http://") {
            Docker::connect_with_http(host, API_TIMEOUT_SECS, bollard::API_DEFAULT_VERSION)
                .map_err(|e| anyhow::anyhow!("Cannot connect to TCP endpoint '{}': {}", host, e))
        } else {
            anyhow::bail!(
                "Invalid docker_host format: '{}'. Expected 'unix:///path/to/socket' or 'tcp://host:port'",
                host
            )
        }
    }

    async fn connect_with_defaults() -> anyhow::Result<Docker> {
        let home = std::env::var("HOME").unwrap_or_default();
        let xdg_runtime = std::env::var("XDG_RUNTIME_DIR").unwrap_or_default();

        let mut socket_paths: Vec<(&str, String)> =
            vec![("Linux default", "/var/run/docker.sock".to_string())];
        if !home.is_empty() {
            socket_paths.push(("Docker Desktop (macOS)", format!("{}/.docker/run/docker.sock", home)));
            socket_paths.push(("Colima (macOS)", format!("{}/.colima/default/docker.sock", home)));
            socket_paths.push(("Rancher Desktop", format!("{}/.rd/docker.sock", home)));
        }
        if !xdg_runtime.is_empty() {
            socket_paths.push(("Podman (Linux)", format!("{}/podman/podman.sock", xdg_runtime)));
        }

        let mut tried_paths = Vec::new();

        for (name, path) in &socket_paths {
            if !std::path::Path::new(path).exists() {
                continue;
            }

            debug!(path, name, "Found Docker socket");
            match Docker::connect_with_socket(path, API_TIMEOUT_SECS, bollard::API_DEFAULT_VERSION) {
                Ok(client) => {
                    if client.ping().await.is_ok() {
                        return Ok(client);
                    }
                    tried_paths.push(format!("{} ({}) - daemon not responding", path, name));
                }
                Err(e) => {
                    tried_paths.push(format!("{} ({}) - connection failed: {}", path, name, e));
                }
            }
        }

        match Docker::connect_with_socket_defaults() {
            Ok(client) => Ok(client),
            Err(e) => {
                let tried_info = if tried_paths.is_empty() {
                    "No Docker socket found at common locations".to_string()
                } else {
                    format!("Tried:\n  - {}", tried_paths.join("\n  - "))
                };

                anyhow::bail!(
                    "Cannot connect to Docker daemon. {}\n\n\
                     Start Docker, set DOCKER_HOST, or set backend.docker_host.\n\n\
                     Underlying error: {}",
                    tried_info,
                    e
                )
            }
        }
    }
}

fn status_code(error: &BollardError) -> Option<u16> {
    match error {
        BollardError::DockerResponseServerError { status_code, .. } => Some(*status_code),
        _ => None,
    }
}

fn is_port_conflict(message: &str) -> bool {
    message.contains("port is already allocated") || message.contains("address already in use")
}

/// Turn a pull failure into something an operator can act on
fn classify_pull_error(image: &str, message: &str) -> RuntimeError {
    if message.contains("manifest unknown") || message.contains("not found") {
        RuntimeError::ImageNotFound(image.to_string())
    } else if message.contains("unauthorized") || message.contains("authentication") {
        RuntimeError::Pull {
            image: image.to_string(),
            message: "authentication required; run 'docker login' first".to_string(),
        }
    } else {
        RuntimeError::Pull {
            image: image.to_string(),
            message: message.to_string(),
        }
    }
}

fn container_config(spec: &ContainerSpec) -> Config<String> {
    let port_key = spec.port_key();

    let mut port_bindings: HashMap<String, Option<Vec<PortBinding>>> = HashMap::new();
    port_bindings.insert(
        port_key.clone(),
        Some(vec![PortBinding {
            host_ip: Some(spec.host_ip.clone()),
            host_port: Some(spec.host_port.to_string()),
        }]),
    );

    let mut exposed_ports: HashMap<String, HashMap<(), ()>> = HashMap::new();
    exposed_ports.insert(port_key, HashMap::new());

    Config {
        image: Some(spec.image.clone()),
        exposed_ports: Some(exposed_ports),
        host_config: Some(HostConfig {
            port_bindings: Some(port_bindings),
            ..Default::default()
        }),
        ..Default::default()
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn image_exists(&self, image: &str) -> Result<bool, RuntimeError> {
        match self.client.inspect_image(image).await {
            Ok(_) => Ok(true),
            Err(e) if status_code(&e) == Some(404) => Ok(false),
            Err(e) => Err(RuntimeError::api("inspect image", e)),
        }
    }

    async fn pull_image(&self, image: &str) -> Result<(), RuntimeError> {
        info!(image, "Pulling Docker image");
        let options = CreateImageOptions {
            from_image: image,
            ..Default::default()
        };

        // The image is only usable once the progress stream is exhausted
        let mut stream = self.client.create_image(Some(options), None, None);
        let mut last_error = None;

        while let Some(result) = stream.next().await {
            match result {
                Ok(progress) => {
                    if let Some(status) = progress.status {
                        debug!(image, status, "Pull progress");
                    }
                    if let Some(error) = progress.error {
                        last_error = Some(error);
                    }
                }
                Err(e) => return Err(classify_pull_error(image, &e.to_string())),
            }
        }

        if let Some(error) = last_error {
            return Err(classify_pull_error(image, &error));
        }

        info!(image, "Image pulled successfully");
        Ok(())
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, RuntimeError> {
        let options = CreateContainerOptions {
            name: spec.name.clone(),
            platform: None,
        };

        let response = self
            .client
            .create_container(Some(options), container_config(spec))
            .await
            .map_err(|e| {
                let message = e.to_string();
                if is_port_conflict(&message) {
                    RuntimeError::PortInUse(spec.host_port)
                } else if status_code(&e) == Some(404) {
                    RuntimeError::ImageNotFound(spec.image.clone())
                } else {
                    RuntimeError::api("create container", message)
                }
            })?;

        for warning in &response.warnings {
            debug!(container = %spec.name, warning, "Docker create warning");
        }

        Ok(response.id)
    }

    async fn start_container(&self, id: &str) -> Result<(), RuntimeError> {
        self.client
            .start_container(id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| {
                let message = e.to_string();
                if is_port_conflict(&message) {
                    RuntimeError::api(
                        "start container",
                        format!("host port is already in use: {}", message),
                    )
                } else if status_code(&e) == Some(404) {
                    RuntimeError::ContainerNotFound(id.to_string())
                } else {
                    RuntimeError::api("start container", message)
                }
            })
    }

    async fn stop_container(&self, id: &str, grace: Duration) -> Result<(), RuntimeError> {
        let options = StopContainerOptions {
            t: grace.as_secs() as i64,
        };

        match self.client.stop_container(id, Some(options)).await {
            Ok(_) => Ok(()),
            Err(e) if status_code(&e) == Some(304) => {
                debug!(container_id = id, "Container was already stopped");
                Ok(())
            }
            Err(e) if status_code(&e) == Some(404) => {
                debug!(container_id = id, "Container not found");
                Ok(())
            }
            Err(e) => Err(RuntimeError::api("stop container", e)),
        }
    }

    async fn remove_container(&self, id: &str) -> Result<(), RuntimeError> {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };

        match self.client.remove_container(id, Some(options)).await {
            Ok(_) => Ok(()),
            Err(e) if status_code(&e) == Some(404) => {
                debug!(container_id = id, "Container not found");
                Ok(())
            }
            Err(e) => Err(RuntimeError::api("remove container", e)),
        }
    }
}

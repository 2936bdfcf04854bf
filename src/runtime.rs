//! Container runtime abstraction
//!
//! The lifecycle orchestrator talks to the container engine only through
//! [`ContainerRuntime`], so it can be driven by Docker in production and by an
//! in-memory runtime in tests.

use async_trait::async_trait;
use std::time::Duration;

/// Everything needed to create the backend container
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSpec {
    /// Container name; a stale container with this name is replaced
    pub name: String,
    /// Image reference, e.g. `lechgu/mandelbrot`
    pub image: String,
    /// Port the backend listens on inside the container
    pub container_port: u16,
    /// Loopback port on the host the container port is published to
    pub host_port: u16,
    /// Host address the port is bound to
    pub host_ip: String,
}

impl ContainerSpec {
    pub fn new(name: &str, image: &str, container_port: u16, host_port: u16) -> Self {
        Self {
            name: name.to_string(),
            image: image.to_string(),
            container_port,
            host_port,
            host_ip: "127.0.0.1".to_string(),
        }
    }

    /// Docker-style port key, e.g. `80/tcp`
    pub fn port_key(&self) -> String {
        format!("{}/tcp", self.container_port)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RuntimeError {
    #[error("image {0:?} not found")]
    ImageNotFound(String),
    #[error("failed to pull image {image:?}: {message}")]
    Pull { image: String, message: String },
    #[error("port {0} is already in use")]
    PortInUse(u16),
    #[error("container {0:?} not found")]
    ContainerNotFound(String),
    #[error("{operation} failed: {message}")]
    Api {
        operation: &'static str,
        message: String,
    },
}

impl RuntimeError {
    pub fn api(operation: &'static str, message: impl ToString) -> Self {
        RuntimeError::Api {
            operation,
            message: message.to_string(),
        }
    }
}

/// Operations the lifecycle needs from a container engine
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Whether `image` is present locally
    async fn image_exists(&self, image: &str) -> Result<bool, RuntimeError>;

    /// Pull `image`, returning only once the pull has fully completed
    async fn pull_image(&self, image: &str) -> Result<(), RuntimeError>;

    /// Create (but do not start) a container; returns its identifier
    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, RuntimeError>;

    async fn start_container(&self, id: &str) -> Result<(), RuntimeError>;

    /// Ask the container to stop, killing it after `grace`.
    /// A container that is already stopped or gone is not an error.
    async fn stop_container(&self, id: &str, grace: Duration) -> Result<(), RuntimeError>;

    /// Force-remove a container by id or name. A missing container is not an error.
    async fn remove_container(&self, id: &str) -> Result<(), RuntimeError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_container_spec_defaults_to_loopback() {
        let spec = ContainerSpec::new("mandelbrot-auth-proxy", "lechgu/mandelbrot", 80, 8080);
        assert_eq!(spec.host_ip, "127.0.0.1");
        assert_eq!(spec.port_key(), "80/tcp");
    }

    #[test]
    fn test_runtime_error_messages() {
        assert_eq!(
            RuntimeError::PortInUse(8080).to_string(),
            "port 8080 is already in use"
        );
        assert_eq!(
            RuntimeError::api("create container", "boom").to_string(),
            "create container failed: boom"
        );
    }
}

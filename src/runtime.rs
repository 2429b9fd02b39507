//! Narrow interface over the container runtime, plus the Docker implementation.

use std::collections::HashMap;

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, ListContainersOptions, RemoveContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::models::{HostConfig, PortBinding};
use bollard::Docker;
use futures_util::StreamExt;
use thiserror::Error;
use tracing::warn;

/// Label identifying containers managed by this server.
pub const ROLE_LABEL: &str = "termlab.role";
pub const ROLE_LAB: &str = "lab";
/// Label carrying the owner id, for operator-side inspection.
pub const OWNER_LABEL: &str = "termlab.owner";

/// Port ttyd listens on inside the container.
pub const CONTAINER_PORT: u16 = 7681;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("runtime call failed: {0}")]
    Api(String),
}

/// What the runtime reports about an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeStatus {
    Running,
    Exited,
    Missing,
}

/// One live instance as reported by `list`.
#[derive(Debug, Clone)]
pub struct InstanceSummary {
    pub handle: String,
    pub host_port: Option<u16>,
}

/// Everything needed to create one lab container.
#[derive(Debug, Clone)]
pub struct CreateSpec {
    pub name: String,
    pub image: String,
    pub entrypoint: Vec<String>,
    pub host_port: u16,
    pub owner: String,
    pub memory_bytes: i64,
    pub nano_cpus: i64,
    pub pids_limit: i64,
    pub cap_drop: Vec<String>,
}

/// Control surface the lifecycle core needs from the container runtime.
#[async_trait]
pub trait RuntimeGateway: Send + Sync {
    /// Create and start an instance; returns its handle.
    async fn create(&self, spec: &CreateSpec) -> Result<String, RuntimeError>;
    async fn status(&self, handle: &str) -> Result<RuntimeStatus, RuntimeError>;
    /// Run a command inside the instance and capture its combined output.
    async fn exec_capture(&self, handle: &str, cmd: &[&str]) -> Result<String, RuntimeError>;
    async fn stop(&self, handle: &str) -> Result<(), RuntimeError>;
    async fn remove(&self, handle: &str) -> Result<(), RuntimeError>;
    /// All instances carrying our role label, running or not.
    async fn list(&self) -> Result<Vec<InstanceSummary>, RuntimeError>;
}

/// Production gateway backed by the local Docker daemon.
pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    pub fn new(docker: Docker) -> Self {
        Self { docker }
    }
}

fn api_err(e: bollard::errors::Error) -> RuntimeError {
    RuntimeError::Api(e.to_string())
}

fn is_not_found(e: &bollard::errors::Error) -> bool {
    matches!(
        e,
        bollard::errors::Error::DockerResponseServerError {
            status_code: 404,
            ..
        }
    )
}

#[async_trait]
impl RuntimeGateway for DockerRuntime {
    async fn create(&self, spec: &CreateSpec) -> Result<String, RuntimeError> {
        let mut labels = HashMap::new();
        labels.insert(ROLE_LABEL.to_string(), ROLE_LAB.to_string());
        labels.insert(OWNER_LABEL.to_string(), spec.owner.clone());

        let exposed = format!("{}/tcp", CONTAINER_PORT);
        let mut port_bindings = HashMap::new();
        port_bindings.insert(
            exposed.clone(),
            Some(vec![PortBinding {
                host_ip: Some("0.0.0.0".to_string()),
                host_port: Some(spec.host_port.to_string()),
            }]),
        );
        let mut exposed_ports = HashMap::new();
        exposed_ports.insert(exposed, HashMap::new());

        let config = Config {
            image: Some(spec.image.clone()),
            entrypoint: Some(spec.entrypoint.clone()),
            labels: Some(labels),
            exposed_ports: Some(exposed_ports),
            host_config: Some(HostConfig {
                memory: Some(spec.memory_bytes),
                nano_cpus: Some(spec.nano_cpus),
                pids_limit: Some(spec.pids_limit),
                privileged: Some(false),
                cap_drop: Some(spec.cap_drop.clone()),
                port_bindings: Some(port_bindings),
                ..Default::default()
            }),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: spec.name.clone(),
            ..Default::default()
        };

        let created = self
            .docker
            .create_container(Some(options), config)
            .await
            .map_err(api_err)?;

        if let Err(e) = self.docker.start_container::<String>(&created.id, None).await {
            // Roll back the half-made container so it cannot hold the port.
            if let Err(rm) = self
                .docker
                .remove_container(
                    &created.id,
                    Some(RemoveContainerOptions {
                        force: true,
                        ..Default::default()
                    }),
                )
                .await
            {
                warn!("failed to remove container {} after start failure: {}", created.id, rm);
            }
            return Err(api_err(e));
        }

        Ok(created.id)
    }

    async fn status(&self, handle: &str) -> Result<RuntimeStatus, RuntimeError> {
        match self.docker.inspect_container(handle, None).await {
            Ok(info) => {
                let running = info.state.and_then(|s| s.running).unwrap_or(false);
                if running {
                    Ok(RuntimeStatus::Running)
                } else {
                    Ok(RuntimeStatus::Exited)
                }
            }
            Err(e) if is_not_found(&e) => Ok(RuntimeStatus::Missing),
            Err(e) => Err(api_err(e)),
        }
    }

    async fn exec_capture(&self, handle: &str, cmd: &[&str]) -> Result<String, RuntimeError> {
        let exec = self
            .docker
            .create_exec(
                handle,
                CreateExecOptions {
                    cmd: Some(cmd.to_vec()),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    ..Default::default()
                },
            )
            .await
            .map_err(api_err)?;

        let mut captured = String::new();
        if let StartExecResults::Attached { mut output, .. } = self
            .docker
            .start_exec(&exec.id, None)
            .await
            .map_err(api_err)?
        {
            while let Some(Ok(msg)) = output.next().await {
                captured.push_str(&msg.to_string());
            }
        }
        Ok(captured)
    }

    async fn stop(&self, handle: &str) -> Result<(), RuntimeError> {
        match self.docker.stop_container(handle, None).await {
            Ok(()) => Ok(()),
            // Already gone or already stopped counts as stopped.
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(api_err(e)),
        }
    }

    async fn remove(&self, handle: &str) -> Result<(), RuntimeError> {
        match self
            .docker
            .remove_container(
                handle,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
        {
            Ok(()) => Ok(()),
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(api_err(e)),
        }
    }

    async fn list(&self) -> Result<Vec<InstanceSummary>, RuntimeError> {
        let mut filters = HashMap::new();
        filters.insert(
            "label".to_string(),
            vec![format!("{}={}", ROLE_LABEL, ROLE_LAB)],
        );
        let containers = self
            .docker
            .list_containers(Some(ListContainersOptions {
                all: true,
                filters,
                ..Default::default()
            }))
            .await
            .map_err(api_err)?;

        Ok(containers
            .into_iter()
            .filter_map(|c| {
                let handle = c.id?;
                let host_port = c.ports.as_ref().and_then(|ports| {
                    ports
                        .iter()
                        .filter(|p| p.private_port == CONTAINER_PORT)
                        .find_map(|p| p.public_port)
                });
                Some(InstanceSummary { handle, host_port })
            })
            .collect())
    }
}

//! Long-lived agent containers behind a small runtime trait.
//!
//! The deploy fast path only inspects, starts, stops and removes containers
//! that were provisioned beforehand; `create` is reserved for the explicit
//! setup step.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use bollard::Docker;
use bollard::errors::Error as DockerError;

use crate::error::{FleetError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerInfo {
    pub id: String,
    pub name: String,
    pub running: bool,
}

#[derive(Debug, Clone, Default)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub env: BTreeMap<String, String>,
    /// Bind mounts, `host:container[:ro]`.
    pub mounts: Vec<String>,
    pub command: Option<Vec<String>>,
    pub labels: HashMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct ExecOutput {
    pub exit_code: i64,
    pub output: String,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// `None` when no container with this name or id exists.
    async fn inspect(&self, name: &str) -> Result<Option<ContainerInfo>>;
    async fn start(&self, name: &str) -> Result<()>;
    async fn stop(&self, name: &str) -> Result<()>;
    async fn remove(&self, name: &str) -> Result<()>;
    async fn exec(&self, name: &str, cmd: &[String], timeout: Duration) -> Result<ExecOutput>;
    /// Create (but do not start) a container; returns its id.
    async fn create(&self, spec: &ContainerSpec) -> Result<String>;
}

pub struct DockerRuntime {
    docker: Docker,
    stop_timeout_secs: i64,
}

impl DockerRuntime {
    pub fn connect(stop_timeout_secs: i64) -> Result<Self> {
        let docker = Docker::connect_with_local_defaults().map_err(|e| {
            FleetError::execution(format!(
                "failed to connect to Docker daemon: {}. Is Docker running?",
                e
            ))
        })?;
        Ok(Self {
            docker,
            stop_timeout_secs,
        })
    }
}

fn status_code(e: &DockerError) -> Option<u16> {
    match e {
        DockerError::DockerResponseServerError { status_code, .. } => Some(*status_code),
        _ => None,
    }
}

fn docker_err(action: &str, name: &str, e: DockerError) -> FleetError {
    FleetError::execution(format!("docker {} '{}' failed: {}", action, name, e))
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn inspect(&self, name: &str) -> Result<Option<ContainerInfo>> {
        use bollard::container::InspectContainerOptions;

        match self
            .docker
            .inspect_container(name, None::<InspectContainerOptions>)
            .await
        {
            Ok(resp) => Ok(Some(ContainerInfo {
                id: resp.id.unwrap_or_else(|| name.to_string()),
                name: resp
                    .name
                    .map(|n| n.trim_start_matches('/').to_string())
                    .unwrap_or_else(|| name.to_string()),
                running: resp.state.and_then(|s| s.running).unwrap_or(false),
            })),
            Err(e) if status_code(&e) == Some(404) => Ok(None),
            Err(e) => Err(docker_err("inspect", name, e)),
        }
    }

    async fn start(&self, name: &str) -> Result<()> {
        match self.docker.start_container::<String>(name, None).await {
            Ok(()) => Ok(()),
            // 304: already started
            Err(e) if status_code(&e) == Some(304) => Ok(()),
            Err(e) => Err(docker_err("start", name, e)),
        }
    }

    async fn stop(&self, name: &str) -> Result<()> {
        use bollard::container::StopContainerOptions;

        let opts = StopContainerOptions {
            t: self.stop_timeout_secs,
        };
        match self.docker.stop_container(name, Some(opts)).await {
            Ok(()) => Ok(()),
            Err(e) if matches!(status_code(&e), Some(304) | Some(404)) => Ok(()),
            Err(e) => Err(docker_err("stop", name, e)),
        }
    }

    async fn remove(&self, name: &str) -> Result<()> {
        use bollard::container::RemoveContainerOptions;

        let opts = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        match self.docker.remove_container(name, Some(opts)).await {
            Ok(()) => Ok(()),
            Err(e) if status_code(&e) == Some(404) => Ok(()),
            Err(e) => Err(docker_err("remove", name, e)),
        }
    }

    async fn exec(&self, name: &str, cmd: &[String], timeout: Duration) -> Result<ExecOutput> {
        use bollard::exec::{CreateExecOptions, StartExecResults};
        use futures::StreamExt;

        let options = CreateExecOptions {
            cmd: Some(cmd.to_vec()),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            ..Default::default()
        };
        let exec = self
            .docker
            .create_exec(name, options)
            .await
            .map_err(|e| docker_err("exec", name, e))?;
        let started = self
            .docker
            .start_exec(&exec.id, None)
            .await
            .map_err(|e| docker_err("exec", name, e))?;

        let mut output = String::new();
        if let StartExecResults::Attached { output: mut stream, .. } = started {
            let collect = async {
                while let Some(msg) = stream.next().await {
                    match msg {
                        Ok(bollard::container::LogOutput::StdOut { message })
                        | Ok(bollard::container::LogOutput::StdErr { message }) => {
                            output.push_str(&String::from_utf8_lossy(&message));
                        }
                        Ok(_) => {}
                        Err(e) => {
                            output.push_str(&format!("\n[exec stream error: {}]", e));
                            break;
                        }
                    }
                }
            };
            if tokio::time::timeout(timeout, collect).await.is_err() {
                return Err(FleetError::execution(format!(
                    "exec in '{}' timed out after {:?}",
                    name, timeout
                )));
            }
        }

        let inspect = self
            .docker
            .inspect_exec(&exec.id)
            .await
            .map_err(|e| docker_err("inspect exec", name, e))?;
        Ok(ExecOutput {
            exit_code: inspect.exit_code.unwrap_or(-1),
            output: output.trim().to_string(),
        })
    }

    async fn create(&self, spec: &ContainerSpec) -> Result<String> {
        use bollard::container::{Config, CreateContainerOptions};
        use bollard::models::HostConfig;

        let env: Vec<String> = spec.env.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
        let host_config = HostConfig {
            binds: if spec.mounts.is_empty() {
                None
            } else {
                Some(spec.mounts.clone())
            },
            ..Default::default()
        };
        let config = Config {
            image: Some(spec.image.clone()),
            env: Some(env),
            cmd: spec.command.clone(),
            host_config: Some(host_config),
            labels: Some(spec.labels.clone()),
            ..Default::default()
        };
        let options = CreateContainerOptions {
            name: spec.name.clone(),
            platform: None,
        };
        let resp = self
            .docker
            .create_container(Some(options), config)
            .await
            .map_err(|e| docker_err("create", &spec.name, e))?;
        tracing::info!(container = %spec.name, image = %spec.image, "container provisioned");
        Ok(resp.id)
    }
}

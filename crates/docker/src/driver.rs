use crate::error::{DockerError, Result};
use async_trait::async_trait;
use bollard::container::LogOutput;
use bollard::models::{ContainerCreateBody, HostConfig};
use bollard::query_parameters::{
    CreateContainerOptions, CreateImageOptions, InspectContainerOptions, KillContainerOptions,
    LogsOptions, RemoveContainerOptions, StartContainerOptions, StatsOptions,
    WaitContainerOptions,
};
use bollard::Docker;
use futures_util::stream::TryStreamExt;
use tracing::{debug, warn};

/// Everything the engine needs to build one function container.
#[derive(Debug, Clone, Default)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    /// `KEY=VALUE` pairs.
    pub env: Vec<String>,
    /// `host:container:ro` bind mounts.
    pub binds: Vec<String>,
    pub working_dir: String,
    /// Hard memory limit in bytes; 0 means unlimited.
    pub memory_bytes: i64,
    /// Hard CPU quota in nanocpus; 0 means unlimited.
    pub nano_cpus: i64,
    pub network_mode: String,
}

/// Best-effort resource usage read after a container exits. Zeroes when the
/// engine did not report a figure.
#[derive(Debug, Clone, Copy, Default)]
pub struct ContainerStats {
    pub cpu_usage_ns: i64,
    pub memory_peak: i64,
    pub network_in: i64,
    pub network_out: i64,
}

/// Engine operations the execution runtime depends on.
#[async_trait]
pub trait ContainerDriver: Send + Sync {
    async fn create(&self, spec: &ContainerSpec) -> Result<String>;
    async fn start(&self, id: &str) -> Result<()>;

    /// Block until the container exits and return its exit code.
    async fn wait(&self, id: &str) -> Result<i64>;

    async fn kill(&self, id: &str, signal: &str) -> Result<()>;

    /// Collected stdout+stderr. The engine multiplexes both streams into
    /// framed chunks; the returned bytes are the frame payloads only.
    async fn logs(&self, id: &str) -> Result<Vec<u8>>;

    async fn stats(&self, id: &str) -> Result<ContainerStats>;

    /// Force-remove the container and its anonymous volumes.
    async fn remove(&self, id: &str) -> Result<()>;

    async fn image_exists(&self, name: &str) -> Result<bool>;
    async fn pull_image(&self, name: &str) -> Result<()>;
}

/// Bollard-backed driver against the local engine socket.
pub struct DockerDriver {
    docker: Docker,
}

impl DockerDriver {
    pub fn new() -> Result<Self> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| DockerError::ConnectionError(e.to_string()))?;
        Ok(Self { docker })
    }

    async fn inspect_exit_code(&self, id: &str) -> Option<i64> {
        let details = self
            .docker
            .inspect_container(id, None::<InspectContainerOptions>)
            .await
            .ok()?;
        details.state.and_then(|state| state.exit_code)
    }
}

#[async_trait]
impl ContainerDriver for DockerDriver {
    async fn create(&self, spec: &ContainerSpec) -> Result<String> {
        let host_config = HostConfig {
            binds: if spec.binds.is_empty() {
                None
            } else {
                Some(spec.binds.clone())
            },
            network_mode: if spec.network_mode.is_empty() {
                None
            } else {
                Some(spec.network_mode.clone())
            },
            memory: (spec.memory_bytes > 0).then_some(spec.memory_bytes),
            // memory_swap == memory disables swap (the limit is RAM+swap).
            memory_swap: (spec.memory_bytes > 0).then_some(spec.memory_bytes),
            nano_cpus: (spec.nano_cpus > 0).then_some(spec.nano_cpus),
            ..Default::default()
        };

        let body = ContainerCreateBody {
            image: Some(spec.image.clone()),
            env: Some(spec.env.clone()),
            working_dir: if spec.working_dir.is_empty() {
                None
            } else {
                Some(spec.working_dir.clone())
            },
            host_config: Some(host_config),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: Some(spec.name.clone()),
            platform: String::new(),
        };

        let container = self.docker.create_container(Some(options), body).await?;
        debug!(container_id = %container.id, image = %spec.image, "container created");
        Ok(container.id)
    }

    async fn start(&self, id: &str) -> Result<()> {
        self.docker
            .start_container(id, None::<StartContainerOptions>)
            .await?;
        debug!(container_id = %id, "container started");
        Ok(())
    }

    async fn wait(&self, id: &str) -> Result<i64> {
        let mut status_stream = self
            .docker
            .wait_container(id, Some(WaitContainerOptions::default()));

        match status_stream.try_next().await {
            Ok(Some(status)) => Ok(status.status_code),
            Ok(None) => {
                // The wait stream closed without a status; the container
                // state still has the exit code.
                self.inspect_exit_code(id).await.ok_or_else(|| {
                    DockerError::ContainerError(format!(
                        "wait stream for {id} ended without a status"
                    ))
                })
            }
            Err(e) => {
                if let Some(exit_code) = self.inspect_exit_code(id).await {
                    warn!(container_id = %id, error = %e, "wait failed, recovered exit code from inspect");
                    return Ok(exit_code);
                }
                Err(e.into())
            }
        }
    }

    async fn kill(&self, id: &str, signal: &str) -> Result<()> {
        self.docker
            .kill_container(
                id,
                Some(KillContainerOptions {
                    signal: signal.to_string(),
                }),
            )
            .await?;
        debug!(container_id = %id, signal, "container killed");
        Ok(())
    }

    async fn logs(&self, id: &str) -> Result<Vec<u8>> {
        let options = LogsOptions {
            stdout: true,
            stderr: true,
            since: 0,
            until: 0,
            timestamps: false,
            follow: false,
            tail: "all".to_string(),
        };

        let mut stream = self.docker.logs(id, Some(options));
        let mut output = Vec::new();

        while let Some(frame) = stream.try_next().await? {
            match frame {
                LogOutput::StdOut { message } | LogOutput::StdErr { message } => {
                    output.extend_from_slice(&message);
                }
                _ => {}
            }
        }

        Ok(output)
    }

    async fn stats(&self, id: &str) -> Result<ContainerStats> {
        let options = StatsOptions {
            stream: false,
            ..Default::default()
        };

        let mut stream = self.docker.stats(id, Some(options));
        let Some(sample) = stream.try_next().await? else {
            return Ok(ContainerStats::default());
        };

        let memory_peak = sample
            .memory_stats
            .as_ref()
            .and_then(|m| m.max_usage.or(m.usage))
            .unwrap_or(0) as i64;

        let cpu_usage_ns = sample
            .cpu_stats
            .as_ref()
            .and_then(|c| c.cpu_usage.as_ref())
            .and_then(|u| u.total_usage)
            .unwrap_or(0) as i64;

        let (network_in, network_out) = sample
            .networks
            .as_ref()
            .map(|networks| {
                networks.values().fold((0i64, 0i64), |(rx, tx), n| {
                    (
                        rx + n.rx_bytes.unwrap_or(0) as i64,
                        tx + n.tx_bytes.unwrap_or(0) as i64,
                    )
                })
            })
            .unwrap_or((0, 0));

        Ok(ContainerStats {
            cpu_usage_ns,
            memory_peak,
            network_in,
            network_out,
        })
    }

    async fn remove(&self, id: &str) -> Result<()> {
        self.docker
            .remove_container(
                id,
                Some(RemoveContainerOptions {
                    force: true,
                    v: true,
                    link: false,
                }),
            )
            .await?;
        debug!(container_id = %id, "container removed");
        Ok(())
    }

    async fn image_exists(&self, name: &str) -> Result<bool> {
        match self.docker.inspect_image(name).await {
            Ok(_) => Ok(true),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn pull_image(&self, name: &str) -> Result<()> {
        debug!(image = %name, "pulling image");

        let options = CreateImageOptions {
            from_image: Some(name.to_string()),
            ..Default::default()
        };

        let mut stream = self.docker.create_image(Some(options), None, None);
        loop {
            match stream.try_next().await {
                Ok(Some(progress)) => {
                    if let Some(status) = progress.status {
                        debug!(image = %name, status = %status, "pull progress");
                    }
                }
                Ok(None) => break,
                Err(bollard::errors::Error::DockerResponseServerError {
                    status_code: 404,
                    message,
                }) => {
                    return Err(DockerError::ImageNotFound(format!("{name}: {message}")));
                }
                Err(e) => return Err(e.into()),
            }
        }

        debug!(image = %name, "image pulled");
        Ok(())
    }
}

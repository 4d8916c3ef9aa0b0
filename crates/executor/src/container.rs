//! Container-backed `FunctionRuntime`.

use crate::error::Result;
use crate::spec::{ExecutionResult, ExecutionSpec, FunctionRuntime};
use async_trait::async_trait;
use docker::{ContainerDriver, ContainerSpec, ContainerStats};
use metadata::model::error_kind;
use metadata::{ExecutionError, ExecutionMetrics};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::fs;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Mount point of the staged code inside the container.
const CODE_MOUNT: &str = "/app/function";
const WORKING_DIR: &str = "/app";
const NETWORK_MODE: &str = "bridge";

/// Runtime tag → (base image, code file extension). Adding a runtime means
/// adding a branch here and shipping the matching base image.
fn runtime_image(tag: &str) -> Option<(&'static str, &'static str)> {
    match tag {
        "go" => Some(("faas-runtime-go:latest", "go")),
        "python" => Some(("faas-runtime-python:latest", "py")),
        "nodejs" => Some(("faas-runtime-nodejs:latest", "js")),
        _ => None,
    }
}

pub struct ContainerRuntime {
    driver: Arc<dyn ContainerDriver>,
    work_dir: PathBuf,
}

impl ContainerRuntime {
    /// `work_dir` hosts the per-execution staging directories; it is created
    /// eagerly so bind-mount sources always resolve to absolute paths.
    pub async fn new(driver: Arc<dyn ContainerDriver>, work_dir: impl Into<PathBuf>) -> Result<Self> {
        let work_dir = work_dir.into();
        fs::create_dir_all(&work_dir).await?;
        let work_dir = fs::canonicalize(&work_dir).await?;
        Ok(Self { driver, work_dir })
    }

    /// Write the function code where the container will see it. One
    /// directory per execution; removed on every exit path.
    async fn stage_code(&self, spec: &ExecutionSpec, ext: &str, nanos: u128) -> Result<PathBuf> {
        let staging = self.work_dir.join(&spec.function_id).join(nanos.to_string());
        fs::create_dir_all(&staging).await?;
        fs::write(staging.join(format!("main.{ext}")), &spec.code).await?;
        Ok(staging)
    }

    fn build_container_spec(
        &self,
        spec: &ExecutionSpec,
        image: &str,
        payload: &str,
        staging: &Path,
        nanos: u128,
    ) -> ContainerSpec {
        let mut env: Vec<String> = spec
            .environment
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect();
        env.push(format!("FUNCTION_HANDLER={}", spec.handler));
        env.push(format!("FUNCTION_PAYLOAD={payload}"));

        ContainerSpec {
            name: format!("faas-{}-{}", spec.function_id, nanos),
            image: image.to_string(),
            env,
            binds: vec![format!("{}:{CODE_MOUNT}:ro", staging.display())],
            working_dir: WORKING_DIR.to_string(),
            memory_bytes: spec.limits.memory_bytes,
            nano_cpus: spec.limits.cpu_shares * 1_000_000,
            network_mode: NETWORK_MODE.to_string(),
        }
    }

    /// Cleanup runs outside the execution deadline so an expired deadline
    /// can never leak a container or a staging directory.
    async fn cleanup(&self, container_id: Option<&str>, staging: &Path) {
        if let Some(id) = container_id {
            if let Err(e) = self.driver.remove(id).await {
                warn!(container_id = %id, error = %e, "failed to remove container");
            }
        }
        if let Err(e) = fs::remove_dir_all(staging).await {
            warn!(staging = %staging.display(), error = %e, "failed to remove staging directory");
        }
    }

    async fn read_stats(&self, container_id: &str) -> ContainerStats {
        match self.driver.stats(container_id).await {
            Ok(stats) => stats,
            Err(e) => {
                debug!(container_id, error = %e, "container stats unavailable");
                ContainerStats::default()
            }
        }
    }

    async fn read_logs(&self, container_id: &str) -> Vec<u8> {
        match self.driver.logs(container_id).await {
            Ok(logs) => logs,
            Err(e) => {
                warn!(container_id, error = %e, "failed to read container logs");
                Vec::new()
            }
        }
    }
}

fn metrics_with_duration(duration: Duration) -> ExecutionMetrics {
    ExecutionMetrics {
        duration,
        ..Default::default()
    }
}

#[async_trait]
impl FunctionRuntime for ContainerRuntime {
    async fn execute(&self, spec: ExecutionSpec) -> Result<ExecutionResult> {
        let started = Instant::now();

        let Some((image, ext)) = runtime_image(&spec.runtime) else {
            return Ok(ExecutionResult::failed(
                ExecutionError::new(
                    error_kind::UNSUPPORTED_RUNTIME,
                    format!("unsupported runtime: {}", spec.runtime),
                ),
                metrics_with_duration(started.elapsed()),
            ));
        };

        // The payload travels as an environment variable, so it must be
        // valid UTF-8. Fail before any engine or filesystem work.
        let payload = match std::str::from_utf8(&spec.payload) {
            Ok(payload) => payload.to_string(),
            Err(e) => {
                return Ok(ExecutionResult::failed(
                    ExecutionError::new(
                        error_kind::INVALID_PAYLOAD,
                        format!("payload is not valid UTF-8: {e}"),
                    ),
                    metrics_with_duration(started.elapsed()),
                ));
            }
        };

        let present = match self.driver.image_exists(image).await {
            Ok(present) => present,
            Err(e) => {
                return Ok(ExecutionResult::failed(
                    ExecutionError::new(
                        error_kind::IMAGE_ERROR,
                        format!("failed to inspect runtime image {image}: {e}"),
                    ),
                    metrics_with_duration(started.elapsed()),
                ));
            }
        };
        if !present {
            info!(image, "runtime image missing, pulling");
            if let Err(e) = self.driver.pull_image(image).await {
                return Ok(ExecutionResult::failed(
                    ExecutionError::new(
                        error_kind::IMAGE_ERROR,
                        format!("failed to pull runtime image {image}: {e}"),
                    ),
                    metrics_with_duration(started.elapsed()),
                ));
            }
        }

        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();

        let staging = self.stage_code(&spec, ext, nanos).await?;
        let container_spec = self.build_container_spec(&spec, image, &payload, &staging, nanos);

        debug!(
            function_id = %spec.function_id,
            image,
            timeout_ms = spec.timeout.as_millis() as u64,
            memory_bytes = spec.limits.memory_bytes,
            "starting execution"
        );

        // Create + start + wait all run under the invocation deadline. The
        // duration clock starts just before create: image pulls are not the
        // function's time.
        let run_started = Instant::now();
        let mut container_id: Option<String> = None;
        let driver = self.driver.clone();
        let run = timeout(spec.timeout, {
            let container_spec = &container_spec;
            let container_id = &mut container_id;
            async move {
                let id = driver.create(container_spec).await?;
                *container_id = Some(id.clone());
                driver.start(&id).await?;
                driver.wait(&id).await.map_err(crate::ExecutorError::from)
            }
        })
        .await;

        let duration = run_started.elapsed();

        match run {
            // Deadline hit: SIGKILL immediately, no graceful shutdown.
            Err(_elapsed) => {
                if let Some(id) = container_id.as_deref() {
                    if let Err(e) = self.driver.kill(id, "SIGKILL").await {
                        warn!(container_id = %id, error = %e, "failed to kill timed-out container");
                    }
                }
                self.cleanup(container_id.as_deref(), &staging).await;

                warn!(
                    function_id = %spec.function_id,
                    timeout_ms = spec.timeout.as_millis() as u64,
                    "execution timed out"
                );
                Ok(ExecutionResult::timed_out(
                    ExecutionError::new(error_kind::TIMEOUT_ERROR, "execution timed out"),
                    metrics_with_duration(duration),
                ))
            }

            // Engine trouble before or during the run: infra-transient, the
            // worker decides whether to retry.
            Ok(Err(e)) => {
                self.cleanup(container_id.as_deref(), &staging).await;
                Err(e)
            }

            Ok(Ok(exit_code)) => {
                let id = container_id.as_deref().unwrap_or_default().to_string();
                let logs = self.read_logs(&id).await;
                let stats = self.read_stats(&id).await;
                self.cleanup(container_id.as_deref(), &staging).await;

                let metrics = ExecutionMetrics {
                    duration,
                    cpu_time: Duration::from_nanos(stats.cpu_usage_ns.max(0) as u64),
                    memory_peak: stats.memory_peak,
                    network_in: stats.network_in,
                    network_out: stats.network_out,
                };

                if exit_code == 0 {
                    info!(
                        function_id = %spec.function_id,
                        duration_ms = duration.as_millis() as u64,
                        "execution completed"
                    );
                    Ok(ExecutionResult::completed(logs, metrics))
                } else {
                    warn!(
                        function_id = %spec.function_id,
                        exit_code,
                        "execution failed"
                    );
                    Ok(ExecutionResult::failed(
                        ExecutionError::new(
                            error_kind::RUNTIME_ERROR,
                            format!("function exited with code {exit_code}"),
                        )
                        .with_stack(String::from_utf8_lossy(&logs)),
                        metrics,
                    ))
                }
            }
        }
    }
}

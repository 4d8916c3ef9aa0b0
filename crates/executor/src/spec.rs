use crate::error::Result;
use async_trait::async_trait;
use metadata::{ExecutionError, ExecutionMetrics, ExecutionStatus};
use std::collections::HashMap;
use std::time::Duration;

/// Resource bounds for one execution. Zero means unlimited.
#[derive(Debug, Clone, Copy, Default)]
pub struct ResourceLimits {
    pub memory_bytes: i64,
    /// Converted to a hard nanocpu quota (`cpu_shares * 1e6`) by the
    /// container runtime.
    pub cpu_shares: i64,
}

/// Everything needed to run one invocation, assembled by the worker from the
/// function row, the code store and the execution request.
#[derive(Debug, Clone)]
pub struct ExecutionSpec {
    pub function_id: String,
    /// Runtime tag; the runtime does a closed match on it and fails the
    /// execution (not the worker) on an unknown tag.
    pub runtime: String,
    pub code: Vec<u8>,
    pub handler: String,
    /// UTF-8 JSON; validated before the container is built.
    pub payload: Vec<u8>,
    pub environment: HashMap<String, String>,
    pub timeout: Duration,
    pub limits: ResourceLimits,
}

/// Normalized outcome of one execution. `metrics` is always populated;
/// `result` is the captured stdout and only meaningful for `Completed`.
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub status: ExecutionStatus,
    pub result: Vec<u8>,
    pub error: Option<ExecutionError>,
    pub metrics: ExecutionMetrics,
}

impl ExecutionResult {
    pub fn completed(result: Vec<u8>, metrics: ExecutionMetrics) -> Self {
        Self {
            status: ExecutionStatus::Completed,
            result,
            error: None,
            metrics,
        }
    }

    pub fn failed(error: ExecutionError, metrics: ExecutionMetrics) -> Self {
        Self {
            status: ExecutionStatus::Failed,
            result: Vec::new(),
            error: Some(error),
            metrics,
        }
    }

    pub fn timed_out(error: ExecutionError, metrics: ExecutionMetrics) -> Self {
        Self {
            status: ExecutionStatus::Timeout,
            result: Vec::new(),
            error: Some(error),
            metrics,
        }
    }
}

/// The seam between the worker loop and the execution machinery.
#[async_trait]
pub trait FunctionRuntime: Send + Sync {
    async fn execute(&self, spec: ExecutionSpec) -> Result<ExecutionResult>;
}

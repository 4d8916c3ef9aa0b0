//! Domain model shared across the platform.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Name of the queue carrying execution requests from the control plane to
/// the workers.
pub const EXECUTION_QUEUE: &str = "faas_executions";

/// Supported function runtimes. Adding a runtime means adding a tag here and
/// a matching branch (image + file extension) in the execution runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeKind {
    Go,
    Python,
    Nodejs,
}

impl RuntimeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Go => "go",
            Self::Python => "python",
            Self::Nodejs => "nodejs",
        }
    }
}

impl fmt::Display for RuntimeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RuntimeKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "go" => Ok(Self::Go),
            "python" => Ok(Self::Python),
            "nodejs" => Ok(Self::Nodejs),
            other => Err(format!("unsupported runtime: {other}")),
        }
    }
}

/// Invocation lifecycle. `Pending → Running → {Completed | Failed | Timeout}`;
/// the three terminal states are absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Timeout,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Timeout)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Timeout => "timeout",
        }
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "timeout" => Ok(Self::Timeout),
            other => Err(format!("unknown status: {other}")),
        }
    }
}

/// Error kinds carried on failed invocations. Kept as plain strings in the
/// record so the set can grow without schema changes.
pub mod error_kind {
    pub const UNSUPPORTED_RUNTIME: &str = "UnsupportedRuntime";
    pub const IMAGE_ERROR: &str = "ImageError";
    pub const INVALID_PAYLOAD: &str = "InvalidPayload";
    pub const RUNTIME_ERROR: &str = "RuntimeError";
    pub const TIMEOUT_ERROR: &str = "TimeoutError";
    pub const CONTAINER_ERROR: &str = "ContainerError";
    pub const FUNCTION_MISSING: &str = "FunctionMissing";
    pub const CODE_FETCH_FAILED: &str = "CodeFetchFailed";
    pub const RETRY_EXHAUSTED: &str = "RetryExhausted";
}

/// Structured error attached to a failed or timed-out invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionError {
    #[serde(rename = "type")]
    pub kind: String,
    pub message: String,
    /// Captured container output when available.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub stack: String,
}

impl ExecutionError {
    pub fn new(kind: &str, message: impl Into<String>) -> Self {
        Self {
            kind: kind.to_string(),
            message: message.into(),
            stack: String::new(),
        }
    }

    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = stack.into();
        self
    }
}

/// Resource usage of one execution. Durations are persisted as integer
/// nanoseconds; byte counters are best-effort and zero when the engine did
/// not report them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionMetrics {
    #[serde(with = "duration_ns")]
    pub duration: Duration,
    #[serde(with = "duration_ns")]
    pub cpu_time: Duration,
    pub memory_peak: i64,
    pub network_in: i64,
    pub network_out: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionCode {
    /// Opaque pointer into the code store.
    pub location: String,
    /// Hex-encoded SHA-256 of the stored bytes.
    pub checksum: String,
    /// Size in bytes.
    pub size: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionConfig {
    #[serde(with = "duration_secs")]
    pub timeout: Duration,
    pub memory_mb: u32,
    /// Advisory; the core does not schedule on it.
    pub concurrency: u32,
    #[serde(default)]
    pub environment: HashMap<String, String>,
}

/// A registered function: immutable-by-version code artifact plus execution
/// configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Function {
    pub id: String,
    pub name: String,
    pub version: String,
    pub runtime: RuntimeKind,
    pub handler: String,
    pub code: FunctionCode,
    pub config: FunctionConfig,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One attempt to run a function on a specific payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Invocation {
    pub id: String,
    pub function_id: String,
    pub payload: serde_json::Value,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    pub status: ExecutionStatus,
    #[serde(
        default,
        with = "base64_opt",
        skip_serializing_if = "Option::is_none"
    )]
    pub result: Option<Vec<u8>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ExecutionError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<ExecutionMetrics>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

/// Queue payload carrying one invocation from the control plane to a worker.
/// Field names are wire-stable; `timeout` is integer nanoseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRequest {
    pub invocation_id: String,
    pub function_id: String,
    pub payload: serde_json::Value,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default, with = "duration_ns_opt")]
    pub timeout: Option<Duration>,
}

#[derive(Debug, Clone, Default)]
pub struct FunctionFilter {
    pub runtime: Option<RuntimeKind>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
}

#[derive(Debug, Clone, Default)]
pub struct InvocationFilter {
    pub function_id: Option<String>,
    pub status: Option<ExecutionStatus>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
}

pub(crate) mod duration_ns {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_nanos() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_nanos(u64::deserialize(d)?))
    }
}

pub(crate) mod duration_ns_opt {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match d {
            Some(d) => s.serialize_some(&(d.as_nanos() as u64)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(d)?.map(Duration::from_nanos))
    }
}

pub(crate) mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}

pub(crate) mod base64_opt {
    use base64::prelude::*;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(v: &Option<Vec<u8>>, s: S) -> Result<S::Ok, S::Error> {
        match v {
            Some(bytes) => s.serialize_some(&BASE64_STANDARD.encode(bytes)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Vec<u8>>, D::Error> {
        match Option::<String>::deserialize(d)? {
            Some(text) => BASE64_STANDARD
                .decode(text)
                .map(Some)
                .map_err(serde::de::Error::custom),
            None => Ok(None),
        }
    }
}

//! Execution runtime: runs exactly one invocation in a fresh container.
//!
//! Every function-level outcome — success, crash, timeout, bad runtime tag,
//! bad payload — comes back as an `Ok(ExecutionResult)`. `Err` is reserved
//! for infrastructure trouble (staging I/O, engine transport) that the
//! worker retries; the distinction drives the retry policy.

pub mod container;
pub mod error;
pub mod spec;

pub use container::ContainerRuntime;
pub use error::{ExecutorError, Result};
pub use spec::{ExecutionResult, ExecutionSpec, FunctionRuntime, ResourceLimits};

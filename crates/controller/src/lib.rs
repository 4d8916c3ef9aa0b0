//! Control plane: function registration and asynchronous invocation.
//!
//! `FunctionService` owns the function lifecycle (validation, code blobs,
//! metadata rows); `InvocationService` records a PENDING invocation and
//! enqueues its execution request — the row always exists before the
//! enqueue returns, so a read right after invoking finds at least PENDING.

pub mod config;
pub mod error;
pub mod functions;
pub mod invocations;

pub use config::ControllerConfig;
pub use error::{ControllerError, Result};
pub use functions::{CreateFunctionRequest, FunctionService, UpdateFunctionRequest};
pub use invocations::{InvocationHandle, InvocationService, InvokeRequest};

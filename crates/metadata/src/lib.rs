//! Metadata store: durable records for functions and invocations.
//!
//! This crate owns the domain model shared across the platform and the
//! `MetadataStore` trait, with a sea-orm backed implementation for Postgres
//! and an in-memory implementation for tests and single-process runs. The
//! invocation rows here are the source of truth for execution state; the
//! store enforces that terminal states are absorbing.

pub mod entity;
pub mod error;
pub mod memory;
pub mod model;
pub mod store;

pub use error::{MetadataError, Result};
pub use memory::MemoryMetadataStore;
pub use model::{
    ExecutionError, ExecutionMetrics, ExecutionRequest, ExecutionStatus, Function, FunctionCode,
    FunctionConfig, FunctionFilter, Invocation, InvocationFilter, RuntimeKind, EXECUTION_QUEUE,
};
pub use store::SeaOrmMetadataStore;

use async_trait::async_trait;

/// Transactional persistence for function and invocation records.
///
/// `Internal` errors are transient and retryable; `NotFound` and `Conflict`
/// are definitive answers about the data.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    async fn create_function(&self, function: &Function) -> Result<()>;
    async fn get_function(&self, id: &str) -> Result<Function>;
    async fn get_function_by_name(&self, name: &str, version: &str) -> Result<Function>;
    async fn update_function(&self, function: &Function) -> Result<()>;
    async fn delete_function(&self, id: &str) -> Result<()>;
    async fn list_functions(&self, filter: &FunctionFilter) -> Result<Vec<Function>>;

    async fn create_invocation(&self, invocation: &Invocation) -> Result<()>;
    async fn get_invocation(&self, id: &str) -> Result<Invocation>;

    /// Full replace of the invocation's mutable columns. Idempotent for
    /// identical inputs. A write that would move a terminal row back to a
    /// non-terminal status is a successful no-op: terminal states absorb.
    async fn update_invocation(&self, invocation: &Invocation) -> Result<()>;
    async fn list_invocations(&self, filter: &InvocationFilter) -> Result<Vec<Invocation>>;
}

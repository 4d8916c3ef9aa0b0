//! Worker loop: drains the execution queue one message at a time.
//!
//! Per message: parse, mark the invocation RUNNING, resolve the function and
//! its code, drive the execution runtime, write the terminal row, ack.
//! Function-level outcomes (including FAILED and TIMEOUT) are terminal and
//! acked; infrastructure failures are retried by nacking the message until
//! `MAX_ATTEMPTS`, after which the invocation fails with `RetryExhausted`
//! and the message is dead-lettered. Horizontal scale comes from running
//! more worker processes, never from concurrency inside one loop.

pub mod config;

pub use config::WorkerConfig;

use chrono::Utc;
use executor::{ExecutionResult, ExecutionSpec, ExecutorError, FunctionRuntime, ResourceLimits};
use metadata::model::error_kind;
use metadata::{
    ExecutionError, ExecutionRequest, ExecutionStatus, MetadataError, MetadataStore,
    EXECUTION_QUEUE,
};
use queue::{Message, Queue};
use std::sync::Arc;
use std::time::Duration;
use storage::{CodeStore, StorageError};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// A message is dead-lettered after this many delivery attempts fail on
/// infrastructure errors.
pub const MAX_ATTEMPTS: u32 = 3;

/// Infrastructure failures that warrant redelivery. Everything else becomes
/// a terminal invocation state instead of an error.
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("metadata store: {0}")]
    Metadata(#[from] MetadataError),

    #[error("code fetch failed: {0}")]
    CodeFetch(#[from] StorageError),

    #[error("execution runtime: {0}")]
    Execution(#[from] ExecutorError),
}

pub struct Worker {
    id: String,
    queue: Arc<dyn Queue>,
    store: Arc<dyn MetadataStore>,
    code_store: Arc<dyn CodeStore>,
    runtime: Arc<dyn FunctionRuntime>,
    poll_timeout: Duration,
    shutdown: CancellationToken,
}

impl Worker {
    pub fn new(
        id: String,
        queue: Arc<dyn Queue>,
        store: Arc<dyn MetadataStore>,
        code_store: Arc<dyn CodeStore>,
        runtime: Arc<dyn FunctionRuntime>,
        poll_timeout: Duration,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            id,
            queue,
            store,
            code_store,
            runtime,
            poll_timeout,
            shutdown,
        }
    }

    /// Run until the shutdown token fires. The token is only checked between
    /// iterations, so an in-flight execution always completes (or times out
    /// on its own deadline) before the loop exits.
    pub async fn run(&self) {
        info!(worker_id = %self.id, "worker started");

        while !self.shutdown.is_cancelled() {
            if let Err(e) = self.process_next().await {
                error!(worker_id = %self.id, error = %e, "failed to process message");
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }

        info!(worker_id = %self.id, "worker stopped");
    }

    /// Process at most one message. Returns `Err` only for queue transport
    /// failures; everything message-scoped is settled inside.
    pub async fn process_next(&self) -> queue::Result<()> {
        let Some(message) = self.queue.dequeue(EXECUTION_QUEUE, self.poll_timeout).await? else {
            return Ok(());
        };

        info!(
            worker_id = %self.id,
            message_id = %message.id,
            attempts = message.attempts,
            "processing execution request"
        );

        let request: ExecutionRequest = match serde_json::from_slice(&message.payload) {
            Ok(request) => request,
            Err(e) => {
                error!(message_id = %message.id, error = %e, "unparseable execution request");
                self.queue
                    .dead_letter(&message, &format!("invalid payload: {e}"))
                    .await?;
                return Ok(());
            }
        };

        match self.handle(&request).await {
            Ok(()) => self.queue.ack(&message).await?,
            Err(e) => self.retry_or_park(&message, &request, e).await?,
        }

        Ok(())
    }

    async fn retry_or_park(
        &self,
        message: &Message,
        request: &ExecutionRequest,
        err: WorkerError,
    ) -> queue::Result<()> {
        if message.attempts < MAX_ATTEMPTS {
            warn!(
                invocation_id = %request.invocation_id,
                attempts = message.attempts,
                error = %err,
                "attempt failed, requeueing"
            );
            // The invocation stays RUNNING; the next attempt rewrites the
            // terminal state.
            return self.queue.nack(message).await;
        }

        error!(
            invocation_id = %request.invocation_id,
            attempts = message.attempts,
            error = %err,
            "retries exhausted, dead-lettering"
        );

        // Best effort: the message is parked either way, and the invocation
        // must not be left RUNNING forever.
        if let Err(e) = self
            .write_failure(
                &request.invocation_id,
                ExecutionError::new(
                    error_kind::RETRY_EXHAUSTED,
                    format!("max retries exceeded: {err}"),
                ),
            )
            .await
        {
            error!(invocation_id = %request.invocation_id, error = %e, "failed to record retry exhaustion");
        }

        self.queue
            .dead_letter(message, &format!("max retries exceeded: {err}"))
            .await
    }

    async fn handle(&self, request: &ExecutionRequest) -> Result<(), WorkerError> {
        // The execution may still be able to proceed when this write fails;
        // the terminal write retries the row anyway.
        if let Err(e) = self.mark_running(&request.invocation_id).await {
            warn!(
                invocation_id = %request.invocation_id,
                error = %e,
                "could not mark invocation running"
            );
        }

        let function = match self.store.get_function(&request.function_id).await {
            Ok(function) => function,
            Err(MetadataError::NotFound { .. }) => {
                // Deleted between enqueue and dequeue. Terminal, not worth a
                // retry.
                self.write_failure(
                    &request.invocation_id,
                    ExecutionError::new(
                        error_kind::FUNCTION_MISSING,
                        format!("function {} not found", request.function_id),
                    ),
                )
                .await?;
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        let code = self.code_store.retrieve(&function.code.location).await?;
        if storage::sha256_hex(&code) != function.code.checksum {
            // A corrupted blob will not heal on redelivery.
            self.write_failure(
                &request.invocation_id,
                ExecutionError::new(
                    error_kind::CODE_FETCH_FAILED,
                    format!(
                        "code checksum mismatch for function {}",
                        request.function_id
                    ),
                ),
            )
            .await?;
            return Ok(());
        }

        let timeout = request.timeout.unwrap_or(function.config.timeout);
        let spec = ExecutionSpec {
            function_id: function.id.clone(),
            runtime: function.runtime.as_str().to_string(),
            code,
            handler: function.handler.clone(),
            payload: serde_json::to_vec(&request.payload).unwrap_or_default(),
            environment: function.config.environment.clone(),
            timeout,
            limits: ResourceLimits {
                memory_bytes: function.config.memory_mb as i64 * 1024 * 1024,
                cpu_shares: 0,
            },
        };

        let result = self.runtime.execute(spec).await?;
        self.finish(&request.invocation_id, &result).await?;

        info!(
            invocation_id = %request.invocation_id,
            status = %result.status,
            duration_ms = result.metrics.duration.as_millis() as u64,
            "execution finished"
        );
        Ok(())
    }

    async fn mark_running(&self, invocation_id: &str) -> Result<(), MetadataError> {
        let mut invocation = self.store.get_invocation(invocation_id).await?;
        if invocation.status.is_terminal() {
            // Redelivered after a crash between terminal write and ack.
            return Ok(());
        }
        invocation.status = ExecutionStatus::Running;
        if invocation.started_at.is_none() {
            invocation.started_at = Some(Utc::now());
        }
        self.store.update_invocation(&invocation).await
    }

    /// Terminal write for an execution outcome. Idempotent: a redelivered
    /// message writes the same terminal content again and keeps the original
    /// completion time.
    async fn finish(
        &self,
        invocation_id: &str,
        result: &ExecutionResult,
    ) -> Result<(), MetadataError> {
        let mut invocation = self.store.get_invocation(invocation_id).await?;
        let now = Utc::now();

        invocation.status = result.status;
        invocation.result =
            (result.status == ExecutionStatus::Completed).then(|| result.result.clone());
        invocation.error = result.error.clone();
        invocation.metrics = Some(result.metrics.clone());
        if invocation.started_at.is_none() {
            invocation.started_at = Some(now);
        }
        if invocation.completed_at.is_none() {
            invocation.completed_at = Some(now);
        }

        self.store.update_invocation(&invocation).await
    }

    /// Terminal failure without an execution result (function missing, bad
    /// code blob, retries exhausted).
    async fn write_failure(
        &self,
        invocation_id: &str,
        error: ExecutionError,
    ) -> Result<(), MetadataError> {
        let mut invocation = self.store.get_invocation(invocation_id).await?;
        let now = Utc::now();

        invocation.status = ExecutionStatus::Failed;
        invocation.result = None;
        invocation.error = Some(error);
        if invocation.started_at.is_none() {
            invocation.started_at = Some(now);
        }
        if invocation.completed_at.is_none() {
            invocation.completed_at = Some(now);
        }

        self.store.update_invocation(&invocation).await
    }
}

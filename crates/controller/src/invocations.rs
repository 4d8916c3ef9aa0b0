//! Asynchronous invocation entry point and result reads.

use crate::error::{ControllerError, Result};
use chrono::{DateTime, TimeDelta, Utc};
use metadata::{
    ExecutionRequest, ExecutionStatus, Invocation, InvocationFilter, MetadataError, MetadataStore,
    EXECUTION_QUEUE,
};
use queue::Queue;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct InvokeRequest {
    pub function_id: String,
    pub payload: serde_json::Value,
    pub headers: HashMap<String, String>,
    pub timeout: Option<Duration>,
}

/// What the caller gets back from an async invoke; results are read later
/// via `get_result`.
#[derive(Debug, Clone, Serialize)]
pub struct InvocationHandle {
    pub invocation_id: String,
    pub function_id: String,
    pub status: ExecutionStatus,
    pub created_at: DateTime<Utc>,
}

pub struct InvocationService {
    store: Arc<dyn MetadataStore>,
    queue: Arc<dyn Queue>,
}

impl InvocationService {
    pub fn new(store: Arc<dyn MetadataStore>, queue: Arc<dyn Queue>) -> Self {
        Self { store, queue }
    }

    /// Record a PENDING invocation, then enqueue its execution. The row is
    /// durable before the enqueue; if the enqueue fails the row stays
    /// PENDING for the sweeper to pick up.
    pub async fn invoke_async(&self, request: InvokeRequest) -> Result<InvocationHandle> {
        // Fail fast on unknown functions; nothing invalid enters the queue.
        let function = self.store.get_function(&request.function_id).await?;

        let invocation = Invocation {
            id: uuid::Uuid::new_v4().to_string(),
            function_id: request.function_id.clone(),
            payload: request.payload.clone(),
            headers: request.headers.clone(),
            status: ExecutionStatus::Pending,
            result: None,
            error: None,
            metrics: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        };
        self.store.create_invocation(&invocation).await?;

        self.enqueue(&invocation, request.timeout.or(Some(function.config.timeout)))
            .await?;

        info!(
            invocation_id = %invocation.id,
            function_id = %request.function_id,
            function_name = %function.name,
            "function invoked"
        );

        Ok(InvocationHandle {
            invocation_id: invocation.id,
            function_id: request.function_id,
            status: ExecutionStatus::Pending,
            created_at: invocation.created_at,
        })
    }

    pub async fn get_result(&self, invocation_id: &str) -> Result<Invocation> {
        Ok(self.store.get_invocation(invocation_id).await?)
    }

    pub async fn list(&self, filter: &InvocationFilter) -> Result<Vec<Invocation>> {
        Ok(self.store.list_invocations(filter).await?)
    }

    /// Re-enqueue PENDING invocations older than `older_than`. These are
    /// rows whose original enqueue failed (or whose message was lost);
    /// returns how many were requeued. Runs on demand, not as a daemon.
    pub async fn sweep_pending(&self, older_than: Duration) -> Result<u64> {
        let cutoff = Utc::now()
            - TimeDelta::from_std(older_than)
                .map_err(|e| ControllerError::validation(format!("invalid threshold: {e}")))?;

        let pending = self
            .store
            .list_invocations(&InvocationFilter {
                status: Some(ExecutionStatus::Pending),
                ..Default::default()
            })
            .await?;

        let mut requeued = 0;
        for invocation in pending {
            if invocation.created_at >= cutoff {
                continue;
            }
            // The function may be long gone; the worker settles that case.
            match self.enqueue(&invocation, None).await {
                Ok(()) => {
                    requeued += 1;
                    info!(invocation_id = %invocation.id, "requeued orphaned invocation");
                }
                Err(e) => {
                    warn!(invocation_id = %invocation.id, error = %e, "failed to requeue invocation");
                }
            }
        }

        Ok(requeued)
    }

    async fn enqueue(
        &self,
        invocation: &Invocation,
        timeout: Option<Duration>,
    ) -> Result<()> {
        let request = ExecutionRequest {
            invocation_id: invocation.id.clone(),
            function_id: invocation.function_id.clone(),
            payload: invocation.payload.clone(),
            headers: invocation.headers.clone(),
            timeout,
        };
        let payload = serde_json::to_vec(&request)
            .map_err(|e| MetadataError::Internal(format!("failed to encode request: {e}")))?;

        let headers = HashMap::from([
            ("invocation_id".to_string(), invocation.id.clone()),
            ("function_id".to_string(), invocation.function_id.clone()),
        ]);

        self.queue.enqueue(EXECUTION_QUEUE, payload, headers).await?;
        Ok(())
    }
}

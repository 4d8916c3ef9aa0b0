//! Sea-ORM backed metadata store (Postgres in production deployments).

use crate::entity::{functions, invocations};
use crate::error::{MetadataError, Result};
use crate::model::{
    ExecutionError, ExecutionMetrics, ExecutionStatus, Function, FunctionCode, FunctionConfig,
    FunctionFilter, Invocation, InvocationFilter,
};
use crate::MetadataStore;
use async_trait::async_trait;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, Database, DatabaseConnection, DbErr, EntityTrait, QueryFilter,
    QueryOrder, QuerySelect, Set, SqlErr,
};
use std::time::Duration;
use tracing::debug;

pub struct SeaOrmMetadataStore {
    db: DatabaseConnection,
}

impl SeaOrmMetadataStore {
    pub async fn connect(url: &str) -> Result<Self> {
        let db = Database::connect(url)
            .await
            .map_err(|e| MetadataError::Internal(format!("database connection failed: {e}")))?;
        debug!("metadata store connected");
        Ok(Self { db })
    }

    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }
}

fn conflict_or_internal(e: DbErr, conflict: impl FnOnce() -> String) -> MetadataError {
    match e.sql_err() {
        Some(SqlErr::UniqueConstraintViolation(_)) => MetadataError::Conflict(conflict()),
        _ => MetadataError::Internal(e.to_string()),
    }
}

fn internal(e: DbErr) -> MetadataError {
    MetadataError::Internal(e.to_string())
}

fn parse_json_map(text: &str) -> Result<std::collections::HashMap<String, String>> {
    if text.is_empty() {
        return Ok(Default::default());
    }
    serde_json::from_str(text).map_err(|e| MetadataError::Internal(format!("corrupt row: {e}")))
}

fn to_json(value: &impl serde::Serialize) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| "{}".to_string())
}

fn function_from_row(row: functions::Model) -> Result<Function> {
    let runtime = row
        .runtime
        .parse()
        .map_err(|e: String| MetadataError::Internal(format!("corrupt row: {e}")))?;

    Ok(Function {
        id: row.id,
        name: row.name,
        version: row.version,
        runtime,
        handler: row.handler,
        code: FunctionCode {
            location: row.code_location,
            checksum: row.code_checksum,
            size: row.code_size,
        },
        config: FunctionConfig {
            timeout: Duration::from_secs(row.timeout_seconds.max(0) as u64),
            memory_mb: row.memory_mb.max(0) as u32,
            concurrency: row.max_concurrency.max(0) as u32,
            environment: parse_json_map(&row.environment)?,
        },
        metadata: parse_json_map(&row.metadata)?,
        created_at: row.created_at,
        updated_at: row.updated_at,
    })
}

fn function_to_row(f: &Function) -> functions::ActiveModel {
    functions::ActiveModel {
        id: Set(f.id.clone()),
        name: Set(f.name.clone()),
        version: Set(f.version.clone()),
        runtime: Set(f.runtime.as_str().to_string()),
        handler: Set(f.handler.clone()),
        code_location: Set(f.code.location.clone()),
        code_checksum: Set(f.code.checksum.clone()),
        code_size: Set(f.code.size),
        timeout_seconds: Set(f.config.timeout.as_secs() as i64),
        memory_mb: Set(f.config.memory_mb as i32),
        max_concurrency: Set(f.config.concurrency as i32),
        environment: Set(to_json(&f.config.environment)),
        metadata: Set(to_json(&f.metadata)),
        created_at: Set(f.created_at),
        updated_at: Set(f.updated_at),
    }
}

fn invocation_from_row(row: invocations::Model) -> Result<Invocation> {
    let status: ExecutionStatus = row
        .status
        .parse()
        .map_err(|e: String| MetadataError::Internal(format!("corrupt row: {e}")))?;

    let payload = serde_json::from_str(&row.payload)
        .map_err(|e| MetadataError::Internal(format!("corrupt row: {e}")))?;

    let error = row.error_type.map(|kind| ExecutionError {
        kind,
        message: row.error_message.unwrap_or_default(),
        stack: row.error_stack.unwrap_or_default(),
    });

    let metrics = row.duration_ns.map(|duration_ns| ExecutionMetrics {
        duration: Duration::from_nanos(duration_ns.max(0) as u64),
        cpu_time: Duration::from_nanos(row.cpu_time_ns.unwrap_or(0).max(0) as u64),
        memory_peak: row.memory_peak.unwrap_or(0),
        network_in: row.network_in.unwrap_or(0),
        network_out: row.network_out.unwrap_or(0),
    });

    Ok(Invocation {
        id: row.id,
        function_id: row.function_id,
        payload,
        headers: parse_json_map(&row.headers)?,
        status,
        result: row.result,
        error,
        metrics,
        created_at: row.created_at,
        started_at: row.started_at,
        completed_at: row.completed_at,
    })
}

fn invocation_to_row(i: &Invocation) -> invocations::ActiveModel {
    invocations::ActiveModel {
        id: Set(i.id.clone()),
        function_id: Set(i.function_id.clone()),
        payload: Set(i.payload.to_string()),
        headers: Set(to_json(&i.headers)),
        status: Set(i.status.as_str().to_string()),
        result: Set(i.result.clone()),
        error_type: Set(i.error.as_ref().map(|e| e.kind.clone())),
        error_message: Set(i.error.as_ref().map(|e| e.message.clone())),
        error_stack: Set(i.error.as_ref().map(|e| e.stack.clone())),
        duration_ns: Set(i.metrics.as_ref().map(|m| m.duration.as_nanos() as i64)),
        cpu_time_ns: Set(i.metrics.as_ref().map(|m| m.cpu_time.as_nanos() as i64)),
        memory_peak: Set(i.metrics.as_ref().map(|m| m.memory_peak)),
        network_in: Set(i.metrics.as_ref().map(|m| m.network_in)),
        network_out: Set(i.metrics.as_ref().map(|m| m.network_out)),
        created_at: Set(i.created_at),
        started_at: Set(i.started_at),
        completed_at: Set(i.completed_at),
    }
}

#[async_trait]
impl MetadataStore for SeaOrmMetadataStore {
    async fn create_function(&self, function: &Function) -> Result<()> {
        let name = function.name.clone();
        let version = function.version.clone();
        functions::Entity::insert(function_to_row(function))
            .exec(&self.db)
            .await
            .map_err(|e| {
                conflict_or_internal(e, || format!("function {name}:{version} already exists"))
            })?;
        Ok(())
    }

    async fn get_function(&self, id: &str) -> Result<Function> {
        let row = functions::Entity::find_by_id(id.to_string())
            .one(&self.db)
            .await
            .map_err(internal)?
            .ok_or_else(|| MetadataError::not_found("function", id))?;
        function_from_row(row)
    }

    async fn get_function_by_name(&self, name: &str, version: &str) -> Result<Function> {
        let row = functions::Entity::find()
            .filter(functions::Column::Name.eq(name))
            .filter(functions::Column::Version.eq(version))
            .one(&self.db)
            .await
            .map_err(internal)?
            .ok_or_else(|| MetadataError::not_found("function", format!("{name}:{version}")))?;
        function_from_row(row)
    }

    async fn update_function(&self, function: &Function) -> Result<()> {
        match function_to_row(function).update(&self.db).await {
            Ok(_) => Ok(()),
            Err(DbErr::RecordNotUpdated) => {
                Err(MetadataError::not_found("function", function.id.clone()))
            }
            Err(e) => Err(internal(e)),
        }
    }

    async fn delete_function(&self, id: &str) -> Result<()> {
        let res = functions::Entity::delete_by_id(id.to_string())
            .exec(&self.db)
            .await
            .map_err(internal)?;
        if res.rows_affected == 0 {
            return Err(MetadataError::not_found("function", id));
        }
        Ok(())
    }

    async fn list_functions(&self, filter: &FunctionFilter) -> Result<Vec<Function>> {
        let mut query = functions::Entity::find();
        if let Some(runtime) = filter.runtime {
            query = query.filter(functions::Column::Runtime.eq(runtime.as_str()));
        }

        let rows = query
            .order_by_desc(functions::Column::CreatedAt)
            .order_by_desc(functions::Column::Id)
            .limit(filter.limit)
            .offset(filter.offset)
            .all(&self.db)
            .await
            .map_err(internal)?;

        rows.into_iter().map(function_from_row).collect()
    }

    async fn create_invocation(&self, invocation: &Invocation) -> Result<()> {
        let id = invocation.id.clone();
        invocations::Entity::insert(invocation_to_row(invocation))
            .exec(&self.db)
            .await
            .map_err(|e| conflict_or_internal(e, || format!("invocation {id} already exists")))?;
        Ok(())
    }

    async fn get_invocation(&self, id: &str) -> Result<Invocation> {
        let row = invocations::Entity::find_by_id(id.to_string())
            .one(&self.db)
            .await
            .map_err(internal)?
            .ok_or_else(|| MetadataError::not_found("invocation", id))?;
        invocation_from_row(row)
    }

    async fn update_invocation(&self, invocation: &Invocation) -> Result<()> {
        // Terminal states absorb: a late non-terminal write (e.g. the RUNNING
        // transition of a redelivered message) must not regress the row.
        let current = self.get_invocation(&invocation.id).await?;
        if current.status.is_terminal() && !invocation.status.is_terminal() {
            debug!(
                invocation_id = %invocation.id,
                current = %current.status,
                attempted = %invocation.status,
                "ignoring non-terminal write against terminal invocation"
            );
            return Ok(());
        }

        match invocation_to_row(invocation).update(&self.db).await {
            Ok(_) => Ok(()),
            Err(DbErr::RecordNotUpdated) => {
                Err(MetadataError::not_found("invocation", invocation.id.clone()))
            }
            Err(e) => Err(internal(e)),
        }
    }

    async fn list_invocations(&self, filter: &InvocationFilter) -> Result<Vec<Invocation>> {
        let mut query = invocations::Entity::find();
        if let Some(function_id) = &filter.function_id {
            query = query.filter(invocations::Column::FunctionId.eq(function_id.clone()));
        }
        if let Some(status) = filter.status {
            query = query.filter(invocations::Column::Status.eq(status.as_str()));
        }

        let rows = query
            .order_by_desc(invocations::Column::CreatedAt)
            .order_by_desc(invocations::Column::Id)
            .limit(filter.limit)
            .offset(filter.offset)
            .all(&self.db)
            .await
            .map_err(internal)?;

        rows.into_iter().map(invocation_from_row).collect()
    }
}

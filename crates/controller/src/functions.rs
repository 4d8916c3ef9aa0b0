//! Function lifecycle: validate, checksum, store code, persist the row.

use crate::error::{ControllerError, Result};
use chrono::Utc;
use metadata::{
    Function, FunctionCode, FunctionConfig, FunctionFilter, MetadataStore, RuntimeKind,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use storage::CodeStore;
use tracing::{error, info};

#[derive(Debug, Clone)]
pub struct CreateFunctionRequest {
    pub name: String,
    pub version: String,
    pub runtime: RuntimeKind,
    pub handler: String,
    pub code: Vec<u8>,
    pub timeout: Duration,
    pub memory_mb: u32,
    pub concurrency: u32,
    pub environment: HashMap<String, String>,
    pub metadata: HashMap<String, String>,
}

/// All fields optional; only the provided ones change.
#[derive(Debug, Clone, Default)]
pub struct UpdateFunctionRequest {
    pub handler: Option<String>,
    pub code: Option<Vec<u8>>,
    pub timeout: Option<Duration>,
    pub memory_mb: Option<u32>,
    pub concurrency: Option<u32>,
    pub environment: Option<HashMap<String, String>>,
}

pub struct FunctionService {
    store: Arc<dyn MetadataStore>,
    code_store: Arc<dyn CodeStore>,
}

impl FunctionService {
    pub fn new(store: Arc<dyn MetadataStore>, code_store: Arc<dyn CodeStore>) -> Self {
        Self { store, code_store }
    }

    pub async fn create(&self, request: CreateFunctionRequest) -> Result<Function> {
        validate_create(&request)?;

        let function_id = uuid::Uuid::new_v4().to_string();
        let checksum = storage::sha256_hex(&request.code);
        let location = self.code_store.store(&function_id, &request.code).await?;

        let now = Utc::now();
        let function = Function {
            id: function_id.clone(),
            name: request.name,
            version: request.version,
            runtime: request.runtime,
            handler: request.handler,
            code: FunctionCode {
                location: location.clone(),
                checksum,
                size: request.code.len() as i64,
            },
            config: FunctionConfig {
                timeout: request.timeout,
                memory_mb: request.memory_mb,
                concurrency: request.concurrency,
                environment: request.environment,
            },
            metadata: request.metadata,
            created_at: now,
            updated_at: now,
        };

        if let Err(e) = self.store.create_function(&function).await {
            // The blob has no owner without a row; best-effort cleanup.
            if let Err(cleanup) = self.code_store.delete(&location).await {
                error!(function_id = %function_id, error = %cleanup, "failed to clean up code blob");
            }
            return Err(e.into());
        }

        info!(
            function_id = %function.id,
            name = %function.name,
            version = %function.version,
            runtime = %function.runtime,
            "function created"
        );
        Ok(function)
    }

    pub async fn get(&self, id: &str) -> Result<Function> {
        Ok(self.store.get_function(id).await?)
    }

    pub async fn get_by_name(&self, name: &str, version: &str) -> Result<Function> {
        Ok(self.store.get_function_by_name(name, version).await?)
    }

    pub async fn update(&self, id: &str, request: UpdateFunctionRequest) -> Result<Function> {
        let mut function = self.store.get_function(id).await?;

        if let Some(handler) = request.handler {
            if handler.is_empty() {
                return Err(ControllerError::validation("handler is required"));
            }
            function.handler = handler;
        }
        if let Some(timeout) = request.timeout {
            if timeout.is_zero() {
                return Err(ControllerError::validation("timeout must be positive"));
            }
            function.config.timeout = timeout;
        }
        if let Some(memory_mb) = request.memory_mb {
            if memory_mb == 0 {
                return Err(ControllerError::validation("memory must be positive"));
            }
            function.config.memory_mb = memory_mb;
        }
        if let Some(concurrency) = request.concurrency {
            if concurrency == 0 {
                return Err(ControllerError::validation("concurrency must be positive"));
            }
            function.config.concurrency = concurrency;
        }
        if let Some(environment) = request.environment {
            function.config.environment = environment;
        }

        if let Some(code) = request.code {
            if code.is_empty() {
                return Err(ControllerError::validation("function code is required"));
            }
            // New blob replaces the old at the same location.
            let location = self.code_store.store(id, &code).await?;
            function.code = FunctionCode {
                location,
                checksum: storage::sha256_hex(&code),
                size: code.len() as i64,
            };
        }

        function.updated_at = Utc::now();
        self.store.update_function(&function).await?;

        info!(function_id = %id, name = %function.name, "function updated");
        Ok(function)
    }

    /// Delete the row first, then the blob. A failed blob delete leaves
    /// garbage, not broken metadata; in-flight invocations that already
    /// fetched the code are unaffected.
    pub async fn delete(&self, id: &str) -> Result<()> {
        let function = self.store.get_function(id).await?;
        self.store.delete_function(id).await?;

        if let Err(e) = self.code_store.delete(&function.code.location).await {
            error!(
                function_id = %id,
                location = %function.code.location,
                error = %e,
                "failed to delete function code"
            );
        }

        info!(function_id = %id, name = %function.name, "function deleted");
        Ok(())
    }

    pub async fn list(&self, filter: &FunctionFilter) -> Result<Vec<Function>> {
        Ok(self.store.list_functions(filter).await?)
    }
}

fn validate_create(request: &CreateFunctionRequest) -> Result<()> {
    validate_name(&request.name)?;
    validate_version(&request.version)?;
    if request.handler.is_empty() {
        return Err(ControllerError::validation("handler is required"));
    }
    if request.code.is_empty() {
        return Err(ControllerError::validation("function code is required"));
    }
    if request.timeout.is_zero() {
        return Err(ControllerError::validation("timeout must be positive"));
    }
    if request.memory_mb == 0 {
        return Err(ControllerError::validation("memory must be positive"));
    }
    if request.concurrency == 0 {
        return Err(ControllerError::validation("concurrency must be positive"));
    }
    Ok(())
}

fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(ControllerError::validation("function name cannot be empty"));
    }
    if name.len() > 255 {
        return Err(ControllerError::validation(
            "function name too long (max 255 characters)",
        ));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(ControllerError::validation(
            "function name must contain only alphanumeric characters, hyphens, and underscores",
        ));
    }
    Ok(())
}

fn validate_version(version: &str) -> Result<()> {
    let parts: Vec<&str> = version.split('.').collect();
    let valid = parts.len() == 3
        && parts
            .iter()
            .all(|p| !p.is_empty() && p.chars().all(|c| c.is_ascii_digit()));
    if !valid {
        return Err(ControllerError::validation(
            "version must follow semantic versioning (e.g., 1.0.0)",
        ));
    }
    Ok(())
}

//! In-memory metadata store with the same observable semantics as the
//! database-backed one. Used by tests and single-process deployments.

use crate::error::{MetadataError, Result};
use crate::model::{Function, FunctionFilter, Invocation, InvocationFilter};
use crate::MetadataStore;
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

#[derive(Default)]
pub struct MemoryMetadataStore {
    functions: RwLock<HashMap<String, Function>>,
    invocations: RwLock<HashMap<String, Invocation>>,
}

impl MemoryMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn paginate<T>(mut items: Vec<T>, limit: Option<u64>, offset: Option<u64>) -> Vec<T> {
    let offset = offset.unwrap_or(0) as usize;
    if offset >= items.len() {
        return Vec::new();
    }
    items.drain(..offset);
    if let Some(limit) = limit {
        items.truncate(limit as usize);
    }
    items
}

#[async_trait]
impl MetadataStore for MemoryMetadataStore {
    async fn create_function(&self, function: &Function) -> Result<()> {
        let mut functions = self.functions.write().await;
        if functions.contains_key(&function.id) {
            return Err(MetadataError::Conflict(format!(
                "function {} already exists",
                function.id
            )));
        }
        if functions
            .values()
            .any(|f| f.name == function.name && f.version == function.version)
        {
            return Err(MetadataError::Conflict(format!(
                "function {}:{} already exists",
                function.name, function.version
            )));
        }
        functions.insert(function.id.clone(), function.clone());
        Ok(())
    }

    async fn get_function(&self, id: &str) -> Result<Function> {
        self.functions
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| MetadataError::not_found("function", id))
    }

    async fn get_function_by_name(&self, name: &str, version: &str) -> Result<Function> {
        self.functions
            .read()
            .await
            .values()
            .find(|f| f.name == name && f.version == version)
            .cloned()
            .ok_or_else(|| MetadataError::not_found("function", format!("{name}:{version}")))
    }

    async fn update_function(&self, function: &Function) -> Result<()> {
        let mut functions = self.functions.write().await;
        if !functions.contains_key(&function.id) {
            return Err(MetadataError::not_found("function", function.id.clone()));
        }
        functions.insert(function.id.clone(), function.clone());
        Ok(())
    }

    async fn delete_function(&self, id: &str) -> Result<()> {
        self.functions
            .write()
            .await
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| MetadataError::not_found("function", id))
    }

    async fn list_functions(&self, filter: &FunctionFilter) -> Result<Vec<Function>> {
        let functions = self.functions.read().await;
        let mut matched: Vec<Function> = functions
            .values()
            .filter(|f| filter.runtime.map_or(true, |r| f.runtime == r))
            .cloned()
            .collect();
        matched.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(paginate(matched, filter.limit, filter.offset))
    }

    async fn create_invocation(&self, invocation: &Invocation) -> Result<()> {
        let mut invocations = self.invocations.write().await;
        if invocations.contains_key(&invocation.id) {
            return Err(MetadataError::Conflict(format!(
                "invocation {} already exists",
                invocation.id
            )));
        }
        invocations.insert(invocation.id.clone(), invocation.clone());
        Ok(())
    }

    async fn get_invocation(&self, id: &str) -> Result<Invocation> {
        self.invocations
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| MetadataError::not_found("invocation", id))
    }

    async fn update_invocation(&self, invocation: &Invocation) -> Result<()> {
        let mut invocations = self.invocations.write().await;
        let current = invocations
            .get(&invocation.id)
            .ok_or_else(|| MetadataError::not_found("invocation", invocation.id.clone()))?;

        // Terminal states absorb; late non-terminal writes are no-ops.
        if current.status.is_terminal() && !invocation.status.is_terminal() {
            return Ok(());
        }

        invocations.insert(invocation.id.clone(), invocation.clone());
        Ok(())
    }

    async fn list_invocations(&self, filter: &InvocationFilter) -> Result<Vec<Invocation>> {
        let invocations = self.invocations.read().await;
        let mut matched: Vec<Invocation> = invocations
            .values()
            .filter(|i| {
                filter
                    .function_id
                    .as_ref()
                    .map_or(true, |f| &i.function_id == f)
                    && filter.status.map_or(true, |s| i.status == s)
            })
            .cloned()
            .collect();
        matched.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(paginate(matched, filter.limit, filter.offset))
    }
}

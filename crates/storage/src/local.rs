use crate::error::{Result, StorageError};
use crate::CodeStore;
use async_trait::async_trait;
use std::path::{Component, Path, PathBuf};
use tokio::fs;
use tracing::debug;

/// Local-filesystem code store. Blobs live at `<base>/<function_id>/code`;
/// the location string stored on the function row is the path relative to
/// `base`, so the base directory can move between deployments.
pub struct LocalCodeStore {
    base: PathBuf,
}

impl LocalCodeStore {
    pub async fn new(base: impl Into<PathBuf>) -> Result<Self> {
        let base = base.into();
        fs::create_dir_all(&base).await?;
        Ok(Self { base })
    }

    /// Resolve a stored location to an absolute path, rejecting locations
    /// that would escape the base directory.
    fn resolve(&self, location: &str) -> Result<PathBuf> {
        let rel = Path::new(location);
        let escapes = rel
            .components()
            .any(|c| !matches!(c, Component::Normal(_)));
        if location.is_empty() || escapes {
            return Err(StorageError::InvalidLocation(location.to_string()));
        }
        Ok(self.base.join(rel))
    }
}

#[async_trait]
impl CodeStore for LocalCodeStore {
    async fn store(&self, function_id: &str, code: &[u8]) -> Result<String> {
        let dir = self.base.join(function_id);
        fs::create_dir_all(&dir).await?;

        let path = dir.join("code");
        fs::write(&path, code).await?;

        debug!(function_id, bytes = code.len(), "stored function code");
        Ok(format!("{function_id}/code"))
    }

    async fn retrieve(&self, location: &str) -> Result<Vec<u8>> {
        let path = self.resolve(location)?;
        match fs::read(&path).await {
            Ok(code) => Ok(code),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StorageError::NotFound(location.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(&self, location: &str) -> Result<()> {
        let path = self.resolve(location)?;
        // The blob's parent is the per-function directory; remove the whole
        // directory so stale staging artifacts cannot accumulate.
        let dir = path.parent().unwrap_or(&path);
        if !dir.exists() {
            return Err(StorageError::NotFound(location.to_string()));
        }
        fs::remove_dir_all(dir).await?;
        debug!(location, "deleted function code");
        Ok(())
    }
}

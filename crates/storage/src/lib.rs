//! Code store: blob storage for function source code.
//!
//! Functions carry an opaque `location` string that only this crate knows how
//! to resolve. The local backend keeps one blob per function id; reads are
//! consistent as soon as the corresponding write has returned.

pub mod checksum;
pub mod error;
pub mod local;

pub use checksum::sha256_hex;
pub use error::{Result, StorageError};
pub use local::LocalCodeStore;

use async_trait::async_trait;

/// Blob storage for function code, keyed by function id.
#[async_trait]
pub trait CodeStore: Send + Sync {
    /// Store `code` for `function_id` and return the opaque location the
    /// metadata row should carry. Overwrites any previous blob for the id.
    async fn store(&self, function_id: &str, code: &[u8]) -> Result<String>;

    /// Retrieve the blob at `location`.
    async fn retrieve(&self, location: &str) -> Result<Vec<u8>>;

    /// Delete the blob at `location`. Deleting an absent blob is an error so
    /// callers can log it; callers treat deletion as best-effort.
    async fn delete(&self, location: &str) -> Result<()>;
}

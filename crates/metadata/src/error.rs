use thiserror::Error;

#[derive(Error, Debug)]
pub enum MetadataError {
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("metadata store error: {0}")]
    Internal(String),
}

impl MetadataError {
    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity,
            id: id.into(),
        }
    }

    /// True for errors a caller may retry; `NotFound` and `Conflict` are
    /// definitive and must not be retried.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Internal(_))
    }
}

pub type Result<T> = std::result::Result<T, MetadataError>;

use metadata::MetadataError;
use queue::QueueError;
use storage::StorageError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ControllerError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error(transparent)]
    Metadata(#[from] MetadataError),

    #[error("code storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("queue error: {0}")]
    Queue(#[from] QueueError),
}

impl ControllerError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }
}

pub type Result<T> = std::result::Result<T, ControllerError>;

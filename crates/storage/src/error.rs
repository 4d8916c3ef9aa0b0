use thiserror::Error;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("code not found at {0}")]
    NotFound(String),

    #[error("invalid location {0}")]
    InvalidLocation(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, StorageError>;

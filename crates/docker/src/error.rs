use thiserror::Error;

#[derive(Error, Debug)]
pub enum DockerError {
    #[error("Docker connection failed: {0}")]
    ConnectionError(String),

    #[error("Image not found: {0}")]
    ImageNotFound(String),

    #[error("Container operation failed: {0}")]
    ContainerError(String),

    #[error("Docker API error: {0}")]
    BollardError(#[from] bollard::errors::Error),
}

pub type Result<T> = std::result::Result<T, DockerError>;

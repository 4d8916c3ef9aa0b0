use thiserror::Error;

/// Infrastructure failures only. Function-level failures are structured
/// results, never errors.
#[derive(Error, Debug)]
pub enum ExecutorError {
    #[error("staging error: {0}")]
    Staging(#[from] std::io::Error),

    #[error("container error: {0}")]
    Container(#[from] docker::DockerError),
}

pub type Result<T> = std::result::Result<T, ExecutorError>;

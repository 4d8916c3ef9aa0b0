use thiserror::Error;

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("message encoding error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("message {0} was not produced by dequeue")]
    NotDequeued(String),
}

pub type Result<T> = std::result::Result<T, QueueError>;

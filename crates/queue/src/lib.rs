//! Reliable message queue with at-least-once delivery.
//!
//! Each named queue is three buckets: *ready*, *processing* and
//! *dead-letter*. Dequeue atomically moves one message from ready to
//! processing; a message leaves processing only through ack (gone), nack
//! (back to ready, attempts preserved) or dead-letter. A message is in
//! exactly one bucket at any observable point, so a worker crash before
//! ack leaves the message recoverable in processing.

pub mod error;
pub mod memory;
pub mod message;
pub mod redis_queue;

pub use error::{QueueError, Result};
pub use memory::MemoryQueue;
pub use message::{Message, QueueStats, DEAD_LETTERED_AT, DEAD_LETTER_REASON};
pub use redis_queue::RedisQueue;

use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;

#[async_trait]
pub trait Queue: Send + Sync {
    /// Place a new message in the ready bucket of `queue`.
    async fn enqueue(
        &self,
        queue: &str,
        payload: Vec<u8>,
        headers: HashMap<String, String>,
    ) -> Result<()>;

    /// Block up to `timeout` for a message; returns `None` on timeout. The
    /// ready → processing move is atomic and bumps the attempt counter of
    /// the returned message.
    async fn dequeue(&self, queue: &str, timeout: Duration) -> Result<Option<Message>>;

    /// Remove a processed message from the processing bucket.
    async fn ack(&self, message: &Message) -> Result<()>;

    /// Return a message from processing to ready for redelivery. The
    /// attempt counter survives the cycle.
    async fn nack(&self, message: &Message) -> Result<()>;

    /// Move a message from processing to the dead-letter bucket, annotated
    /// with `reason` and a timestamp. Dead-lettered messages are never
    /// redelivered automatically.
    async fn dead_letter(&self, message: &Message, reason: &str) -> Result<()>;

    /// Bucket sizes for `queue`.
    async fn stats(&self, queue: &str) -> Result<QueueStats>;

    /// Move every message in processing back to ready and return the count.
    /// Operator-invoked recovery for messages orphaned by dead workers.
    async fn reclaim(&self, queue: &str) -> Result<u64>;

    /// Dead-lettered messages, newest first.
    async fn dead_letters(&self, queue: &str) -> Result<Vec<Message>>;
}

//! Redis-backed queue.
//!
//! Key layout per named queue:
//! - `<prefix>:queue:<name>` — ready list, head = newest, tail = oldest
//! - `<prefix>:processing:<name>` — in-flight list
//! - `<prefix>:dead_letter:<name>` — parked list
//!
//! Dequeue is a single `BLMOVE` from the ready tail to the processing head,
//! which is the atomic visibility handoff the delivery contract requires.
//! Removals match the exact envelope text that was moved; the two-bucket
//! moves (nack, dead-letter) run as `MULTI`/`EXEC` pipelines.

use crate::error::{QueueError, Result};
use crate::message::{Message, QueueStats, DEAD_LETTERED_AT, DEAD_LETTER_REASON};
use crate::Queue;
use async_trait::async_trait;
use chrono::Utc;
use redis::AsyncCommands;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, warn};

pub struct RedisQueue {
    client: redis::Client,
    prefix: String,
}

impl RedisQueue {
    pub fn new(url: &str, prefix: &str) -> Result<Self> {
        let client = redis::Client::open(url)?;
        Ok(Self {
            client,
            prefix: prefix.to_string(),
        })
    }

    fn ready_key(&self, queue: &str) -> String {
        format!("{}:queue:{}", self.prefix, queue)
    }

    fn processing_key(&self, queue: &str) -> String {
        format!("{}:processing:{}", self.prefix, queue)
    }

    fn dead_letter_key(&self, queue: &str) -> String {
        format!("{}:dead_letter:{}", self.prefix, queue)
    }

    fn raw_of(message: &Message) -> Result<&str> {
        message
            .raw
            .as_deref()
            .ok_or_else(|| QueueError::NotDequeued(message.id.clone()))
    }
}

#[async_trait]
impl Queue for RedisQueue {
    async fn enqueue(
        &self,
        queue: &str,
        payload: Vec<u8>,
        headers: HashMap<String, String>,
    ) -> Result<()> {
        let message = Message::new(queue, payload, headers);
        let body = serde_json::to_string(&message)?;

        let mut conn = self.client.get_async_connection().await?;
        let _: i64 = conn.lpush(self.ready_key(queue), body).await?;

        debug!(queue, message_id = %message.id, "enqueued message");
        Ok(())
    }

    async fn dequeue(&self, queue: &str, timeout: Duration) -> Result<Option<Message>> {
        let mut conn = self.client.get_async_connection().await?;

        let moved: Option<String> = redis::cmd("BLMOVE")
            .arg(self.ready_key(queue))
            .arg(self.processing_key(queue))
            .arg("RIGHT")
            .arg("LEFT")
            .arg(timeout.as_secs_f64())
            .query_async(&mut conn)
            .await?;

        let Some(raw) = moved else {
            return Ok(None);
        };

        let mut message: Message = serde_json::from_str(&raw)?;
        message.attempts += 1;
        message.raw = Some(raw);

        debug!(queue, message_id = %message.id, attempts = message.attempts, "dequeued message");
        Ok(Some(message))
    }

    async fn ack(&self, message: &Message) -> Result<()> {
        let raw = Self::raw_of(message)?;
        let mut conn = self.client.get_async_connection().await?;

        let removed: i64 = conn.lrem(self.processing_key(&message.queue), 1, raw).await?;
        if removed == 0 {
            // Someone reclaimed the message while we were processing it;
            // duplicate delivery handles the rest.
            warn!(message_id = %message.id, "ack found no message in processing");
        }
        Ok(())
    }

    async fn nack(&self, message: &Message) -> Result<()> {
        let raw = Self::raw_of(message)?;
        // Re-serialize so the bumped attempt counter survives redelivery.
        let body = serde_json::to_string(message)?;

        let mut conn = self.client.get_async_connection().await?;
        redis::pipe()
            .atomic()
            .lrem(self.processing_key(&message.queue), 1, raw)
            .lpush(self.ready_key(&message.queue), body)
            .query_async::<_, ()>(&mut conn)
            .await?;

        debug!(message_id = %message.id, attempts = message.attempts, "nacked message");
        Ok(())
    }

    async fn dead_letter(&self, message: &Message, reason: &str) -> Result<()> {
        let raw = Self::raw_of(message)?;

        let mut parked = message.clone();
        parked
            .headers
            .insert(DEAD_LETTER_REASON.to_string(), reason.to_string());
        parked
            .headers
            .insert(DEAD_LETTERED_AT.to_string(), Utc::now().to_rfc3339());
        let body = serde_json::to_string(&parked)?;

        let mut conn = self.client.get_async_connection().await?;
        redis::pipe()
            .atomic()
            .lrem(self.processing_key(&message.queue), 1, raw)
            .lpush(self.dead_letter_key(&message.queue), body)
            .query_async::<_, ()>(&mut conn)
            .await?;

        warn!(message_id = %message.id, reason, "dead-lettered message");
        Ok(())
    }

    async fn stats(&self, queue: &str) -> Result<QueueStats> {
        let mut conn = self.client.get_async_connection().await?;

        let size: u64 = conn.llen(self.ready_key(queue)).await?;
        let processing: u64 = conn.llen(self.processing_key(queue)).await?;
        let dead_letter: u64 = conn.llen(self.dead_letter_key(queue)).await?;

        Ok(QueueStats {
            name: queue.to_string(),
            size,
            processing,
            dead_letter,
        })
    }

    async fn reclaim(&self, queue: &str) -> Result<u64> {
        let mut conn = self.client.get_async_connection().await?;
        let mut moved = 0;

        loop {
            let raw: Option<String> = redis::cmd("LMOVE")
                .arg(self.processing_key(queue))
                .arg(self.ready_key(queue))
                .arg("RIGHT")
                .arg("LEFT")
                .query_async(&mut conn)
                .await?;
            if raw.is_none() {
                break;
            }
            moved += 1;
        }

        if moved > 0 {
            warn!(queue, moved, "reclaimed in-flight messages");
        }
        Ok(moved)
    }

    async fn dead_letters(&self, queue: &str) -> Result<Vec<Message>> {
        let mut conn = self.client.get_async_connection().await?;
        let bodies: Vec<String> = conn.lrange(self.dead_letter_key(queue), 0, -1).await?;

        bodies
            .iter()
            .map(|body| serde_json::from_str(body).map_err(QueueError::from))
            .collect()
    }
}

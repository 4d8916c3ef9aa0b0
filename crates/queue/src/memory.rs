//! In-memory queue with the same bucket semantics as the redis backend.
//! Used by tests and single-process deployments.

use crate::error::Result;
use crate::message::{Message, QueueStats, DEAD_LETTERED_AT, DEAD_LETTER_REASON};
use crate::Queue;
use async_trait::async_trait;
use chrono::Utc;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;

#[derive(Default)]
struct Buckets {
    ready: VecDeque<Message>,
    processing: Vec<Message>,
    dead_letter: Vec<Message>,
}

#[derive(Default)]
pub struct MemoryQueue {
    queues: Mutex<HashMap<String, Buckets>>,
    ready_signal: Notify,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Queue for MemoryQueue {
    async fn enqueue(
        &self,
        queue: &str,
        payload: Vec<u8>,
        headers: HashMap<String, String>,
    ) -> Result<()> {
        let message = Message::new(queue, payload, headers);
        self.queues
            .lock()
            .await
            .entry(queue.to_string())
            .or_default()
            .ready
            .push_back(message);
        self.ready_signal.notify_waiters();
        Ok(())
    }

    async fn dequeue(&self, queue: &str, timeout: Duration) -> Result<Option<Message>> {
        let deadline = Instant::now() + timeout;

        loop {
            {
                let mut queues = self.queues.lock().await;
                let buckets = queues.entry(queue.to_string()).or_default();
                if let Some(mut message) = buckets.ready.pop_front() {
                    message.attempts += 1;
                    buckets.processing.push(message.clone());
                    return Ok(Some(message));
                }
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            // Either a new message arrives or the poll window closes.
            let _ = tokio::time::timeout(remaining, self.ready_signal.notified()).await;
        }
    }

    async fn ack(&self, message: &Message) -> Result<()> {
        let mut queues = self.queues.lock().await;
        let buckets = queues.entry(message.queue.clone()).or_default();
        buckets.processing.retain(|m| m.id != message.id);
        Ok(())
    }

    async fn nack(&self, message: &Message) -> Result<()> {
        let mut queues = self.queues.lock().await;
        let buckets = queues.entry(message.queue.clone()).or_default();
        buckets.processing.retain(|m| m.id != message.id);
        // Attempts on `message` were bumped by dequeue and ride along.
        buckets.ready.push_back(message.clone());
        drop(queues);
        self.ready_signal.notify_waiters();
        Ok(())
    }

    async fn dead_letter(&self, message: &Message, reason: &str) -> Result<()> {
        let mut parked = message.clone();
        parked
            .headers
            .insert(DEAD_LETTER_REASON.to_string(), reason.to_string());
        parked
            .headers
            .insert(DEAD_LETTERED_AT.to_string(), Utc::now().to_rfc3339());

        let mut queues = self.queues.lock().await;
        let buckets = queues.entry(message.queue.clone()).or_default();
        buckets.processing.retain(|m| m.id != message.id);
        buckets.dead_letter.push(parked);
        Ok(())
    }

    async fn stats(&self, queue: &str) -> Result<QueueStats> {
        let mut queues = self.queues.lock().await;
        let buckets = queues.entry(queue.to_string()).or_default();
        Ok(QueueStats {
            name: queue.to_string(),
            size: buckets.ready.len() as u64,
            processing: buckets.processing.len() as u64,
            dead_letter: buckets.dead_letter.len() as u64,
        })
    }

    async fn reclaim(&self, queue: &str) -> Result<u64> {
        let mut queues = self.queues.lock().await;
        let buckets = queues.entry(queue.to_string()).or_default();
        let moved = buckets.processing.len() as u64;
        let reclaimed: Vec<Message> = buckets.processing.drain(..).collect();
        buckets.ready.extend(reclaimed);
        drop(queues);
        if moved > 0 {
            self.ready_signal.notify_waiters();
        }
        Ok(moved)
    }

    async fn dead_letters(&self, queue: &str) -> Result<Vec<Message>> {
        let mut queues = self.queues.lock().await;
        let buckets = queues.entry(queue.to_string()).or_default();
        let mut parked = buckets.dead_letter.clone();
        parked.reverse(); // newest first, like the redis backend
        Ok(parked)
    }
}

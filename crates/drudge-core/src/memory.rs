use crate::{Message, QueueClient, QueueError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use parking_lot::RwLock;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

struct StoredMessage {
    message: Message,
    visible_at: Instant,
}

struct QueueState {
    visibility_timeout: Duration,
    messages: VecDeque<StoredMessage>,
    deletes: u64,
    lease_extensions: u64,
}

impl QueueState {
    fn find_mut(&mut self, message: &Message) -> Result<&mut StoredMessage> {
        self.messages
            .iter_mut()
            .find(|stored| stored.message.id == message.id && stored.message.receipt == message.receipt)
            .ok_or_else(|| QueueError::StaleReceipt(message.id.to_string()))
    }
}

/// In-process queue with visibility-timeout semantics.
///
/// Fetched messages stay hidden until their lease runs out, then become
/// visible again with a fresh receipt. Useful for tests and local runs.
pub struct InMemoryQueue {
    queues: RwLock<HashMap<String, QueueState>>,
}

impl InMemoryQueue {
    pub fn new() -> Self {
        InMemoryQueue {
            queues: RwLock::new(HashMap::new()),
        }
    }

    /// Create a queue, or update the visibility timeout of an existing one
    pub fn create_queue(&self, name: impl Into<String>, visibility_timeout: Duration) {
        let mut queues = self.queues.write();
        queues
            .entry(name.into())
            .and_modify(|state| state.visibility_timeout = visibility_timeout)
            .or_insert_with(|| QueueState {
                visibility_timeout,
                messages: VecDeque::new(),
                deletes: 0,
                lease_extensions: 0,
            });
    }

    /// Enqueue a message body, returning the stored message
    pub fn send(&self, queue: &str, body: impl Into<Bytes>) -> Result<Message> {
        let mut queues = self.queues.write();
        let state = queues
            .get_mut(queue)
            .ok_or_else(|| QueueError::QueueNotFound(queue.to_string()))?;

        let message = Message::new(queue, body);
        state.messages.push_back(StoredMessage {
            message: message.clone(),
            visible_at: Instant::now(),
        });
        Ok(message)
    }

    /// Messages not yet deleted, visible or not
    pub fn len(&self, queue: &str) -> usize {
        self.queues.read().get(queue).map(|s| s.messages.len()).unwrap_or(0)
    }

    pub fn is_empty(&self, queue: &str) -> bool {
        self.len(queue) == 0
    }

    /// Messages currently hidden by a lease
    pub fn in_flight(&self, queue: &str) -> usize {
        let now = Instant::now();
        self.queues
            .read()
            .get(queue)
            .map(|s| s.messages.iter().filter(|m| m.visible_at > now).count())
            .unwrap_or(0)
    }

    /// Successful deletes on the queue
    pub fn deletes(&self, queue: &str) -> u64 {
        self.queues.read().get(queue).map(|s| s.deletes).unwrap_or(0)
    }

    /// Successful visibility-timeout updates on the queue
    pub fn lease_extensions(&self, queue: &str) -> u64 {
        self.queues.read().get(queue).map(|s| s.lease_extensions).unwrap_or(0)
    }

    pub fn queue_names(&self) -> Vec<String> {
        self.queues.read().keys().cloned().collect()
    }
}

impl Default for InMemoryQueue {
    fn default() -> Self {
        Self::new()
    }
}

fn lease_expiry(timeout: Duration) -> Option<chrono::DateTime<Utc>> {
    chrono::Duration::from_std(timeout).ok().map(|d| Utc::now() + d)
}

#[async_trait]
impl QueueClient for InMemoryQueue {
    async fn fetch(&self, queue: &str, max: usize) -> Result<Vec<Message>> {
        let mut queues = self.queues.write();
        let state = queues
            .get_mut(queue)
            .ok_or_else(|| QueueError::QueueNotFound(queue.to_string()))?;

        let now = Instant::now();
        let timeout = state.visibility_timeout;
        let mut received = Vec::new();

        for stored in state.messages.iter_mut() {
            if received.len() >= max {
                break;
            }
            if stored.visible_at > now {
                continue;
            }

            // Every receive invalidates the previous receipt
            stored.message.receipt = Uuid::new_v4().to_string();
            stored.message.receive_count += 1;
            stored.message.lease_expires_at = lease_expiry(timeout);
            stored.visible_at = now + timeout;
            received.push(stored.message.clone());
        }

        Ok(received)
    }

    async fn delete(&self, message: &Message) -> Result<()> {
        let mut queues = self.queues.write();
        let state = queues
            .get_mut(&message.queue)
            .ok_or_else(|| QueueError::QueueNotFound(message.queue.clone()))?;

        let position = state
            .messages
            .iter()
            .position(|stored| stored.message.id == message.id && stored.message.receipt == message.receipt)
            .ok_or_else(|| QueueError::StaleReceipt(message.id.to_string()))?;

        state.messages.remove(position);
        state.deletes += 1;
        Ok(())
    }

    async fn visibility_timeout(&self, queue: &str) -> Result<Duration> {
        self.queues
            .read()
            .get(queue)
            .map(|s| s.visibility_timeout)
            .ok_or_else(|| QueueError::QueueNotFound(queue.to_string()))
    }

    async fn set_visibility_timeout(&self, message: &Message, timeout: Duration) -> Result<()> {
        let mut queues = self.queues.write();
        let state = queues
            .get_mut(&message.queue)
            .ok_or_else(|| QueueError::QueueNotFound(message.queue.clone()))?;

        let stored = state.find_mut(message)?;
        stored.visible_at = Instant::now() + timeout;
        stored.message.lease_expires_at = lease_expiry(timeout);
        state.lease_extensions += 1;
        Ok(())
    }
}

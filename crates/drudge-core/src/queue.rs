use crate::{Message, Result};
use async_trait::async_trait;
use std::time::Duration;

/// Operations the worker needs from the remote queue service.
#[async_trait]
pub trait QueueClient: Send + Sync {
    /// Receive up to `max` visible messages. Each returned message stays
    /// hidden from other consumers for the queue's visibility timeout.
    async fn fetch(&self, queue: &str, max: usize) -> Result<Vec<Message>>;

    /// Delete a received message so it is never redelivered
    async fn delete(&self, message: &Message) -> Result<()>;

    /// Visibility timeout configured on the queue
    async fn visibility_timeout(&self, queue: &str) -> Result<Duration>;

    /// Hide the message for `timeout` starting now
    async fn set_visibility_timeout(&self, message: &Message, timeout: Duration) -> Result<()>;
}

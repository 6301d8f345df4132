use crate::{QueueError, Result, MAX_BATCH_SIZE};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Unique identifier for a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId(Uuid);

impl MessageId {
    pub fn new() -> Self {
        MessageId(Uuid::new_v4())
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A message received from the remote queue.
///
/// The queue owns the message until it is deleted; a worker only holds it
/// for the duration of one handler invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Stable message identifier
    pub id: MessageId,

    /// Name of the queue the message was fetched from
    pub queue: String,

    /// Raw message body
    pub body: Bytes,

    /// Handle of the current receive, required for delete and lease updates
    pub receipt: String,

    /// How many times the message has been received
    pub receive_count: u32,

    /// When the current visibility lease runs out
    pub lease_expires_at: Option<DateTime<Utc>>,
}

impl Message {
    pub fn new(queue: impl Into<String>, body: impl Into<Bytes>) -> Self {
        Message {
            id: MessageId::new(),
            queue: queue.into(),
            body: body.into(),
            receipt: Uuid::new_v4().to_string(),
            receive_count: 0,
            lease_expires_at: None,
        }
    }

    /// Body as text, replacing invalid UTF-8 sequences
    pub fn body_lossy(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Unit of work handed to a processor: one message or a batch fetched together.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    Single(Message),
    /// Not validated; build batches with [`Delivery::batch`]
    Batch(Vec<Message>),
}

impl Delivery {
    /// Build a batch delivery, rejecting empty or oversized batches
    pub fn batch(messages: Vec<Message>) -> Result<Self> {
        if messages.is_empty() {
            return Err(QueueError::InvalidBatch("batch is empty".to_string()));
        }
        if messages.len() > MAX_BATCH_SIZE {
            return Err(QueueError::InvalidBatch(format!(
                "batch of {} exceeds maximum of {}",
                messages.len(),
                MAX_BATCH_SIZE
            )));
        }
        Ok(Delivery::Batch(messages))
    }

    pub fn is_batch(&self) -> bool {
        matches!(self, Delivery::Batch(_))
    }

    /// Messages in fetch order
    pub fn messages(&self) -> &[Message] {
        match self {
            Delivery::Single(message) => std::slice::from_ref(message),
            Delivery::Batch(messages) => messages,
        }
    }

    pub fn len(&self) -> usize {
        self.messages().len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages().is_empty()
    }

    /// Queue of the first message
    pub fn queue(&self) -> &str {
        self.messages().first().map(|m| m.queue.as_str()).unwrap_or_default()
    }
}

impl From<Message> for Delivery {
    fn from(message: Message) -> Self {
        Delivery::Single(message)
    }
}

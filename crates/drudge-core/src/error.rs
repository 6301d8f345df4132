use thiserror::Error;

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Queue not found: {0}")]
    QueueNotFound(String),

    #[error("Receipt is no longer valid for message {0}")]
    StaleReceipt(String),

    #[error("Invalid batch: {0}")]
    InvalidBatch(String),

    #[error("Transport error: {0}")]
    Transport(String),
}

#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("Invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Codec {0} does not support loading")]
    Unsupported(String),

    #[error("Parser failed: {0}")]
    Parser(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, QueueError>;

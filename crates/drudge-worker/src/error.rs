use drudge_core::QueueError;
use std::path::PathBuf;
use thiserror::Error;

/// Why a `Processor::process` call did not complete normally
#[derive(Error, Debug)]
pub enum ProcessError {
    #[error("No worker registered for queue {0}")]
    UnregisteredQueue(String),

    #[error("Processor for queue {expected} cannot process work for queue {actual}")]
    QueueMismatch { expected: String, actual: String },

    #[error("Processor for queue {0} has been shut down")]
    ShutDown(String),

    #[error("Handler for queue {queue} failed: {source}")]
    Handler {
        queue: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("Failed to delete processed message: {0}")]
    Delete(#[from] QueueError),
}

impl ProcessError {
    /// Errors after which the slot must not take more work
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ProcessError::UnregisteredQueue(_) | ProcessError::QueueMismatch { .. } | ProcessError::ShutDown(_)
        )
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid YAML in config file: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Invalid parser for queue {queue}: {reason}")]
    InvalidParser { queue: String, reason: String },

    #[error("Unknown handler {handler} for queue {queue}")]
    UnknownHandler { queue: String, handler: String },

    #[error("You really should set a logfile if you're going to daemonize")]
    DaemonWithoutLogfile,

    #[error("Invalid logfile path: {0}")]
    InvalidLogfile(PathBuf),

    #[error("Failed to write pid file {path}: {source}")]
    PidFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

use crate::error::ConfigError;
use crate::handler::{LogHandler, SleepHandler};
use drudge_core::{ParserKind, WorkerDescriptor, MAX_BATCH_SIZE};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Hard limit on how long stopping the processors may take
    pub shutdown_timeout_secs: u64,
    /// Lease renewals fire this long before the visibility timeout runs out
    pub lease_safety_margin_secs: u64,
    /// Pause between fetches when a queue came back empty
    pub poll_interval_ms: u64,
    pub log_level: String,
    pub queues: BTreeMap<String, QueueConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Overrides the worker's slot count
    pub concurrency: Option<usize>,
    /// Messages per fetch for batch workers
    pub batch_size: usize,
    /// Visibility timeout used when the queue is created locally
    pub visibility_timeout_secs: u64,
    /// Built-in handler: "log" or "sleep:<millis>"
    pub handler: String,
    pub parser: Option<String>,
    pub auto_delete: bool,
    pub auto_visibility_timeout: bool,
    pub batch: bool,
    /// Bodies enqueued at startup on the in-memory backend
    pub seed_messages: Vec<String>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        WorkerConfig {
            shutdown_timeout_secs: 20,
            lease_safety_margin_secs: 5,
            poll_interval_ms: 1000,
            log_level: "info".to_string(),
            queues: BTreeMap::new(),
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        QueueConfig {
            concurrency: None,
            batch_size: MAX_BATCH_SIZE,
            visibility_timeout_secs: 30,
            handler: "log".to_string(),
            parser: None,
            auto_delete: true,
            auto_visibility_timeout: false,
            batch: false,
            seed_messages: Vec::new(),
        }
    }
}

impl WorkerConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml(&contents)
    }

    pub fn from_yaml(contents: &str) -> Result<Self, ConfigError> {
        let config: WorkerConfig = serde_yaml::from_str(contents)?;
        Ok(config)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    pub fn lease_safety_margin(&self) -> Duration {
        Duration::from_secs(self.lease_safety_margin_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Settings for a queue, falling back to defaults when not configured
    pub fn queue(&self, name: &str) -> QueueConfig {
        self.queues.get(name).cloned().unwrap_or_default()
    }
}

impl QueueConfig {
    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_secs(self.visibility_timeout_secs)
    }

    /// Batch size clamped to what one fetch can return
    pub fn effective_batch_size(&self) -> usize {
        self.batch_size.clamp(1, MAX_BATCH_SIZE)
    }

    pub fn parser_kind(&self, queue: &str) -> Result<ParserKind, ConfigError> {
        match &self.parser {
            Some(name) => name.parse().map_err(|reason| ConfigError::InvalidParser {
                queue: queue.to_string(),
                reason,
            }),
            None => Ok(ParserKind::default()),
        }
    }

    /// Build a descriptor for one of the built-in handlers
    pub fn builtin_descriptor(&self, queue: &str) -> Result<WorkerDescriptor, ConfigError> {
        let builder = match self.handler.split_once(':') {
            None if self.handler == "log" => WorkerDescriptor::builder(queue, LogHandler),
            Some(("sleep", millis)) => {
                let millis: u64 = millis.parse().map_err(|_| ConfigError::UnknownHandler {
                    queue: queue.to_string(),
                    handler: self.handler.clone(),
                })?;
                WorkerDescriptor::builder(queue, SleepHandler::new(Duration::from_millis(millis)))
            }
            _ => {
                return Err(ConfigError::UnknownHandler {
                    queue: queue.to_string(),
                    handler: self.handler.clone(),
                })
            }
        };

        Ok(builder
            .parser(self.parser_kind(queue)?)
            .auto_delete(self.auto_delete)
            .auto_visibility_timeout(self.auto_visibility_timeout)
            .batch(self.batch)
            .concurrency(self.concurrency.unwrap_or(1))
            .build())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = WorkerConfig::default();
        assert_eq!(config.shutdown_timeout(), Duration::from_secs(20));
        assert_eq!(config.lease_safety_margin(), Duration::from_secs(5));

        let queue = config.queue("anything");
        assert_eq!(queue.effective_batch_size(), MAX_BATCH_SIZE);
        assert_eq!(queue.handler, "log");
    }

    #[test]
    fn test_from_yaml() {
        let config = WorkerConfig::from_yaml(
            r#"
shutdown_timeout_secs: 5
queues:
  orders:
    concurrency: 3
    parser: json
    auto_visibility_timeout: true
    handler: "sleep:250"
    batch: true
    batch_size: 50
    seed_messages:
      - '{"id":1}'
"#,
        )
        .unwrap();

        assert_eq!(config.shutdown_timeout_secs, 5);
        assert_eq!(config.poll_interval_ms, 1000);

        let orders = config.queue("orders");
        assert_eq!(orders.effective_batch_size(), MAX_BATCH_SIZE);
        assert_eq!(orders.seed_messages.len(), 1);

        let descriptor = orders.builtin_descriptor("orders").unwrap();
        assert_eq!(descriptor.parser().name(), "json");
        assert_eq!(descriptor.concurrency(), 3);
        assert!(descriptor.batch());
        assert!(descriptor.auto_delete());
        assert!(descriptor.auto_visibility_timeout());
    }

    #[test]
    fn test_invalid_queue_settings() {
        let bad_parser = QueueConfig {
            parser: Some("xml".to_string()),
            ..QueueConfig::default()
        };
        assert!(matches!(
            bad_parser.builtin_descriptor("orders"),
            Err(ConfigError::InvalidParser { .. })
        ));

        let bad_handler = QueueConfig {
            handler: "sleep:soon".to_string(),
            ..QueueConfig::default()
        };
        assert!(matches!(
            bad_handler.builtin_descriptor("orders"),
            Err(ConfigError::UnknownHandler { .. })
        ));
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("drudge.yml");
        std::fs::write(&path, "poll_interval_ms: 10\n").unwrap();

        let config = WorkerConfig::from_file(&path).unwrap();
        assert_eq!(config.poll_interval(), Duration::from_millis(10));

        assert!(matches!(
            WorkerConfig::from_file(dir.path().join("missing.yml")),
            Err(ConfigError::Read { .. })
        ));
    }
}

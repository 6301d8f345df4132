pub mod cli;
pub mod config;
pub mod error;
pub mod fetcher;
pub mod handler;
pub mod lease;
pub mod manager;
pub mod processor;
pub mod registry;
pub mod shutdown;
pub mod signals;

pub use config::{QueueConfig, WorkerConfig};
pub use error::{ConfigError, ProcessError};
pub use lease::{LeaseRenewal, LeaseRenewer};
pub use manager::{Manager, PoolCoordinator, QueueStats, ReadySlots};
pub use processor::{Processor, ResourcePool};
pub use registry::WorkerRegistry;
pub use shutdown::{Lifecycle, Phase, Pool, ShutdownOutcome, ShutdownState};
pub use signals::SignalEvent;

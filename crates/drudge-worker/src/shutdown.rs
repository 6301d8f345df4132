use crate::signals::SignalEvent;
use async_trait::async_trait;
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{info, warn};

pub const DEFAULT_SHUTDOWN_DEADLINE: Duration = Duration::from_secs(20);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum Phase {
    Running = 0,
    Draining = 1,
    Terminated = 2,
}

impl Phase {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Phase::Running,
            1 => Phase::Draining,
            _ => Phase::Terminated,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Running => write!(f, "running"),
            Phase::Draining => write!(f, "draining"),
            Phase::Terminated => write!(f, "terminated"),
        }
    }
}

/// Process-wide shutdown phase; only ever moves forward
#[derive(Debug)]
pub struct ShutdownState {
    phase: AtomicU8,
}

impl ShutdownState {
    pub fn new() -> Self {
        ShutdownState {
            phase: AtomicU8::new(Phase::Running as u8),
        }
    }

    pub fn phase(&self) -> Phase {
        Phase::from_u8(self.phase.load(Ordering::SeqCst))
    }

    /// Move to `to`. Returns false if the state was already there or past it.
    pub fn advance(&self, to: Phase) -> bool {
        let previous = self.phase.fetch_max(to as u8, Ordering::SeqCst);
        previous < to as u8
    }
}

impl Default for ShutdownState {
    fn default() -> Self {
        Self::new()
    }
}

/// The worker pool as seen by the lifecycle
#[async_trait]
pub trait Pool: Send + Sync {
    /// Stop every processor and wait for them
    async fn stop(&self);

    /// Log diagnostic state
    fn dump(&self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownOutcome {
    Graceful,
    DeadlineExceeded,
}

/// Owns the signal channel. The first termination signal drains the pool
/// under a hard deadline; later ones are only logged.
pub struct Lifecycle {
    pool: Arc<dyn Pool>,
    events: UnboundedReceiver<SignalEvent>,
    state: Arc<ShutdownState>,
    deadline: Duration,
}

impl Lifecycle {
    pub fn new(pool: Arc<dyn Pool>, events: UnboundedReceiver<SignalEvent>) -> Self {
        Lifecycle {
            pool,
            events,
            state: Arc::new(ShutdownState::new()),
            deadline: DEFAULT_SHUTDOWN_DEADLINE,
        }
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }

    pub fn state(&self) -> Arc<ShutdownState> {
        self.state.clone()
    }

    /// Block on the signal channel until the worker has been shut down
    pub async fn run(mut self) -> ShutdownOutcome {
        loop {
            match self.events.recv().await {
                Some(event) if event.is_termination() => {
                    return self.drain(&event.to_string()).await;
                }
                Some(event) => {
                    info!("Received {}, dumping worker state", event);
                    self.pool.dump();
                }
                None => {
                    warn!("Signal channel closed");
                    return self.drain("end of signal stream").await;
                }
            }
        }
    }

    async fn drain(&mut self, cause: &str) -> ShutdownOutcome {
        self.state.advance(Phase::Draining);
        info!("Received {}, terminating processors...", cause);

        let pool = self.pool.clone();
        let stopping = pool.clone();
        let stop = tokio::time::timeout(self.deadline, async move { stopping.stop().await });
        tokio::pin!(stop);

        let events = &mut self.events;
        let outcome = loop {
            tokio::select! {
                result = &mut stop => {
                    break match result {
                        Ok(()) => ShutdownOutcome::Graceful,
                        Err(_) => ShutdownOutcome::DeadlineExceeded,
                    };
                }
                Some(event) = events.recv() => {
                    if event.is_termination() {
                        info!("Received {} while {}, ignoring", event, Phase::Draining);
                    } else {
                        pool.dump();
                    }
                }
            }
        };

        self.state.advance(Phase::Terminated);
        match outcome {
            ShutdownOutcome::Graceful => info!("All processors stopped"),
            ShutdownOutcome::DeadlineExceeded => {
                warn!("Processors did not stop within {:?}, exiting anyway", self.deadline)
            }
        }
        outcome
    }
}

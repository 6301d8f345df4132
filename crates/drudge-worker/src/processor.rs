use crate::error::ProcessError;
use crate::lease::{LeaseRenewal, LeaseRenewer, DEFAULT_SAFETY_MARGIN};
use crate::manager::PoolCoordinator;
use crate::registry::WorkerRegistry;
use drudge_core::{decode, Delivery, QueueClient, WorkerDescriptor};
use parking_lot::Mutex as SyncMutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// A pool of external resources (database connections and the like) that
/// handlers borrow from and may not give back.
pub trait ResourcePool: Send + Sync {
    fn name(&self) -> &str;

    /// Return every handle held by the current execution context
    fn release_all(&self);
}

/// Owns one queue slot. One `process` call runs at a time; each keeps the
/// lease alive, decodes, runs the handler, deletes on success when asked to,
/// then releases pooled resources and reports the slot free.
pub struct Processor {
    queue: String,
    registry: Arc<WorkerRegistry>,
    client: Arc<dyn QueueClient>,
    coordinator: Arc<dyn PoolCoordinator>,
    resources: Vec<Arc<dyn ResourcePool>>,
    safety_margin: Duration,
    exclusive: Mutex<()>,
    renewal: SyncMutex<Option<LeaseRenewal>>,
    closed: AtomicBool,
}

impl Processor {
    pub fn new(
        queue: impl Into<String>,
        registry: Arc<WorkerRegistry>,
        client: Arc<dyn QueueClient>,
        coordinator: Arc<dyn PoolCoordinator>,
    ) -> Self {
        let queue = queue.into();
        debug!("Initializing processor for queue {}", queue);

        Processor {
            queue,
            registry,
            client,
            coordinator,
            resources: Vec::new(),
            safety_margin: DEFAULT_SAFETY_MARGIN,
            exclusive: Mutex::new(()),
            renewal: SyncMutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    pub fn with_safety_margin(mut self, safety_margin: Duration) -> Self {
        self.safety_margin = safety_margin;
        self
    }

    pub fn with_resources(mut self, resources: Vec<Arc<dyn ResourcePool>>) -> Self {
        self.resources = resources;
        self
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Whether a `process` call currently holds the slot
    pub fn is_busy(&self) -> bool {
        self.exclusive.try_lock().is_err()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn has_active_renewal(&self) -> bool {
        self.renewal
            .lock()
            .as_ref()
            .map(|renewal| !renewal.is_cancelled())
            .unwrap_or(false)
    }

    /// Run the registered handler against one delivery.
    ///
    /// Calls on the same processor are serialized. Handler failures are
    /// returned as [`ProcessError::Handler`] after cleanup; the messages are
    /// left undeleted so the queue redelivers them once their lease runs out.
    pub async fn process(&self, queue_name: &str, delivery: Delivery) -> Result<(), ProcessError> {
        if queue_name != self.queue {
            return Err(ProcessError::QueueMismatch {
                expected: self.queue.clone(),
                actual: queue_name.to_string(),
            });
        }

        debug!("Processor {} begins processing...", queue_name);
        let mut finished = FinishNotice {
            coordinator: self.coordinator.as_ref(),
            queue: queue_name,
            armed: false,
        };

        let outcome = {
            let _exclusive = self.exclusive.lock().await;
            if self.is_closed() {
                return Err(ProcessError::ShutDown(self.queue.clone()));
            }

            let descriptor = self
                .registry
                .get(queue_name)
                .ok_or_else(|| ProcessError::UnregisteredQueue(queue_name.to_string()))?;
            finished.armed = true;

            let _cleanup = Cleanup { processor: self };
            self.start_renewal(&descriptor, &delivery).await;
            let outcome = self.run(&descriptor, &delivery).await;
            self.stop_renewal().await;
            outcome
        };

        debug!("Processor {} finishes processing...", queue_name);
        outcome
    }

    async fn run(&self, descriptor: &WorkerDescriptor, delivery: &Delivery) -> Result<(), ProcessError> {
        let body = decode(descriptor.parser(), delivery);

        descriptor
            .handler()
            .perform(delivery, body)
            .await
            .map_err(|source| ProcessError::Handler {
                queue: self.queue.clone(),
                source,
            })?;

        if descriptor.auto_delete() {
            self.delete(delivery).await?;
        }
        Ok(())
    }

    async fn delete(&self, delivery: &Delivery) -> Result<(), ProcessError> {
        let mut first_error = None;
        for message in delivery.messages() {
            if let Err(e) = self.client.delete(message).await {
                warn!("Failed to delete message {} from {}: {}", message.id, self.queue, e);
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(ProcessError::Delete(e)),
            None => Ok(()),
        }
    }

    async fn start_renewal(&self, descriptor: &WorkerDescriptor, delivery: &Delivery) {
        if !descriptor.auto_visibility_timeout() {
            return;
        }

        let visibility_timeout = match self.client.visibility_timeout(&self.queue).await {
            Ok(timeout) => timeout,
            Err(e) => {
                warn!("Cannot renew leases on {}, visibility timeout unavailable: {}", self.queue, e);
                return;
            }
        };

        let renewal = LeaseRenewer::start(
            self.client.clone(),
            delivery.clone(),
            visibility_timeout,
            self.safety_margin,
        );
        *self.renewal.lock() = renewal;
    }

    async fn stop_renewal(&self) {
        let renewal = self.renewal.lock().take();
        if let Some(renewal) = renewal {
            renewal.stop().await;
        }
    }

    /// Close the slot: cancel any active renewal and refuse further work
    pub fn shutdown(&self) {
        debug!("Processor for queue {} shutting down...", self.queue);
        self.closed.store(true, Ordering::SeqCst);
        if let Some(renewal) = self.renewal.lock().take() {
            renewal.cancel();
        }
    }
}

/// Runs on every exit from an invocation, panics included
struct Cleanup<'a> {
    processor: &'a Processor,
}

impl Drop for Cleanup<'_> {
    fn drop(&mut self) {
        if let Some(renewal) = self.processor.renewal.lock().take() {
            renewal.cancel();
        }
        for pool in &self.processor.resources {
            debug!("Releasing {} handles held by {}", pool.name(), self.processor.queue);
            pool.release_all();
        }
    }
}

/// Reports the slot as free once the exclusive region has been left
struct FinishNotice<'a> {
    coordinator: &'a dyn PoolCoordinator,
    queue: &'a str,
    armed: bool,
}

impl Drop for FinishNotice<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.coordinator.processor_finished(self.queue);
        }
    }
}

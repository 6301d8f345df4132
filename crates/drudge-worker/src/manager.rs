use crate::config::WorkerConfig;
use crate::error::ProcessError;
use crate::fetcher::Fetcher;
use crate::processor::{Processor, ResourcePool};
use crate::registry::WorkerRegistry;
use crate::shutdown::Pool;
use async_trait::async_trait;
use dashmap::DashMap;
use drudge_core::{Delivery, QueueClient};
use futures::future::join_all;
use parking_lot::Mutex as SyncMutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Receives a notification whenever a processor slot becomes free
pub trait PoolCoordinator: Send + Sync {
    fn processor_finished(&self, queue: &str);
}

/// Idle-slot counters, one semaphore permit per idle slot
pub struct ReadySlots {
    queues: DashMap<String, Arc<Semaphore>>,
}

impl ReadySlots {
    pub fn new() -> Self {
        ReadySlots {
            queues: DashMap::new(),
        }
    }

    fn register(&self, queue: &str) -> Arc<Semaphore> {
        self.queues
            .entry(queue.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(0)))
            .clone()
    }

    /// Idle slots not yet claimed by the fetcher
    pub fn idle(&self, queue: &str) -> usize {
        self.queues
            .get(queue)
            .map(|ready| ready.available_permits())
            .unwrap_or(0)
    }
}

impl Default for ReadySlots {
    fn default() -> Self {
        Self::new()
    }
}

impl PoolCoordinator for ReadySlots {
    fn processor_finished(&self, queue: &str) {
        match self.queues.get(queue) {
            Some(ready) => ready.add_permits(1),
            None => warn!("Processor finished for unknown queue {}", queue),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub slots: usize,
    pub busy: usize,
    pub processed: u64,
    pub failed: u64,
    pub restarts: u64,
}

struct QueueRuntime {
    processors: SyncMutex<Vec<Option<Arc<Processor>>>>,
    processed: AtomicU64,
    failed: AtomicU64,
    restarts: AtomicU64,
}

impl QueueRuntime {
    fn new(concurrency: usize) -> Self {
        QueueRuntime {
            processors: SyncMutex::new(vec![None; concurrency]),
            processed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            restarts: AtomicU64::new(0),
        }
    }

    fn install(&self, index: usize, processor: Arc<Processor>) {
        self.processors.lock()[index] = Some(processor);
    }

    fn stats(&self) -> QueueStats {
        let processors = self.processors.lock();
        QueueStats {
            slots: processors.len(),
            busy: processors.iter().flatten().filter(|p| p.is_busy()).count(),
            processed: self.processed.load(Ordering::SeqCst),
            failed: self.failed.load(Ordering::SeqCst),
            restarts: self.restarts.load(Ordering::SeqCst),
        }
    }
}

/// Runs and supervises the processors of all registered queues. Each queue
/// gets a [`Fetcher`] that only pulls messages for idle slots.
pub struct Manager {
    config: WorkerConfig,
    registry: Arc<WorkerRegistry>,
    client: Arc<dyn QueueClient>,
    resources: Vec<Arc<dyn ResourcePool>>,
    ready: Arc<ReadySlots>,
    queues: DashMap<String, Arc<QueueRuntime>>,
    cancel: CancellationToken,
    tasks: SyncMutex<Vec<JoinHandle<()>>>,
}

impl Manager {
    pub fn new(config: WorkerConfig, registry: Arc<WorkerRegistry>, client: Arc<dyn QueueClient>) -> Self {
        Manager {
            config,
            registry,
            client,
            resources: Vec::new(),
            ready: Arc::new(ReadySlots::new()),
            queues: DashMap::new(),
            cancel: CancellationToken::new(),
            tasks: SyncMutex::new(Vec::new()),
        }
    }

    /// Shared pools every processor releases after each invocation
    pub fn with_resources(mut self, resources: Vec<Arc<dyn ResourcePool>>) -> Self {
        self.resources = resources;
        self
    }

    /// Spawn fetchers and processor slots for every registered queue
    pub fn start(&self) {
        let mut tasks = self.tasks.lock();

        for name in self.registry.queue_names() {
            let Some(descriptor) = self.registry.get(&name) else {
                continue;
            };
            let queue_config = self.config.queue(&name);
            let concurrency = queue_config
                .concurrency
                .unwrap_or(descriptor.concurrency())
                .max(1);

            let ready = self.ready.register(&name);
            let (tx, rx) = mpsc::channel(concurrency);
            let deliveries = Arc::new(Mutex::new(rx));
            let runtime = Arc::new(QueueRuntime::new(concurrency));
            self.queues.insert(name.clone(), runtime.clone());

            let batch_size = descriptor.batch().then(|| queue_config.effective_batch_size());
            let fetcher = Fetcher::new(
                name.clone(),
                self.client.clone(),
                ready,
                tx,
                batch_size,
                self.config.poll_interval(),
            );
            tasks.push(tokio::spawn(fetcher.run(self.cancel.child_token())));

            for index in 0..concurrency {
                let slot = Slot {
                    queue: name.clone(),
                    index,
                    registry: self.registry.clone(),
                    client: self.client.clone(),
                    coordinator: self.ready.clone(),
                    resources: self.resources.clone(),
                    safety_margin: self.config.lease_safety_margin(),
                    deliveries: deliveries.clone(),
                    runtime: runtime.clone(),
                    cancel: self.cancel.child_token(),
                };
                tasks.push(tokio::spawn(slot.supervise()));
            }

            info!("Started {} processor(s) for queue {}", concurrency, name);
        }
    }

    /// Stop fetching, let in-flight work finish and shut every processor down
    pub async fn stop(&self) {
        info!("Stopping processors for {} queue(s)", self.queues.len());
        self.cancel.cancel();

        let tasks = std::mem::take(&mut *self.tasks.lock());
        for result in join_all(tasks).await {
            if let Err(e) = result {
                warn!("Worker task ended abnormally: {}", e);
            }
        }
        info!("All processors stopped");
    }

    /// Log the state of every queue
    pub fn dump(&self) {
        let mut names: Vec<String> = self.queues.iter().map(|e| e.key().clone()).collect();
        names.sort();

        for name in names {
            if let Some(stats) = self.stats(&name) {
                info!(
                    "Queue {}: {} slot(s), {} busy, {} idle, {} processed, {} failed, {} restart(s)",
                    name,
                    stats.slots,
                    stats.busy,
                    self.ready.idle(&name),
                    stats.processed,
                    stats.failed,
                    stats.restarts
                );
            }
        }
    }

    pub fn stats(&self, queue: &str) -> Option<QueueStats> {
        self.queues.get(queue).map(|runtime| runtime.stats())
    }
}

#[async_trait]
impl Pool for Manager {
    async fn stop(&self) {
        Manager::stop(self).await
    }

    fn dump(&self) {
        Manager::dump(self)
    }
}

/// One processor slot and everything needed to rebuild it after a crash
struct Slot {
    queue: String,
    index: usize,
    registry: Arc<WorkerRegistry>,
    client: Arc<dyn QueueClient>,
    coordinator: Arc<ReadySlots>,
    resources: Vec<Arc<dyn ResourcePool>>,
    safety_margin: Duration,
    deliveries: Arc<Mutex<mpsc::Receiver<Delivery>>>,
    runtime: Arc<QueueRuntime>,
    cancel: CancellationToken,
}

impl Slot {
    fn new_processor(&self) -> Arc<Processor> {
        let processor = Processor::new(
            self.queue.clone(),
            self.registry.clone(),
            self.client.clone(),
            self.coordinator.clone(),
        )
        .with_safety_margin(self.safety_margin)
        .with_resources(self.resources.clone());
        Arc::new(processor)
    }

    async fn supervise(self) {
        let mut processor = self.new_processor();
        self.coordinator.processor_finished(&self.queue);

        loop {
            self.runtime.install(self.index, processor.clone());
            let serving = tokio::spawn(serve(
                processor.clone(),
                self.deliveries.clone(),
                self.runtime.clone(),
                self.cancel.clone(),
            ));

            match serving.await {
                Ok(()) => break,
                Err(e) if e.is_panic() => {
                    // Cleanup already ran while unwinding, including the idle notice
                    error!("Processor {}#{} crashed, restarting: {}", self.queue, self.index, e);
                    self.runtime.failed.fetch_add(1, Ordering::SeqCst);
                    self.runtime.restarts.fetch_add(1, Ordering::SeqCst);
                    processor.shutdown();
                    processor = self.new_processor();
                }
                Err(e) => {
                    warn!("Processor {}#{} was cancelled: {}", self.queue, self.index, e);
                    break;
                }
            }
        }

        processor.shutdown();
    }
}

async fn serve(
    processor: Arc<Processor>,
    deliveries: Arc<Mutex<mpsc::Receiver<Delivery>>>,
    runtime: Arc<QueueRuntime>,
    cancel: CancellationToken,
) {
    let queue = processor.queue().to_string();

    loop {
        let delivery = tokio::select! {
            biased;
            // Queued deliveries are left behind; their leases expire and the queue redelivers them
            _ = cancel.cancelled() => None,
            delivery = async { deliveries.lock().await.recv().await } => delivery,
        };
        let Some(delivery) = delivery else { break };

        match processor.process(&queue, delivery).await {
            Ok(()) => {
                runtime.processed.fetch_add(1, Ordering::SeqCst);
            }
            Err(e) if e.is_fatal() => {
                error!("Processor for {} stopping: {}", queue, e);
                break;
            }
            Err(e @ ProcessError::Handler { .. }) => {
                runtime.failed.fetch_add(1, Ordering::SeqCst);
                error!("{}", e);
            }
            Err(e) => {
                runtime.failed.fetch_add(1, Ordering::SeqCst);
                warn!("{}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::LogHandler;
    use drudge_core::{InMemoryQueue, WorkerDescriptor};

    #[test]
    fn test_ready_slots() {
        let ready = ReadySlots::new();
        ready.register("orders");

        ready.processor_finished("orders");
        ready.processor_finished("orders");
        ready.processor_finished("unknown");

        assert_eq!(ready.idle("orders"), 2);
        assert_eq!(ready.idle("unknown"), 0);
    }

    #[tokio::test]
    async fn test_cancelled_slot_leaves_queued_deliveries() {
        let queue = Arc::new(InMemoryQueue::new());
        queue.create_queue("orders", Duration::from_secs(30));
        for body in ["a", "b"] {
            queue.send("orders", body).unwrap();
        }

        let registry = Arc::new(WorkerRegistry::new());
        registry.register(WorkerDescriptor::builder("orders", LogHandler).auto_delete(true).build());
        let ready = Arc::new(ReadySlots::new());
        ready.register("orders");
        let processor = Arc::new(Processor::new("orders", registry, queue.clone(), ready));

        let (tx, rx) = mpsc::channel(4);
        for message in queue.fetch("orders", 2).await.unwrap() {
            tx.send(Delivery::from(message)).await.unwrap();
        }
        let deliveries = Arc::new(Mutex::new(rx));
        let runtime = Arc::new(QueueRuntime::new(1));
        let cancel = CancellationToken::new();
        cancel.cancel();

        serve(processor, deliveries.clone(), runtime.clone(), cancel).await;

        assert_eq!(runtime.stats().processed, 0);
        assert_eq!(queue.deletes("orders"), 0);
        // Still leased, so the queue hands them out again once the leases run out
        assert_eq!(queue.in_flight("orders"), 2);
        assert!(deliveries.lock().await.try_recv().is_ok());
    }
}

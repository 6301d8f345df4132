use async_trait::async_trait;
use drudge_core::{DecodedBody, Delivery, Handler, InMemoryQueue, WorkerDescriptor};
use drudge_worker::{Manager, WorkerConfig, WorkerRegistry};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

const QUEUE: &str = "orders";

#[derive(Default)]
struct Recorder {
    bodies: Mutex<Vec<String>>,
    deliveries: Mutex<Vec<usize>>,
}

struct RecordingHandler(Arc<Recorder>);

#[async_trait]
impl Handler for RecordingHandler {
    async fn perform(&self, delivery: &Delivery, _body: DecodedBody) -> anyhow::Result<()> {
        self.0.deliveries.lock().push(delivery.len());
        for message in delivery.messages() {
            let body = message.body_lossy();
            match body.as_str() {
                "fail" => anyhow::bail!("refusing {}", message.id),
                "panic" => panic!("handler blew up"),
                _ => self.0.bodies.lock().push(body),
            }
        }
        Ok(())
    }
}

fn config() -> WorkerConfig {
    WorkerConfig {
        poll_interval_ms: 10,
        ..Default::default()
    }
}

fn setup(bodies: &[&str]) -> Arc<InMemoryQueue> {
    let queue = Arc::new(InMemoryQueue::new());
    queue.create_queue(QUEUE, Duration::from_secs(30));
    for body in bodies {
        queue.send(QUEUE, body.to_string()).unwrap();
    }
    queue
}

async fn wait_until(condition: impl Fn() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test]
async fn test_processes_and_deletes_messages() {
    let queue = setup(&["a", "b", "c", "d", "e"]);
    let recorder = Arc::new(Recorder::default());
    let registry = Arc::new(WorkerRegistry::new());
    registry.register(
        WorkerDescriptor::builder(QUEUE, RecordingHandler(recorder.clone()))
            .auto_delete(true)
            .concurrency(2)
            .build(),
    );

    let manager = Manager::new(config(), registry, queue.clone());
    manager.start();

    wait_until(|| queue.deletes(QUEUE) == 5).await;
    manager.stop().await;

    let mut bodies = recorder.bodies.lock().clone();
    bodies.sort();
    assert_eq!(bodies, vec!["a", "b", "c", "d", "e"]);
    assert!(queue.is_empty(QUEUE));

    let stats = manager.stats(QUEUE).unwrap();
    assert_eq!(stats.slots, 2);
    assert_eq!(stats.processed, 5);
    assert_eq!(stats.failed, 0);
}

#[tokio::test]
async fn test_failed_message_is_kept_and_slot_keeps_serving() {
    let queue = setup(&["fail", "a", "b"]);
    let recorder = Arc::new(Recorder::default());
    let registry = Arc::new(WorkerRegistry::new());
    registry.register(
        WorkerDescriptor::builder(QUEUE, RecordingHandler(recorder.clone()))
            .auto_delete(true)
            .build(),
    );

    let manager = Manager::new(config(), registry, queue.clone());
    manager.start();

    wait_until(|| queue.deletes(QUEUE) == 2).await;
    manager.stop().await;

    let stats = manager.stats(QUEUE).unwrap();
    assert_eq!(stats.processed, 2);
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.restarts, 0);

    // Left for redelivery once its lease runs out
    assert_eq!(queue.len(QUEUE), 1);
    assert_eq!(queue.in_flight(QUEUE), 1);
}

#[tokio::test]
async fn test_panicking_handler_restarts_slot() {
    let queue = setup(&["panic", "a", "b"]);
    let recorder = Arc::new(Recorder::default());
    let registry = Arc::new(WorkerRegistry::new());
    registry.register(
        WorkerDescriptor::builder(QUEUE, RecordingHandler(recorder.clone()))
            .auto_delete(true)
            .build(),
    );

    let manager = Manager::new(config(), registry, queue.clone());
    manager.start();

    wait_until(|| queue.deletes(QUEUE) == 2).await;
    manager.stop().await;

    let stats = manager.stats(QUEUE).unwrap();
    assert_eq!(stats.restarts, 1);
    assert_eq!(stats.processed, 2);
    assert_eq!(stats.busy, 0);
    assert_eq!(queue.len(QUEUE), 1);
}

#[tokio::test]
async fn test_batch_worker_receives_batches() {
    let queue = setup(&["a", "b", "c", "d", "e"]);
    let recorder = Arc::new(Recorder::default());
    let registry = Arc::new(WorkerRegistry::new());
    registry.register(
        WorkerDescriptor::builder(QUEUE, RecordingHandler(recorder.clone()))
            .auto_delete(true)
            .batch(true)
            .build(),
    );

    let mut config = config();
    config.queues.insert(
        QUEUE.to_string(),
        drudge_worker::QueueConfig {
            batch_size: 3,
            ..Default::default()
        },
    );

    let manager = Manager::new(config, registry, queue.clone());
    manager.start();

    wait_until(|| queue.deletes(QUEUE) == 5).await;
    manager.stop().await;

    assert_eq!(*recorder.deliveries.lock(), vec![3, 2]);
    assert_eq!(recorder.bodies.lock().len(), 5);
}

#[tokio::test]
async fn test_stop_with_idle_queue_returns() {
    let queue = setup(&[]);
    let registry = Arc::new(WorkerRegistry::new());
    registry.register(
        WorkerDescriptor::builder(QUEUE, RecordingHandler(Arc::new(Recorder::default())))
            .concurrency(3)
            .build(),
    );

    let manager = Manager::new(config(), registry, queue);
    manager.start();
    tokio::time::sleep(Duration::from_millis(50)).await;

    tokio::time::timeout(Duration::from_secs(1), manager.stop())
        .await
        .expect("stop hung");
    assert_eq!(manager.stats(QUEUE).unwrap().processed, 0);
}

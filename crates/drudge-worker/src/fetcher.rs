use drudge_core::{Delivery, Message, QueueClient, MAX_BATCH_SIZE};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Pulls messages for one queue whenever a slot is idle and hands them to the
/// slots through a shared channel.
pub struct Fetcher {
    queue: String,
    client: Arc<dyn QueueClient>,
    ready: Arc<Semaphore>,
    deliveries: mpsc::Sender<Delivery>,
    batch_size: Option<usize>,
    poll_interval: Duration,
}

impl Fetcher {
    /// `batch_size` is set for batch workers: each idle slot then receives one
    /// batch of up to that many messages.
    pub fn new(
        queue: String,
        client: Arc<dyn QueueClient>,
        ready: Arc<Semaphore>,
        deliveries: mpsc::Sender<Delivery>,
        batch_size: Option<usize>,
        poll_interval: Duration,
    ) -> Self {
        Fetcher {
            queue,
            client,
            ready,
            deliveries,
            batch_size,
            poll_interval,
        }
    }

    pub async fn run(self, cancel: CancellationToken) {
        info!("Fetcher for queue {} started", self.queue);

        loop {
            let idle = tokio::select! {
                _ = cancel.cancelled() => break,
                idle = self.claim_idle_slots() => idle,
            };
            let Some(idle) = idle else { break };

            let max = self.batch_size.unwrap_or(idle);
            let messages = match self.client.fetch(&self.queue, max).await {
                Ok(messages) => messages,
                Err(e) => {
                    warn!("Failed to fetch from {}: {}", self.queue, e);
                    Vec::new()
                }
            };

            if messages.is_empty() {
                self.ready.add_permits(idle);
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(self.poll_interval) => continue,
                }
            }

            debug!("Fetched {} message(s) from {}", messages.len(), self.queue);
            let deliveries = self.deliveries_from(messages);
            self.ready.add_permits(idle.saturating_sub(deliveries.len()));

            for delivery in deliveries {
                let sent = tokio::select! {
                    _ = cancel.cancelled() => break,
                    sent = self.deliveries.send(delivery) => sent,
                };
                if sent.is_err() {
                    info!("Slots for queue {} are gone, fetcher exiting", self.queue);
                    return;
                }
            }
        }

        info!("Fetcher for queue {} stopped", self.queue);
    }

    /// Wait for at least one idle slot, then take every other idle slot too
    async fn claim_idle_slots(&self) -> Option<usize> {
        let first = self.ready.acquire().await.ok()?;
        first.forget();

        let mut idle = 1;
        if self.batch_size.is_none() {
            let more = self
                .ready
                .available_permits()
                .min(MAX_BATCH_SIZE - 1);
            if let Ok(permits) = self.ready.try_acquire_many(more as u32) {
                permits.forget();
                idle += more;
            }
        }
        Some(idle)
    }

    fn deliveries_from(&self, messages: Vec<Message>) -> Vec<Delivery> {
        if self.batch_size.is_some() {
            match Delivery::batch(messages) {
                Ok(batch) => vec![batch],
                Err(e) => {
                    warn!("Dropping malformed batch from {}: {}", self.queue, e);
                    Vec::new()
                }
            }
        } else {
            messages.into_iter().map(Delivery::Single).collect()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use drudge_core::InMemoryQueue;

    fn queue_with(count: usize) -> Arc<InMemoryQueue> {
        let queue = Arc::new(InMemoryQueue::new());
        queue.create_queue("jobs", Duration::from_secs(30));
        for i in 0..count {
            queue.send("jobs", format!("job-{}", i)).unwrap();
        }
        queue
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetches_only_for_idle_slots() {
        let queue = queue_with(5);
        let ready = Arc::new(Semaphore::new(2));
        let (tx, mut rx) = mpsc::channel(10);
        let cancel = CancellationToken::new();

        let fetcher = Fetcher::new("jobs".into(), queue.clone(), ready.clone(), tx, None, Duration::from_millis(100));
        let handle = tokio::spawn(fetcher.run(cancel.clone()));

        let first = rx.recv().await.unwrap();
        rx.recv().await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(!first.is_batch());
        assert!(rx.try_recv().is_err());
        assert_eq!(queue.in_flight("jobs"), 2);

        ready.add_permits(1);
        rx.recv().await.unwrap();
        assert_eq!(queue.in_flight("jobs"), 3);

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_batch_worker_gets_one_batch_per_slot() {
        let queue = queue_with(5);
        let ready = Arc::new(Semaphore::new(1));
        let (tx, mut rx) = mpsc::channel(10);
        let cancel = CancellationToken::new();

        let fetcher = Fetcher::new("jobs".into(), queue.clone(), ready, tx, Some(3), Duration::from_millis(100));
        let handle = tokio::spawn(fetcher.run(cancel.clone()));

        let delivery = rx.recv().await.unwrap();
        assert!(delivery.is_batch());
        assert_eq!(delivery.len(), 3);

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_fetch_returns_slots() {
        let queue = queue_with(0);
        let ready = Arc::new(Semaphore::new(2));
        let (tx, _rx) = mpsc::channel(10);
        let cancel = CancellationToken::new();

        let fetcher = Fetcher::new("jobs".into(), queue, ready.clone(), tx, None, Duration::from_millis(100));
        let handle = tokio::spawn(fetcher.run(cancel.clone()));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(ready.available_permits(), 2);

        cancel.cancel();
        handle.await.unwrap();
    }
}

use drudge_core::{Delivery, QueueClient};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Default gap between a renewal and the lease running out
pub const DEFAULT_SAFETY_MARGIN: Duration = Duration::from_secs(5);

/// Keeps a delivery's messages hidden while its handler runs, renewing
/// their lease a safety margin before it would run out
pub struct LeaseRenewer;

impl LeaseRenewer {
    /// Period between renewals, `None` when the timeout leaves nothing to renew
    pub fn renewal_interval(visibility_timeout: Duration, safety_margin: Duration) -> Option<Duration> {
        if visibility_timeout.is_zero() {
            return None;
        }
        if visibility_timeout > safety_margin {
            Some(visibility_timeout - safety_margin)
        } else {
            Some(visibility_timeout / 2)
        }
    }

    /// Start renewing the delivery's lease. The first renewal happens one
    /// interval after the start, never immediately.
    pub fn start(
        client: Arc<dyn QueueClient>,
        delivery: Delivery,
        visibility_timeout: Duration,
        safety_margin: Duration,
    ) -> Option<LeaseRenewal> {
        let interval = Self::renewal_interval(visibility_timeout, safety_margin)?;
        let token = CancellationToken::new();
        let firings = Arc::new(AtomicU64::new(0));

        let task = tokio::spawn(renew_loop(
            client,
            delivery,
            visibility_timeout,
            Instant::now() + interval,
            interval,
            token.clone(),
            firings.clone(),
        ));

        Some(LeaseRenewal {
            token,
            firings,
            interval,
            task: Some(task),
        })
    }
}

async fn renew_loop(
    client: Arc<dyn QueueClient>,
    delivery: Delivery,
    visibility_timeout: Duration,
    first_renewal: Instant,
    interval: Duration,
    token: CancellationToken,
    firings: Arc<AtomicU64>,
) {
    let mut ticker = interval_at(first_renewal, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => break,
            _ = ticker.tick() => {}
        }

        firings.fetch_add(1, Ordering::SeqCst);
        for message in delivery.messages() {
            debug!("Processor {} updating visibility timeout of {}", message.queue, message.id);
            if let Err(e) = client.set_visibility_timeout(message, visibility_timeout).await {
                warn!("Failed to extend lease of message {}: {}", message.id, e);
            }
        }
    }
}

/// Handle to a running lease renewal. Dropping it cancels the renewal.
pub struct LeaseRenewal {
    token: CancellationToken,
    firings: Arc<AtomicU64>,
    interval: Duration,
    task: Option<JoinHandle<()>>,
}

impl LeaseRenewal {
    /// Stop future renewals. Idempotent and safe to call from any task; a
    /// renewal already talking to the queue is allowed to finish.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Cancel and wait for an in-progress renewal to finish
    pub async fn stop(mut self) {
        self.cancel();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!("Lease renewal task ended abnormally: {}", e);
            }
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Number of renewals started so far
    pub fn firings(&self) -> u64 {
        self.firings.load(Ordering::SeqCst)
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }
}

impl Drop for LeaseRenewal {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use drudge_core::{InMemoryQueue, Message};
    use tokio::time::sleep;

    async fn fetched(timeout_secs: u64) -> (Arc<InMemoryQueue>, Delivery) {
        let queue = Arc::new(InMemoryQueue::new());
        queue.create_queue("orders", Duration::from_secs(timeout_secs));
        queue.send("orders", "payload").unwrap();
        let message = queue.fetch("orders", 1).await.unwrap().remove(0);
        (queue, Delivery::from(message))
    }

    #[test]
    fn test_renewal_interval() {
        let margin = DEFAULT_SAFETY_MARGIN;
        assert_eq!(
            LeaseRenewer::renewal_interval(Duration::from_secs(30), margin),
            Some(Duration::from_secs(25))
        );
        assert_eq!(
            LeaseRenewer::renewal_interval(Duration::from_secs(4), margin),
            Some(Duration::from_secs(2))
        );
        assert_eq!(LeaseRenewer::renewal_interval(Duration::ZERO, margin), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_before_first_interval_never_fires() {
        let (queue, delivery) = fetched(30).await;
        let renewal = LeaseRenewer::start(queue.clone(), delivery, Duration::from_secs(30), DEFAULT_SAFETY_MARGIN)
            .unwrap();

        sleep(Duration::from_secs(24)).await;
        renewal.cancel();
        sleep(Duration::from_secs(120)).await;

        assert_eq!(renewal.firings(), 0);
        assert_eq!(queue.lease_extensions("orders"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sliding_renewals_keep_message_hidden() {
        let (queue, delivery) = fetched(10).await;
        let renewal = LeaseRenewer::start(queue.clone(), delivery, Duration::from_secs(10), DEFAULT_SAFETY_MARGIN)
            .unwrap();
        assert_eq!(renewal.interval(), Duration::from_secs(5));

        sleep(Duration::from_secs(12)).await;
        assert_eq!(renewal.firings(), 2);
        assert_eq!(queue.lease_extensions("orders"), 2);
        // Without renewal the lease would have run out at 10s
        assert_eq!(queue.in_flight("orders"), 1);

        renewal.stop().await;
        sleep(Duration::from_secs(30)).await;
        assert_eq!(queue.lease_extensions("orders"), 2);
        assert_eq!(queue.in_flight("orders"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_is_idempotent() {
        let (queue, delivery) = fetched(10).await;
        let renewal = LeaseRenewer::start(queue, delivery, Duration::from_secs(10), DEFAULT_SAFETY_MARGIN)
            .unwrap();

        renewal.cancel();
        renewal.cancel();
        assert!(renewal.is_cancelled());
        renewal.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_cancels() {
        let (queue, delivery) = fetched(10).await;
        let renewal = LeaseRenewer::start(queue.clone(), delivery, Duration::from_secs(10), DEFAULT_SAFETY_MARGIN)
            .unwrap();
        drop(renewal);

        sleep(Duration::from_secs(30)).await;
        assert_eq!(queue.lease_extensions("orders"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_renewal_failures_do_not_stop_timer() {
        let queue = Arc::new(InMemoryQueue::new());
        queue.create_queue("orders", Duration::from_secs(10));
        // Never fetched, so its receipt is unknown to the queue
        let stranger = Delivery::from(Message::new("orders", "x"));

        let renewal = LeaseRenewer::start(queue.clone(), stranger, Duration::from_secs(10), DEFAULT_SAFETY_MARGIN)
            .unwrap();

        sleep(Duration::from_secs(16)).await;
        assert_eq!(renewal.firings(), 3);
        assert_eq!(queue.lease_extensions("orders"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_batch_renews_every_message() {
        let queue = Arc::new(InMemoryQueue::new());
        queue.create_queue("orders", Duration::from_secs(10));
        for i in 0..3 {
            queue.send("orders", format!("m{}", i)).unwrap();
        }
        let batch = Delivery::batch(queue.fetch("orders", 3).await.unwrap()).unwrap();

        let renewal = LeaseRenewer::start(queue.clone(), batch, Duration::from_secs(10), DEFAULT_SAFETY_MARGIN)
            .unwrap();
        sleep(Duration::from_secs(6)).await;

        assert_eq!(renewal.firings(), 1);
        assert_eq!(queue.lease_extensions("orders"), 3);
    }
}

use async_trait::async_trait;
use drudge_core::{Body, DecodedBody, Delivery, Handler};
use std::time::Duration;
use tracing::info;

/// Handler that logs every message it receives
pub struct LogHandler;

fn describe(body: Option<&Body>) -> String {
    match body {
        Some(Body::Json(value)) => value.to_string(),
        Some(Body::Raw(bytes)) => String::from_utf8_lossy(bytes).into_owned(),
        Some(Body::Custom(_)) => "<custom>".to_string(),
        None => "<undecodable>".to_string(),
    }
}

#[async_trait]
impl Handler for LogHandler {
    async fn perform(&self, delivery: &Delivery, body: DecodedBody) -> anyhow::Result<()> {
        let bodies: Vec<Option<&Body>> = match &body {
            DecodedBody::Single(body) => vec![body.as_ref()],
            DecodedBody::Batch(bodies) => bodies.iter().map(Option::as_ref).collect(),
        };

        for (message, body) in delivery.messages().iter().zip(bodies) {
            info!("Queue {} message {}: {}", message.queue, message.id, describe(body));
        }
        Ok(())
    }
}

/// Handler that simulates work by sleeping
pub struct SleepHandler {
    duration: Duration,
}

impl SleepHandler {
    pub fn new(duration: Duration) -> Self {
        SleepHandler { duration }
    }
}

#[async_trait]
impl Handler for SleepHandler {
    async fn perform(&self, delivery: &Delivery, _body: DecodedBody) -> anyhow::Result<()> {
        tokio::time::sleep(self.duration).await;
        info!("Slept {:?} over {} message(s) from {}", self.duration, delivery.len(), delivery.queue());
        Ok(())
    }
}

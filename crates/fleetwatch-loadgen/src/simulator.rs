// A single simulated device publishing readings on a fixed cadence.
use fleetwatch_client::{ConnectionError, Connector};
use fleetwatch_common::ids::SessionId;
use fleetwatch_common::shutdown;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

use crate::payload::{PayloadFactory, TelemetryPayload};

pub const DEFAULT_DEVICE_INTERVAL: Duration = Duration::from_secs(2);

pub struct DeviceSimulator {
    connector: Arc<dyn Connector>,
    client_id: String,
    topic: String,
    interval: Duration,
    payload: TelemetryPayload,
    limit: Option<u64>,
}

impl DeviceSimulator {
    pub fn new(
        connector: Arc<dyn Connector>,
        client_id: impl Into<String>,
        topic: impl Into<String>,
    ) -> Self {
        Self {
            connector,
            client_id: client_id.into(),
            topic: topic.into(),
            interval: DEFAULT_DEVICE_INTERVAL,
            payload: TelemetryPayload::default(),
            limit: None,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval.max(Duration::from_millis(1));
        self
    }

    pub fn with_payload(mut self, payload: TelemetryPayload) -> Self {
        self.payload = payload;
        self
    }

    /// Stop after `limit` readings instead of running until cancelled.
    pub fn with_limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Publish readings until cancelled or the limit is reached. Returns the
    /// number of readings published.
    pub async fn run(self, mut cancel: watch::Receiver<bool>) -> Result<u64, ConnectionError> {
        let client = self.connector.connect(&self.client_id).await?;
        tracing::info!(
            client_id = %self.client_id,
            topic = %self.topic,
            interval_ms = self.interval.as_millis() as u64,
            "device simulator connected"
        );
        let session = SessionId::new();
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut published = 0u64;

        let result = loop {
            if self.limit.is_some_and(|limit| published >= limit) {
                break Ok(published);
            }
            tokio::select! {
                biased;
                _ = shutdown::cancelled(&mut cancel) => break Ok(published),
                _ = ticker.tick() => {}
            }
            let payload = self.payload.payload(&session, published);
            if let Err(err) = client.publish(&self.topic, payload).await {
                tracing::warn!(client_id = %self.client_id, error = %err, "device publish failed");
                break Err(err);
            }
            published += 1;
            tracing::trace!(client_id = %self.client_id, published, "device reading published");
        };

        if let Err(err) = client.disconnect().await {
            tracing::warn!(client_id = %self.client_id, error = %err, "device disconnect failed");
        }
        result
    }
}

// Wiring: subscriber unit -> ingestion pipeline -> aggregator loop.
use fleetwatch_client::{BrokerClient, ConnectionError, Connector};
use fleetwatch_common::ids::RunId;
use fleetwatch_common::{Clock, ConfigError, shutdown};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::aggregator::WindowAggregator;
use crate::config::MonitorConfig;
use crate::event::RawMessage;
use crate::ingest::{IngestOutcome, IngestionPipeline};
use crate::query::MetricsQuery;

/// Connection status of the subscriber unit.
#[derive(Debug, Default)]
pub struct SubscriberStatus {
    connected: AtomicBool,
    connects: AtomicU64,
    failures: AtomicU64,
}

impl SubscriberStatus {
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub fn connects(&self) -> u64 {
        self.connects.load(Ordering::Relaxed)
    }

    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }
}

pub struct Monitor;

impl Monitor {
    /// Validate `config`, then start the subscriber and aggregator tasks.
    ///
    /// Broker unavailability is not an error here: the subscriber keeps
    /// retrying every `reconnect_delay_ms` until shut down.
    pub fn start(
        config: MonitorConfig,
        connector: Arc<dyn Connector>,
        clock: Arc<dyn Clock>,
    ) -> Result<MonitorHandle, ConfigError> {
        config.validate()?;
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let (pipeline, events) =
            IngestionPipeline::new(config.required_fields.clone(), config.queue_capacity);
        let aggregator = WindowAggregator::new(&config, Arc::clone(&clock))
            .with_ingest_stats(pipeline.stats());
        let query = aggregator.query();
        let status = Arc::new(SubscriberStatus::default());

        let aggregator_task = tokio::spawn({
            let cancel = cancel_rx.clone();
            async move {
                aggregator.run(events, cancel).await;
            }
        });
        let subscriber = Subscriber {
            client_id: format!("fleetwatch-monitor-{}", RunId::new().short()),
            topic: config.topic.clone(),
            reconnect_delay: config.reconnect_delay(),
            connector,
            clock,
            pipeline: pipeline.clone(),
            status: Arc::clone(&status),
        };
        let subscriber_task = tokio::spawn(subscriber.run(cancel_rx));
        tracing::info!(
            topic = %config.topic,
            window_secs = config.window_secs,
            bucket_secs = config.bucket_secs,
            threshold = config.dos_threshold,
            "monitor started"
        );

        Ok(MonitorHandle {
            query,
            pipeline,
            status,
            cancel: cancel_tx,
            tasks: vec![subscriber_task, aggregator_task],
        })
    }
}

pub struct MonitorHandle {
    query: MetricsQuery,
    pipeline: IngestionPipeline,
    status: Arc<SubscriberStatus>,
    cancel: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl std::fmt::Debug for MonitorHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MonitorHandle")
            .field("connected", &self.status.is_connected())
            .finish_non_exhaustive()
    }
}

impl MonitorHandle {
    pub fn query(&self) -> MetricsQuery {
        self.query.clone()
    }

    /// Producer handle, for feeding messages that did not come off the bus.
    pub fn pipeline(&self) -> IngestionPipeline {
        self.pipeline.clone()
    }

    pub fn status(&self) -> Arc<SubscriberStatus> {
        Arc::clone(&self.status)
    }

    /// Signal both tasks and wait for them; the final snapshot is published
    /// before this returns.
    pub async fn shutdown(self) {
        let _ = self.cancel.send(true);
        for task in self.tasks {
            if let Err(err) = task.await {
                tracing::warn!(error = %err, "monitor task ended abnormally");
            }
        }
        tracing::info!("monitor stopped");
    }
}

struct Subscriber {
    client_id: String,
    topic: String,
    reconnect_delay: Duration,
    connector: Arc<dyn Connector>,
    // Arrival times are restamped with the aggregator's clock.
    clock: Arc<dyn Clock>,
    pipeline: IngestionPipeline,
    status: Arc<SubscriberStatus>,
}

enum SessionEnd {
    Cancelled,
    Lost(ConnectionError),
    ConsumerGone,
}

impl Subscriber {
    async fn run(self, mut cancel: watch::Receiver<bool>) {
        loop {
            if shutdown::is_cancelled(&cancel) {
                break;
            }
            let connected = tokio::select! {
                biased;
                _ = shutdown::cancelled(&mut cancel) => break,
                result = self.connector.connect(&self.client_id) => result,
            };
            let end = match connected {
                Ok(client) => self.consume(client, &mut cancel).await,
                Err(err) => SessionEnd::Lost(err),
            };
            match end {
                SessionEnd::Cancelled | SessionEnd::ConsumerGone => break,
                SessionEnd::Lost(err) => {
                    self.status.failures.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(
                        endpoint = %self.connector.endpoint(),
                        error = %err,
                        retry_ms = self.reconnect_delay.as_millis() as u64,
                        "subscriber connection unavailable"
                    );
                }
            }
            tokio::select! {
                biased;
                _ = shutdown::cancelled(&mut cancel) => break,
                _ = tokio::time::sleep(self.reconnect_delay) => {}
            }
        }
        tracing::debug!(client_id = %self.client_id, "subscriber stopped");
    }

    // Owns one connection from subscribe to disconnect.
    async fn consume(
        &self,
        mut client: Box<dyn BrokerClient>,
        cancel: &mut watch::Receiver<bool>,
    ) -> SessionEnd {
        let end = match client.subscribe(&self.topic).await {
            Err(err) => SessionEnd::Lost(err),
            Ok(()) => {
                self.status.connected.store(true, Ordering::Release);
                self.status.connects.fetch_add(1, Ordering::Relaxed);
                tracing::info!(client_id = %self.client_id, topic = %self.topic, "subscribed");
                self.pump(client.as_mut(), cancel).await
            }
        };
        self.status.connected.store(false, Ordering::Release);
        if let Err(err) = client.disconnect().await {
            tracing::debug!(client_id = %self.client_id, error = %err, "subscriber disconnect failed");
        }
        end
    }

    async fn pump(
        &self,
        client: &mut dyn BrokerClient,
        cancel: &mut watch::Receiver<bool>,
    ) -> SessionEnd {
        loop {
            let next = tokio::select! {
                biased;
                _ = shutdown::cancelled(cancel) => return SessionEnd::Cancelled,
                next = client.next_message() => next,
            };
            match next {
                Some(Ok(message)) => {
                    let raw = RawMessage {
                        received_at_ms: self.clock.now_ms(),
                        ..RawMessage::from(message)
                    };
                    if self.pipeline.on_raw_message(raw) == IngestOutcome::Closed {
                        return SessionEnd::ConsumerGone;
                    }
                }
                Some(Err(err)) => return SessionEnd::Lost(err),
                None => {
                    return SessionEnd::Lost(ConnectionError::Disconnected(
                        "subscription stream ended".to_string(),
                    ));
                }
            }
        }
    }
}

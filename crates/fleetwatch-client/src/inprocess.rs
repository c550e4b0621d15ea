// In-process broker client adapter.
use async_trait::async_trait;
use bytes::Bytes;
use fleetwatch_broker::{Broker, BrokerError, ConnectionGuard};
use fleetwatch_common::clock::unix_now_ms;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::DEFAULT_INBOUND_CAPACITY;
use crate::{BrokerClient, ConnectionError, Connector, InboundMessage};

/// Opens connections against a broker running in this process.
///
/// ```
/// use bytes::Bytes;
/// use fleetwatch_broker::Broker;
/// use fleetwatch_client::{Connector, InProcessConnector};
/// use std::sync::Arc;
///
/// let broker = Arc::new(Broker::new());
/// let connector = InProcessConnector::new(broker.clone());
/// let rt = tokio::runtime::Runtime::new().expect("rt");
/// rt.block_on(async {
///     let mut sub = connector.connect("sub").await.expect("connect");
///     sub.subscribe("iot/device/data").await.expect("subscribe");
///     let publisher = connector.connect("pub").await.expect("connect");
///     publisher
///         .publish("iot/device/data", Bytes::from_static(b"payload"))
///         .await
///         .expect("publish");
///     let msg = sub.next_message().await.expect("message").expect("ok");
///     assert_eq!(msg.payload, Bytes::from_static(b"payload"));
///     publisher.disconnect().await.expect("disconnect");
///     sub.disconnect().await.expect("disconnect");
/// });
/// assert_eq!(broker.active_connections(), 0);
/// ```
#[derive(Clone, Debug)]
pub struct InProcessConnector {
    broker: Arc<Broker>,
    inbound_capacity: usize,
}

impl InProcessConnector {
    pub fn new(broker: Arc<Broker>) -> Self {
        Self {
            broker,
            inbound_capacity: DEFAULT_INBOUND_CAPACITY,
        }
    }

    pub fn with_inbound_capacity(mut self, capacity: usize) -> Self {
        self.inbound_capacity = capacity.max(1);
        self
    }

    pub fn broker(&self) -> &Arc<Broker> {
        &self.broker
    }
}

#[async_trait]
impl Connector for InProcessConnector {
    async fn connect(&self, client_id: &str) -> Result<Box<dyn BrokerClient>, ConnectionError> {
        let guard = self
            .broker
            .connect(client_id)
            .map_err(|err| {
                metrics::counter!("fleetwatch_client_connect_failures_total", "reason" => "refused")
                    .increment(1);
                ConnectionError::Refused {
                    endpoint: self.endpoint(),
                    reason: err.to_string(),
                }
            })?;
        Ok(Box::new(InProcessClient::new(
            Arc::clone(&self.broker),
            guard,
            self.inbound_capacity,
        )))
    }

    fn endpoint(&self) -> String {
        "in-process".to_string()
    }
}

/// One connection to an in-process broker.
#[derive(Debug)]
pub struct InProcessClient {
    broker: Arc<Broker>,
    client_id: String,
    // Held for the connection lifetime; dropping it releases the broker slot.
    guard: Option<ConnectionGuard>,
    inbound_tx: mpsc::Sender<InboundMessage>,
    inbound_rx: mpsc::Receiver<InboundMessage>,
    forwarders: Vec<JoinHandle<()>>,
}

impl InProcessClient {
    fn new(broker: Arc<Broker>, guard: ConnectionGuard, inbound_capacity: usize) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::channel(inbound_capacity);
        Self {
            broker,
            client_id: guard.client_id().to_string(),
            guard: Some(guard),
            inbound_tx,
            inbound_rx,
            forwarders: Vec::new(),
        }
    }

    fn ensure_open(&self) -> Result<(), ConnectionError> {
        if self.guard.is_none() {
            return Err(ConnectionError::Disconnected(format!(
                "client {} already closed",
                self.client_id
            )));
        }
        Ok(())
    }
}

impl Drop for InProcessClient {
    fn drop(&mut self) {
        for task in self.forwarders.drain(..) {
            task.abort();
        }
    }
}

#[async_trait]
impl BrokerClient for InProcessClient {
    fn client_id(&self) -> &str {
        &self.client_id
    }

    async fn publish(&self, topic: &str, payload: Bytes) -> Result<(), ConnectionError> {
        self.ensure_open()?;
        self.broker
            .publish(topic, payload)
            .await
            .map(|_| ())
            .map_err(|err| ConnectionError::Publish {
                topic: topic.to_string(),
                reason: err.to_string(),
            })
    }

    async fn subscribe(&mut self, topic: &str) -> Result<(), ConnectionError> {
        self.ensure_open()?;
        let mut subscription =
            self.broker
                .subscribe(topic)
                .await
                .map_err(|err: BrokerError| ConnectionError::Subscribe {
                    topic: topic.to_string(),
                    reason: err.to_string(),
                })?;
        let tx = self.inbound_tx.clone();
        let topic = topic.to_string();
        // Forward broker deliveries into the client inbox until either side closes.
        self.forwarders.push(tokio::spawn(async move {
            while let Some(payload) = subscription.recv().await {
                let message = InboundMessage {
                    topic: topic.clone(),
                    payload,
                    received_at_ms: unix_now_ms(),
                };
                if tx.send(message).await.is_err() {
                    break;
                }
            }
        }));
        Ok(())
    }

    async fn next_message(&mut self) -> Option<Result<InboundMessage, ConnectionError>> {
        if self.guard.is_none() {
            return None;
        }
        self.inbound_rx.recv().await.map(Ok)
    }

    async fn disconnect(mut self: Box<Self>) -> Result<(), ConnectionError> {
        for task in self.forwarders.drain(..) {
            task.abort();
        }
        if let Some(guard) = self.guard.take() {
            guard.close();
        }
        tracing::trace!(client_id = %self.client_id, "in-process client disconnected");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn refused_connection_maps_to_refused_error() {
        let broker = Arc::new(Broker::new());
        broker.refuse_client("attacker-1");
        let connector = InProcessConnector::new(broker);
        let err = connector.connect("attacker-1").await.err().expect("refused");
        assert!(matches!(err, ConnectionError::Refused { .. }));
    }

    #[tokio::test]
    async fn disconnect_releases_broker_slot() {
        let broker = Arc::new(Broker::new().with_max_connections(1));
        let connector = InProcessConnector::new(broker.clone());
        let client = connector.connect("one").await.expect("connect");
        assert!(connector.connect("two").await.is_err());
        client.disconnect().await.expect("disconnect");
        let client = connector.connect("two").await.expect("slot released");
        drop(client);
        let stats = broker.connection_stats();
        assert_eq!(stats.active, 0);
        assert_eq!(stats.opened, stats.closed);
    }

    #[tokio::test]
    async fn subscribed_client_receives_topic_and_payload() {
        let broker = Arc::new(Broker::new());
        let connector = InProcessConnector::new(broker);
        let mut sub = connector.connect("sub").await.expect("connect");
        sub.subscribe("iot/device/data").await.expect("subscribe");
        let publisher = connector.connect("pub").await.expect("connect");
        publisher
            .publish("iot/device/data", Bytes::from_static(b"{}"))
            .await
            .expect("publish");
        let msg = tokio::time::timeout(Duration::from_secs(1), sub.next_message())
            .await
            .expect("timeout")
            .expect("message")
            .expect("ok");
        assert_eq!(msg.topic, "iot/device/data");
        assert!(msg.received_at_ms > 0);
    }
}

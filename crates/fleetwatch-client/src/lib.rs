// Broker client capability used by the load generator and the monitor.
//
// A `Connector` opens brand-new connections; connections are never pooled or
// shared, so each caller owns exactly one `BrokerClient` and must hand it back
// through `disconnect`. Inbound messages are pulled with `next_message` rather
// than pushed through a callback, which keeps backpressure explicit at the
// consumer.
use async_trait::async_trait;
use bytes::Bytes;
use std::time::Duration;

pub mod config;
pub mod inprocess;
pub mod mqtt;

pub use config::{ClientConfig, QosLevel};
pub use inprocess::{InProcessClient, InProcessConnector};
pub use mqtt::{MqttClient, MqttConnector};

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    #[error("connection to {endpoint} refused: {reason}")]
    Refused { endpoint: String, reason: String },
    #[error("connect to {endpoint} timed out after {timeout:?}")]
    Timeout { endpoint: String, timeout: Duration },
    #[error("connection lost: {0}")]
    Disconnected(String),
    #[error("publish to {topic} failed: {reason}")]
    Publish { topic: String, reason: String },
    #[error("subscribe to {topic} failed: {reason}")]
    Subscribe { topic: String, reason: String },
    #[error("invalid broker address: {0}")]
    InvalidAddress(String),
}

/// A message delivered from a subscribed topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Bytes,
    /// Arrival time at this client, unix millis.
    pub received_at_ms: u64,
}

#[async_trait]
pub trait BrokerClient: Send + Sync {
    fn client_id(&self) -> &str;

    async fn publish(&self, topic: &str, payload: Bytes) -> Result<(), ConnectionError>;

    async fn subscribe(&mut self, topic: &str) -> Result<(), ConnectionError>;

    /// Next message from any subscribed topic. `None` once the connection is
    /// closed; `Some(Err(_))` reports a connection loss before closing.
    async fn next_message(&mut self) -> Option<Result<InboundMessage, ConnectionError>>;

    /// Close the connection and release its resources.
    async fn disconnect(self: Box<Self>) -> Result<(), ConnectionError>;
}

#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a new, independent connection identified by `client_id`.
    async fn connect(&self, client_id: &str) -> Result<Box<dyn BrokerClient>, ConnectionError>;

    /// Human readable endpoint for logs.
    fn endpoint(&self) -> String;
}

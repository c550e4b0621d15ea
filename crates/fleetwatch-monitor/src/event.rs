// Messages as they arrive off the bus, and the decoded readings built from them.
use bytes::Bytes;
use fleetwatch_client::InboundMessage;
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMessage {
    pub topic: String,
    pub payload: Bytes,
    pub received_at_ms: u64,
}

impl RawMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>, received_at_ms: u64) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            received_at_ms,
        }
    }
}

impl From<InboundMessage> for RawMessage {
    fn from(message: InboundMessage) -> Self {
        Self {
            topic: message.topic,
            payload: message.payload,
            received_at_ms: message.received_at_ms,
        }
    }
}

/// A decoded reading. Bucketed by `timestamp_ms` (arrival time), never by
/// queue order.
#[derive(Debug, Clone, PartialEq)]
pub struct TelemetryEvent {
    pub timestamp_ms: u64,
    pub topic: String,
    pub fields: BTreeMap<String, f64>,
    pub payload_len: usize,
}

impl TelemetryEvent {
    pub fn field(&self, name: &str) -> Option<f64> {
        self.fields.get(name).copied()
    }
}

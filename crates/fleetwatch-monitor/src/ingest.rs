// Producer side of the ingestion queue.
//
// `on_raw_message` runs on the network path, so it never waits: decode
// failures and a full queue both drop the message and bump a counter.
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;

use crate::decode::{DecodeError, decode_telemetry};
use crate::event::{RawMessage, TelemetryEvent};

// Only the first few decode errors are logged; the counter keeps the rest.
const DECODE_ERROR_LOG_LIMIT: u64 = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    Enqueued,
    DecodeDropped,
    BackpressureDropped,
    /// The consumer is gone; nothing will read the queue again.
    Closed,
}

/// Point-in-time copy of the pipeline counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestCounters {
    pub received: u64,
    pub enqueued: u64,
    pub decode_errors: u64,
    pub backpressure_drops: u64,
}

/// Live counters shared between the pipeline and whoever reports on it.
#[derive(Debug, Default)]
pub struct IngestStats {
    received: AtomicU64,
    enqueued: AtomicU64,
    decode_errors: AtomicU64,
    backpressure_drops: AtomicU64,
}

impl IngestStats {
    pub fn snapshot(&self) -> IngestCounters {
        IngestCounters {
            received: self.received.load(Ordering::Relaxed),
            enqueued: self.enqueued.load(Ordering::Relaxed),
            decode_errors: self.decode_errors.load(Ordering::Relaxed),
            backpressure_drops: self.backpressure_drops.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone)]
pub struct IngestionPipeline {
    required_fields: Arc<[String]>,
    tx: mpsc::Sender<TelemetryEvent>,
    stats: Arc<IngestStats>,
}

impl IngestionPipeline {
    /// Create the pipeline and the consumer end of its bounded queue.
    pub fn new(
        required_fields: Vec<String>,
        capacity: usize,
    ) -> (Self, mpsc::Receiver<TelemetryEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let pipeline = Self {
            required_fields: required_fields.into(),
            tx,
            stats: Arc::new(IngestStats::default()),
        };
        (pipeline, rx)
    }

    pub fn on_raw_message(&self, message: RawMessage) -> IngestOutcome {
        self.stats.received.fetch_add(1, Ordering::Relaxed);
        let event = match decode_telemetry(&message, &self.required_fields[..]) {
            Ok(event) => event,
            Err(err) => {
                self.record_decode_error(&message, &err);
                return IngestOutcome::DecodeDropped;
            }
        };
        match self.tx.try_send(event) {
            Ok(()) => {
                self.stats.enqueued.fetch_add(1, Ordering::Relaxed);
                IngestOutcome::Enqueued
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.stats.backpressure_drops.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("fleetwatch_ingest_backpressure_drops_total").increment(1);
                IngestOutcome::BackpressureDropped
            }
            Err(mpsc::error::TrySendError::Closed(_)) => IngestOutcome::Closed,
        }
    }

    pub fn counters(&self) -> IngestCounters {
        self.stats.snapshot()
    }

    pub fn stats(&self) -> Arc<IngestStats> {
        Arc::clone(&self.stats)
    }

    pub fn required_fields(&self) -> &[String] {
        &self.required_fields
    }

    fn record_decode_error(&self, message: &RawMessage, err: &DecodeError) {
        let seen = self.stats.decode_errors.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("fleetwatch_ingest_decode_errors_total").increment(1);
        if seen >= DECODE_ERROR_LOG_LIMIT {
            return;
        }
        let preview_len = message.payload.len().min(64);
        let preview = String::from_utf8_lossy(&message.payload[..preview_len]);
        tracing::debug!(
            topic = %message.topic,
            payload_len = message.payload.len(),
            preview = %preview,
            error = %err,
            "dropping undecodable telemetry"
        );
    }
}

//! Telemetry monitoring over a sliding time window.
//!
//! # Data flow
//! ```text
//! subscriber -> IngestionPipeline -> bounded queue -> WindowAggregator -> MetricsQuery
//!                    (decode, drop)                    (bucket, evict,
//!                                                       detect, publish)
//! ```
//!
//! The pipeline never blocks the network side: undecodable messages and
//! messages arriving while the queue is full are dropped and counted. The
//! aggregator is the only writer of the window; readers get immutable
//! snapshots swapped in on each tick.
pub mod aggregator;
pub mod anomaly;
pub mod config;
pub mod decode;
pub mod event;
pub mod ingest;
pub mod query;
pub mod runtime;
pub mod window;

pub use aggregator::WindowAggregator;
pub use anomaly::{AnomalyDetector, AnomalyRecord, Transition};
pub use config::MonitorConfig;
pub use decode::{DecodeError, decode_telemetry};
pub use event::{RawMessage, TelemetryEvent};
pub use ingest::{IngestCounters, IngestOutcome, IngestStats, IngestionPipeline};
pub use query::{HistoryPoint, MetricsQuery, MetricsSnapshot, RecentEvent, SnapshotCounters};
pub use runtime::{Monitor, MonitorHandle, SubscriberStatus};
pub use window::{
    Admission, AggregatorState, EvictionReport, FieldStats, SeriesPoint, WindowBucket, WindowView,
};

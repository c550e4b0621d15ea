// Read side: immutable snapshots published by the aggregator.
use arc_swap::ArcSwap;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::anomaly::AnomalyRecord;
use crate::window::SeriesPoint;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotCounters {
    pub received: u64,
    pub decode_errors: u64,
    pub backpressure_drops: u64,
    pub expired_drops: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct HistoryPoint {
    pub timestamp: u64,
    pub value: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecentEvent {
    pub timestamp: u64,
    pub topic: String,
    pub fields: BTreeMap<String, f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub timestamp_taken: u64,
    pub event_count: u64,
    pub rate_per_second: f64,
    pub rate_per_minute: u64,
    pub per_field_series: BTreeMap<String, Vec<SeriesPoint>>,
    pub anomaly: AnomalyRecord,
    pub counters: SnapshotCounters,
    /// `ratePerMinute` sampled on each tick, oldest first.
    pub rate_history: Vec<HistoryPoint>,
    /// Latest admitted readings, newest last.
    pub recent: Vec<RecentEvent>,
}

impl MetricsSnapshot {
    pub fn empty(threshold: f64) -> Self {
        Self {
            timestamp_taken: 0,
            event_count: 0,
            rate_per_second: 0.0,
            rate_per_minute: 0,
            per_field_series: BTreeMap::new(),
            anomaly: AnomalyRecord {
                active: false,
                since: None,
                observed_rate: 0.0,
                threshold,
                transitions: 0,
            },
            counters: SnapshotCounters::default(),
            rate_history: Vec::new(),
            recent: Vec::new(),
        }
    }
}

/// Cheap, cloneable reader of the latest published snapshot.
///
/// Loading never takes a lock and never waits on the aggregator.
#[derive(Debug, Clone)]
pub struct MetricsQuery {
    current: Arc<ArcSwap<MetricsSnapshot>>,
}

impl MetricsQuery {
    pub(crate) fn new(current: Arc<ArcSwap<MetricsSnapshot>>) -> Self {
        Self { current }
    }

    pub fn snapshot(&self) -> Arc<MetricsSnapshot> {
        self.current.load_full()
    }

    pub fn anomaly(&self) -> AnomalyRecord {
        self.current.load().anomaly
    }

    pub fn to_json(&self) -> serde_json::Value {
        // Serializing plain maps and numbers cannot fail.
        serde_json::to_value(&*self.snapshot()).unwrap_or(serde_json::Value::Null)
    }
}

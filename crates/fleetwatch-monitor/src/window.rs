// Bucketed sliding-window state.
//
// Time is cut into fixed slots of `bucket_ms`; slot `n` covers
// `[n * bucket_ms, (n + 1) * bucket_ms)`. A bucket is retained while its slot
// end is no older than `now - window_ms`. Once a slot has been evicted the
// watermark `evicted_through` keeps late events from recreating it.
use serde::Serialize;
use std::collections::BTreeMap;

use crate::event::TelemetryEvent;

const MINUTE_MS: u64 = 60_000;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FieldStats {
    pub sum: f64,
    pub min: f64,
    pub max: f64,
    pub last: f64,
    pub count: u64,
}

impl FieldStats {
    fn new(value: f64) -> Self {
        Self {
            sum: value,
            min: value,
            max: value,
            last: value,
            count: 1,
        }
    }

    fn record(&mut self, value: f64) {
        self.sum += value;
        self.min = self.min.min(value);
        self.max = self.max.max(value);
        self.last = value;
        self.count += 1;
    }

    pub fn mean(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum / self.count as f64
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct WindowBucket {
    pub slot: u64,
    pub start_ms: u64,
    pub end_ms: u64,
    pub count: u64,
    pub fields: BTreeMap<String, FieldStats>,
}

impl WindowBucket {
    fn new(slot: u64, bucket_ms: u64) -> Self {
        let start_ms = slot * bucket_ms;
        Self {
            slot,
            start_ms,
            end_ms: start_ms.saturating_add(bucket_ms),
            count: 0,
            fields: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Admitted,
    /// The event's slot is outside the window or was already evicted.
    Expired,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EvictionReport {
    pub buckets: usize,
    pub events: u64,
}

/// One point of a per-field series: the field's statistics within a bucket.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SeriesPoint {
    /// Bucket start, unix millis.
    pub timestamp: u64,
    /// Mean of the field within the bucket.
    pub value: f64,
    pub min: f64,
    pub max: f64,
    pub count: u64,
}

/// Derived metrics over the retained buckets at a given instant.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WindowView {
    pub now_ms: u64,
    pub event_count: u64,
    pub rate_per_second: f64,
    pub rate_per_minute: u64,
    pub per_field_series: BTreeMap<String, Vec<SeriesPoint>>,
    pub buckets: usize,
}

#[derive(Debug, Clone)]
pub struct AggregatorState {
    window_ms: u64,
    bucket_ms: u64,
    buckets: BTreeMap<u64, WindowBucket>,
    evicted_through: Option<u64>,
    admitted: u64,
    evicted: u64,
    expired: u64,
}

impl AggregatorState {
    /// `window_ms` and `bucket_ms` are validated by the caller's config; zero
    /// widths are clamped to one millisecond.
    pub fn new(window_ms: u64, bucket_ms: u64) -> Self {
        let bucket_ms = bucket_ms.max(1);
        Self {
            window_ms: window_ms.max(bucket_ms),
            bucket_ms,
            buckets: BTreeMap::new(),
            evicted_through: None,
            admitted: 0,
            evicted: 0,
            expired: 0,
        }
    }

    pub fn window_ms(&self) -> u64 {
        self.window_ms
    }

    pub fn bucket_ms(&self) -> u64 {
        self.bucket_ms
    }

    fn slot_of(&self, timestamp_ms: u64) -> u64 {
        timestamp_ms / self.bucket_ms
    }

    fn horizon(&self, now_ms: u64) -> u64 {
        now_ms.saturating_sub(self.window_ms)
    }

    fn is_expired(&self, slot: u64, now_ms: u64) -> bool {
        if self.evicted_through.is_some_and(|through| slot <= through) {
            return true;
        }
        (slot + 1).saturating_mul(self.bucket_ms) < self.horizon(now_ms)
    }

    pub fn ingest(&mut self, event: &TelemetryEvent, now_ms: u64) -> Admission {
        let slot = self.slot_of(event.timestamp_ms);
        if self.is_expired(slot, now_ms) {
            self.expired += 1;
            return Admission::Expired;
        }
        let bucket_ms = self.bucket_ms;
        let bucket = self
            .buckets
            .entry(slot)
            .or_insert_with(|| WindowBucket::new(slot, bucket_ms));
        bucket.count += 1;
        for (name, value) in &event.fields {
            match bucket.fields.get_mut(name) {
                Some(stats) => stats.record(*value),
                None => {
                    bucket.fields.insert(name.clone(), FieldStats::new(*value));
                }
            }
        }
        self.admitted += 1;
        Admission::Admitted
    }

    /// Drop every bucket whose slot end is older than `now - window`.
    pub fn evict(&mut self, now_ms: u64) -> EvictionReport {
        let horizon = self.horizon(now_ms);
        let mut report = EvictionReport::default();
        while let Some(entry) = self.buckets.first_entry() {
            if entry.get().end_ms >= horizon {
                break;
            }
            let bucket = entry.remove();
            report.buckets += 1;
            report.events += bucket.count;
            self.evicted_through = Some(bucket.slot);
        }
        // Advance past empty slots too, so nothing can land behind the horizon.
        if let Some(dead_through) = horizon
            .checked_sub(1)
            .and_then(|last_ms| (last_ms / self.bucket_ms).checked_sub(1))
            && self.evicted_through.is_none_or(|through| through < dead_through)
        {
            self.evicted_through = Some(dead_through);
        }
        self.evicted += report.events;
        report
    }

    /// Derived metrics at `now_ms`. Buckets past the horizon are skipped even
    /// if `evict` has not run yet.
    pub fn view(&self, now_ms: u64) -> WindowView {
        let horizon = self.horizon(now_ms);
        let minute_horizon = now_ms.saturating_sub(self.window_ms.min(MINUTE_MS));
        let current_slot = self.slot_of(now_ms);
        let mut view = WindowView {
            now_ms,
            ..WindowView::default()
        };
        for bucket in self.buckets.values().filter(|b| b.end_ms >= horizon) {
            view.buckets += 1;
            view.event_count += bucket.count;
            if bucket.end_ms > minute_horizon {
                view.rate_per_minute += bucket.count;
            }
            for (name, stats) in &bucket.fields {
                view.per_field_series
                    .entry(name.clone())
                    .or_default()
                    .push(SeriesPoint {
                        timestamp: bucket.start_ms,
                        value: stats.mean(),
                        min: stats.min,
                        max: stats.max,
                        count: stats.count,
                    });
            }
        }
        // Rate comes from the most recently closed bucket, the one just before `now`.
        let closed = current_slot
            .checked_sub(1)
            .and_then(|slot| self.buckets.get(&slot))
            .filter(|bucket| bucket.end_ms >= horizon)
            .map(|bucket| bucket.count)
            .unwrap_or(0);
        view.rate_per_second = closed as f64 * 1_000.0 / self.bucket_ms as f64;
        view
    }

    pub fn buckets(&self) -> impl Iterator<Item = &WindowBucket> {
        self.buckets.values()
    }

    pub fn retained_events(&self) -> u64 {
        self.buckets.values().map(|bucket| bucket.count).sum()
    }

    pub fn admitted(&self) -> u64 {
        self.admitted
    }

    pub fn evicted(&self) -> u64 {
        self.evicted
    }

    /// Events refused because their slot had already left the window.
    pub fn expired(&self) -> u64 {
        self.expired
    }
}

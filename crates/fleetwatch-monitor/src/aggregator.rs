// Consumer side: owns the window state and publishes snapshots.
//
// `WindowAggregator` is the single writer of `AggregatorState`. Readers only
// see what `tick` publishes through the `ArcSwap`, so a snapshot is never a
// half-evicted window.
use arc_swap::ArcSwap;
use fleetwatch_common::{Clock, shutdown};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;

use crate::anomaly::{AnomalyDetector, Transition};
use crate::config::MonitorConfig;
use crate::event::TelemetryEvent;
use crate::ingest::IngestStats;
use crate::query::{HistoryPoint, MetricsQuery, MetricsSnapshot, RecentEvent, SnapshotCounters};
use crate::window::{Admission, AggregatorState};

pub struct WindowAggregator {
    state: AggregatorState,
    detector: AnomalyDetector,
    clock: Arc<dyn Clock>,
    tick_interval: Duration,
    ingest_stats: Option<Arc<IngestStats>>,
    recent: VecDeque<RecentEvent>,
    recent_capacity: usize,
    rate_history: VecDeque<HistoryPoint>,
    published: Arc<ArcSwap<MetricsSnapshot>>,
}

impl std::fmt::Debug for WindowAggregator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WindowAggregator")
            .field("window_ms", &self.state.window_ms())
            .field("bucket_ms", &self.state.bucket_ms())
            .field("threshold", &self.detector.threshold())
            .finish_non_exhaustive()
    }
}

impl WindowAggregator {
    pub fn new(config: &MonitorConfig, clock: Arc<dyn Clock>) -> Self {
        let detector =
            AnomalyDetector::new(config.dos_threshold).with_hysteresis(config.hysteresis);
        Self {
            state: AggregatorState::new(config.window_ms(), config.bucket_ms()),
            published: Arc::new(ArcSwap::from_pointee(MetricsSnapshot::empty(
                config.dos_threshold,
            ))),
            detector,
            clock,
            tick_interval: config.tick_interval().max(Duration::from_millis(1)),
            ingest_stats: None,
            recent: VecDeque::with_capacity(config.recent_capacity),
            recent_capacity: config.recent_capacity,
            rate_history: VecDeque::new(),
        }
    }

    /// Report these pipeline counters in every snapshot.
    pub fn with_ingest_stats(mut self, stats: Arc<IngestStats>) -> Self {
        self.ingest_stats = Some(stats);
        self
    }

    pub fn query(&self) -> MetricsQuery {
        MetricsQuery::new(Arc::clone(&self.published))
    }

    pub fn state(&self) -> &AggregatorState {
        &self.state
    }

    pub fn ingest(&mut self, event: TelemetryEvent) -> Admission {
        let now_ms = self.clock.now_ms();
        let admission = self.state.ingest(&event, now_ms);
        match admission {
            Admission::Admitted => {
                if self.recent_capacity > 0 {
                    if self.recent.len() == self.recent_capacity {
                        self.recent.pop_front();
                    }
                    self.recent.push_back(RecentEvent {
                        timestamp: event.timestamp_ms,
                        topic: event.topic,
                        fields: event.fields,
                    });
                }
            }
            Admission::Expired => {
                metrics::counter!("fleetwatch_window_expired_drops_total").increment(1);
                tracing::trace!(timestamp_ms = event.timestamp_ms, now_ms, "event older than window");
            }
        }
        admission
    }

    /// Evict, evaluate the detector on the closed-bucket rate, and publish.
    pub fn tick(&mut self) -> Transition {
        let now_ms = self.clock.now_ms();
        let evicted = self.state.evict(now_ms);
        if evicted.buckets > 0 {
            tracing::trace!(buckets = evicted.buckets, events = evicted.events, "evicted buckets");
        }
        let view = self.state.view(now_ms);
        let transition = self.detector.evaluate(view.rate_per_second, now_ms);

        self.rate_history.push_back(HistoryPoint {
            timestamp: now_ms,
            value: view.rate_per_minute as f64,
        });
        let horizon = now_ms.saturating_sub(self.state.window_ms());
        while self
            .rate_history
            .front()
            .is_some_and(|point| point.timestamp < horizon)
        {
            self.rate_history.pop_front();
        }

        metrics::gauge!("fleetwatch_window_events").set(view.event_count as f64);
        metrics::gauge!("fleetwatch_rate_per_second").set(view.rate_per_second);
        self.published.store(Arc::new(self.build_snapshot(now_ms)));
        transition
    }

    /// A live snapshot of the window at the current clock reading. Does not
    /// evict, evaluate or publish.
    pub fn snapshot(&self) -> MetricsSnapshot {
        self.build_snapshot(self.clock.now_ms())
    }

    fn build_snapshot(&self, now_ms: u64) -> MetricsSnapshot {
        let view = self.state.view(now_ms);
        let ingest = self
            .ingest_stats
            .as_ref()
            .map(|stats| stats.snapshot())
            .unwrap_or_default();
        MetricsSnapshot {
            timestamp_taken: now_ms,
            event_count: view.event_count,
            rate_per_second: view.rate_per_second,
            rate_per_minute: view.rate_per_minute,
            per_field_series: view.per_field_series,
            anomaly: self.detector.record(),
            counters: SnapshotCounters {
                received: ingest.received,
                decode_errors: ingest.decode_errors,
                backpressure_drops: ingest.backpressure_drops,
                expired_drops: self.state.expired(),
            },
            rate_history: self.rate_history.iter().copied().collect(),
            recent: self.recent.iter().cloned().collect(),
        }
    }

    /// Consume events and tick until cancelled. The last snapshot is
    /// published before returning.
    pub async fn run(
        mut self,
        mut events: mpsc::Receiver<TelemetryEvent>,
        mut cancel: watch::Receiver<bool>,
    ) -> Self {
        let mut ticker = tokio::time::interval(self.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut inputs_open = true;
        loop {
            tokio::select! {
                biased;
                _ = shutdown::cancelled(&mut cancel) => break,
                _ = ticker.tick() => {
                    self.tick();
                }
                event = events.recv(), if inputs_open => match event {
                    Some(event) => {
                        self.ingest(event);
                    }
                    None => {
                        tracing::debug!("ingestion queue closed; ticking until cancelled");
                        inputs_open = false;
                    }
                },
            }
        }
        while let Ok(event) = events.try_recv() {
            self.ingest(event);
        }
        self.tick();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleetwatch_common::ManualClock;
    use std::collections::BTreeMap;

    const T0: u64 = 1_700_000_000_000;

    fn event(at_ms: u64) -> TelemetryEvent {
        TelemetryEvent {
            timestamp_ms: at_ms,
            topic: "iot/device/data".into(),
            fields: BTreeMap::from([
                ("temperature".to_string(), 22.0),
                ("humidity".to_string(), 45.0),
            ]),
            payload_len: 42,
        }
    }

    fn aggregator(clock: &ManualClock) -> WindowAggregator {
        let config = MonitorConfig {
            recent_capacity: 3,
            ..MonitorConfig::default()
        };
        WindowAggregator::new(&config, Arc::new(clock.clone()))
    }

    #[test]
    fn readers_only_see_published_ticks() {
        let clock = ManualClock::new(T0);
        let mut agg = aggregator(&clock);
        let query = agg.query();
        agg.ingest(event(T0));
        assert_eq!(query.snapshot().event_count, 0);
        assert_eq!(agg.snapshot().event_count, 1);
        agg.tick();
        assert_eq!(query.snapshot().event_count, 1);
        assert_eq!(query.snapshot().timestamp_taken, T0);
    }

    #[test]
    fn largest_accepted_window_does_not_overflow() {
        let config = MonitorConfig {
            window_secs: u64::MAX / 1_000,
            bucket_secs: u64::MAX / 1_000,
            ..MonitorConfig::default()
        };
        assert!(config.validate().is_ok());
        let clock = ManualClock::new(T0);
        let mut agg = WindowAggregator::new(&config, Arc::new(clock.clone()));
        assert_eq!(agg.ingest(event(T0)), Admission::Admitted);
        agg.tick();
        assert_eq!(agg.query().snapshot().event_count, 1);
    }

    #[test]
    fn double_tick_without_events_is_stable() {
        let clock = ManualClock::new(T0);
        let mut agg = aggregator(&clock);
        for i in 0..5 {
            agg.ingest(event(T0 + i * 100));
        }
        clock.advance_secs(70);
        agg.tick();
        let first = agg.query().snapshot();
        agg.tick();
        let second = agg.query().snapshot();
        assert_eq!(first.event_count, 0);
        assert_eq!(first.event_count, second.event_count);
        assert_eq!(first.per_field_series, second.per_field_series);
        assert_eq!(first.anomaly, second.anomaly);
    }

    #[test]
    fn recent_feed_keeps_newest_entries() {
        let clock = ManualClock::new(T0);
        let mut agg = aggregator(&clock);
        for i in 0..5 {
            agg.ingest(event(T0 + i));
        }
        let snapshot = agg.snapshot();
        let stamps: Vec<u64> = snapshot.recent.iter().map(|r| r.timestamp).collect();
        assert_eq!(stamps, vec![T0 + 2, T0 + 3, T0 + 4]);
    }

    #[test]
    fn expired_events_are_counted_in_snapshot() {
        let clock = ManualClock::new(T0 + 120_000);
        let mut agg = aggregator(&clock);
        assert_eq!(agg.ingest(event(T0)), Admission::Expired);
        assert_eq!(agg.snapshot().counters.expired_drops, 1);
        assert!(agg.snapshot().recent.is_empty());
    }

    #[test]
    fn rate_history_is_sampled_per_tick_and_trimmed() {
        let clock = ManualClock::new(T0);
        let mut agg = aggregator(&clock);
        for _ in 0..70 {
            agg.ingest(event(clock.now_ms()));
            clock.advance_secs(1);
            agg.tick();
        }
        let history = agg.query().snapshot().rate_history.clone();
        assert!(history.len() <= 61);
        let newest = history.last().expect("sample");
        assert_eq!(newest.timestamp, clock.now_ms());
        assert!(history.iter().all(|p| p.timestamp >= clock.now_ms() - 60_000));
    }

    #[tokio::test]
    async fn run_stops_on_cancel_and_publishes_final_snapshot() {
        let clock = ManualClock::new(T0);
        let agg = aggregator(&clock);
        let query = agg.query();
        let (tx, rx) = mpsc::channel(8);
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let task = tokio::spawn(agg.run(rx, cancel_rx));
        for i in 0..3 {
            tx.send(event(T0 + i)).await.expect("send");
        }
        drop(tx);
        cancel_tx.send(true).expect("cancel");
        let agg = tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .expect("timeout")
            .expect("join");
        assert_eq!(agg.state().admitted(), 3);
        assert_eq!(query.snapshot().event_count, 3);
    }
}

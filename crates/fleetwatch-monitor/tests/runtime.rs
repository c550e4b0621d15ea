// Monitor wired to an in-process broker with real time.
use bytes::Bytes;
use fleetwatch_broker::Broker;
use fleetwatch_client::{Connector, InProcessConnector};
use fleetwatch_common::clock::unix_now_ms;
use fleetwatch_common::{ManualClock, SystemClock};
use fleetwatch_loadgen::{LoadGenerator, LoadPlan, StaticPayload};
use fleetwatch_monitor::{MetricsQuery, Monitor, MonitorConfig, MonitorHandle};
use std::sync::Arc;
use std::time::Duration;

const TOPIC: &str = "iot/device/data";

fn config() -> MonitorConfig {
    MonitorConfig {
        tick_interval_ms: 20,
        reconnect_delay_ms: 20,
        ..MonitorConfig::default()
    }
}

fn start(broker: &Arc<Broker>, config: MonitorConfig) -> MonitorHandle {
    let connector = Arc::new(InProcessConnector::new(Arc::clone(broker)));
    Monitor::start(config, connector, Arc::new(SystemClock)).expect("start")
}

async fn wait_until(query: &MetricsQuery, what: &str, check: impl Fn(&MetricsQuery) -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !check(query) {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {what}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

async fn wait_for_subscriber(broker: &Broker) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while broker.subscriber_count(TOPIC).await == 0 {
        assert!(tokio::time::Instant::now() < deadline, "subscriber never attached");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn readings_published_on_the_bus_reach_the_snapshot() {
    let broker = Arc::new(Broker::new());
    let monitor = start(&broker, config());
    wait_for_subscriber(&broker).await;

    let publisher = InProcessConnector::new(Arc::clone(&broker))
        .connect("device-1")
        .await
        .expect("connect");
    for temperature in [21.0, 22.0, 23.0] {
        let payload = format!(r#"{{"temperature": {temperature}, "humidity": 45.5}}"#);
        publisher
            .publish(TOPIC, Bytes::from(payload))
            .await
            .expect("publish");
    }
    publisher.disconnect().await.expect("disconnect");

    let query = monitor.query();
    wait_until(&query, "three events", |q| q.snapshot().event_count == 3).await;
    let snapshot = query.snapshot();
    assert!(snapshot.per_field_series.contains_key("humidity"));
    assert_eq!(snapshot.recent.len(), 3);
    assert_eq!(snapshot.recent[2].fields["temperature"], 23.0);

    monitor.shutdown().await;
    assert_eq!(broker.active_connections(), 0);
}

#[tokio::test]
async fn bus_readings_are_bucketed_on_the_monitor_clock() {
    let broker = Arc::new(Broker::new());
    let start_ms = (unix_now_ms() + 120_000) / 1_000 * 1_000;
    let clock = ManualClock::new(start_ms);
    let connector = Arc::new(InProcessConnector::new(Arc::clone(&broker)));
    let monitor = Monitor::start(config(), connector, Arc::new(clock.clone())).expect("start");
    wait_for_subscriber(&broker).await;

    let publisher = InProcessConnector::new(Arc::clone(&broker))
        .connect("device-1")
        .await
        .expect("connect");
    publisher
        .publish(TOPIC, Bytes::from_static(br#"{"temperature": 21.5, "humidity": 40.0}"#))
        .await
        .expect("publish");
    publisher.disconnect().await.expect("disconnect");

    let query = monitor.query();
    wait_until(&query, "one event", |q| q.snapshot().event_count == 1).await;
    let snapshot = query.snapshot();
    assert_eq!(snapshot.counters.expired_drops, 0);
    assert_eq!(snapshot.recent[0].timestamp, start_ms);
    assert_eq!(snapshot.per_field_series["temperature"][0].timestamp, start_ms);

    // Only the injected clock moves the window; the bucket ends at start + 1 s.
    clock.advance_secs(62);
    wait_until(&query, "eviction", |q| q.snapshot().event_count == 0).await;
    monitor.shutdown().await;
}

#[tokio::test]
async fn spam_flood_is_counted_as_decode_errors() {
    let broker = Arc::new(Broker::new());
    let monitor = start(&broker, config());
    wait_for_subscriber(&broker).await;

    let generator = LoadGenerator::new(
        Arc::new(InProcessConnector::new(Arc::clone(&broker))),
        Arc::new(StaticPayload::spam()),
    );
    let report = generator
        .run(&LoadPlan::new(10, 20, TOPIC).with_max_concurrent_sessions(5))
        .await
        .expect("run");
    assert_eq!(report.published, 200);

    let query = monitor.query();
    wait_until(&query, "decode errors", |q| {
        let counters = q.snapshot().counters;
        counters.decode_errors >= 1 && counters.received == counters.decode_errors
    })
    .await;
    assert_eq!(query.snapshot().event_count, 0);
    monitor.shutdown().await;
}

#[tokio::test]
async fn unreachable_broker_is_retried_until_it_accepts() {
    let broker = Arc::new(Broker::new());
    broker.set_accepting(false);
    let monitor = start(&broker, config());
    let status = monitor.status();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while status.failures() < 2 {
        assert!(tokio::time::Instant::now() < deadline, "no retries observed");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(!status.is_connected());

    broker.set_accepting(true);
    wait_for_subscriber(&broker).await;
    assert!(status.connects() >= 1);

    monitor.shutdown().await;
    assert_eq!(broker.active_connections(), 0);
}

#[test]
fn invalid_config_is_rejected_before_any_task_starts() {
    let broker = Arc::new(Broker::new());
    let connector = Arc::new(InProcessConnector::new(broker.clone()));
    let err = Monitor::start(
        MonitorConfig {
            bucket_secs: 0,
            ..MonitorConfig::default()
        },
        connector,
        Arc::new(SystemClock),
    )
    .expect_err("invalid");
    assert!(err.to_string().contains("bucket_secs"));
    assert_eq!(broker.connection_stats().opened, 0);
}

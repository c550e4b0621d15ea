// Self-contained demo: an in-process broker, a few well-behaved devices, a
// telemetry flood that trips the anomaly flag, and the recovery afterwards.
use anyhow::{Context, Result, bail};
use clap::Parser;
use fleetwatch_broker::Broker;
use fleetwatch_client::{Connector, InProcessConnector};
use fleetwatch_common::{DEFAULT_TOPIC, SystemClock};
use fleetwatch_loadgen::{DeviceSimulator, LoadGenerator, LoadPlan, TelemetryPayload};
use fleetwatch_monitor::{MetricsQuery, Monitor, MonitorConfig};
use fleetwatch_test_harness::init_tracing;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "flood-demo")]
#[command(about = "Trip and clear the flood detector without an external broker")]
struct Args {
    /// Number of background devices publishing every `--device-interval-ms`
    #[arg(long, default_value_t = 3)]
    devices: usize,

    #[arg(long, default_value_t = 500)]
    device_interval_ms: u64,

    /// Flood sessions
    #[arg(long, default_value_t = 20)]
    sessions: usize,

    /// Messages per flood session
    #[arg(long, default_value_t = 200)]
    messages: u64,

    /// Readings per second above which the flood is flagged
    #[arg(long, default_value_t = 50.0)]
    threshold: f64,

    /// Give up waiting for the anomaly to clear after this many seconds
    #[arg(long, default_value_t = 30)]
    settle_secs: u64,
}

async fn wait_for(query: &MetricsQuery, active: bool, limit: Duration) -> Result<()> {
    let started = tokio::time::Instant::now();
    while query.anomaly().active != active {
        if started.elapsed() > limit {
            bail!("anomaly did not become {active} within {limit:?}");
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();

    let broker = Arc::new(Broker::new());
    let connector: Arc<dyn Connector> = Arc::new(InProcessConnector::new(Arc::clone(&broker)));
    let config = MonitorConfig {
        window_secs: 10,
        dos_threshold: args.threshold,
        tick_interval_ms: 250,
        ..MonitorConfig::default()
    };
    let handle = Monitor::start(config, Arc::clone(&connector), Arc::new(SystemClock))
        .context("failed to start monitor")?;
    let query = handle.query();

    let (stop_tx, stop_rx) = watch::channel(false);
    let mut devices = JoinSet::new();
    for id in 0..args.devices {
        let device = DeviceSimulator::new(
            Arc::clone(&connector),
            format!("iot-device-{}", id + 1),
            DEFAULT_TOPIC,
        )
        .with_interval(Duration::from_millis(args.device_interval_ms));
        devices.spawn(device.run(stop_rx.clone()));
    }

    tokio::time::sleep(Duration::from_secs(2)).await;
    let calm = query.snapshot();
    info!(rate_per_second = calm.rate_per_second, events = calm.event_count, "baseline");

    let plan = LoadPlan::new(args.sessions, args.messages, DEFAULT_TOPIC)
        .with_publish_interval(Duration::from_millis(5));
    let flood = LoadGenerator::new(Arc::clone(&connector), Arc::new(TelemetryPayload::default()))
        .spawn(plan);
    wait_for(&query, true, Duration::from_secs(10)).await?;
    let flagged = query.snapshot();
    info!(
        rate_per_second = flagged.rate_per_second,
        since = ?flagged.anomaly.since,
        "flood detected"
    );

    let report = flood.await.context("flood task panicked")??;
    info!(
        published = report.published,
        completed = report.completed,
        failed = report.failed,
        "flood finished"
    );

    wait_for(&query, false, Duration::from_secs(args.settle_secs)).await?;
    info!(transitions = query.anomaly().transitions, "flood cleared");

    let _ = stop_tx.send(true);
    while let Some(joined) = devices.join_next().await {
        let published = joined.context("device task panicked")??;
        tracing::debug!(published, "device stopped");
    }
    handle.shutdown().await;
    println!("{}", serde_json::to_string_pretty(&*query.snapshot())?);
    let stats = broker.connection_stats();
    info!(opened = stats.opened, closed = stats.closed, "broker connections");
    Ok(())
}

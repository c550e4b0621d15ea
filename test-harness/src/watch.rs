// Run the monitor against a live broker and print what it sees.
use anyhow::{Context, Result};
use clap::Parser;
use fleetwatch_common::SystemClock;
use fleetwatch_common::shutdown;
use fleetwatch_monitor::{MetricsSnapshot, Monitor, MonitorConfig};
use fleetwatch_test_harness::{BrokerArgs, cancel_on_ctrl_c, init_tracing};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Parser, Debug)]
#[command(name = "watch")]
#[command(about = "Subscribe to device telemetry and print window snapshots")]
struct Args {
    #[command(flatten)]
    broker: BrokerArgs,

    /// Milliseconds between printed snapshots
    #[arg(long, default_value_t = 1000)]
    print_every_ms: u64,

    /// Print full snapshots as JSON instead of a summary line
    #[arg(long)]
    json: bool,

    /// Stop after this many seconds (0 = until interrupted)
    #[arg(long, default_value_t = 0)]
    timeout_secs: u64,
}

fn summary(snapshot: &MetricsSnapshot) -> String {
    let anomaly = if snapshot.anomaly.active { "DOS" } else { "ok" };
    let latest: Vec<String> = snapshot
        .per_field_series
        .iter()
        .filter_map(|(name, series)| series.last().map(|p| format!("{name}={:.2}", p.value)))
        .collect();
    format!(
        "[{anomaly}] events={} rate/s={:.1} rate/min={} decode_errors={} drops={} {}",
        snapshot.event_count,
        snapshot.rate_per_second,
        snapshot.rate_per_minute,
        snapshot.counters.decode_errors,
        snapshot.counters.backpressure_drops,
        latest.join(" "),
    )
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();

    let mut config = MonitorConfig::from_env_or_yaml(None)?;
    config.endpoint = args.broker.endpoint();
    config.topic = args.broker.topic.clone();
    let handle = Monitor::start(config, args.broker.connector()?, Arc::new(SystemClock))
        .context("failed to start monitor")?;
    let query = handle.query();

    let mut cancel = cancel_on_ctrl_c();
    let deadline = (args.timeout_secs > 0)
        .then(|| Instant::now() + Duration::from_secs(args.timeout_secs));
    let mut ticker = tokio::time::interval(Duration::from_millis(args.print_every_ms.max(1)));
    loop {
        tokio::select! {
            _ = shutdown::cancelled(&mut cancel) => break,
            _ = async {
                match deadline {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending().await,
                }
            } => break,
            _ = ticker.tick() => {
                let snapshot = query.snapshot();
                if args.json {
                    println!("{}", serde_json::to_string(&*snapshot)?);
                } else {
                    println!("{}", summary(&snapshot));
                }
            }
        }
    }

    handle.shutdown().await;
    println!("{}", serde_json::to_string_pretty(&*query.snapshot())?);
    Ok(())
}

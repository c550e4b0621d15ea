// A single simulated device publishing temperature and humidity readings.
use anyhow::Result;
use clap::Parser;
use fleetwatch_loadgen::{DeviceSimulator, TelemetryPayload};
use fleetwatch_test_harness::{BrokerArgs, cancel_on_ctrl_c, init_tracing};
use std::time::Duration;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "device")]
#[command(about = "Publish random device readings on a fixed interval")]
struct Args {
    #[command(flatten)]
    broker: BrokerArgs,

    /// Client id of the simulated device
    #[arg(long, default_value = "iot-device-1")]
    id: String,

    /// Milliseconds between readings
    #[arg(long, default_value_t = 2000)]
    interval_ms: u64,

    /// Stop after this many readings (0 = until interrupted)
    #[arg(long, default_value_t = 0)]
    count: u64,

    /// Extra numeric field to include, as name=min..max (e.g. battery=20..100)
    #[arg(long)]
    extra: Vec<String>,
}

fn parse_extra(spec: &str) -> Result<(String, std::ops::Range<f64>)> {
    let (name, range) = spec
        .split_once('=')
        .ok_or_else(|| anyhow::anyhow!("expected name=min..max, got {spec:?}"))?;
    let (min, max) = range
        .split_once("..")
        .ok_or_else(|| anyhow::anyhow!("expected min..max in {spec:?}"))?;
    Ok((name.trim().to_string(), min.trim().parse()?..max.trim().parse()?))
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();

    let mut payload = TelemetryPayload::default();
    for spec in &args.extra {
        let (name, range) = parse_extra(spec)?;
        payload = payload.with_field(name, range);
    }
    let mut device = DeviceSimulator::new(args.broker.connector()?, &args.id, &args.broker.topic)
        .with_interval(Duration::from_millis(args.interval_ms))
        .with_payload(payload);
    if args.count > 0 {
        device = device.with_limit(args.count);
    }
    let published = device.run(cancel_on_ctrl_c()).await?;
    info!(id = %args.id, published, "device stopped");
    Ok(())
}

// Flood a topic from many independent MQTT sessions.
use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use fleetwatch_loadgen::{LoadGenerator, LoadPlan, PayloadFactory, StaticPayload, TelemetryPayload};
use fleetwatch_test_harness::{BrokerArgs, cancel_on_ctrl_c, init_tracing};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

#[derive(ValueEnum, Debug, Clone, Copy)]
enum PayloadKind {
    /// The literal "Spam message"
    Spam,
    /// Random temperature/humidity JSON
    Telemetry,
    /// `--payload-size` bytes of filler
    Filler,
}

#[derive(Parser, Debug)]
#[command(name = "flood")]
#[command(about = "Open many concurrent publishing sessions against one topic")]
struct Args {
    #[command(flatten)]
    broker: BrokerArgs,

    /// Number of sessions (one connection each)
    #[arg(long, env = "FLEETWATCH_SESSION_COUNT", default_value_t = 100)]
    sessions: usize,

    /// Messages each session publishes
    #[arg(long, env = "FLEETWATCH_MESSAGES_PER_SESSION", default_value_t = 1000)]
    messages: u64,

    /// Cap on simultaneously open sessions
    #[arg(long, env = "FLEETWATCH_MAX_CONCURRENT_SESSIONS", default_value_t = 256)]
    max_concurrent: usize,

    /// Pause between publishes within a session, in milliseconds (0 = flood)
    #[arg(long, default_value_t = 0)]
    interval_ms: u64,

    #[arg(long, value_enum, default_value_t = PayloadKind::Spam)]
    payload: PayloadKind,

    /// Payload size in bytes for `--payload filler`
    #[arg(long, default_value_t = 1024)]
    payload_size: usize,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();

    let plan = LoadPlan::new(args.sessions, args.messages, args.broker.topic.clone())
        .with_max_concurrent_sessions(args.max_concurrent)
        .with_publish_interval(Duration::from_millis(args.interval_ms));
    plan.validate().context("invalid load plan")?;
    let factory: Arc<dyn PayloadFactory> = match args.payload {
        PayloadKind::Spam => Arc::new(StaticPayload::spam()),
        PayloadKind::Telemetry => Arc::new(TelemetryPayload::default()),
        PayloadKind::Filler => Arc::new(StaticPayload::filler(args.payload_size)),
    };
    let connector = args.broker.connector()?;
    info!(
        endpoint = %connector.endpoint(),
        topic = %plan.topic,
        sessions = plan.session_count,
        messages = plan.messages_per_session,
        max_concurrent = plan.max_concurrent_sessions,
        payload = ?args.payload,
        "starting flood"
    );

    let report = LoadGenerator::new(connector, factory)
        .with_cancel(cancel_on_ctrl_c())
        .run(&plan)
        .await?;

    for failure in report.failures.iter().take(10) {
        warn!(index = failure.index, client_id = %failure.client_id, reason = %failure.reason, "session failed");
    }
    if report.failures.len() > 10 {
        warn!(more = report.failures.len() - 10, "further session failures omitted");
    }
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

//! Tracing and metrics setup for the monitor service.
//!
//! Installs an `EnvFilter` + fmt tracing subscriber and a global Prometheus
//! recorder. In tests the recorder handle is cached, since a process can only
//! install one recorder.
use metrics_exporter_prometheus::PrometheusBuilder;
use metrics_exporter_prometheus::PrometheusHandle;
#[cfg(test)]
use std::sync::OnceLock;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[cfg(test)]
static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Initializes logging and metrics. `RUST_LOG` controls the filter; the
/// default is `info`.
pub fn init_observability(service_name: &str) -> PrometheusHandle {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let fmt_layer = tracing_subscriber::fmt::layer();
    init_subscriber(tracing_subscriber::registry().with(filter).with(fmt_layer));

    let handle = install_metrics_recorder();
    describe_metrics();
    tracing::debug!(service = service_name, "observability initialized");
    handle
}

fn describe_metrics() {
    metrics::describe_counter!(
        "fleetwatch_ingest_decode_errors_total",
        "Messages dropped because the payload did not decode"
    );
    metrics::describe_counter!(
        "fleetwatch_ingest_backpressure_drops_total",
        "Decoded events dropped because the aggregation queue was full"
    );
    metrics::describe_counter!(
        "fleetwatch_window_expired_drops_total",
        "Events that arrived for a bucket already outside the window"
    );
    metrics::describe_gauge!("fleetwatch_window_events", "Events retained in the window");
    metrics::describe_gauge!(
        "fleetwatch_rate_per_second",
        "Message count of the most recently closed bucket, per second"
    );
    metrics::describe_counter!(
        "fleetwatch_anomaly_transitions_total",
        "Rate anomaly state changes by resulting state"
    );
    metrics::describe_counter!(
        "fleetwatch_client_connect_failures_total",
        "Broker connection attempts that were refused or timed out"
    );
    // Only populated with the in-process backend.
    metrics::describe_gauge!(
        "fleetwatch_broker_connections_active",
        "Open in-process broker connections"
    );
    metrics::describe_counter!(
        "fleetwatch_broker_dropped_total",
        "Payloads dropped at a full in-process subscriber queue"
    );
}

/// Panics if a recorder is already installed outside tests.
fn install_metrics_recorder() -> PrometheusHandle {
    #[cfg(test)]
    {
        if let Some(handle) = METRICS_HANDLE.get() {
            return handle.clone();
        }
        let handle = PrometheusBuilder::new()
            .install_recorder()
            .expect("install metrics recorder");
        let _ = METRICS_HANDLE.set(handle.clone());
        handle
    }
    #[cfg(not(test))]
    {
        PrometheusBuilder::new()
            .install_recorder()
            .expect("install metrics recorder")
    }
}

fn init_subscriber<S>(subscriber: S)
where
    S: tracing::Subscriber + Send + Sync + 'static,
{
    #[cfg(test)]
    {
        let _ = subscriber.try_init();
    }
    #[cfg(not(test))]
    {
        subscriber.init();
    }
}

// Monitor service main entry point.
mod observability;

use anyhow::{Context, Result};
use fleetwatch_broker::Broker;
use fleetwatch_client::{Connector, InProcessConnector, MqttConnector};
use fleetwatch_common::SystemClock;
use fleetwatch_monitor::Monitor;
use monitor::config::{Backend, ServiceConfig};
use monitor::http;
use std::future::Future;
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<()> {
    run_with_shutdown(async {
        let _ = tokio::signal::ctrl_c().await;
    })
    .await
}

async fn run_with_shutdown<F>(shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let metrics_handle = observability::init_observability("fleetwatch-monitor");

    // Configuration errors are fatal before any subscription starts.
    let config = ServiceConfig::from_env_or_yaml().context("load monitor config")?;
    let connector: Arc<dyn Connector> = match config.backend {
        Backend::Mqtt => Arc::new(MqttConnector::new(config.client.clone())),
        Backend::InProcess => {
            tracing::info!("using embedded in-process broker");
            Arc::new(InProcessConnector::new(Arc::new(Broker::new())))
        }
    };
    tracing::info!(endpoint = %connector.endpoint(), topic = %config.monitor.topic, "connecting");

    let handle = Monitor::start(config.monitor.clone(), connector, Arc::new(SystemClock))
        .context("start monitor")?;

    let listener = tokio::net::TcpListener::bind(config.http_bind)
        .await
        .with_context(|| format!("bind http listener {}", config.http_bind))?;
    tracing::info!(addr = %listener.local_addr()?, "http listener started");
    let app = http::router(metrics_handle, handle.query(), handle.status());
    let server = tokio::spawn(async move {
        if let Err(err) = axum::serve(listener, app.into_make_service()).await {
            tracing::warn!(error = %err, "http server exited");
        }
    });

    // Block until SIGINT so the process stays alive.
    shutdown.await;
    server.abort();
    handle.shutdown().await;
    Ok(())
}

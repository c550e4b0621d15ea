// Shared plumbing for the operator binaries.
use anyhow::{Context, Result};
use clap::Args;
use fleetwatch_client::{ClientConfig, Connector, MqttConnector};
use fleetwatch_common::{BrokerEndpoint, DEFAULT_TOPIC};
use std::sync::Arc;
use tokio::sync::watch;

/// Broker connection flags, shared by every binary that talks MQTT.
#[derive(Args, Debug, Clone)]
pub struct BrokerArgs {
    /// Broker host name or address
    #[arg(long, env = "FLEETWATCH_BROKER_HOST", default_value = "127.0.0.1")]
    pub host: String,

    /// Broker port
    #[arg(long, env = "FLEETWATCH_BROKER_PORT", default_value_t = 1883)]
    pub port: u16,

    /// Seconds to wait for the broker to accept a connection
    #[arg(long, env = "FLEETWATCH_CONNECT_TIMEOUT_SECS", default_value_t = 60)]
    pub connect_timeout_secs: u64,

    /// Topic to publish to or subscribe on
    #[arg(long, env = "FLEETWATCH_TOPIC", default_value = DEFAULT_TOPIC)]
    pub topic: String,
}

impl BrokerArgs {
    pub fn endpoint(&self) -> BrokerEndpoint {
        BrokerEndpoint {
            host: self.host.clone(),
            port: self.port,
            connect_timeout_secs: self.connect_timeout_secs,
        }
    }

    /// Client settings from env/YAML with the endpoint taken from the flags.
    pub fn client_config(&self) -> Result<ClientConfig> {
        let mut config = ClientConfig::from_env_or_yaml(None)?;
        config.endpoint = self.endpoint();
        config.validate().context("invalid broker flags")?;
        Ok(config)
    }

    pub fn connector(&self) -> Result<Arc<dyn Connector>> {
        Ok(Arc::new(MqttConnector::new(self.client_config()?)))
    }
}

pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();
}

/// A cancellation signal that flips on the first Ctrl-C.
pub fn cancel_on_ctrl_c() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received, stopping");
            let _ = tx.send(true);
        }
    });
    rx
}

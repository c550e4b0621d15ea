use anyhow::{Context, Result};
use fleetwatch_client::ClientConfig;
use fleetwatch_monitor::MonitorConfig;
use serde::Deserialize;
use std::fs;
use std::net::SocketAddr;

const DEFAULT_HTTP_BIND: &str = "0.0.0.0:8080";

/// Where the subscriber gets its messages from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    /// An external MQTT broker at the configured endpoint.
    Mqtt,
    /// A broker embedded in this process; for demos and local runs.
    InProcess,
}

impl Backend {
    fn parse(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "mqtt" => Ok(Self::Mqtt),
            "in-process" | "inprocess" | "embedded" => Ok(Self::InProcess),
            other => anyhow::bail!("unknown broker backend {other:?} (expected mqtt or in-process)"),
        }
    }
}

// Monitor service configuration sourced from environment variables.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub monitor: MonitorConfig,
    // MQTT session settings; its endpoint always mirrors `monitor.endpoint`.
    pub client: ClientConfig,
    // HTTP listener for /snapshot, /metrics, /live and /ready.
    pub http_bind: SocketAddr,
    pub backend: Backend,
}

#[derive(Debug, Deserialize, Default)]
struct ServiceConfigOverride {
    http_bind: Option<String>,
    backend: Option<String>,
}

impl ServiceConfig {
    pub fn from_env() -> Result<Self> {
        let http_bind = std::env::var("FLEETWATCH_HTTP_BIND")
            .unwrap_or_else(|_| DEFAULT_HTTP_BIND.to_string())
            .parse()
            .with_context(|| "parse FLEETWATCH_HTTP_BIND")?;
        let backend = match std::env::var("FLEETWATCH_BROKER_BACKEND") {
            Ok(value) => Backend::parse(&value).context("parse FLEETWATCH_BROKER_BACKEND")?,
            Err(_) => Backend::Mqtt,
        };
        let monitor = MonitorConfig::from_env()?;
        let mut client = ClientConfig::from_env_or_yaml(None)?;
        client.endpoint = monitor.endpoint.clone();
        Ok(Self {
            monitor,
            client,
            http_bind,
            backend,
        })
    }

    /// Env defaults plus the YAML file named by `FLEETWATCH_CONFIG`. The same
    /// file carries monitor settings and the service keys `http_bind` and
    /// `backend`.
    pub fn from_env_or_yaml() -> Result<Self> {
        let mut config = Self::from_env()?;
        if let Ok(path) = std::env::var("FLEETWATCH_CONFIG") {
            config.monitor = MonitorConfig::from_env_or_yaml(Some(&path))?;
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("read FLEETWATCH_CONFIG: {path}"))?;
            let override_cfg: ServiceConfigOverride =
                serde_yaml::from_str(&contents).with_context(|| "parse service config yaml")?;
            if let Some(value) = override_cfg.http_bind {
                config.http_bind = value.parse().with_context(|| "parse http_bind")?;
            }
            if let Some(value) = override_cfg.backend {
                config.backend = Backend::parse(&value)?;
            }
            config.client.endpoint = config.monitor.endpoint.clone();
        }
        config.monitor.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;

    struct EnvGuard {
        key: &'static str,
        prev: Option<String>,
    }

    impl EnvGuard {
        fn set(key: &'static str, value: &str) -> Self {
            let prev = std::env::var(key).ok();
            unsafe {
                std::env::set_var(key, value);
            }
            Self { key, prev }
        }

        fn unset(key: &'static str) -> Self {
            let prev = std::env::var(key).ok();
            unsafe {
                std::env::remove_var(key);
            }
            Self { key, prev }
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            match &self.prev {
                Some(value) => unsafe {
                    std::env::set_var(self.key, value);
                },
                None => unsafe {
                    std::env::remove_var(self.key);
                },
            }
        }
    }

    #[test]
    #[serial]
    fn defaults_use_mqtt_backend() {
        let _g1 = EnvGuard::unset("FLEETWATCH_CONFIG");
        let _g2 = EnvGuard::unset("FLEETWATCH_HTTP_BIND");
        let _g3 = EnvGuard::unset("FLEETWATCH_BROKER_BACKEND");
        let config = ServiceConfig::from_env_or_yaml().expect("config");
        assert_eq!(config.backend, Backend::Mqtt);
        assert_eq!(config.http_bind, DEFAULT_HTTP_BIND.parse().expect("addr"));
        assert_eq!(config.client.endpoint, config.monitor.endpoint);
    }

    #[test]
    #[serial]
    fn yaml_sets_service_and_monitor_keys() {
        let _g1 = EnvGuard::unset("FLEETWATCH_BROKER_BACKEND");
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        writeln!(
            file,
            "http_bind: 127.0.0.1:9191\nbackend: in-process\nbroker_host: 10.0.0.18\ndos_threshold: 20"
        )
        .expect("write");
        let _g2 = EnvGuard::set("FLEETWATCH_CONFIG", file.path().to_str().expect("path"));
        let config = ServiceConfig::from_env_or_yaml().expect("config");
        assert_eq!(config.http_bind.port(), 9191);
        assert_eq!(config.backend, Backend::InProcess);
        assert_eq!(config.monitor.dos_threshold, 20.0);
        assert_eq!(config.client.endpoint.host, "10.0.0.18");
    }

    #[test]
    #[serial]
    fn unknown_backend_is_an_error() {
        let _g1 = EnvGuard::unset("FLEETWATCH_CONFIG");
        let _g2 = EnvGuard::set("FLEETWATCH_BROKER_BACKEND", "carrier-pigeon");
        assert!(ServiceConfig::from_env_or_yaml().is_err());
    }
}

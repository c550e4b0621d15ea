// Client-side defaults and connection settings.
use anyhow::{Context, Result};
use fleetwatch_common::{BrokerEndpoint, ConfigError};
use serde::Deserialize;
use std::fs;
use std::time::Duration;

pub(crate) const DEFAULT_KEEP_ALIVE_SECS: u64 = 60;
pub(crate) const DEFAULT_REQUEST_CAPACITY: usize = 1024;
pub(crate) const DEFAULT_INBOUND_CAPACITY: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QosLevel {
    #[default]
    AtMostOnce,
    AtLeastOnce,
    ExactlyOnce,
}

impl QosLevel {
    pub fn from_level(level: u8) -> Option<Self> {
        match level {
            0 => Some(Self::AtMostOnce),
            1 => Some(Self::AtLeastOnce),
            2 => Some(Self::ExactlyOnce),
            _ => None,
        }
    }

    pub(crate) fn to_mqtt(self) -> rumqttc::QoS {
        match self {
            Self::AtMostOnce => rumqttc::QoS::AtMostOnce,
            Self::AtLeastOnce => rumqttc::QoS::AtLeastOnce,
            Self::ExactlyOnce => rumqttc::QoS::ExactlyOnce,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClientConfig {
    pub endpoint: BrokerEndpoint,
    pub keep_alive_secs: u64,
    // Outgoing request queue between the client handle and its event loop.
    pub request_capacity: usize,
    // Inbound message queue between the event loop and `next_message`.
    pub inbound_capacity: usize,
    pub qos: QosLevel,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
struct ClientConfigOverride {
    broker_host: Option<String>,
    broker_port: Option<u16>,
    connect_timeout_secs: Option<u64>,
    keep_alive_secs: Option<u64>,
    request_capacity: Option<usize>,
    inbound_capacity: Option<usize>,
    qos: Option<u8>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            endpoint: BrokerEndpoint::default(),
            keep_alive_secs: DEFAULT_KEEP_ALIVE_SECS,
            request_capacity: DEFAULT_REQUEST_CAPACITY,
            inbound_capacity: DEFAULT_INBOUND_CAPACITY,
            qos: QosLevel::default(),
        }
    }
}

impl ClientConfig {
    pub fn new(endpoint: BrokerEndpoint) -> Self {
        Self {
            endpoint,
            ..Self::default()
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.endpoint.connect_timeout_secs)
    }

    pub fn from_env_or_yaml(config_path: Option<&str>) -> Result<Self> {
        let mut config = Self::from_env();
        let override_path = config_path
            .map(|value| value.to_string())
            .or_else(|| std::env::var("FLEETWATCH_CLIENT_CONFIG").ok());
        if let Some(path) = override_path.as_deref() {
            let contents =
                fs::read_to_string(path).with_context(|| format!("read client config: {path}"))?;
            let override_cfg: ClientConfigOverride =
                serde_yaml::from_str(&contents).context("parse client config yaml")?;
            override_cfg.apply(&mut config);
        }
        config.validate()?;
        Ok(config)
    }

    fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(value) = std::env::var("FLEETWATCH_BROKER_HOST")
            && !value.trim().is_empty()
        {
            config.endpoint.host = value;
        }
        if let Some(value) = read_u64_env("FLEETWATCH_BROKER_PORT")
            && let Ok(port) = u16::try_from(value)
        {
            config.endpoint.port = port;
        }
        if let Some(value) = read_u64_env("FLEETWATCH_CONNECT_TIMEOUT_SECS") {
            config.endpoint.connect_timeout_secs = value;
        }
        if let Some(value) = read_u64_env("FLEETWATCH_MQTT_KEEP_ALIVE_SECS") {
            config.keep_alive_secs = value;
        }
        if let Some(value) = read_usize_env("FLEETWATCH_MQTT_REQUEST_CAPACITY") {
            config.request_capacity = value;
        }
        if let Some(value) = read_usize_env("FLEETWATCH_MQTT_INBOUND_CAPACITY") {
            config.inbound_capacity = value;
        }
        if let Some(value) = std::env::var("FLEETWATCH_MQTT_QOS")
            .ok()
            .and_then(|value| value.parse::<u8>().ok())
            .and_then(QosLevel::from_level)
        {
            config.qos = value;
        }
        config
    }

    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        self.endpoint.validate()?;
        if self.request_capacity == 0 {
            return Err(ConfigError::NonPositive {
                name: "request_capacity",
            });
        }
        if self.inbound_capacity == 0 {
            return Err(ConfigError::NonPositive {
                name: "inbound_capacity",
            });
        }
        Ok(())
    }
}

impl ClientConfigOverride {
    fn apply(&self, config: &mut ClientConfig) {
        if let Some(value) = &self.broker_host
            && !value.trim().is_empty()
        {
            config.endpoint.host = value.clone();
        }
        if let Some(value) = self.broker_port
            && value > 0
        {
            config.endpoint.port = value;
        }
        if let Some(value) = self.connect_timeout_secs
            && value > 0
        {
            config.endpoint.connect_timeout_secs = value;
        }
        if let Some(value) = self.keep_alive_secs
            && value > 0
        {
            config.keep_alive_secs = value;
        }
        if let Some(value) = self.request_capacity
            && value > 0
        {
            config.request_capacity = value;
        }
        if let Some(value) = self.inbound_capacity
            && value > 0
        {
            config.inbound_capacity = value;
        }
        if let Some(value) = self.qos.and_then(QosLevel::from_level) {
            config.qos = value;
        }
    }
}

fn read_u64_env(key: &str) -> Option<u64> {
    std::env::var(key)
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .filter(|value| *value > 0)
}

fn read_usize_env(key: &str) -> Option<usize> {
    std::env::var(key)
        .ok()
        .and_then(|value| value.parse::<usize>().ok())
        .filter(|value| *value > 0)
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
    fn env_overrides_defaults() {
        let _g1 = EnvGuard::set("FLEETWATCH_BROKER_HOST", "10.2.8.52");
        let _g2 = EnvGuard::set("FLEETWATCH_BROKER_PORT", "1884");
        let _g3 = EnvGuard::set("FLEETWATCH_MQTT_QOS", "1");
        let _g4 = EnvGuard::unset("FLEETWATCH_CLIENT_CONFIG");
        let config = ClientConfig::from_env_or_yaml(None).expect("config");
        assert_eq!(config.endpoint.host, "10.2.8.52");
        assert_eq!(config.endpoint.port, 1884);
        assert_eq!(config.qos, QosLevel::AtLeastOnce);
    }

    #[test]
    #[serial]
    fn invalid_env_values_are_ignored() {
        let _g1 = EnvGuard::set("FLEETWATCH_BROKER_PORT", "70000");
        let _g2 = EnvGuard::set("FLEETWATCH_MQTT_QOS", "9");
        let _g3 = EnvGuard::unset("FLEETWATCH_BROKER_HOST");
        let _g4 = EnvGuard::unset("FLEETWATCH_CLIENT_CONFIG");
        let config = ClientConfig::from_env_or_yaml(None).expect("config");
        assert_eq!(config.endpoint.port, 1883);
        assert_eq!(config.qos, QosLevel::AtMostOnce);
    }

    #[test]
    #[serial]
    fn yaml_overrides_env() {
        let _g1 = EnvGuard::set("FLEETWATCH_BROKER_HOST", "from-env");
        let _g2 = EnvGuard::unset("FLEETWATCH_BROKER_PORT");
        let _g3 = EnvGuard::unset("FLEETWATCH_MQTT_QOS");
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        writeln!(file, "broker_host: from-yaml\nbroker_port: 2883\nqos: 2").expect("write");
        let path = file.path().to_str().expect("utf8 path").to_string();
        let config = ClientConfig::from_env_or_yaml(Some(&path)).expect("config");
        assert_eq!(config.endpoint.host, "from-yaml");
        assert_eq!(config.endpoint.port, 2883);
        assert_eq!(config.qos, QosLevel::ExactlyOnce);
    }

    #[test]
    #[serial]
    fn missing_yaml_file_is_an_error() {
        let err = ClientConfig::from_env_or_yaml(Some("/nonexistent/fleetwatch.yaml"))
            .expect_err("missing file");
        assert!(err.to_string().contains("read client config"));
    }

    #[test]
    fn validate_rejects_zero_inbound_capacity() {
        let config = ClientConfig {
            inbound_capacity: 0,
            ..ClientConfig::default()
        };
        assert_eq!(
            config.validate(),
            Err(ConfigError::NonPositive {
                name: "inbound_capacity"
            })
        );
    }
}

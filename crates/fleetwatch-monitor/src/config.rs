// Monitor settings sourced from environment variables with YAML overrides.
use anyhow::{Context, Result};
use fleetwatch_common::{BrokerEndpoint, ConfigError, DEFAULT_REQUIRED_FIELDS, DEFAULT_TOPIC};
use serde::Deserialize;
use std::fs;
use std::time::Duration;

const DEFAULT_WINDOW_SECS: u64 = 60;
const DEFAULT_BUCKET_SECS: u64 = 1;
const DEFAULT_DOS_THRESHOLD: f64 = 50.0;
const DEFAULT_QUEUE_CAPACITY: usize = 10_000;
const DEFAULT_TICK_INTERVAL_MS: u64 = 1_000;
const DEFAULT_RECENT_CAPACITY: usize = 10;
const DEFAULT_RECONNECT_DELAY_MS: u64 = 2_000;

#[derive(Debug, Clone, PartialEq)]
pub struct MonitorConfig {
    pub endpoint: BrokerEndpoint,
    pub topic: String,
    pub window_secs: u64,
    pub bucket_secs: u64,
    // Messages per second above which a burst is flagged.
    pub dos_threshold: f64,
    pub hysteresis: f64,
    pub queue_capacity: usize,
    // Eviction and snapshot cadence, independent of event arrival.
    pub tick_interval_ms: u64,
    pub required_fields: Vec<String>,
    pub recent_capacity: usize,
    pub reconnect_delay_ms: u64,
}

#[derive(Debug, Deserialize, Default)]
struct MonitorConfigOverride {
    broker_host: Option<String>,
    broker_port: Option<u16>,
    connect_timeout_secs: Option<u64>,
    topic: Option<String>,
    window_secs: Option<u64>,
    bucket_secs: Option<u64>,
    dos_threshold: Option<f64>,
    hysteresis: Option<f64>,
    queue_capacity: Option<usize>,
    tick_interval_ms: Option<u64>,
    required_fields: Option<Vec<String>>,
    recent_capacity: Option<usize>,
    reconnect_delay_ms: Option<u64>,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            endpoint: BrokerEndpoint::default(),
            topic: DEFAULT_TOPIC.to_string(),
            window_secs: DEFAULT_WINDOW_SECS,
            bucket_secs: DEFAULT_BUCKET_SECS,
            dos_threshold: DEFAULT_DOS_THRESHOLD,
            hysteresis: 0.0,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            tick_interval_ms: DEFAULT_TICK_INTERVAL_MS,
            required_fields: DEFAULT_REQUIRED_FIELDS.iter().map(|f| f.to_string()).collect(),
            recent_capacity: DEFAULT_RECENT_CAPACITY,
            reconnect_delay_ms: DEFAULT_RECONNECT_DELAY_MS,
        }
    }
}

impl MonitorConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }

    pub fn bucket(&self) -> Duration {
        Duration::from_secs(self.bucket_secs)
    }

    /// Window width in milliseconds; saturates for values `validate` rejects.
    pub fn window_ms(&self) -> u64 {
        self.window_secs.saturating_mul(1_000)
    }

    pub fn bucket_ms(&self) -> u64 {
        self.bucket_secs.saturating_mul(1_000)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    /// Env defaults, then the YAML file at `config_path` or `FLEETWATCH_CONFIG`.
    /// The result is validated.
    pub fn from_env_or_yaml(config_path: Option<&str>) -> Result<Self> {
        let mut config = Self::from_env()?;
        let override_path = config_path
            .map(|value| value.to_string())
            .or_else(|| std::env::var("FLEETWATCH_CONFIG").ok());
        if let Some(path) = override_path.as_deref() {
            let contents = fs::read_to_string(path)
                .with_context(|| format!("read FLEETWATCH_CONFIG: {path}"))?;
            let override_cfg: MonitorConfigOverride =
                serde_yaml::from_str(&contents).context("parse monitor config yaml")?;
            override_cfg.apply(&mut config);
        }
        config.validate()?;
        Ok(config)
    }

    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        if let Some(value) = read_env("FLEETWATCH_BROKER_HOST") {
            config.endpoint.host = value;
        }
        if let Some(value) = read_env("FLEETWATCH_BROKER_PORT") {
            config.endpoint.port = value
                .parse()
                .with_context(|| format!("parse FLEETWATCH_BROKER_PORT: {value}"))?;
        }
        if let Some(value) = read_parsed("FLEETWATCH_CONNECT_TIMEOUT_SECS")? {
            config.endpoint.connect_timeout_secs = value;
        }
        if let Some(value) = read_env("FLEETWATCH_TOPIC") {
            config.topic = value;
        }
        if let Some(value) = read_parsed("FLEETWATCH_WINDOW_SECS")? {
            config.window_secs = value;
        }
        if let Some(value) = read_parsed("FLEETWATCH_BUCKET_SECS")? {
            config.bucket_secs = value;
        }
        if let Some(value) = read_parsed("FLEETWATCH_DOS_THRESHOLD")? {
            config.dos_threshold = value;
        }
        if let Some(value) = read_parsed("FLEETWATCH_HYSTERESIS")? {
            config.hysteresis = value;
        }
        if let Some(value) = read_parsed("FLEETWATCH_QUEUE_CAPACITY")? {
            config.queue_capacity = value;
        }
        if let Some(value) = read_parsed("FLEETWATCH_TICK_INTERVAL_MS")? {
            config.tick_interval_ms = value;
        }
        if let Some(value) = read_env("FLEETWATCH_REQUIRED_FIELDS") {
            config.required_fields = value
                .split(',')
                .map(str::trim)
                .filter(|field| !field.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Some(value) = read_parsed("FLEETWATCH_RECENT_CAPACITY")? {
            config.recent_capacity = value;
        }
        if let Some(value) = read_parsed("FLEETWATCH_RECONNECT_DELAY_MS")? {
            config.reconnect_delay_ms = value;
        }
        Ok(config)
    }

    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        self.endpoint.validate()?;
        if self.topic.trim().is_empty() {
            return Err(ConfigError::Empty { name: "topic" });
        }
        if self.window_secs == 0 {
            return Err(ConfigError::NonPositive { name: "window_secs" });
        }
        if self.bucket_secs == 0 {
            return Err(ConfigError::NonPositive { name: "bucket_secs" });
        }
        for (name, secs) in [("window_secs", self.window_secs), ("bucket_secs", self.bucket_secs)] {
            if secs.checked_mul(1_000).is_none() {
                return Err(ConfigError::Invalid {
                    name,
                    value: secs.to_string(),
                });
            }
        }
        if self.bucket_secs > self.window_secs {
            return Err(ConfigError::BucketWiderThanWindow {
                bucket_secs: self.bucket_secs,
                window_secs: self.window_secs,
            });
        }
        check_threshold(self.dos_threshold)?;
        if !self.hysteresis.is_finite() || self.hysteresis < 0.0 {
            return Err(ConfigError::Invalid {
                name: "hysteresis",
                value: self.hysteresis.to_string(),
            });
        }
        if self.queue_capacity == 0 {
            return Err(ConfigError::NonPositive {
                name: "queue_capacity",
            });
        }
        if self.tick_interval_ms == 0 {
            return Err(ConfigError::NonPositive {
                name: "tick_interval_ms",
            });
        }
        if self.required_fields.is_empty() {
            return Err(ConfigError::Empty {
                name: "required_fields",
            });
        }
        Ok(())
    }
}

fn check_threshold(value: f64) -> std::result::Result<(), ConfigError> {
    if !value.is_finite() {
        return Err(ConfigError::InvalidThreshold {
            value,
            reason: "must be finite",
        });
    }
    if value < 0.0 {
        return Err(ConfigError::InvalidThreshold {
            value,
            reason: "must not be negative",
        });
    }
    Ok(())
}

impl MonitorConfigOverride {
    fn apply(self, config: &mut MonitorConfig) {
        if let Some(value) = self.broker_host
            && !value.trim().is_empty()
        {
            config.endpoint.host = value;
        }
        if let Some(value) = self.broker_port {
            config.endpoint.port = value;
        }
        if let Some(value) = self.connect_timeout_secs {
            config.endpoint.connect_timeout_secs = value;
        }
        if let Some(value) = self.topic {
            config.topic = value;
        }
        if let Some(value) = self.window_secs {
            config.window_secs = value;
        }
        if let Some(value) = self.bucket_secs {
            config.bucket_secs = value;
        }
        if let Some(value) = self.dos_threshold {
            config.dos_threshold = value;
        }
        if let Some(value) = self.hysteresis {
            config.hysteresis = value;
        }
        if let Some(value) = self.queue_capacity {
            config.queue_capacity = value;
        }
        if let Some(value) = self.tick_interval_ms {
            config.tick_interval_ms = value;
        }
        if let Some(value) = self.required_fields {
            config.required_fields = value;
        }
        if let Some(value) = self.recent_capacity {
            config.recent_capacity = value;
        }
        if let Some(value) = self.reconnect_delay_ms {
            config.reconnect_delay_ms = value;
        }
    }
}

fn read_env(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

// A set but malformed value is an error, never a silent default.
fn read_parsed<T>(key: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    read_env(key)
        .map(|value| {
            value
                .parse::<T>()
                .with_context(|| format!("parse {key}: {value}"))
        })
        .transpose()
}

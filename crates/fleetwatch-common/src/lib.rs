// Shared data types and small helpers used across crates.
use serde::{Deserialize, Serialize};

pub mod clock;
pub mod shutdown;

pub use clock::{Clock, ManualClock, SystemClock};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid id: {0}")]
    InvalidId(String),
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
}

/// Startup validation failures. These are fatal: the operator must fix the
/// configuration before any session or subscription is opened.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("{name} must be greater than zero")]
    NonPositive { name: &'static str },
    #[error("bucket width ({bucket_secs}s) must not exceed the window ({window_secs}s)")]
    BucketWiderThanWindow { bucket_secs: u64, window_secs: u64 },
    #[error("invalid threshold {value}: {reason}")]
    InvalidThreshold { value: f64, reason: &'static str },
    #[error("{name} must not be empty")]
    Empty { name: &'static str },
    #[error("invalid value for {name}: {value}")]
    Invalid { name: &'static str, value: String },
}

pub mod ids {
    // Strongly typed IDs to avoid mixing namespaces at compile time.
    use super::{Error, Result};
    use serde::{Deserialize, Serialize};
    use std::fmt;
    use std::str::FromStr;
    use uuid::Uuid;

    macro_rules! id_type {
        ($name:ident) => {
            #[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
            pub struct $name(Uuid);

            impl $name {
                pub fn new() -> Self {
                    Self(Uuid::new_v4())
                }

                pub fn from_uuid(uuid: Uuid) -> Self {
                    Self(uuid)
                }

                pub fn as_uuid(&self) -> Uuid {
                    self.0
                }

                /// First 8 hex chars, used in client ids and log lines.
                pub fn short(&self) -> String {
                    let mut text = self.0.simple().to_string();
                    text.truncate(8);
                    text
                }
            }

            impl Default for $name {
                fn default() -> Self {
                    Self::new()
                }
            }

            impl fmt::Display for $name {
                fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                    write!(f, "{}", self.0)
                }
            }

            impl FromStr for $name {
                type Err = Error;

                fn from_str(input: &str) -> Result<Self> {
                    // Preserve the original input for clearer error messages.
                    let uuid =
                        Uuid::parse_str(input).map_err(|_| Error::InvalidId(input.into()))?;
                    Ok(Self(uuid))
                }
            }
        };
    }

    id_type!(RunId);
    id_type!(SessionId);
}

/// Topic a deployment publishes device readings on.
pub const DEFAULT_TOPIC: &str = "iot/device/data";

/// Fields every telemetry payload must carry.
pub const DEFAULT_REQUIRED_FIELDS: [&str; 2] = ["temperature", "humidity"];

/// Broker endpoint shared by the load generator and the monitor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokerEndpoint {
    pub host: String,
    pub port: u16,
    pub connect_timeout_secs: u64,
}

impl Default for BrokerEndpoint {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 1883,
            connect_timeout_secs: 60,
        }
    }
}

impl BrokerEndpoint {
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        if self.host.trim().is_empty() {
            return Err(ConfigError::Empty { name: "broker_host" });
        }
        if self.port == 0 {
            return Err(ConfigError::NonPositive { name: "broker_port" });
        }
        if self.connect_timeout_secs == 0 {
            return Err(ConfigError::NonPositive {
                name: "connect_timeout_secs",
            });
        }
        Ok(())
    }
}

impl std::fmt::Display for BrokerEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::{BrokerEndpoint, ConfigError, Error, ids::SessionId};
    use std::str::FromStr;

    #[test]
    fn session_id_round_trip() {
        let id = SessionId::new();
        let parsed = SessionId::from_str(&id.to_string()).expect("parse");
        assert_eq!(id, parsed);
    }

    #[test]
    fn session_id_rejects_invalid_input() {
        let err = SessionId::from_str("not-a-uuid").expect_err("invalid");
        assert!(matches!(err, Error::InvalidId(s) if s == "not-a-uuid"));
    }

    #[test]
    fn short_id_is_eight_chars() {
        assert_eq!(SessionId::new().short().len(), 8);
    }

    #[test]
    fn endpoint_validation_rejects_zero_port() {
        let endpoint = BrokerEndpoint {
            port: 0,
            ..BrokerEndpoint::default()
        };
        assert_eq!(
            endpoint.validate(),
            Err(ConfigError::NonPositive { name: "broker_port" })
        );
    }

    #[test]
    fn endpoint_display_is_host_port() {
        let endpoint = BrokerEndpoint {
            host: "10.2.8.52".into(),
            ..BrokerEndpoint::default()
        };
        assert_eq!(endpoint.to_string(), "10.2.8.52:1883");
        assert!(endpoint.validate().is_ok());
    }

    #[test]
    fn config_error_wraps_into_error() {
        let err: Error = ConfigError::Empty { name: "topic" }.into();
        assert_eq!(err.to_string(), "config error: topic must not be empty");
    }
}

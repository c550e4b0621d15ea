//! Load generation against a pub/sub topic.
//!
//! # Purpose
//! Opens many independent publishing sessions (one connection each), lets each
//! emit a burst as fast as its connection allows, and joins all of them before
//! reporting. The only thing bounded here is the generator's own footprint:
//! at most `max_concurrent_sessions` sessions exist at any moment.
//!
//! # Failure model
//! A session that cannot connect, or loses its connection mid-burst, ends early
//! and is reported in [`LoadReport::failures`]; siblings keep running.
use fleetwatch_common::{ConfigError, DEFAULT_TOPIC};
use std::time::Duration;

pub mod generator;
pub mod payload;
pub mod session;
pub mod simulator;

pub use generator::{LoadGenerator, LoadReport, SessionFailure};
pub use payload::{PayloadFactory, StaticPayload, TelemetryPayload};
pub use session::{Session, SessionOutcome, SessionState};
pub use simulator::DeviceSimulator;

const DEFAULT_MAX_CONCURRENT_SESSIONS: usize = 256;

#[derive(Debug, Clone, PartialEq)]
pub struct LoadPlan {
    pub session_count: usize,
    pub messages_per_session: u64,
    pub topic: String,
    /// Cap on simultaneously outstanding sessions (and therefore connections).
    pub max_concurrent_sessions: usize,
    /// Optional pause between publishes; `None` floods.
    pub publish_interval: Option<Duration>,
}

impl Default for LoadPlan {
    fn default() -> Self {
        Self {
            session_count: 100,
            messages_per_session: 1000,
            topic: DEFAULT_TOPIC.to_string(),
            max_concurrent_sessions: DEFAULT_MAX_CONCURRENT_SESSIONS,
            publish_interval: None,
        }
    }
}

impl LoadPlan {
    pub fn new(session_count: usize, messages_per_session: u64, topic: impl Into<String>) -> Self {
        Self {
            session_count,
            messages_per_session,
            topic: topic.into(),
            ..Self::default()
        }
    }

    pub fn with_max_concurrent_sessions(mut self, cap: usize) -> Self {
        self.max_concurrent_sessions = cap;
        self
    }

    pub fn with_publish_interval(mut self, interval: Duration) -> Self {
        self.publish_interval = (!interval.is_zero()).then_some(interval);
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.session_count == 0 {
            return Err(ConfigError::NonPositive {
                name: "session_count",
            });
        }
        if self.max_concurrent_sessions == 0 {
            return Err(ConfigError::NonPositive {
                name: "max_concurrent_sessions",
            });
        }
        if self.topic.trim().is_empty() {
            return Err(ConfigError::Empty { name: "topic" });
        }
        Ok(())
    }
}

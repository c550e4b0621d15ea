// Payload factories for load sessions and simulated devices.
use bytes::Bytes;
use fleetwatch_common::ids::SessionId;
use rand::Rng;
use std::ops::Range;

/// Builds the payload for message `seq` of a session.
pub trait PayloadFactory: Send + Sync {
    fn payload(&self, session: &SessionId, seq: u64) -> Bytes;
}

impl<F> PayloadFactory for F
where
    F: Fn(&SessionId, u64) -> Bytes + Send + Sync,
{
    fn payload(&self, session: &SessionId, seq: u64) -> Bytes {
        self(session, seq)
    }
}

/// The same bytes for every message.
#[derive(Debug, Clone)]
pub struct StaticPayload(Bytes);

impl StaticPayload {
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self(payload.into())
    }

    /// Undecodable flood payload; ingestion counts it as a decode error.
    pub fn spam() -> Self {
        Self(Bytes::from_static(b"Spam message"))
    }

    /// A fixed-size filler payload.
    pub fn filler(size: usize) -> Self {
        Self(Bytes::from(vec![b'x'; size]))
    }
}

impl PayloadFactory for StaticPayload {
    fn payload(&self, _session: &SessionId, _seq: u64) -> Bytes {
        self.0.clone()
    }
}

/// Random device readings encoded as a JSON object.
#[derive(Debug, Clone)]
pub struct TelemetryPayload {
    fields: Vec<(String, Range<f64>)>,
}

impl Default for TelemetryPayload {
    fn default() -> Self {
        Self {
            fields: vec![
                ("temperature".to_string(), 20.0..30.0),
                ("humidity".to_string(), 40.0..60.0),
            ],
        }
    }
}

impl TelemetryPayload {
    pub fn with_field(mut self, name: impl Into<String>, range: Range<f64>) -> Self {
        self.fields.push((name.into(), range));
        self
    }

    pub fn reading(&self) -> serde_json::Map<String, serde_json::Value> {
        let mut rng = rand::thread_rng();
        self.fields
            .iter()
            .map(|(name, range)| {
                let value = if range.is_empty() {
                    range.start
                } else {
                    rng.gen_range(range.clone())
                };
                (name.clone(), serde_json::Value::from(value))
            })
            .collect()
    }
}

impl PayloadFactory for TelemetryPayload {
    fn payload(&self, _session: &SessionId, _seq: u64) -> Bytes {
        Bytes::from(serde_json::Value::Object(self.reading()).to_string())
    }
}

// JSON telemetry decoding.
use serde_json::Value;
use std::collections::BTreeMap;

use crate::event::{RawMessage, TelemetryEvent};

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("payload is not valid utf-8: {0}")]
    Utf8(String),
    #[error("payload is not valid json: {0}")]
    Json(String),
    #[error("payload is not a json object")]
    NotAnObject,
    #[error("required field {0} is missing")]
    MissingField(String),
    #[error("required field {0} is not a number")]
    NonNumeric(String),
}

/// Decode a JSON object payload into a [`TelemetryEvent`].
///
/// Every name in `required` must be present with a numeric value. Other
/// numeric fields pass through under their own name; non-numeric extras are
/// ignored. Booleans are not numbers.
pub fn decode_telemetry<S: AsRef<str>>(
    message: &RawMessage,
    required: &[S],
) -> Result<TelemetryEvent, DecodeError> {
    let text =
        std::str::from_utf8(&message.payload).map_err(|err| DecodeError::Utf8(err.to_string()))?;
    let value: Value =
        serde_json::from_str(text).map_err(|err| DecodeError::Json(err.to_string()))?;
    let Value::Object(object) = value else {
        return Err(DecodeError::NotAnObject);
    };

    for name in required {
        let name = name.as_ref();
        match object.get(name) {
            None | Some(Value::Null) => return Err(DecodeError::MissingField(name.to_string())),
            Some(Value::Number(_)) => {}
            Some(_) => return Err(DecodeError::NonNumeric(name.to_string())),
        }
    }

    let fields: BTreeMap<String, f64> = object
        .iter()
        .filter_map(|(name, value)| match value {
            Value::Number(number) => number.as_f64().map(|v| (name.clone(), v)),
            _ => None,
        })
        .collect();

    Ok(TelemetryEvent {
        timestamp_ms: message.received_at_ms,
        topic: message.topic.clone(),
        fields,
        payload_len: message.payload.len(),
    })
}

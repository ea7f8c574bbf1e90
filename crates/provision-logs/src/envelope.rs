//! Wire format of provisioning log messages.
//!
//! Each network message is a JSON array. Every element wraps a
//! JSON-encoded string under `Values.data`:
//!
//! ```json
//! [ { "Values": { "data": "{\"kind\":\"data\",\"log\":\"...\",\"created_resources\":1,\"total_resources\":3}" } } ]
//! ```
//!
//! Decoding never fails as a whole: elements that do not decode, or data
//! envelopes missing a field, are dropped and the rest of the batch is kept.

use serde::Deserialize;
use tracing::debug;

/// One decoded element of a message batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogEnvelope {
    /// Log output plus the provisioner's resource counters.
    Data {
        log: String,
        created_resources: u64,
        total_resources: u64,
    },
    /// The provisioner reported a failure; `error_text` is its log text.
    Error { error_text: String },
}

/// Outer element: `{ "Values": { "data": "..." } }`.
#[derive(Debug, Deserialize)]
struct RawElement {
    #[serde(rename = "Values")]
    values: Option<RawValues>,
}

#[derive(Debug, Deserialize)]
struct RawValues {
    data: Option<String>,
}

/// Inner payload decoded from the `data` string.
#[derive(Debug, Deserialize)]
struct RawPayload {
    kind: Option<String>,
    log: Option<String>,
    created_resources: Option<u64>,
    total_resources: Option<u64>,
}

impl RawPayload {
    fn into_envelope(self) -> Option<LogEnvelope> {
        if self.kind.as_deref() == Some("error") {
            return Some(LogEnvelope::Error {
                error_text: self.log.unwrap_or_default(),
            });
        }
        match (self.log, self.created_resources, self.total_resources) {
            (Some(log), Some(created_resources), Some(total_resources)) => Some(LogEnvelope::Data {
                log,
                created_resources,
                total_resources,
            }),
            _ => None,
        }
    }
}

/// Decode a single batch element.
///
/// Returns `None` for anything that is not a well-formed envelope.
#[must_use]
pub fn decode_element(element: &serde_json::Value) -> Option<LogEnvelope> {
    let raw = RawElement::deserialize(element).ok()?;
    let data = raw.values?.data?;
    let payload: RawPayload = serde_json::from_str(&data).ok()?;
    payload.into_envelope()
}

/// Decode one network message into its envelopes, in batch order.
///
/// A message that is not a JSON array yields no envelopes.
#[must_use]
pub fn decode_message(message: &str) -> Vec<LogEnvelope> {
    let elements: Vec<serde_json::Value> = match serde_json::from_str(message) {
        Ok(elements) => elements,
        Err(e) => {
            debug!(error = %e, "Discarding message that is not a JSON array");
            return Vec::new();
        }
    };

    let total = elements.len();
    let envelopes: Vec<LogEnvelope> = elements.iter().filter_map(decode_element).collect();
    if envelopes.len() < total {
        debug!(
            discarded = total - envelopes.len(),
            kept = envelopes.len(),
            "Discarded malformed envelopes"
        );
    }
    envelopes
}

/// Encode envelopes in the wire format. Used by tests and mock servers.
#[must_use]
pub fn encode_message(envelopes: &[LogEnvelope]) -> String {
    let elements: Vec<serde_json::Value> = envelopes
        .iter()
        .map(|envelope| {
            let payload = match envelope {
                LogEnvelope::Data {
                    log,
                    created_resources,
                    total_resources,
                } => serde_json::json!({
                    "kind": "data",
                    "log": log,
                    "created_resources": created_resources,
                    "total_resources": total_resources,
                }),
                LogEnvelope::Error { error_text } => serde_json::json!({
                    "kind": "error",
                    "log": error_text,
                }),
            };
            serde_json::json!({ "Values": { "data": payload.to_string() } })
        })
        .collect();
    serde_json::Value::Array(elements).to_string()
}

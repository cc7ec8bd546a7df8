//! Wire envelopes exchanged across the host/guest boundary (§3.5). All
//! of them are plain UTF-8 JSON; the guest marshals them itself, the
//! host only ever sees opaque bytes it reads out of guest memory.

use std::collections::HashMap;

use base64::Engine as _;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestEnvelope {
    pub method: String,
    pub path: String,
    #[serde(default)]
    pub headers: HashMap<String, Vec<String>>,
    /// Raw body bytes, carried as a JSON array of `u8` so the envelope
    /// stays plain JSON end to end rather than mixing in base64 only
    /// here; the response side uses base64 instead (see below) because
    /// that's what guests overwhelmingly return as a `String` field.
    #[serde(default, with = "body_as_vec")]
    pub body: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    pub status: u16,
    #[serde(default)]
    pub headers: HashMap<String, Vec<String>>,
    /// Base64-encoded; JSON cannot carry arbitrary binary directly.
    pub body: String,
}

impl ResponseEnvelope {
    pub fn decode_body(&self) -> Result<Vec<u8>, base64::DecodeError> {
        base64::engine::general_purpose::STANDARD.decode(&self.body)
    }

    pub fn is_well_formed(&self) -> bool {
        (100..=599).contains(&self.status) && self.decode_body().is_ok()
    }
}

mod body_as_vec {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &Vec<u8>, s: S) -> Result<S::Ok, S::Error> {
        serde::Serialize::serialize(bytes, s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        Vec::<u8>::deserialize(d)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryEnvelope {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<JsonValue>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecEnvelope {
    pub rows_affected: i64,
    pub last_insert_id: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionEnvelope {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tx_id: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn response_envelope_well_formed_round_trip() {
        let env = ResponseEnvelope {
            status: 200,
            headers: HashMap::from([("content-type".to_string(), vec!["application/json".to_string()])]),
            body: base64::engine::general_purpose::STANDARD.encode(b"{\"x\":1}"),
        };
        assert!(env.is_well_formed());
        assert_eq!(env.decode_body().unwrap(), b"{\"x\":1}".to_vec());
    }

    #[test]
    fn out_of_range_status_is_not_well_formed() {
        let env = ResponseEnvelope {
            status: 999,
            headers: HashMap::new(),
            body: String::new(),
        };
        assert!(!env.is_well_formed());
    }
}

//! Parse-or-reject shapes for raw store payloads.
//!
//! Store notifications carry untyped JSON. Each entity has one parse function
//! that either yields a typed value or a [`FeedError::Validation`] describing
//! what was wrong; callers log the error and skip the payload. Unknown extra
//! fields are tolerated.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{FeedError, FeedResult};

/// A contact request this user sent, as stored under `storedReqs/<id>`.
///
/// Every field except `timestamp` is ciphertext under the local secret.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredRequest {
    pub recipient_pub: String,
    pub handshake_address: String,
    #[serde(rename = "sentReqID")]
    pub sent_req_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
}

/// A request living at `handshakeNodes/<address>/<request id>`.
///
/// `response` is ciphertext under the pairwise secret of sender and recipient.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeRequest {
    pub response: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
}

/// A feed message. The body is ciphertext in the store and plaintext once
/// decrypted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub body: String,
    pub timestamp: i64,
}

/// One entry of an outgoing map, before decryption.
#[derive(Debug, Clone, PartialEq)]
pub enum OutgoingEntry {
    /// The feed was tombstoned
    Tombstone,
    /// A live feed: encrypted peer public key plus raw messages
    Live {
        with: String,
        messages: Map<String, Value>,
    },
}

fn parse<T: DeserializeOwned>(kind: &str, value: &Value) -> FeedResult<T> {
    if !value.is_object() {
        return Err(FeedError::Validation(format!(
            "expected {} object, got {}",
            kind, value
        )));
    }
    serde_json::from_value(value.clone())
        .map_err(|e| FeedError::Validation(format!("invalid {}: {}", kind, e)))
}

pub fn parse_stored_request(value: &Value) -> FeedResult<StoredRequest> {
    parse("stored request", value)
}

pub fn parse_handshake_request(value: &Value) -> FeedResult<HandshakeRequest> {
    parse("handshake request", value)
}

/// Parse a message. Timestamps must be integers.
pub fn parse_message(value: &Value) -> FeedResult<Message> {
    parse("message", value)
}

/// Parse an outgoing map entry.
///
/// `null` is a tombstone. Non-objects and objects without a string `with` are
/// rejected. A missing or non-object `messages` field yields no messages.
pub fn parse_outgoing_entry(value: &Value) -> FeedResult<OutgoingEntry> {
    match value {
        Value::Null => Ok(OutgoingEntry::Tombstone),
        Value::Object(fields) => {
            let with = fields
                .get("with")
                .and_then(Value::as_str)
                .ok_or_else(|| {
                    FeedError::Validation("outgoing without a string `with`".to_string())
                })?
                .to_string();
            let messages = match fields.get("messages") {
                Some(Value::Object(messages)) => messages.clone(),
                _ => Map::new(),
            };
            Ok(OutgoingEntry::Live { with, messages })
        }
        other => Err(FeedError::Validation(format!(
            "expected outgoing object, got {}",
            other
        ))),
    }
}

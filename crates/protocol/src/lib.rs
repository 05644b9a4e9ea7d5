//! Wire protocol: the JSON-RPC 2.0 message envelope carried by every
//! tool-relay transport.
//!
//! The transport layer treats an [`Envelope`] as opaque apart from its `id`,
//! which is used for correlation and as the polling cursor.  Fields the
//! envelope does not model explicitly are preserved in [`Envelope::extra`] so
//! that a message round-trips through the transport byte-for-byte in meaning.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Protocol version stamped on every envelope built by this crate.
pub const JSONRPC_VERSION: &str = "2.0";

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Identifiers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Correlation token of a request/response pair.  JSON-RPC allows either a
/// number or a string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageId {
    Number(i64),
    String(String),
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::String(s) => f.write_str(s),
        }
    }
}

impl From<i64> for MessageId {
    fn from(n: i64) -> Self {
        Self::Number(n)
    }
}

impl From<&str> for MessageId {
    fn from(s: &str) -> Self {
        Self::String(s.to_owned())
    }
}

impl From<String> for MessageId {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Envelope
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A JSON-RPC 2.0 error object.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "JSON-RPC error {}: {}", self.code, self.message)
    }
}

impl std::error::Error for RpcError {}

/// One wire-level message: a request, a notification, or a response.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Envelope {
    #[serde(default = "d_jsonrpc")]
    pub jsonrpc: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<MessageId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    /// `Some(Value::Null)` when the member is present as `null`.
    #[serde(
        default,
        deserialize_with = "present",
        skip_serializing_if = "Option::is_none"
    )]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
    /// Top-level members not covered by the fields above.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// What an envelope represents, derived from which members are present.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvelopeKind {
    Request,
    Notification,
    Response,
}

/// Errors raised while decoding an inbound frame.
#[derive(thiserror::Error, Debug)]
pub enum EnvelopeError {
    #[error("malformed envelope: {0}")]
    Json(#[from] serde_json::Error),

    #[error("not a JSON-RPC message: no method, result or error member")]
    Unrecognized,
}

impl Envelope {
    fn empty() -> Self {
        Self {
            jsonrpc: d_jsonrpc(),
            id: None,
            method: None,
            params: None,
            result: None,
            error: None,
            extra: Map::new(),
        }
    }

    /// A request (expects a response with the same `id`).
    pub fn request(id: impl Into<MessageId>, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            id: Some(id.into()),
            method: Some(method.into()),
            params,
            ..Self::empty()
        }
    }

    /// A notification (no `id`, fire-and-forget).
    pub fn notification(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            method: Some(method.into()),
            params,
            ..Self::empty()
        }
    }

    /// A successful response.
    pub fn response(id: impl Into<MessageId>, result: Value) -> Self {
        Self {
            id: Some(id.into()),
            result: Some(result),
            ..Self::empty()
        }
    }

    /// An error response.
    pub fn error_response(id: Option<MessageId>, error: RpcError) -> Self {
        Self {
            id,
            error: Some(error),
            ..Self::empty()
        }
    }

    /// Classify the envelope.  `None` means the object carries none of the
    /// members that make it a JSON-RPC message.
    pub fn kind(&self) -> Option<EnvelopeKind> {
        if self.method.is_some() {
            if self.id.is_some() {
                Some(EnvelopeKind::Request)
            } else {
                Some(EnvelopeKind::Notification)
            }
        } else if self.result.is_some() || self.error.is_some() {
            Some(EnvelopeKind::Response)
        } else {
            None
        }
    }

    /// Decode one frame.  Rejects anything that is not a JSON object shaped
    /// like a JSON-RPC message.
    pub fn from_json(text: &str) -> Result<Self, EnvelopeError> {
        let envelope: Self = serde_json::from_str(text)?;
        envelope.validated()
    }

    /// Same as [`from_json`](Self::from_json) for an already-parsed value.
    pub fn from_value(value: Value) -> Result<Self, EnvelopeError> {
        let envelope: Self = serde_json::from_value(value)?;
        envelope.validated()
    }

    fn validated(self) -> Result<Self, EnvelopeError> {
        match self.kind() {
            Some(_) => Ok(self),
            None => Err(EnvelopeError::Unrecognized),
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

fn d_jsonrpc() -> String {
    JSONRPC_VERSION.into()
}

/// Any present member, `null` included, becomes `Some`.  Absence is handled
/// by `#[serde(default)]`.
fn present<'de, D>(deserializer: D) -> Result<Option<Value>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}

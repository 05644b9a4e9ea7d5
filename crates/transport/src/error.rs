//! Error taxonomy shared by both channel variants.

/// Errors returned by transport operations or reported through
/// [`TransportEvent::Error`](crate::event::TransportEvent::Error).
///
/// `Clone` so one fault can be fanned out to every event subscriber.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    // ── Misuse ───────────────────────────────────────────────────────
    #[error("transport not started")]
    NotStarted,

    #[error("transport closed")]
    Closed,

    // ── Transient network faults ─────────────────────────────────────
    #[error("connect: {0}")]
    Connect(String),

    #[error("websocket: {0}")]
    WebSocket(String),

    #[error("request: {0}")]
    Request(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },

    // ── Payload / local faults ───────────────────────────────────────
    #[error("protocol: {0}")]
    Protocol(String),

    #[error("outbound queue full ({0} messages)")]
    QueueFull(usize),

    #[error("config: {0}")]
    Config(String),
}

impl TransportError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }
}

impl From<tr_protocol::EnvelopeError> for TransportError {
    fn from(e: tr_protocol::EnvelopeError) -> Self {
        Self::Protocol(e.to_string())
    }
}

/// Map a `reqwest` failure, keeping timeouts distinguishable.
pub fn from_reqwest(e: reqwest::Error) -> TransportError {
    if e.is_timeout() {
        TransportError::Timeout(e.to_string())
    } else if e.is_decode() {
        TransportError::Protocol(e.to_string())
    } else {
        TransportError::Request(e.to_string())
    }
}

//! The uniform contract both channel variants satisfy.

use async_trait::async_trait;
use tr_protocol::Envelope;

use crate::error::TransportError;
use crate::event::EventStream;

/// A bidirectional message channel to a remote tool-execution server.
///
/// Typical use:
///
/// ```rust,ignore
/// let transport = create_transport(&config)?;
/// let mut events = transport.subscribe();
/// transport.start().await?;
/// transport.send(Envelope::request(1, "tools/list", None)).await?;
/// while let Some(event) = events.recv().await { /* ... */ }
/// ```
#[async_trait]
pub trait Transport: Send + Sync {
    /// Establish initial connectivity.
    async fn start(&self) -> Result<(), TransportError>;

    /// Hand one envelope to the channel.
    ///
    /// Fails with [`TransportError::NotStarted`] before `start` completes and
    /// [`TransportError::Closed`] after `close`.  Whether anything else can
    /// fail here depends on the variant.
    async fn send(&self, envelope: Envelope) -> Result<(), TransportError>;

    /// Tear everything down.  Idempotent: only the first call emits
    /// [`TransportEvent::Closed`](crate::event::TransportEvent::Closed), and
    /// no event is delivered after it returns.
    async fn close(&self) -> Result<(), TransportError>;

    /// Subscribe to inbound messages, recoverable errors and closure.
    fn subscribe(&self) -> EventStream;

    /// Short variant name for logs (`"socket"`, `"polling"`).
    fn kind(&self) -> &'static str;
}

/// Handle-side lifecycle shared by both variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Lifecycle {
    Idle,
    Starting,
    Running,
    Closed,
}

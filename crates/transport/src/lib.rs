//! `tr-transport`: message transport between a client and a remote
//! tool-execution server.
//!
//! Two channel variants sit behind one [`Transport`] contract:
//!
//! | Variant | Substrate | Outbound when disconnected | Inbound |
//! |---|---|---|---|
//! | [`SocketTransport`]  | persistent WebSocket | buffered in an [`OutboundQueue`], flushed in order on reconnect | frames pushed by the server |
//! | [`PollingTransport`] | plain HTTP           | `send` fails immediately | `GET /messages` every `poll_interval` |
//!
//! Consumers observe the channel through an [`EventStream`] of
//! [`TransportEvent`]s rather than callbacks:
//!
//! ```rust,no_run
//! use tr_protocol::Envelope;
//! use tr_transport::{create_transport, SocketConfig, Transport, TransportConfig, TransportEvent};
//!
//! # async fn example() -> Result<(), tr_transport::TransportError> {
//! let config = TransportConfig::Socket(SocketConfig::new("ws://localhost:3210/rpc"));
//! let transport = create_transport(&config)?;
//! let mut events = transport.subscribe();
//!
//! transport.start().await?;
//! transport.send(Envelope::request(1, "tools/list", None)).await?;
//!
//! while let Some(event) = events.recv().await {
//!     match event {
//!         TransportEvent::Message(env) => println!("{env:?}"),
//!         TransportEvent::Error(e) => eprintln!("transport error: {e}"),
//!         TransportEvent::Closed(reason) => {
//!             eprintln!("closed: {reason:?}");
//!             break;
//!         }
//!     }
//! }
//! # Ok(())
//! # }
//! ```
//!
//! # Socket reconnects
//!
//! An unexpected closure triggers up to `max_reconnect_attempts` reconnects,
//! attempt `n` waiting `n × reconnect_base_delay_ms`.  Exhausting the ceiling
//! closes the channel for good with
//! [`CloseReason::MaxAttemptsReached`].

pub mod config;
pub mod credentials;
pub mod error;
pub mod event;
pub mod polling;
pub mod queue;
pub mod reconnect;
pub mod socket;
pub mod traits;

// ── Re-exports for ergonomic imports ─────────────────────────────────

pub use config::{PollingConfig, SocketConfig, TransportConfig};
pub use credentials::{
    CredentialAttachment, CredentialMode, HandshakeHeaderCredentials, QueryTokenCredentials,
};
pub use error::TransportError;
pub use event::{CloseReason, EventStream, TransportEvent};
pub use polling::{PollCursor, PollingTransport, LAST_MESSAGE_ID_HEADER};
pub use queue::{OutboundQueue, OverflowPolicy, QueueConfig};
pub use reconnect::ReconnectPolicy;
pub use socket::{ConnectionState, SocketTransport};
pub use traits::Transport;

use std::sync::Arc;

/// Build the channel variant selected by `config`.  Does not connect; call
/// [`Transport::start`] on the result.
pub fn create_transport(config: &TransportConfig) -> Result<Arc<dyn Transport>, TransportError> {
    let transport: Arc<dyn Transport> = match config {
        TransportConfig::Socket(cfg) => Arc::new(SocketTransport::new(cfg.clone())?),
        TransportConfig::Polling(cfg) => Arc::new(PollingTransport::new(cfg.clone())?),
    };
    tracing::debug!(kind = transport.kind(), url = %config.url(), "transport created");
    Ok(transport)
}

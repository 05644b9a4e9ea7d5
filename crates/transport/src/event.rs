//! Typed event delivery: the inbound side of the transport contract.
//!
//! Each channel owns one [`EventHub`].  Consumers call `subscribe()` (before
//! `start()`, or they miss whatever was emitted earlier) and receive every
//! subsequent event in emission order.  The hub's `finished` flag is the single
//! authority on whether the channel may still speak: once the `Closed` event
//! has gone out, every later emission is discarded and all streams end.

use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures_util::Stream;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tr_protocol::Envelope;

use crate::error::TransportError;

/// Why a channel closed on its own.  A requested `close()` carries no reason.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// The reconnect ceiling was reached without a successful open.
    MaxAttemptsReached { attempts: u32 },
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MaxAttemptsReached { attempts } => {
                write!(f, "max reconnect attempts reached ({attempts})")
            }
        }
    }
}

/// Something the channel has to tell its consumer.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// One inbound message, in substrate order.
    Message(Envelope),
    /// A recoverable fault; the channel keeps running.
    Error(TransportError),
    /// Terminal.  Emitted exactly once; the stream ends after it.
    Closed(Option<CloseReason>),
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Hub
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Default)]
struct HubState {
    subscribers: Vec<mpsc::UnboundedSender<TransportEvent>>,
    finished: bool,
}

/// Fan-out point for one channel's events.  Cheap to clone.
#[derive(Clone, Default)]
pub(crate) struct EventHub {
    state: Arc<Mutex<HubState>>,
}

impl EventHub {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn subscribe(&self) -> EventStream {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.state.lock();
        // A finished hub hands out a stream that is already at its end.
        if !state.finished {
            state.subscribers.push(tx);
        }
        EventStream { rx }
    }

    /// Deliver a non-terminal event.  Returns `false` once the hub is finished.
    pub(crate) fn emit(&self, event: TransportEvent) -> bool {
        let mut state = self.state.lock();
        if state.finished {
            tracing::trace!(?event, "dropping event emitted after close");
            return false;
        }
        state.subscribers.retain(|tx| tx.send(event.clone()).is_ok());
        true
    }

    pub(crate) fn message(&self, envelope: Envelope) -> bool {
        self.emit(TransportEvent::Message(envelope))
    }

    pub(crate) fn error(&self, error: TransportError) -> bool {
        self.emit(TransportEvent::Error(error))
    }

    /// Emit the terminal `Closed` event and end every stream.  Only the first
    /// call has any effect; it returns `true`.
    pub(crate) fn finish(&self, reason: Option<CloseReason>) -> bool {
        let mut state = self.state.lock();
        if state.finished {
            return false;
        }
        state.finished = true;
        let event = TransportEvent::Closed(reason);
        for tx in state.subscribers.drain(..) {
            let _ = tx.send(event.clone());
        }
        true
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.state.lock().finished
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Stream
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A subscription to one channel's events.
///
/// Yields `None` after the `Closed` event, or immediately if the channel had
/// already closed when the subscription was taken.
#[derive(Debug)]
pub struct EventStream {
    rx: mpsc::UnboundedReceiver<TransportEvent>,
}

impl EventStream {
    pub async fn recv(&mut self) -> Option<TransportEvent> {
        self.rx.recv().await
    }

    /// Non-blocking poll for an already-delivered event.
    pub fn try_recv(&mut self) -> Option<TransportEvent> {
        self.rx.try_recv().ok()
    }
}

impl Stream for EventStream {
    type Item = TransportEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

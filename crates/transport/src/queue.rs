//! FIFO buffer for envelopes that could not be transmitted immediately.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use tr_protocol::Envelope;

use crate::error::TransportError;

/// What to do when a bounded queue is full.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Evict the oldest buffered envelope to make room.
    #[default]
    DropOldest,
    /// Refuse the new envelope.
    Reject,
}

/// Capacity settings for an [`OutboundQueue`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Maximum number of buffered envelopes.  `None` means unbounded.
    #[serde(default)]
    pub capacity: Option<usize>,
    #[serde(default)]
    pub overflow: OverflowPolicy,
}

/// Strict FIFO queue.  Append at the tail, drain from the head.
///
/// An envelope leaves the queue exactly once: popped for transmission,
/// evicted under [`OverflowPolicy::DropOldest`], or discarded by [`clear`].
/// A transmission that fails hands the envelope back through
/// [`requeue_front`] so it keeps its place.
///
/// [`clear`]: OutboundQueue::clear
/// [`requeue_front`]: OutboundQueue::requeue_front
#[derive(Debug, Default)]
pub struct OutboundQueue {
    items: VecDeque<Envelope>,
    config: QueueConfig,
}

impl OutboundQueue {
    pub fn new(config: QueueConfig) -> Self {
        Self {
            items: VecDeque::new(),
            config,
        }
    }

    /// Append an envelope.  Returns the envelope evicted to make room, if
    /// any, or [`TransportError::QueueFull`] under the reject policy.
    pub fn push(&mut self, envelope: Envelope) -> Result<Option<Envelope>, TransportError> {
        let Some(capacity) = self.config.capacity else {
            self.items.push_back(envelope);
            return Ok(None);
        };

        if self.items.len() < capacity {
            self.items.push_back(envelope);
            return Ok(None);
        }

        match self.config.overflow {
            OverflowPolicy::Reject => Err(TransportError::QueueFull(self.items.len())),
            OverflowPolicy::DropOldest => {
                if capacity == 0 {
                    // Nothing can ever be buffered; the new envelope is the one dropped.
                    return Ok(Some(envelope));
                }
                let evicted = self.items.pop_front();
                self.items.push_back(envelope);
                Ok(evicted)
            }
        }
    }

    pub fn pop_front(&mut self) -> Option<Envelope> {
        self.items.pop_front()
    }

    /// Put back an envelope whose transmission failed.  Ignores the capacity
    /// bound: the envelope was already accounted for.
    pub fn requeue_front(&mut self, envelope: Envelope) {
        self.items.push_front(envelope);
    }

    /// Discard everything.  Returns how many envelopes were dropped.
    pub fn clear(&mut self) -> usize {
        let n = self.items.len();
        self.items.clear();
        n
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

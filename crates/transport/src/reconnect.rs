//! Reconnect policy with linear back-off.

use std::time::Duration;

/// Controls how the socket channel reconnects after an unexpected closure.
///
/// Attempt `n` (1-based) waits `base_delay * n`.  Once `max_attempts`
/// reconnects have been made without a successful open, the channel gives up
/// for good; a new channel must be constructed to try again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Delay unit; attempt `n` waits `n` of these.
    pub base_delay: Duration,
    /// Ceiling on consecutive reconnect attempts.  `0` disables reconnecting.
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(1000),
            max_attempts: 5,
        }
    }
}

impl ReconnectPolicy {
    pub fn new(base_delay: Duration, max_attempts: u32) -> Self {
        Self {
            base_delay,
            max_attempts,
        }
    }

    /// Delay before the given attempt (1-based).  Saturates instead of
    /// overflowing for absurd attempt numbers.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(attempt)
    }

    /// Whether `attempts` already made exhausts the ceiling.
    pub fn should_give_up(&self, attempts: u32) -> bool {
        attempts >= self.max_attempts
    }
}

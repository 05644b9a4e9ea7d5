//! Transport configuration.
//!
//! Deserializes from the `[transport]` table of a relay config:
//!
//! ```toml
//! [transport]
//! kind = "socket"
//! url = "ws://localhost:3210/rpc"
//! max_reconnect_attempts = 3
//!
//! [transport.headers]
//! Authorization = "Bearer secret"
//! ```

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::credentials::CredentialMode;
use crate::queue::QueueConfig;
use crate::reconnect::ReconnectPolicy;

/// Which channel variant to build, with its settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum TransportConfig {
    Socket(SocketConfig),
    Polling(PollingConfig),
}

impl TransportConfig {
    pub fn url(&self) -> &str {
        match self {
            Self::Socket(c) => &c.url,
            Self::Polling(c) => &c.url,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Socket
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SocketConfig {
    #[serde(default = "d_socket_url")]
    pub url: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub credentials: CredentialMode,
    #[serde(default = "d_1000")]
    pub reconnect_base_delay_ms: u64,
    #[serde(default = "d_5")]
    pub max_reconnect_attempts: u32,
    #[serde(default = "d_10000")]
    pub connect_timeout_ms: u64,
    /// Bound on each outbound frame write and on the close handshake.  A
    /// write that exceeds it counts as a lost connection.
    #[serde(default = "d_10000")]
    pub write_timeout_ms: u64,
    #[serde(default)]
    pub queue: QueueConfig,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            url: d_socket_url(),
            headers: BTreeMap::new(),
            credentials: CredentialMode::Query,
            reconnect_base_delay_ms: 1000,
            max_reconnect_attempts: 5,
            connect_timeout_ms: 10_000,
            write_timeout_ms: 10_000,
            queue: QueueConfig::default(),
        }
    }
}

impl SocketConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy::new(
            Duration::from_millis(self.reconnect_base_delay_ms),
            self.max_reconnect_attempts,
        )
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Polling
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PollingConfig {
    #[serde(default = "d_polling_url")]
    pub url: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default = "d_100")]
    pub poll_interval_ms: u64,
    /// Bound on each poll and send round trip.
    #[serde(default = "d_30000")]
    pub timeout_ms: u64,
    /// Bound on the health probe and the disconnect notice.
    #[serde(default = "d_5000")]
    pub probe_timeout_ms: u64,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            url: d_polling_url(),
            headers: BTreeMap::new(),
            poll_interval_ms: 100,
            timeout_ms: 30_000,
            probe_timeout_ms: 5000,
        }
    }
}

impl PollingConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}

// ── serde default helpers ───────────────────────────────────────────

fn d_socket_url() -> String {
    "ws://localhost:3210/rpc".into()
}
fn d_polling_url() -> String {
    "http://localhost:3210".into()
}
fn d_100() -> u64 {
    100
}
fn d_1000() -> u64 {
    1000
}
fn d_5000() -> u64 {
    5000
}
fn d_10000() -> u64 {
    10_000
}
fn d_30000() -> u64 {
    30_000
}
fn d_5() -> u32 {
    5
}

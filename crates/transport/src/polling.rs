//! Polling channel: push delivery emulated over plain HTTP.
//!
//! Two independent activities share one [`PollingInner`]:
//!
//! - the pull loop, a single task that ticks every `poll_interval` and asks
//!   `GET /messages` for envelopes newer than the [`PollCursor`];
//! - the send path, where every `send` is its own `POST /messages`.
//!
//! There is no connection to lose, so there is no reconnect logic and no
//! outbound queue: a failed POST is that `send`'s failure.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::Client;
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tr_protocol::{Envelope, MessageId};

use crate::config::PollingConfig;
use crate::error::{from_reqwest, TransportError};
use crate::event::{EventHub, EventStream};
use crate::traits::{Lifecycle, Transport};

/// Header carrying the poll cursor on `GET /messages`.
pub const LAST_MESSAGE_ID_HEADER: &str = "X-Last-Message-Id";

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Cursor
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Identifier of the last envelope the pull loop delivered.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PollCursor {
    last: Option<MessageId>,
}

impl PollCursor {
    /// Move the cursor to `envelope` if it carries an id.  Envelopes without
    /// one leave the cursor where it is.  Returns `false`, without moving,
    /// for an id that cannot be sent as a header value.
    pub fn observe(&mut self, envelope: &Envelope) -> bool {
        let Some(id) = &envelope.id else {
            return true;
        };
        if HeaderValue::from_str(&id.to_string()).is_err() {
            return false;
        }
        self.last = Some(id.clone());
        true
    }

    pub fn last(&self) -> Option<&MessageId> {
        self.last.as_ref()
    }

    /// Header value to send; empty before anything was seen.
    pub fn header_value(&self) -> String {
        self.last.as_ref().map(ToString::to_string).unwrap_or_default()
    }

    pub fn clear(&mut self) {
        self.last = None;
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Handle
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// HTTP polling variant of [`Transport`].
pub struct PollingTransport {
    inner: Arc<PollingInner>,
    poll_task: Mutex<Option<JoinHandle<()>>>,
}

struct PollingInner {
    http: Client,
    base_url: String,
    poll_interval: Duration,
    timeout: Duration,
    probe_timeout: Duration,
    cursor: Mutex<PollCursor>,
    lifecycle: Mutex<Lifecycle>,
    cancel: CancellationToken,
    events: EventHub,
}

impl PollingTransport {
    /// Build a channel from config.  Validates headers and interval; performs
    /// no I/O.
    pub fn new(config: PollingConfig) -> Result<Self, TransportError> {
        if config.poll_interval_ms == 0 {
            return Err(TransportError::Config("poll_interval_ms must be > 0".into()));
        }

        let mut headers = HeaderMap::new();
        for (name, value) in &config.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| TransportError::Config(format!("header name {name:?}: {e}")))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| TransportError::Config(format!("header {name}: {e}")))?;
            headers.insert(name, value);
        }

        let http = Client::builder()
            .default_headers(headers)
            .build()
            .map_err(|e| TransportError::Config(e.to_string()))?;

        Ok(Self {
            inner: Arc::new(PollingInner {
                http,
                base_url: config.url.trim_end_matches('/').to_owned(),
                poll_interval: config.poll_interval(),
                timeout: config.timeout(),
                probe_timeout: config.probe_timeout(),
                cursor: Mutex::new(PollCursor::default()),
                lifecycle: Mutex::new(Lifecycle::Idle),
                cancel: CancellationToken::new(),
                events: EventHub::new(),
            }),
            poll_task: Mutex::new(None),
        })
    }

    /// Current poll cursor.
    pub fn cursor(&self) -> PollCursor {
        self.inner.cursor.lock().clone()
    }
}

#[async_trait]
impl Transport for PollingTransport {
    async fn start(&self) -> Result<(), TransportError> {
        {
            let mut lifecycle = self.inner.lifecycle.lock();
            match *lifecycle {
                Lifecycle::Running => return Ok(()),
                Lifecycle::Closed => return Err(TransportError::Closed),
                Lifecycle::Starting => {
                    return Err(TransportError::Request("start already in progress".into()))
                }
                Lifecycle::Idle => *lifecycle = Lifecycle::Starting,
            }
        }

        self.inner.probe().await;

        {
            let mut lifecycle = self.inner.lifecycle.lock();
            if *lifecycle != Lifecycle::Starting {
                return Err(TransportError::Closed);
            }
            *lifecycle = Lifecycle::Running;
        }

        let inner = self.inner.clone();
        *self.poll_task.lock() = Some(tokio::spawn(poll_loop(inner)));

        tracing::info!(
            url = %self.inner.base_url,
            interval_ms = self.inner.poll_interval.as_millis() as u64,
            "polling transport started"
        );
        Ok(())
    }

    async fn send(&self, envelope: Envelope) -> Result<(), TransportError> {
        self.inner.ensure_running()?;
        self.inner.post(&envelope).await.inspect_err(|e| {
            tracing::warn!(error = %e, id = ?envelope.id, "send failed");
            self.inner.events.error(e.clone());
        })
    }

    async fn close(&self) -> Result<(), TransportError> {
        {
            let mut lifecycle = self.inner.lifecycle.lock();
            match *lifecycle {
                Lifecycle::Idle => return Err(TransportError::NotStarted),
                Lifecycle::Closed => return Ok(()),
                Lifecycle::Starting | Lifecycle::Running => *lifecycle = Lifecycle::Closed,
            }
        }

        tracing::info!(url = %self.inner.base_url, "closing polling transport");

        self.inner.cancel.cancel();
        if let Some(task) = self.poll_task.lock().take() {
            task.abort();
        }

        self.inner.notify_disconnect().await;
        self.inner.cursor.lock().clear();
        self.inner.events.finish(None);
        Ok(())
    }

    fn subscribe(&self) -> EventStream {
        self.inner.events.subscribe()
    }

    fn kind(&self) -> &'static str {
        "polling"
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// HTTP operations
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

impl PollingInner {
    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn ensure_running(&self) -> Result<(), TransportError> {
        match *self.lifecycle.lock() {
            Lifecycle::Idle | Lifecycle::Starting => Err(TransportError::NotStarted),
            Lifecycle::Closed => Err(TransportError::Closed),
            Lifecycle::Running => Ok(()),
        }
    }

    /// Best-effort reachability check; only ever logs.
    async fn probe(&self) {
        let result = self
            .http
            .get(self.url("/health"))
            .timeout(self.probe_timeout)
            .send()
            .await;

        match result {
            Ok(resp) if resp.status().is_success() => {
                tracing::debug!(url = %self.base_url, "server reachable");
            }
            Ok(resp) => {
                tracing::warn!(
                    url = %self.base_url,
                    status = resp.status().as_u16(),
                    "health probe returned non-success, polling anyway"
                );
            }
            Err(e) => {
                tracing::warn!(url = %self.base_url, error = %e, "health probe failed, polling anyway");
            }
        }
    }

    /// `GET /messages` for everything after the cursor.  Returns the raw array
    /// items; each is validated individually on delivery.
    async fn fetch(&self) -> Result<Vec<Value>, TransportError> {
        let cursor = self.cursor.lock().header_value();
        let resp = self
            .http
            .get(self.url("/messages"))
            .header(LAST_MESSAGE_ID_HEADER, cursor)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(from_reqwest)?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(TransportError::Http {
                status: status.as_u16(),
                body,
            });
        }

        resp.json::<Vec<Value>>().await.map_err(from_reqwest)
    }

    /// Emit a polled batch in order, advancing the cursor as it goes.
    fn deliver(&self, items: Vec<Value>) {
        for item in items {
            if self.cancel.is_cancelled() {
                return;
            }
            match Envelope::from_value(item) {
                Ok(envelope) => {
                    if self.cursor.lock().observe(&envelope) {
                        self.events.message(envelope);
                        continue;
                    }
                    let id = envelope.id.clone();
                    tracing::warn!(?id, "message id unusable as poll cursor, cursor not advanced");
                    self.events.message(envelope);
                    self.events.error(TransportError::Protocol(format!(
                        "message id {id:?} cannot be used as a poll cursor"
                    )));
                }
                Err(e) => {
                    tracing::debug!(error = %e, "dropping malformed polled envelope");
                    self.events.error(e.into());
                }
            }
        }
    }

    /// `POST /messages`.  A reply envelope in the body is emitted before
    /// returning.
    async fn post(&self, envelope: &Envelope) -> Result<(), TransportError> {
        let resp = self
            .http
            .post(self.url("/messages"))
            .timeout(self.timeout)
            .json(envelope)
            .send()
            .await
            .map_err(from_reqwest)?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(TransportError::Http {
                status: status.as_u16(),
                body,
            });
        }

        let body = resp.text().await.map_err(from_reqwest)?;
        if let Some(reply) = self.parse_reply(&body) {
            if !self.cancel.is_cancelled() {
                self.events.message(reply);
            }
        }
        Ok(())
    }

    /// An empty body, `null` or `{}` means "no immediate reply".  Anything
    /// else must be an envelope; if not, it is reported and ignored.
    fn parse_reply(&self, body: &str) -> Option<Envelope> {
        let body = body.trim();
        if body.is_empty() {
            return None;
        }
        let value: Value = match serde_json::from_str(body) {
            Ok(v) => v,
            Err(e) => {
                self.events
                    .error(TransportError::Protocol(format!("malformed reply: {e}")));
                return None;
            }
        };
        match &value {
            Value::Null => return None,
            Value::Object(map) if map.is_empty() => return None,
            _ => {}
        }
        match Envelope::from_value(value) {
            Ok(envelope) => Some(envelope),
            Err(e) => {
                self.events.error(e.into());
                None
            }
        }
    }

    /// `POST /disconnect`; failures are logged and swallowed.
    async fn notify_disconnect(&self) {
        let result = self
            .http
            .post(self.url("/disconnect"))
            .timeout(self.probe_timeout)
            .send()
            .await;

        match result {
            Ok(resp) if resp.status().is_success() => {
                tracing::debug!("disconnect notice delivered");
            }
            Ok(resp) => {
                tracing::warn!(status = resp.status().as_u16(), "disconnect notice rejected");
            }
            Err(e) => {
                tracing::warn!(error = %e, "disconnect notice failed");
            }
        }
    }
}

/// Pull loop.  Ticks never overlap: the next tick waits for the current poll.
async fn poll_loop(inner: Arc<PollingInner>) {
    let mut ticker = tokio::time::interval(inner.poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = inner.cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let outcome = tokio::select! {
            _ = inner.cancel.cancelled() => break,
            r = inner.fetch() => r,
        };

        match outcome {
            Ok(items) => {
                if !items.is_empty() {
                    tracing::trace!(count = items.len(), "polled envelopes");
                }
                inner.deliver(items);
            }
            Err(e) if e.is_timeout() => {
                tracing::debug!("poll timed out, skipping tick");
            }
            Err(e) => {
                tracing::debug!(error = %e, "poll failed");
                inner.events.error(e);
            }
        }
    }

    tracing::debug!("poll loop stopped");
}

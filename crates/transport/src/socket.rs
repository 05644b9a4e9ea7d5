//! Socket channel: one persistent WebSocket with linear-backoff reconnects.
//!
//! The public [`SocketTransport`] handle never touches the connection.  On
//! `start` it spawns a driver task that owns the socket, the outbound queue,
//! the reconnect counter and the connection state, and processes commands
//! from the handle strictly in order.  That single task is what makes queue
//! flushes and later sends come out in the order they were issued.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use reqwest::Url;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tr_protocol::Envelope;

use crate::config::SocketConfig;
use crate::credentials::CredentialAttachment;
use crate::error::TransportError;
use crate::event::{CloseReason, EventHub, EventStream};
use crate::queue::OutboundQueue;
use crate::reconnect::ReconnectPolicy;
use crate::traits::{Lifecycle, Transport};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Connection state of a socket channel, as seen from outside.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Open,
    /// Lost the connection unexpectedly; waiting out the back-off or
    /// attempting to reconnect.
    Reconnecting,
    Closing,
    Closed,
}

enum Command {
    Send(Envelope),
    Close(oneshot::Sender<()>),
}

/// Why the driver stopped serving a connection without it being lost.
enum Interrupt {
    Close(oneshot::Sender<()>),
    /// Every handle was dropped.
    Dropped,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Handle
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// WebSocket variant of [`Transport`].
///
/// `send` never fails once the channel is running: envelopes issued while the
/// socket is down are buffered and flushed, in order, on the next open.
pub struct SocketTransport {
    config: SocketConfig,
    url: Url,
    credentials: Arc<dyn CredentialAttachment>,
    lifecycle: Mutex<Lifecycle>,
    commands: Mutex<Option<mpsc::UnboundedSender<Command>>>,
    driver: Mutex<Option<JoinHandle<()>>>,
    state: Arc<watch::Sender<ConnectionState>>,
    queued: Arc<AtomicUsize>,
    events: EventHub,
}

impl SocketTransport {
    /// Build a channel from config.  Validates the URL and headers; does not
    /// connect.
    pub fn new(config: SocketConfig) -> Result<Self, TransportError> {
        let url = Url::parse(&config.url)
            .map_err(|e| TransportError::Config(format!("invalid socket url {:?}: {e}", config.url)))?;
        let credentials = config.credentials.strategy();
        // Surface bad header names/values now rather than on first connect.
        handshake_request(credentials.as_ref(), &url, &config.headers)?;

        let (state, _) = watch::channel(ConnectionState::Idle);
        Ok(Self {
            config,
            url,
            credentials,
            lifecycle: Mutex::new(Lifecycle::Idle),
            commands: Mutex::new(None),
            driver: Mutex::new(None),
            state: Arc::new(state),
            queued: Arc::new(AtomicUsize::new(0)),
            events: EventHub::new(),
        })
    }

    /// Replace the credential strategy selected by config.
    pub fn with_credentials(mut self, credentials: Arc<dyn CredentialAttachment>) -> Self {
        self.credentials = credentials;
        self
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Watch connection state transitions.
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Envelopes currently buffered awaiting a connection.
    pub fn queued(&self) -> usize {
        self.queued.load(Ordering::Relaxed)
    }

    fn spawn_driver(
        &self,
        commands: mpsc::UnboundedReceiver<Command>,
        ready: oneshot::Sender<Result<(), TransportError>>,
    ) -> JoinHandle<()> {
        let driver = SocketDriver {
            base_url: self.url.clone(),
            headers: self.config.headers.clone(),
            credentials: self.credentials.clone(),
            policy: self.config.reconnect_policy(),
            connect_timeout: self.config.connect_timeout(),
            write_timeout: self.config.write_timeout(),
            commands,
            queue: OutboundQueue::new(self.config.queue),
            queued: self.queued.clone(),
            attempts: 0,
            state: self.state.clone(),
            events: self.events.clone(),
        };
        tokio::spawn(driver.run(ready))
    }
}

#[async_trait]
impl Transport for SocketTransport {
    async fn start(&self) -> Result<(), TransportError> {
        let ready_rx = {
            let mut lifecycle = self.lifecycle.lock();
            match *lifecycle {
                Lifecycle::Running if !self.events.is_finished() => return Ok(()),
                Lifecycle::Running | Lifecycle::Closed => return Err(TransportError::Closed),
                Lifecycle::Starting => {
                    return Err(TransportError::Connect("start already in progress".into()))
                }
                Lifecycle::Idle => *lifecycle = Lifecycle::Starting,
            }

            // Installed before the lock is released so a concurrent close()
            // always finds the driver to stop.
            let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
            let (ready_tx, ready_rx) = oneshot::channel();
            *self.commands.lock() = Some(cmd_tx);
            *self.driver.lock() = Some(self.spawn_driver(cmd_rx, ready_tx));
            ready_rx
        };

        let outcome = ready_rx.await.unwrap_or(Err(TransportError::Closed));

        let mut lifecycle = self.lifecycle.lock();
        match (outcome, *lifecycle) {
            (Ok(()), Lifecycle::Starting) => {
                *lifecycle = Lifecycle::Running;
                tracing::info!(url = %self.url, "socket transport started");
                Ok(())
            }
            (Err(e), Lifecycle::Starting) => {
                *lifecycle = Lifecycle::Idle;
                *self.commands.lock() = None;
                self.driver.lock().take();
                tracing::warn!(url = %self.url, error = %e, "initial socket connection failed");
                Err(e)
            }
            // close() won the race.  It normally owns the teardown; only a
            // driver it never signalled is stopped here.
            _ => {
                if self.commands.lock().take().is_some() {
                    if let Some(driver) = self.driver.lock().take() {
                        driver.abort();
                    }
                }
                Err(TransportError::Closed)
            }
        }
    }

    async fn send(&self, envelope: Envelope) -> Result<(), TransportError> {
        match *self.lifecycle.lock() {
            Lifecycle::Idle | Lifecycle::Starting => return Err(TransportError::NotStarted),
            Lifecycle::Closed => return Err(TransportError::Closed),
            Lifecycle::Running => {}
        }
        if self.events.is_finished() {
            return Err(TransportError::Closed);
        }
        let commands = self.commands.lock().clone();
        match commands {
            Some(tx) => tx
                .send(Command::Send(envelope))
                .map_err(|_| TransportError::Closed),
            None => Err(TransportError::Closed),
        }
    }

    async fn close(&self) -> Result<(), TransportError> {
        let commands = {
            let mut lifecycle = self.lifecycle.lock();
            match *lifecycle {
                Lifecycle::Idle => return Err(TransportError::NotStarted),
                Lifecycle::Closed => return Ok(()),
                Lifecycle::Starting | Lifecycle::Running => *lifecycle = Lifecycle::Closed,
            }
            self.commands.lock().take()
        };

        tracing::info!(url = %self.url, "closing socket transport");

        if let Some(tx) = commands {
            let (ack_tx, ack_rx) = oneshot::channel();
            if tx.send(Command::Close(ack_tx)).is_ok() {
                // A dropped ack means the driver already exited on its own.
                let grace = self.config.write_timeout();
                if tokio::time::timeout(grace, ack_rx).await.is_err() {
                    tracing::warn!(
                        url = %self.url,
                        grace_ms = grace.as_millis() as u64,
                        "socket driver did not acknowledge close, aborting it"
                    );
                }
            }
        }
        if let Some(driver) = self.driver.lock().take() {
            driver.abort();
        }

        // An aborted driver never reached its own shutdown.
        self.state.send_replace(ConnectionState::Closed);
        self.queued.store(0, Ordering::Relaxed);
        self.events.finish(None);
        Ok(())
    }

    fn subscribe(&self) -> EventStream {
        self.events.subscribe()
    }

    fn kind(&self) -> &'static str {
        "socket"
    }
}

/// Resolve credentials and build the handshake request.
fn handshake_request(
    credentials: &dyn CredentialAttachment,
    url: &Url,
    headers: &BTreeMap<String, String>,
) -> Result<Request, TransportError> {
    let target = credentials.attach(url.clone(), headers);
    let mut request = target
        .url
        .as_str()
        .into_client_request()
        .map_err(|e| TransportError::Config(e.to_string()))?;

    for (name, value) in &target.headers {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| TransportError::Config(format!("header name {name:?}: {e}")))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| TransportError::Config(format!("header {name}: {e}")))?;
        request.headers_mut().insert(name, value);
    }
    Ok(request)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Driver
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

enum Connect {
    Connected(Box<WsStream>),
    Failed(TransportError),
    Interrupted(Interrupt),
}

enum Served {
    Lost,
    Interrupted(Interrupt),
}

struct SocketDriver {
    base_url: Url,
    headers: BTreeMap<String, String>,
    credentials: Arc<dyn CredentialAttachment>,
    policy: ReconnectPolicy,
    connect_timeout: Duration,
    write_timeout: Duration,
    commands: mpsc::UnboundedReceiver<Command>,
    queue: OutboundQueue,
    queued: Arc<AtomicUsize>,
    /// Reconnect attempts since the last successful open.
    attempts: u32,
    state: Arc<watch::Sender<ConnectionState>>,
    events: EventHub,
}

impl SocketDriver {
    async fn run(mut self, ready: oneshot::Sender<Result<(), TransportError>>) {
        self.set_state(ConnectionState::Connecting);

        let mut ws = match self.connect().await {
            Connect::Connected(ws) => {
                let _ = ready.send(Ok(()));
                ws
            }
            Connect::Failed(e) => {
                self.set_state(ConnectionState::Idle);
                let _ = ready.send(Err(e));
                return;
            }
            Connect::Interrupted(interrupt) => {
                let _ = ready.send(Err(TransportError::Closed));
                self.shutdown(None, interrupt).await;
                return;
            }
        };

        loop {
            match self.serve(&mut ws).await {
                Served::Interrupted(interrupt) => {
                    self.shutdown(Some(ws), interrupt).await;
                    return;
                }
                Served::Lost => drop(ws),
            }

            ws = loop {
                if self.policy.should_give_up(self.attempts) {
                    self.give_up();
                    return;
                }
                self.attempts += 1;
                let delay = self.policy.delay_for_attempt(self.attempts);
                self.set_state(ConnectionState::Reconnecting);
                tracing::info!(
                    url = %self.base_url,
                    attempt = self.attempts,
                    delay_ms = delay.as_millis() as u64,
                    "reconnecting"
                );

                if let Some(interrupt) = self.wait(delay).await {
                    self.shutdown(None, interrupt).await;
                    return;
                }

                match self.connect().await {
                    Connect::Connected(ws) => break ws,
                    Connect::Failed(e) => {
                        tracing::warn!(attempt = self.attempts, error = %e, "reconnect attempt failed");
                        self.events.error(e);
                    }
                    Connect::Interrupted(interrupt) => {
                        self.shutdown(None, interrupt).await;
                        return;
                    }
                }
            };
        }
    }

    /// One connection attempt, bounded by the connect timeout.  Commands that
    /// arrive meanwhile are queued; a close aborts the attempt.
    async fn connect(&mut self) -> Connect {
        let request = match handshake_request(self.credentials.as_ref(), &self.base_url, &self.headers) {
            Ok(r) => r,
            Err(e) => return Connect::Failed(e),
        };
        tracing::info!(url = %self.base_url, "connecting");

        let timeout = self.connect_timeout;
        let attempt = tokio::time::timeout(timeout, tokio_tungstenite::connect_async(request));
        tokio::pin!(attempt);

        loop {
            tokio::select! {
                res = &mut attempt => {
                    return match res {
                        Ok(Ok((ws, _response))) => Connect::Connected(Box::new(ws)),
                        Ok(Err(e)) => Connect::Failed(TransportError::Connect(e.to_string())),
                        Err(_) => Connect::Failed(TransportError::Timeout(format!(
                            "connect exceeded {}ms",
                            timeout.as_millis()
                        ))),
                    };
                }
                cmd = self.commands.recv() => match cmd {
                    Some(Command::Send(envelope)) => self.enqueue(envelope),
                    Some(Command::Close(ack)) => return Connect::Interrupted(Interrupt::Close(ack)),
                    None => return Connect::Interrupted(Interrupt::Dropped),
                },
            }
        }
    }

    /// Sleep out a reconnect delay while still accepting commands.
    async fn wait(&mut self, delay: Duration) -> Option<Interrupt> {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);

        loop {
            tokio::select! {
                _ = &mut sleep => return None,
                cmd = self.commands.recv() => match cmd {
                    Some(Command::Send(envelope)) => self.enqueue(envelope),
                    Some(Command::Close(ack)) => return Some(Interrupt::Close(ack)),
                    None => return Some(Interrupt::Dropped),
                },
            }
        }
    }

    /// Run an open connection: flush the backlog, then pump frames and
    /// commands until the connection is lost or a close is requested.
    async fn serve(&mut self, ws: &mut WsStream) -> Served {
        self.attempts = 0;
        self.set_state(ConnectionState::Open);
        tracing::info!(url = %self.base_url, "socket open");

        if self.flush(ws).await.is_err() {
            return Served::Lost;
        }

        loop {
            tokio::select! {
                frame = ws.next() => match frame {
                    Some(Ok(Message::Close(frame))) => {
                        tracing::info!(?frame, "server closed connection");
                        return Served::Lost;
                    }
                    Some(Ok(msg)) => self.on_frame(msg),
                    Some(Err(WsError::ConnectionClosed | WsError::AlreadyClosed)) | None => {
                        tracing::info!("socket closed");
                        return Served::Lost;
                    }
                    Some(Err(e)) => {
                        tracing::warn!(error = %e, "socket error");
                        self.events.error(TransportError::WebSocket(e.to_string()));
                        return Served::Lost;
                    }
                },
                cmd = self.commands.recv() => match cmd {
                    Some(Command::Send(envelope)) => {
                        if self.write(ws, envelope).await.is_err() {
                            return Served::Lost;
                        }
                    }
                    Some(Command::Close(ack)) => return Served::Interrupted(Interrupt::Close(ack)),
                    None => return Served::Interrupted(Interrupt::Dropped),
                },
            }
        }
    }

    fn on_frame(&self, msg: Message) {
        match msg {
            Message::Text(text) => self.dispatch(&text),
            Message::Binary(bytes) => match std::str::from_utf8(&bytes) {
                Ok(text) => self.dispatch(text),
                Err(e) => {
                    self.events
                        .error(TransportError::Protocol(format!("binary frame is not UTF-8: {e}")));
                }
            },
            // Ping/pong are answered by tungstenite itself.
            _ => {}
        }
    }

    fn dispatch(&self, text: &str) {
        match Envelope::from_json(text) {
            Ok(envelope) => {
                tracing::trace!(id = ?envelope.id, method = ?envelope.method, "inbound envelope");
                self.events.message(envelope);
            }
            Err(e) => {
                tracing::debug!(error = %e, "dropping malformed frame");
                self.events.error(e.into());
            }
        }
    }

    /// Transmit the whole backlog head to tail.
    async fn flush(&mut self, ws: &mut WsStream) -> Result<(), TransportError> {
        if !self.queue.is_empty() {
            tracing::info!(count = self.queue.len(), "flushing outbound queue");
        }
        while let Some(envelope) = self.queue.pop_front() {
            self.sync_queued();
            self.write(ws, envelope).await?;
        }
        Ok(())
    }

    /// Write one envelope, bounded by the write timeout.  On failure the
    /// envelope goes back to the head of the queue and the error is reported.
    async fn write(&mut self, ws: &mut WsStream, envelope: Envelope) -> Result<(), TransportError> {
        let json = match envelope.to_json() {
            Ok(json) => json,
            Err(e) => {
                // Unserializable envelopes can never be delivered; drop this one.
                tracing::error!(error = %e, "failed to serialize outbound envelope");
                self.events.error(TransportError::Protocol(e.to_string()));
                return Ok(());
            }
        };

        let sending = ws.send(Message::Text(json));
        let err = match tokio::time::timeout(self.write_timeout, sending).await {
            Ok(Ok(())) => return Ok(()),
            Ok(Err(e)) => TransportError::WebSocket(e.to_string()),
            Err(_) => TransportError::Timeout(format!(
                "write exceeded {}ms",
                self.write_timeout.as_millis()
            )),
        };
        tracing::warn!(error = %err, id = ?envelope.id, "send failed, requeueing");
        self.queue.requeue_front(envelope);
        self.sync_queued();
        self.events.error(err.clone());
        Err(err)
    }

    fn enqueue(&mut self, envelope: Envelope) {
        match self.queue.push(envelope) {
            Ok(None) => {}
            Ok(Some(dropped)) => {
                tracing::warn!(id = ?dropped.id, "outbound queue full, dropped oldest envelope");
            }
            Err(e) => {
                tracing::warn!(error = %e, "outbound queue full, rejected envelope");
                self.events.error(e);
            }
        }
        self.sync_queued();
    }

    fn give_up(&mut self) {
        tracing::error!(
            url = %self.base_url,
            attempts = self.attempts,
            "max reconnect attempts exhausted"
        );
        let dropped = self.queue.clear();
        self.sync_queued();
        if dropped > 0 {
            tracing::warn!(dropped, "discarded undelivered envelopes");
        }
        self.set_state(ConnectionState::Closed);
        self.events.finish(Some(CloseReason::MaxAttemptsReached {
            attempts: self.attempts,
        }));
    }

    async fn shutdown(&mut self, ws: Option<Box<WsStream>>, interrupt: Interrupt) {
        self.set_state(ConnectionState::Closing);

        if let Some(mut ws) = ws {
            let frame = CloseFrame {
                code: CloseCode::Normal,
                reason: "client closing".into(),
            };
            let closing = WebSocketStream::close(&mut *ws, Some(frame));
            match tokio::time::timeout(self.write_timeout, closing).await {
                Ok(Ok(())) => tracing::debug!("close frame sent"),
                Ok(Err(e)) => tracing::debug!(error = %e, "error sending close frame"),
                Err(_) => tracing::debug!("timed out sending close frame"),
            }
        }

        let dropped = self.queue.clear();
        self.sync_queued();
        if dropped > 0 {
            tracing::info!(dropped, "discarded undelivered envelopes on close");
        }
        self.attempts = 0;
        self.set_state(ConnectionState::Closed);

        if let Interrupt::Close(ack) = interrupt {
            let _ = ack.send(());
        }
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            tracing::debug!(from = ?previous, to = ?state, "socket state");
        }
    }

    fn sync_queued(&self) {
        self.queued.store(self.queue.len(), Ordering::Relaxed);
    }
}

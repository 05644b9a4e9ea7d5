//! Integration tests: an in-process axum server plays the remote side of the
//! polling protocol (`/health`, `/messages`, `/disconnect`) and records what
//! the [`PollingTransport`] sent it.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::StreamExt;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::Notify;
use tr_protocol::{Envelope, MessageId};
use tr_transport::{
    EventStream, PollingConfig, PollingTransport, Transport, TransportError, TransportEvent,
};

// ── Mini server ─────────────────────────────────────────────────────────

#[derive(Default)]
struct Recorded {
    /// Batches handed out by successive `GET /messages`; `[]` once drained.
    batches: VecDeque<Value>,
    /// `X-Last-Message-Id` of every poll, in order.
    cursors: Vec<String>,
    posted: Vec<Value>,
    health_hits: usize,
    disconnects: usize,
    /// When set, polls hang this long before answering.
    poll_delay: Option<Duration>,
}

#[derive(Clone, Default)]
struct Shared {
    rec: Arc<Mutex<Recorded>>,
    poll_started: Arc<Notify>,
}

async fn health(State(s): State<Shared>) -> &'static str {
    s.rec.lock().health_hits += 1;
    "ok"
}

async fn get_messages(State(s): State<Shared>, headers: HeaderMap) -> Json<Value> {
    let cursor = headers
        .get("x-last-message-id")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("<missing>")
        .to_owned();
    let delay = {
        let mut rec = s.rec.lock();
        rec.cursors.push(cursor);
        rec.poll_delay
    };
    s.poll_started.notify_one();
    if let Some(delay) = delay {
        tokio::time::sleep(delay).await;
    }
    let batch = s.rec.lock().batches.pop_front().unwrap_or_else(|| json!([]));
    Json(batch)
}

async fn post_messages(State(s): State<Shared>, Json(body): Json<Value>) -> Response {
    s.rec.lock().posted.push(body.clone());
    match body["method"].as_str() {
        Some("explode") => (StatusCode::INTERNAL_SERVER_ERROR, "boom").into_response(),
        Some("echo") => Json(json!({
            "jsonrpc": "2.0",
            "id": body["id"],
            "result": body["params"],
        }))
        .into_response(),
        _ => StatusCode::ACCEPTED.into_response(),
    }
}

async fn disconnect(State(s): State<Shared>) -> StatusCode {
    s.rec.lock().disconnects += 1;
    StatusCode::OK
}

async fn start_mini_server() -> (SocketAddr, Shared) {
    let shared = Shared::default();
    let app = Router::new()
        .route("/health", get(health))
        .route("/messages", get(get_messages).post(post_messages))
        .route("/disconnect", post(disconnect))
        .with_state(shared.clone());

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (addr, shared)
}

fn config(addr: SocketAddr) -> PollingConfig {
    let mut cfg = PollingConfig::new(format!("http://{addr}"));
    cfg.poll_interval_ms = 20;
    cfg.timeout_ms = 2000;
    cfg.probe_timeout_ms = 1000;
    cfg
}

/// Next `Message` event, skipping errors.
async fn next_message(events: &mut EventStream) -> Envelope {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        match tokio::time::timeout_at(deadline, events.recv()).await {
            Ok(Some(TransportEvent::Message(env))) => return env,
            Ok(Some(TransportEvent::Error(_))) => continue,
            Ok(other) => panic!("expected message, got {other:?}"),
            Err(_) => panic!("timeout waiting for message"),
        }
    }
}

async fn next_event(events: &mut EventStream) -> TransportEvent {
    tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("timeout waiting for event")
        .expect("event stream ended")
}

/// Poll `check` until it holds or 5s pass.
async fn eventually(mut check: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !check() {
        assert!(tokio::time::Instant::now() < deadline, "condition not reached");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

// ── Tests ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn batch_is_delivered_in_order_and_cursor_advances() {
    let (addr, shared) = start_mini_server().await;
    shared.rec.lock().batches.push_back(json!([
        {"jsonrpc": "2.0", "id": "a", "method": "tools/call"},
        {"jsonrpc": "2.0", "id": "b", "method": "tools/call"},
    ]));

    let transport = PollingTransport::new(config(addr)).unwrap();
    let mut events = transport.subscribe();
    transport.start().await.unwrap();

    assert_eq!(next_message(&mut events).await.id, Some(MessageId::from("a")));
    assert_eq!(next_message(&mut events).await.id, Some(MessageId::from("b")));

    eventually(|| shared.rec.lock().cursors.iter().any(|c| c == "b")).await;
    {
        let rec = shared.rec.lock();
        assert_eq!(rec.health_hits, 1);
        assert_eq!(rec.cursors[0], "", "first poll carries an empty cursor");
        let first_b = rec.cursors.iter().position(|c| c == "b").unwrap();
        assert!(rec.cursors[..first_b].iter().all(|c| c.is_empty()));
    }
    assert_eq!(transport.cursor().header_value(), "b");

    transport.close().await.unwrap();
}

#[tokio::test]
async fn failed_post_fails_send_but_polling_continues() {
    let (addr, shared) = start_mini_server().await;
    let transport = PollingTransport::new(config(addr)).unwrap();
    let mut events = transport.subscribe();
    transport.start().await.unwrap();

    let err = transport
        .send(Envelope::request(1, "explode", None))
        .await
        .unwrap_err();
    assert_eq!(
        err,
        TransportError::Http {
            status: 500,
            body: "boom".into()
        }
    );

    shared
        .rec
        .lock()
        .batches
        .push_back(json!([{"jsonrpc": "2.0", "method": "notifications/still-alive"}]));
    let env = next_message(&mut events).await;
    assert_eq!(env.method.as_deref(), Some("notifications/still-alive"));

    transport.close().await.unwrap();
}

#[tokio::test]
async fn immediate_reply_is_emitted_before_send_returns() {
    let (addr, shared) = start_mini_server().await;
    let transport = PollingTransport::new(config(addr)).unwrap();
    let mut events = transport.subscribe();
    transport.start().await.unwrap();

    transport
        .send(Envelope::request(42, "echo", Some(json!({"hello": "world"}))))
        .await
        .unwrap();

    match events.try_recv() {
        Some(TransportEvent::Message(reply)) => {
            assert_eq!(reply.id, Some(MessageId::Number(42)));
            assert_eq!(reply.result, Some(json!({"hello": "world"})));
        }
        other => panic!("expected reply already delivered, got {other:?}"),
    }

    // A plain accepted POST produces no event.
    transport
        .send(Envelope::notification("notifications/initialized", None))
        .await
        .unwrap();
    assert!(events.try_recv().is_none());

    let posted = shared.rec.lock().posted.clone();
    assert_eq!(posted.len(), 2);
    assert_eq!(posted[0]["method"], "echo");
    assert_eq!(posted[1]["method"], "notifications/initialized");

    transport.close().await.unwrap();
}

#[tokio::test]
async fn null_result_reply_is_delivered() {
    let (addr, _shared) = start_mini_server().await;
    let transport = PollingTransport::new(config(addr)).unwrap();
    let mut events = transport.subscribe();
    transport.start().await.unwrap();

    // `echo` without params answers `"result": null`.
    transport
        .send(Envelope::request(9, "echo", None))
        .await
        .unwrap();

    match events.try_recv() {
        Some(TransportEvent::Message(reply)) => {
            assert_eq!(reply.id, Some(MessageId::Number(9)));
            assert_eq!(reply.result, Some(Value::Null));
        }
        other => panic!("expected null-result reply, got {other:?}"),
    }

    transport.close().await.unwrap();
}

#[tokio::test]
async fn unusable_id_does_not_poison_the_cursor() {
    let (addr, shared) = start_mini_server().await;
    shared.rec.lock().batches.push_back(json!([
        {"jsonrpc": "2.0", "id": "bad\u{1}id", "method": "first"},
        {"jsonrpc": "2.0", "id": "good", "method": "second"},
    ]));

    let transport = PollingTransport::new(config(addr)).unwrap();
    let mut events = transport.subscribe();
    transport.start().await.unwrap();

    match next_event(&mut events).await {
        TransportEvent::Message(env) => assert_eq!(env.method.as_deref(), Some("first")),
        other => panic!("expected first message, got {other:?}"),
    }
    assert!(matches!(
        next_event(&mut events).await,
        TransportEvent::Error(TransportError::Protocol(_))
    ));
    match next_event(&mut events).await {
        TransportEvent::Message(env) => assert_eq!(env.method.as_deref(), Some("second")),
        other => panic!("expected second message, got {other:?}"),
    }

    eventually(|| shared.rec.lock().cursors.iter().any(|c| c == "good")).await;
    let polls = shared.rec.lock().cursors.len();
    eventually(|| shared.rec.lock().cursors.len() >= polls + 3).await;
    assert!(events.try_recv().is_none(), "later polls must keep succeeding");

    transport.close().await.unwrap();
}

#[tokio::test]
async fn close_is_idempotent_and_notifies_server_once() {
    let (addr, shared) = start_mini_server().await;
    let transport = PollingTransport::new(config(addr)).unwrap();
    let events = transport.subscribe();
    transport.start().await.unwrap();

    transport.close().await.unwrap();
    transport.close().await.unwrap();

    assert_eq!(shared.rec.lock().disconnects, 1);
    assert_eq!(transport.cursor().header_value(), "");
    let all: Vec<_> = events.collect().await;
    assert_eq!(all, vec![TransportEvent::Closed(None)]);

    assert_eq!(
        transport.send(Envelope::notification("late", None)).await,
        Err(TransportError::Closed)
    );
    assert_eq!(transport.start().await, Err(TransportError::Closed));
}

#[tokio::test]
async fn in_flight_poll_is_discarded_after_close() {
    let (addr, shared) = start_mini_server().await;
    {
        let mut rec = shared.rec.lock();
        rec.poll_delay = Some(Duration::from_millis(300));
        rec.batches
            .push_back(json!([{"jsonrpc": "2.0", "id": "late", "method": "x"}]));
    }

    let transport = PollingTransport::new(config(addr)).unwrap();
    let events = transport.subscribe();
    transport.start().await.unwrap();

    shared.poll_started.notified().await;
    transport.close().await.unwrap();

    // Give the server time to answer the abandoned request.
    tokio::time::sleep(Duration::from_millis(400)).await;
    let all: Vec<_> = events.collect().await;
    assert_eq!(all, vec![TransportEvent::Closed(None)]);
}

#[tokio::test]
async fn poll_timeouts_are_skipped_silently() {
    let (addr, shared) = start_mini_server().await;
    shared.rec.lock().poll_delay = Some(Duration::from_millis(200));

    let mut cfg = config(addr);
    cfg.timeout_ms = 50;
    let transport = PollingTransport::new(cfg).unwrap();
    let mut events = transport.subscribe();
    transport.start().await.unwrap();

    eventually(|| shared.rec.lock().cursors.len() >= 3).await;
    assert!(events.try_recv().is_none(), "timeouts must not surface as errors");

    transport.close().await.unwrap();
}

#[tokio::test]
async fn unreachable_server_still_starts_and_reports_poll_errors() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let transport = PollingTransport::new(config(addr)).unwrap();
    let mut events = transport.subscribe();
    transport.start().await.unwrap();

    match tokio::time::timeout(Duration::from_secs(5), events.recv()).await {
        Ok(Some(TransportEvent::Error(TransportError::Request(_)))) => {}
        other => panic!("expected poll error, got {other:?}"),
    }

    // The disconnect notice fails too; close still succeeds.
    transport.close().await.unwrap();
}

#[tokio::test]
async fn caller_headers_reach_every_endpoint() {
    let seen = Arc::new(Mutex::new(Vec::<String>::new()));
    let record = {
        let seen = seen.clone();
        move |headers: HeaderMap| {
            let seen = seen.clone();
            async move {
                let auth = headers
                    .get("authorization")
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or_default()
                    .to_owned();
                seen.lock().push(auth);
                StatusCode::OK
            }
        }
    };
    let app = Router::new()
        .route("/health", get(record.clone()))
        .route("/messages", get(record.clone()).post(record.clone()))
        .route("/disconnect", post(record));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    let mut cfg = config(addr);
    cfg.headers
        .insert("Authorization".into(), "Bearer t0ken".into());
    let transport = PollingTransport::new(cfg).unwrap();
    transport.start().await.unwrap();
    transport
        .send(Envelope::notification("n", None))
        .await
        .unwrap();
    transport.close().await.unwrap();

    let seen = seen.lock().clone();
    // health + at least one poll + send + disconnect
    assert!(seen.len() >= 4, "{seen:?}");
    assert!(seen.iter().all(|auth| auth == "Bearer t0ken"), "{seen:?}");
}

//! End-to-end connection tests against an in-process WebSocket peer.
//!
//! The peer accepts connections in a loop (so reconnects work), records
//! every inbound frame and answers through a per-test responder:
//!
//! - `test.error` → error reply with message/code
//! - `test.emit` → the event frames given in `params.events`, then a reply
//! - `test.stale` → a reply with an unknown id first, then the real reply
//! - anything else → success reply echoing `params` as `result`

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::Result;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;

use cdp_client::{
    Command, CommandDescriptor, Connection, Error, EventHandler, RawCommand, SessionRef,
    StaticSchema, Target, expect_key,
};

// ============================================================================
// In-Process Peer
// ============================================================================

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

struct Peer {
    url: String,
    seen: Arc<Mutex<Vec<Value>>>,
}

impl Peer {
    /// Methods of every frame received so far, in arrival order.
    fn seen_methods(&self) -> Vec<String> {
        self.seen
            .lock()
            .iter()
            .filter_map(|f| f["method"].as_str().map(String::from))
            .collect()
    }

    /// Ids of every frame received so far, in arrival order.
    fn seen_ids(&self) -> Vec<u64> {
        self.seen.lock().iter().filter_map(|f| f["id"].as_u64()).collect()
    }
}

async fn spawn_peer<F>(respond: F) -> Peer
where
    F: Fn(&Value) -> Vec<Value> + Send + Sync + 'static,
{
    init_tracing();
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let url = format!("ws://{}", listener.local_addr().expect("addr"));
    let seen: Arc<Mutex<Vec<Value>>> = Arc::new(Mutex::new(Vec::new()));
    let respond = Arc::new(respond);

    let accept_seen = Arc::clone(&seen);
    tokio::spawn(async move {
        loop {
            let Ok((socket, _)) = listener.accept().await else {
                break;
            };
            let Ok(mut ws) = accept_async(socket).await else {
                continue;
            };
            let seen = Arc::clone(&accept_seen);
            let respond = Arc::clone(&respond);
            tokio::spawn(async move {
                while let Some(Ok(message)) = ws.next().await {
                    match message {
                        Message::Text(text) => {
                            let Ok(frame) = serde_json::from_str::<Value>(&text) else {
                                continue;
                            };
                            seen.lock().push(frame.clone());
                            for out in respond(&frame) {
                                if ws.send(Message::Text(out.to_string().into())).await.is_err() {
                                    return;
                                }
                            }
                        }
                        Message::Ping(data) => {
                            let _ = ws.send(Message::Pong(data)).await;
                        }
                        Message::Close(_) => return,
                        _ => {}
                    }
                }
            });
        }
    });

    Peer { url, seen }
}

fn default_respond(frame: &Value) -> Vec<Value> {
    let Some(id) = frame["id"].as_u64() else {
        return Vec::new();
    };
    match frame["method"].as_str().unwrap_or_default() {
        "test.error" => vec![json!({"id": id, "error": {"message": "boom", "code": -32000}})],
        "test.emit" => {
            let mut out: Vec<Value> = frame["params"]["events"]
                .as_array()
                .cloned()
                .unwrap_or_default();
            out.push(json!({"id": id, "result": {}}));
            out
        }
        "test.stale" => vec![
            json!({"id": 999, "result": {}}),
            json!({"id": id, "result": {"ok": true}}),
        ],
        _ => vec![json!({"id": id, "result": frame["params"].clone()})],
    }
}

// ============================================================================
// Fixtures
// ============================================================================

fn schema() -> Arc<StaticSchema> {
    Arc::new(
        StaticSchema::new()
            .namespace(
                "net",
                ["net.requestSent", "net.responseReceived", "net.loadingFailed"],
            )
            .namespace("page", ["page.loadEventFired"]),
    )
}

fn connection(url: &str) -> Connection {
    Connection::builder(url, schema()).build().expect("endpoint")
}

/// Typed command: sends `{"value": 42}` and decodes `result.value`.
struct GetValue;

impl Command for GetValue {
    type Response = u64;

    fn descriptor(&self) -> cdp_client::Result<CommandDescriptor> {
        Ok(CommandDescriptor::new("test.getValue", json!({"value": 42})))
    }

    fn decode(raw: Value) -> cdp_client::Result<u64> {
        expect_key(&raw, "value")?
            .as_u64()
            .ok_or_else(|| Error::malformed_response("value"))
    }
}

fn emit_command(events: Vec<Value>) -> RawCommand {
    RawCommand::new("test.emit", json!({"events": events}))
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

// ============================================================================
// Command Scenarios
// ============================================================================

#[tokio::test]
async fn typed_command_resolves_decoded_value() -> Result<()> {
    let peer = spawn_peer(default_respond).await;
    let conn = connection(&peer.url);

    let value = conn.send(GetValue).await?;
    assert_eq!(value, 42);

    conn.disconnect().await?;
    Ok(())
}

#[tokio::test]
async fn error_reply_renders_message_and_code() -> Result<()> {
    let peer = spawn_peer(default_respond).await;
    let conn = connection(&peer.url);

    let err = conn
        .send(RawCommand::new("test.error", json!({})))
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "boom [code: -32000]");
    assert_eq!(err.code(), Some(-32000));

    conn.disconnect().await?;
    Ok(())
}

#[tokio::test]
async fn unknown_reply_id_is_dropped_and_loop_continues() -> Result<()> {
    let peer = spawn_peer(default_respond).await;
    let conn = connection(&peer.url);

    // the peer answers with a stale id 999 first; the real reply must still
    // correlate, and the connection must stay usable afterwards
    let result = conn.send(RawCommand::new("test.stale", json!({}))).await?;
    assert_eq!(result["ok"], true);

    let value = conn.send(GetValue).await?;
    assert_eq!(value, 42);

    conn.disconnect().await?;
    Ok(())
}

#[tokio::test]
async fn concurrent_callers_each_get_their_own_reply() -> Result<()> {
    let peer = spawn_peer(default_respond).await;
    let conn = connection(&peer.url);
    conn.connect().await?;

    let mut tasks = Vec::new();
    for n in 0..16u64 {
        let conn = conn.clone();
        tasks.push(tokio::spawn(async move {
            let result = conn
                .send(RawCommand::new("test.echo", json!({"n": n})))
                .await?;
            anyhow::ensure!(result["n"] == n, "caller {n} got {result}");
            Ok::<_, anyhow::Error>(())
        }));
    }
    for task in tasks {
        task.await??;
    }

    assert_eq!(conn.pending_count().await, 0);
    conn.disconnect().await?;
    Ok(())
}

#[tokio::test]
async fn ids_strictly_increase_in_transmission_order() -> Result<()> {
    let peer = spawn_peer(default_respond).await;
    let conn = connection(&peer.url);

    for _ in 0..5 {
        conn.send(RawCommand::new("test.echo", json!({}))).await?;
    }

    let ids = peer.seen_ids();
    assert!(ids.len() >= 5);
    for pair in ids.windows(2) {
        assert!(pair[0] < pair[1], "ids not strictly increasing: {ids:?}");
    }

    conn.disconnect().await?;
    Ok(())
}

// ============================================================================
// Lifecycle Scenarios
// ============================================================================

#[tokio::test]
async fn disconnect_twice_is_idempotent() -> Result<()> {
    let peer = spawn_peer(default_respond).await;
    let conn = connection(&peer.url);

    conn.connect().await?;
    assert!(!conn.is_closed().await);

    conn.disconnect().await?;
    conn.disconnect().await?;
    assert!(conn.is_closed().await);
    Ok(())
}

#[tokio::test]
async fn connect_is_idempotent_for_racing_callers() -> Result<()> {
    let peer = spawn_peer(default_respond).await;
    let conn = connection(&peer.url);

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let conn = conn.clone();
        tasks.push(tokio::spawn(async move { conn.connect().await }));
    }
    for task in tasks {
        task.await??;
    }
    assert!(!conn.is_closed().await);

    conn.disconnect().await?;
    Ok(())
}

#[tokio::test]
async fn send_after_disconnect_reconnects_lazily() -> Result<()> {
    let peer = spawn_peer(default_respond).await;
    let conn = connection(&peer.url);

    conn.register(
        Target::namespace("net"),
        EventHandler::sync(|_, _| Ok(())),
    );

    let value = conn.send(GetValue).await?;
    assert_eq!(value, 42);
    conn.disconnect().await?;
    assert!(conn.is_closed().await);

    // handlers survive disconnect; the reconnect re-enables their namespaces
    let value = conn.send(GetValue).await?;
    assert_eq!(value, 42);
    assert!(conn.subscribed_namespaces().contains(&"net".to_string()));

    let enables = peer
        .seen_methods()
        .iter()
        .filter(|m| *m == "net.enable")
        .count();
    assert_eq!(enables, 2, "one enable per established transport");

    conn.disconnect().await?;
    Ok(())
}

// ============================================================================
// Event Scenarios
// ============================================================================

#[tokio::test]
async fn failing_handler_does_not_block_later_handlers() -> Result<()> {
    let peer = spawn_peer(default_respond).await;
    let conn = connection(&peer.url);

    let first = Arc::new(AtomicUsize::new(0));
    let second = Arc::new(AtomicUsize::new(0));

    let seen = Arc::clone(&first);
    conn.register(
        Target::event("page.loadEventFired"),
        EventHandler::sync(move |_, _| {
            seen.fetch_add(1, Ordering::SeqCst);
            Err(Error::handler("deliberate failure"))
        }),
    );
    let seen = Arc::clone(&second);
    conn.register(
        Target::event("page.loadEventFired"),
        EventHandler::sync(move |_, _| {
            seen.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }),
    );

    conn.send(emit_command(vec![
        json!({"method": "page.loadEventFired", "params": {}}),
    ]))
    .await?;

    // sync handlers ran on the listener before the emit reply was processed
    assert_eq!(first.load(Ordering::SeqCst), 1);
    assert_eq!(second.load(Ordering::SeqCst), 1);

    // the listener survived the failing handler
    let value = conn.send(GetValue).await?;
    assert_eq!(value, 42);

    conn.disconnect().await?;
    Ok(())
}

#[tokio::test]
async fn callbacks_run_in_registration_order() -> Result<()> {
    let peer = spawn_peer(default_respond).await;
    let conn = connection(&peer.url);

    let order: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));
    for tag in ["first", "second", "third"] {
        let order = Arc::clone(&order);
        conn.register(
            Target::event("page.loadEventFired"),
            EventHandler::sync(move |_, _| {
                order.lock().push(tag);
                Ok(())
            }),
        );
    }

    conn.send(emit_command(vec![
        json!({"method": "page.loadEventFired", "params": {}}),
    ]))
    .await?;

    assert_eq!(*order.lock(), ["first", "second", "third"]);
    conn.disconnect().await?;
    Ok(())
}

#[tokio::test]
async fn undecodable_event_is_dropped_silently() -> Result<()> {
    let peer = spawn_peer(default_respond).await;
    let conn = connection(&peer.url);

    let counter = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&counter);
    conn.register(
        Target::event("page.loadEventFired"),
        EventHandler::sync(move |_, _| {
            seen.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }),
    );

    conn.send(emit_command(vec![
        json!({"method": "bogus.unknownEvent", "params": {}}),
        json!({"method": "page.loadEventFired", "params": {}}),
    ]))
    .await?;

    assert_eq!(counter.load(Ordering::SeqCst), 1);
    conn.disconnect().await?;
    Ok(())
}

#[tokio::test]
async fn async_handler_receives_session_ref() -> Result<()> {
    let peer = spawn_peer(default_respond).await;
    let counter = Arc::new(AtomicUsize::new(0));

    let conn = Connection::builder(&peer.url, schema())
        .session_ref(SessionRef::new(Arc::new(String::from("owner"))))
        .build()?;

    let seen = Arc::clone(&counter);
    conn.register(
        Target::event("page.loadEventFired"),
        EventHandler::async_fn(move |event, session| {
            let seen = Arc::clone(&seen);
            async move {
                assert_eq!(event.kind(), "page.loadEventFired");
                if session.downcast::<String>().is_some_and(|s| *s == "owner") {
                    seen.fetch_add(1, Ordering::SeqCst);
                }
                Ok(())
            }
        }),
    );

    conn.send(emit_command(vec![
        json!({"method": "page.loadEventFired", "params": {}}),
    ]))
    .await?;

    settle().await;
    assert_eq!(counter.load(Ordering::SeqCst), 1);
    conn.disconnect().await?;
    Ok(())
}

// ============================================================================
// Subscription Reconciliation
// ============================================================================

#[tokio::test]
async fn namespace_registration_issues_exactly_one_enable() -> Result<()> {
    let peer = spawn_peer(default_respond).await;
    let conn = connection(&peer.url);

    // one callback against a namespace declaring three event kinds
    conn.register(
        Target::namespace("net"),
        EventHandler::sync(|_, _| Ok(())),
    );

    conn.send(RawCommand::new("test.echo", json!({}))).await?;
    conn.send(RawCommand::new("test.echo", json!({}))).await?;

    let enables = peer
        .seen_methods()
        .iter()
        .filter(|m| *m == "net.enable")
        .count();
    assert_eq!(enables, 1);

    let subscribed = conn.subscribed_namespaces();
    assert_eq!(subscribed, vec!["net", "storage", "target"]);

    conn.disconnect().await?;
    Ok(())
}

#[tokio::test]
async fn unregistered_namespace_is_dropped_without_disable() -> Result<()> {
    let peer = spawn_peer(default_respond).await;
    let conn = connection(&peer.url);

    conn.register(
        Target::namespace("net"),
        EventHandler::sync(|_, _| Ok(())),
    );
    conn.send(RawCommand::new("test.echo", json!({}))).await?;
    assert!(conn.subscribed_namespaces().contains(&"net".to_string()));

    conn.unregister(Target::namespace("net"));
    conn.send(RawCommand::new("test.echo", json!({}))).await?;

    // local disinterest suffices; no net.disable frame is ever transmitted
    assert_eq!(conn.subscribed_namespaces(), vec!["storage", "target"]);
    assert!(peer.seen_methods().iter().all(|m| m != "net.disable"));

    conn.disconnect().await?;
    Ok(())
}

#[tokio::test]
async fn always_on_namespaces_are_never_enabled_explicitly() -> Result<()> {
    let peer = spawn_peer(default_respond).await;
    let conn = connection(&peer.url);

    conn.send(RawCommand::new("test.echo", json!({}))).await?;

    let methods = peer.seen_methods();
    assert!(methods.iter().all(|m| m != "target.enable" && m != "storage.enable"));
    assert_eq!(conn.subscribed_namespaces(), vec!["storage", "target"]);

    conn.disconnect().await?;
    Ok(())
}

#[tokio::test]
async fn remove_handler_by_id_drops_subscription_on_next_pass() -> Result<()> {
    let peer = spawn_peer(default_respond).await;
    let conn = connection(&peer.url);

    let id = conn.register(
        Target::event("net.loadingFailed"),
        EventHandler::sync(|_, _| Ok(())),
    );
    conn.send(RawCommand::new("test.echo", json!({}))).await?;
    assert!(conn.subscribed_namespaces().contains(&"net".to_string()));

    conn.remove_handler(id);
    conn.send(RawCommand::new("test.echo", json!({}))).await?;
    assert_eq!(conn.subscribed_namespaces(), vec!["storage", "target"]);

    conn.disconnect().await?;
    Ok(())
}

// ============================================================================
// Fire-and-Forget
// ============================================================================

#[tokio::test]
async fn send_oneshot_skips_reconciliation_but_awaits_reply() -> Result<()> {
    let peer = spawn_peer(default_respond).await;
    let conn = connection(&peer.url);
    conn.connect().await?;

    conn.register(
        Target::namespace("net"),
        EventHandler::sync(|_, _| Ok(())),
    );

    let result = conn
        .send_oneshot(RawCommand::new("test.echo", json!({"via": "oneshot"})))
        .await?;
    assert_eq!(result["via"], "oneshot");

    // no reconciliation ran, so the namespace was not enabled
    assert!(peer.seen_methods().iter().all(|m| m != "net.enable"));

    // a regular send triggers it
    conn.send(RawCommand::new("test.echo", json!({}))).await?;
    assert_eq!(
        peer.seen_methods().iter().filter(|m| *m == "net.enable").count(),
        1
    );

    conn.disconnect().await?;
    Ok(())
}

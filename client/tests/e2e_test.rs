//! End-to-end tests: the real client runtime against an in-process relay.

use futures_util::StreamExt;
use pushpop_client::connection::HEARTBEAT_PERIOD;
use pushpop_client::{Client, ClientError, ConnectionState, Reconnect, ReconnectPolicy};
use pushpop_server::hub::{self, HubHandle};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};

/// Helper: start the relay on a random port and return (addr, hub handle).
async fn start_test_server() -> (SocketAddr, HubHandle) {
    let hub = hub::spawn_hub();
    let (guard, _actors) = pushpop_server::ws::actor_tracker();
    let state = pushpop_server::state::AppState::new(hub.clone(), guard);

    let app = pushpop_server::routes::build_router(state);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .unwrap();
    });

    (addr, hub)
}

fn ws_url(addr: SocketAddr) -> String {
    format!("ws://{}/ws", addr)
}

async fn wait_for_members(hub: &HubHandle, channel: &str, count: usize) {
    for _ in 0..500 {
        if hub.members(channel).await.unwrap().len() == count {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("Channel {} never reached {} members", channel, count);
}

async fn trigger(addr: SocketAddr, body: Value) {
    let status = reqwest::Client::new()
        .post(format!("http://{}/trigger", addr))
        .json(&body)
        .send()
        .await
        .unwrap()
        .status();
    assert_eq!(status, 200);
}

/// Bind a callback that forwards every payload into a channel.
fn collect(client: &Client, channel: &str, event: &str) -> mpsc::UnboundedReceiver<Value> {
    let (tx, rx) = mpsc::unbounded_channel();
    client.subscribe(channel).unwrap().bind(event, move |payload: &Value| {
        let _ = tx.send(payload.clone());
    });
    rx
}

#[tokio::test]
async fn test_trigger_reaches_subscribed_client_only() {
    let (addr, hub) = start_test_server().await;
    let alice = Client::connect(&ws_url(addr)).unwrap();
    let bob = Client::connect(&ws_url(addr)).unwrap();

    let mut alice_chat = collect(&alice, "room1", "chat");

    let bob_hits = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&bob_hits);
    bob.subscribe("room2").unwrap().bind("chat", move |_: &Value| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    wait_for_members(&hub, "room1", 1).await;
    wait_for_members(&hub, "room2", 1).await;

    trigger(
        addr,
        json!({"channel": "room1", "event": "chat", "payload": {"text": "hi"}}),
    )
    .await;

    let payload = tokio::time::timeout(Duration::from_secs(2), alice_chat.recv())
        .await
        .expect("Expected the chat callback to fire")
        .unwrap();
    assert_eq!(payload, json!({"text": "hi"}));

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(alice_chat.try_recv().is_err(), "Callback must fire exactly once");
    assert_eq!(bob_hits.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_publish_fans_out_between_clients() {
    let (addr, hub) = start_test_server().await;
    let alice = Client::connect(&ws_url(addr)).unwrap();
    let bob = Client::connect(&ws_url(addr)).unwrap();

    alice.subscribe("room1").unwrap();
    let mut bob_messages = collect(&bob, "room1", "message");
    wait_for_members(&hub, "room1", 2).await;

    alice.publish("room1", json!({"n": 1})).unwrap();

    let payload = tokio::time::timeout(Duration::from_secs(2), bob_messages.recv())
        .await
        .expect("Expected the published message")
        .unwrap();
    assert_eq!(payload, json!({"n": 1}));
}

#[tokio::test]
async fn test_unsubscribe_leaves_channel_on_relay() {
    let (addr, hub) = start_test_server().await;
    let client = Client::connect(&ws_url(addr)).unwrap();

    client.subscribe("room1").unwrap();
    wait_for_members(&hub, "room1", 1).await;

    client.unsubscribe("room1").unwrap();
    wait_for_members(&hub, "room1", 0).await;
    assert_eq!(hub.stats().await.unwrap().channels, 0);
}

#[tokio::test]
async fn test_reconnect_replays_subscriptions_after_forced_close() {
    let (addr, hub) = start_test_server().await;
    let client = Client::connect(&ws_url(addr)).unwrap();
    let mut chat = collect(&client, "room1", "chat");

    wait_for_members(&hub, "room1", 1).await;
    client.wait_open().await.unwrap();

    // Forced removal closes the link without a status code
    let closed = hub.drain(Duration::from_millis(10)).await.unwrap();
    assert_eq!(closed, 1);

    // First retry lands after 1s plus jitter
    wait_for_members(&hub, "room1", 1).await;
    assert_eq!(client.state(), ConnectionState::Open);

    trigger(addr, json!({"channel": "room1", "event": "chat", "payload": "again"})).await;
    let payload = tokio::time::timeout(Duration::from_secs(2), chat.recv())
        .await
        .expect("Expected delivery after reconnect")
        .unwrap();
    assert_eq!(payload, json!("again"));
}

#[tokio::test]
async fn test_disconnect_is_final() {
    let (addr, hub) = start_test_server().await;
    let client = Client::connect(&ws_url(addr)).unwrap();
    client.wait_open().await.unwrap();

    client.disconnect();
    tokio::time::timeout(Duration::from_secs(2), client.wait_terminal())
        .await
        .expect("Expected the client to stop")
        .unwrap();

    assert!(client.state().is_terminal());
    for _ in 0..200 {
        if hub.live_connections() == 0 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("Relay still tracks the disconnected client");
}

#[tokio::test]
async fn test_unreachable_relay_exhausts_reconnects() {
    // Reserve a port, then free it so nothing is listening
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let client = Client::connect_with(
        &ws_url(addr),
        ReconnectPolicy {
            base: Duration::from_millis(10),
            cap: Duration::from_millis(40),
            max_jitter: Duration::from_millis(5),
            max_attempts: 3,
        },
    )
    .unwrap();

    let result = tokio::time::timeout(Duration::from_secs(5), client.wait_terminal())
        .await
        .expect("Expected retries to run out");
    assert!(matches!(
        result,
        Err(ClientError::ReconnectExhausted { attempts: 3 })
    ));
    assert!(matches!(
        client.wait_open().await,
        Err(ClientError::ReconnectExhausted { attempts: 3 })
    ));
}

#[tokio::test]
async fn test_unanswered_heartbeat_drops_link_abnormally() {
    // A relay that accepts the upgrade but never answers application pings
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (opened_tx, opened_rx) = oneshot::channel::<()>();
    let (dropped_tx, dropped_rx) = oneshot::channel::<tokio::time::Instant>();

    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        let _ = opened_tx.send(());
        while let Some(Ok(_)) = ws.next().await {}
        let _ = dropped_tx.send(tokio::time::Instant::now());
    });

    let client = Client::connect_with(
        &ws_url(addr),
        ReconnectPolicy {
            max_attempts: 0,
            ..ReconnectPolicy::default()
        },
    )
    .unwrap();
    client.wait_open().await.unwrap();
    opened_rx.await.unwrap();

    tokio::time::pause();
    let started = tokio::time::Instant::now();

    let result = client.wait_terminal().await;
    assert!(matches!(
        result,
        Err(ClientError::ReconnectExhausted { attempts: 0 })
    ));
    assert_eq!(
        client.state(),
        ConnectionState::Closed {
            code: 1006,
            reconnect: Reconnect::GiveUp { attempts: 0 },
        }
    );

    // One ping goes out after a period, the next tick finds it unanswered
    let dropped_at = dropped_rx.await.unwrap();
    assert!(dropped_at - started >= HEARTBEAT_PERIOD);
}

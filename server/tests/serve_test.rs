//! Integration tests for serving and graceful shutdown.

use futures_util::StreamExt;
use pushpop_server::hub;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio_tungstenite::tungstenite::Message;

#[tokio::test]
async fn test_shutdown_flushes_close_frames_before_returning() {
    let hub = hub::spawn_hub();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let server = tokio::spawn(pushpop_server::serve::run(
        listener,
        hub.clone(),
        async {
            let _ = stop_rx.await;
        },
        Duration::from_millis(100),
    ));

    let (ws, _) = tokio_tungstenite::connect_async(format!("ws://{}/ws", addr))
        .await
        .expect("Failed to connect to WebSocket");
    let (_write, mut read) = ws.split();

    for _ in 0..200 {
        if hub.live_connections() == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(hub.live_connections(), 1);

    stop_tx.send(()).unwrap();
    tokio::time::timeout(Duration::from_secs(5), server)
        .await
        .expect("Expected shutdown to finish")
        .unwrap()
        .unwrap();

    // The close frame was written before run returned
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(1), read.next())
            .await
            .expect("Expected the close frame to be buffered");
        match msg {
            Some(Ok(Message::Close(_))) => break,
            Some(Ok(Message::Ping(_))) => continue,
            other => panic!("Expected close frame, got: {:?}", other),
        }
    }
    assert_eq!(hub.live_connections(), 0);
}

#[tokio::test]
async fn test_shutdown_without_connections_returns_promptly() {
    let hub = hub::spawn_hub();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();

    let result = tokio::time::timeout(
        Duration::from_secs(2),
        pushpop_server::serve::run(listener, hub, async {}, Duration::from_secs(10)),
    )
    .await
    .expect("Expected an idle server to stop without waiting out the drain");
    assert!(result.is_ok());
}

//! Integration test against a real WebSocket server on localhost
//!
//! A minimal tokio-tungstenite backend answers `get_available_codes`,
//! pushes one quantity update on connect, and records the close code it
//! receives when the last consumer detaches.

use std::time::Duration;

use costlink_common::config::SyncConfig;
use costlink_common::events::ConnectionState;
use costlink_sync::SyncHub;
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio_tungstenite::tungstenite::Message;

/// Serve one client; reports the close code it received
async fn serve_one(listener: TcpListener, closed: oneshot::Sender<Option<u16>>) {
    let (stream, _) = listener.accept().await.unwrap();
    let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();

    ws.send(Message::Text(
        json!({ "type": "quantity_update", "code": "C01.02", "quantity": 12.0 }).to_string(),
    ))
    .await
    .unwrap();

    let mut close_code = None;
    while let Some(message) = ws.next().await {
        match message {
            Ok(Message::Text(text)) => {
                let request: Value = serde_json::from_str(&text).unwrap();
                if request["type"] == "get_available_codes" {
                    let response = json!({
                        "type": "get_available_codes_response",
                        "messageId": request["messageId"],
                        "status": "success",
                        "codes": ["C1.2", "D4"],
                    });
                    ws.send(Message::Text(response.to_string())).await.unwrap();
                }
            }
            Ok(Message::Close(frame)) => {
                close_code = frame.map(|f| u16::from(f.code));
                break;
            }
            Ok(_) => {}
            Err(_) => break,
        }
    }
    let _ = closed.send(close_code);
}

#[tokio::test]
async fn test_round_trip_over_websocket() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (closed_tx, closed_rx) = oneshot::channel();
    let server = tokio::spawn(serve_one(listener, closed_tx));

    let config = SyncConfig {
        endpoint_url: format!("ws://{}/ws", addr),
        ..SyncConfig::default()
    };
    let hub = SyncHub::new(config);
    let consumer = hub.consumer();

    hub.connection()
        .wait_until_connected(Duration::from_secs(5))
        .await
        .unwrap();

    let codes = hub.api().available_codes().await.unwrap();
    assert_eq!(codes.codes, vec!["C1.2", "D4"]);

    // The push was sent before the response, so it has been applied
    let record = hub.store().lookup("C1.2").unwrap();
    assert_eq!(record.quantity, 12.0);

    drop(consumer);
    assert_eq!(hub.connection().state(), ConnectionState::Disconnected);

    let close_code = tokio::time::timeout(Duration::from_secs(5), closed_rx)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(close_code, Some(1000));
    server.await.unwrap();
}

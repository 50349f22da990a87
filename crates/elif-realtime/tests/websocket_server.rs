//! Real sockets: TCP listener, WebSocket handshake, token authentication

use elif_realtime::{
    FnAuthenticator, Hub, HubConfig, RealtimeError, Server, ServerConfig, Upgrader,
};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Duration};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type WsClient = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

const STEP_TIMEOUT: Duration = Duration::from_secs(5);

async fn spawn_server(hub: &Hub) -> (SocketAddr, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let upgrader = Upgrader::new(hub.clone()).with_authenticator(FnAuthenticator::new(
        |token: String| async move {
            match token.as_str() {
                "alice-token" => Ok("alice".to_string()),
                _ => Err(RealtimeError::authentication("unknown token")),
            }
        },
    ));
    let server = Server::new(hub.clone(), ServerConfig::default()).with_upgrader(upgrader);

    let handle = tokio::spawn(async move {
        server.serve(listener).await.unwrap();
    });
    (addr, handle)
}

async fn next_frame(ws: &mut WsClient) -> Option<WsMessage> {
    loop {
        let frame = timeout(STEP_TIMEOUT, ws.next())
            .await
            .expect("timed out waiting for a frame")?
            .ok()?;
        match frame {
            WsMessage::Ping(_) | WsMessage::Pong(_) => continue,
            other => return Some(other),
        }
    }
}

async fn next_json(ws: &mut WsClient) -> Value {
    match next_frame(ws).await {
        Some(WsMessage::Text(text)) => serde_json::from_str(&text).unwrap(),
        other => panic!("expected a text frame, got {:?}", other),
    }
}

#[tokio::test]
async fn test_authenticated_round_trip() {
    let hub = Hub::new(HubConfig::default());
    hub.start();
    let (addr, server) = spawn_server(&hub).await;

    let (mut ws, _) = connect_async(format!("ws://{}/ws?token=alice-token", addr))
        .await
        .unwrap();

    ws.send(WsMessage::Text(r#"{"type":"ping","data":"t0"}"#.to_string()))
        .await
        .unwrap();
    assert_eq!(
        next_json(&mut ws).await,
        json!({ "type": "pong", "data": { "timestamp": "t0" } })
    );

    ws.send(WsMessage::Text(r#"{"type":"status"}"#.to_string()))
        .await
        .unwrap();
    let status = next_json(&mut ws).await;
    assert_eq!(status["type"], "status");
    assert_eq!(status["data"]["user_id"], "alice");
    assert_eq!(hub.client_count(), 1);

    hub.shutdown().await;
    assert!(matches!(next_frame(&mut ws).await, Some(WsMessage::Close(_)) | None));
    timeout(STEP_TIMEOUT, server).await.unwrap().unwrap();
}

#[tokio::test]
async fn test_unauthenticated_connection_is_rejected() {
    let hub = Hub::new(HubConfig::default());
    hub.start();
    let (addr, server) = spawn_server(&hub).await;

    for url in [
        format!("ws://{}/ws", addr),
        format!("ws://{}/ws?token=forged", addr),
    ] {
        let (mut ws, _) = connect_async(url).await.unwrap();
        match next_frame(&mut ws).await {
            Some(WsMessage::Close(Some(frame))) => {
                assert_eq!(frame.code, CloseCode::Policy);
                assert_eq!(frame.reason, "unauthorized");
            }
            other => panic!("expected a policy close, got {:?}", other),
        }
    }

    assert_eq!(hub.client_count(), 0);

    hub.shutdown().await;
    timeout(STEP_TIMEOUT, server).await.unwrap().unwrap();
}

#[tokio::test]
async fn test_room_broadcast_over_websocket() {
    let hub = Hub::new(HubConfig::default());
    hub.start();
    let (addr, server) = spawn_server(&hub).await;
    let url = format!("ws://{}/ws?token=alice-token", addr);

    let (mut first, _) = connect_async(url.as_str()).await.unwrap();
    let (mut second, _) = connect_async(url.as_str()).await.unwrap();

    for ws in [&mut first, &mut second] {
        ws.send(WsMessage::Text(
            json!({ "type": "join_room", "data": { "room": "lobby" } }).to_string(),
        ))
        .await
        .unwrap();
        assert_eq!(next_json(ws).await["type"], "room_joined");
    }

    first
        .send(WsMessage::Text(
            json!({
                "type": "broadcast",
                "data": { "room": "lobby", "type": "chat", "payload": "hello" }
            })
            .to_string(),
        ))
        .await
        .unwrap();

    let expected = json!({ "type": "chat", "data": "hello" });
    assert_eq!(next_json(&mut first).await, expected);
    assert_eq!(next_json(&mut second).await, expected);

    hub.shutdown().await;
    timeout(STEP_TIMEOUT, server).await.unwrap().unwrap();
}

#[tokio::test]
async fn test_burst_arrives_as_separate_frames() {
    let hub = Hub::new(HubConfig::default());
    hub.start();
    let (addr, server) = spawn_server(&hub).await;

    let (mut ws, _) = connect_async(format!("ws://{}/ws?token=alice-token", addr))
        .await
        .unwrap();
    ws.send(WsMessage::Text(r#"{"type":"status"}"#.to_string()))
        .await
        .unwrap();
    assert_eq!(next_json(&mut ws).await["type"], "status");

    let client = hub.clients().pop().expect("client registered");
    for seq in 0..20 {
        client
            .send(&elif_realtime::Message::with_payload("seq", json!(seq)))
            .unwrap();
    }

    for seq in 0..20 {
        assert_eq!(next_json(&mut ws).await, json!({ "type": "seq", "data": seq }));
    }

    hub.shutdown().await;
    timeout(STEP_TIMEOUT, server).await.unwrap().unwrap();
}

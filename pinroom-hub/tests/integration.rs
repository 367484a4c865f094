//! Integration tests for end-to-end room fan-out.
//!
//! These tests start a real server and connect real WebSocket clients,
//! verifying the full upgrade → join → broadcast → leave pipeline.

use futures_util::{SinkExt, StreamExt};
use pinroom_hub::client::{ClientEvent, ConnectionState, RoomClient};
use pinroom_hub::config::{EchoPolicy, HubConfig};
use pinroom_hub::origin::OriginPolicy;
use pinroom_hub::protocol::{Payload, SystemMessage};
use pinroom_hub::registry::RoomRegistry;
use pinroom_hub::server::{HubServer, ServerConfig};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::time::{timeout, Duration};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::ORIGIN;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct TestServer {
    addr: SocketAddr,
    registry: Arc<RoomRegistry>,
    shutdown: Option<oneshot::Sender<()>>,
    task: tokio::task::JoinHandle<()>,
}

impl TestServer {
    fn url(&self, pin: &str) -> String {
        format!("ws://{}/ws?pin={pin}", self.addr)
    }

    async fn members(&self, pin: &str) -> usize {
        match self.registry.lookup(pin).await {
            Some(room) => room.members().await.map(|m| m.len()).unwrap_or(0),
            None => 0,
        }
    }

    async fn wait_members(&self, pin: &str, count: usize) {
        timeout(Duration::from_secs(3), async {
            while self.members(pin).await != count {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("room {pin} never reached {count} members"));
    }
}

/// Start a server on a free port.
async fn start_test_server(config: ServerConfig) -> TestServer {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = HubServer::new(config).unwrap();
    let registry = server.registry().clone();
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

    let task = tokio::spawn(async move {
        server
            .serve(listener, async move {
                let _ = shutdown_rx.await;
            })
            .await
            .unwrap();
    });

    TestServer {
        addr,
        registry,
        shutdown: Some(shutdown_tx),
        task,
    }
}

fn test_config() -> ServerConfig {
    ServerConfig {
        bind_addr: "127.0.0.1:0".to_string(),
        ..ServerConfig::default()
    }
}

async fn connect(server: &TestServer, pin: &str) -> WsStream {
    let (ws, _) = tokio_tungstenite::connect_async(server.url(pin)).await.unwrap();
    ws
}

/// Next application message, skipping heartbeat traffic.
async fn next_message(ws: &mut WsStream) -> Message {
    loop {
        let msg = timeout(Duration::from_secs(2), ws.next())
            .await
            .expect("timed out waiting for a message")
            .expect("connection ended")
            .expect("websocket error");
        if !matches!(msg, Message::Ping(_) | Message::Pong(_)) {
            return msg;
        }
    }
}

async fn next_text(ws: &mut WsStream) -> String {
    match next_message(ws).await {
        Message::Text(text) => text.as_str().to_string(),
        other => panic!("expected text, got {other:?}"),
    }
}

fn http_status(err: WsError) -> u16 {
    match err {
        WsError::Http(response) => response.status().as_u16(),
        other => panic!("expected an HTTP rejection, got {other:?}"),
    }
}

#[tokio::test]
async fn test_health_endpoint() {
    let server = start_test_server(test_config()).await;

    let mut stream = TcpStream::connect(server.addr).await.unwrap();
    stream
        .write_all(b"GET /health HTTP/1.1\r\nHost: 127.0.0.1\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();
    let mut response = String::new();
    timeout(Duration::from_secs(2), stream.read_to_string(&mut response))
        .await
        .unwrap()
        .unwrap();

    assert!(response.starts_with("HTTP/1.1 200"), "unexpected response: {response}");
    assert!(response.ends_with("OK"), "unexpected body: {response}");
}

#[tokio::test]
async fn test_broadcast_reaches_whole_room_including_sender() {
    let server = start_test_server(test_config()).await;

    let mut alice = connect(&server, "4242").await;
    let mut bob = connect(&server, "4242").await;
    server.wait_members("4242", 2).await;

    alice.send(Message::text("hello")).await.unwrap();

    assert_eq!(next_text(&mut bob).await, "hello");
    assert_eq!(next_text(&mut alice).await, "hello");
}

#[tokio::test]
async fn test_echo_others_skips_sender() {
    let mut config = test_config();
    config.hub.echo = EchoPolicy::Others;
    let server = start_test_server(config).await;

    let mut alice = connect(&server, "4242").await;
    let mut bob = connect(&server, "4242").await;
    server.wait_members("4242", 2).await;

    alice.send(Message::text("hello")).await.unwrap();
    assert_eq!(next_text(&mut bob).await, "hello");

    bob.send(Message::text("hi back")).await.unwrap();
    // The first thing alice sees is bob's reply, never her own message.
    assert_eq!(next_text(&mut alice).await, "hi back");
}

#[tokio::test]
async fn test_rooms_are_isolated() {
    let server = start_test_server(test_config()).await;

    let mut alice = connect(&server, "1111").await;
    let mut bob = connect(&server, "2222").await;
    server.wait_members("1111", 1).await;
    server.wait_members("2222", 1).await;

    alice.send(Message::text("for 1111")).await.unwrap();
    bob.send(Message::text("for 2222")).await.unwrap();

    assert_eq!(next_text(&mut alice).await, "for 1111");
    assert_eq!(next_text(&mut bob).await, "for 2222");
}

#[tokio::test]
async fn test_per_sender_order_preserved() {
    let server = start_test_server(test_config()).await;

    let mut alice = connect(&server, "4242").await;
    let mut bob = connect(&server, "4242").await;
    server.wait_members("4242", 2).await;

    for i in 0..50 {
        alice.send(Message::text(format!("m{i}"))).await.unwrap();
    }
    for i in 0..50 {
        assert_eq!(next_text(&mut bob).await, format!("m{i}"));
    }
}

#[tokio::test]
async fn test_binary_stays_binary() {
    let server = start_test_server(test_config()).await;

    let mut alice = connect(&server, "4242").await;
    let mut bob = connect(&server, "4242").await;
    server.wait_members("4242", 2).await;

    alice.send(Message::binary(vec![0u8, 255, 1, 254])).await.unwrap();
    match next_message(&mut bob).await {
        Message::Binary(data) => assert_eq!(data.as_ref(), &[0u8, 255, 1, 254]),
        other => panic!("expected binary, got {other:?}"),
    }
}

#[tokio::test]
async fn test_missing_pin_rejected_before_upgrade() {
    let server = start_test_server(test_config()).await;

    let err = tokio_tungstenite::connect_async(format!("ws://{}/ws", server.addr))
        .await
        .unwrap_err();
    assert_eq!(http_status(err), 400);

    let err = tokio_tungstenite::connect_async(format!("ws://{}/ws?pin=", server.addr))
        .await
        .unwrap_err();
    assert_eq!(http_status(err), 400);

    assert_eq!(server.registry.room_count().await, 0);
}

#[tokio::test]
async fn test_untrusted_origin_rejected() {
    let mut config = test_config();
    config.origins = OriginPolicy::from_patterns(["https://*.example.org"]).unwrap();
    let server = start_test_server(config).await;

    let mut request = server.url("4242").into_client_request().unwrap();
    request
        .headers_mut()
        .insert(ORIGIN, HeaderValue::from_static("https://evil.example.com"));
    let err = tokio_tungstenite::connect_async(request).await.unwrap_err();
    assert_eq!(http_status(err), 403);
    assert_eq!(server.registry.room_count().await, 0);

    let mut request = server.url("4242").into_client_request().unwrap();
    request
        .headers_mut()
        .insert(ORIGIN, HeaderValue::from_static("https://chat.example.org"));
    assert!(tokio_tungstenite::connect_async(request).await.is_ok());
    server.wait_members("4242", 1).await;
}

#[tokio::test]
async fn test_abrupt_disconnect_leaves_room_usable() {
    let server = start_test_server(test_config()).await;

    let alice = connect(&server, "4242").await;
    let mut bob = connect(&server, "4242").await;
    server.wait_members("4242", 2).await;

    // No close handshake, just the TCP connection going away.
    drop(alice);
    server.wait_members("4242", 1).await;

    bob.send(Message::text("still here")).await.unwrap();
    assert_eq!(next_text(&mut bob).await, "still here");
}

#[tokio::test]
async fn test_last_leave_reclaims_room() {
    let server = start_test_server(test_config()).await;

    let mut alice = connect(&server, "4242").await;
    server.wait_members("4242", 1).await;
    let first = server.registry.lookup("4242").await.unwrap();

    alice.close(None).await.unwrap();
    timeout(Duration::from_secs(2), async {
        while server.registry.contains("4242").await {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("empty room should be reclaimed");

    let _bob = connect(&server, "4242").await;
    server.wait_members("4242", 1).await;
    let second = server.registry.lookup("4242").await.unwrap();
    assert!(!first.same_room(&second));
}

#[tokio::test]
async fn test_oversized_message_drops_sender_only() {
    let server = start_test_server(test_config()).await;

    let mut alice = connect(&server, "4242").await;
    let mut bob = connect(&server, "4242").await;
    server.wait_members("4242", 2).await;

    let limit = HubConfig::default().max_message_size;
    let _ = alice.send(Message::text("x".repeat(limit * 2))).await;
    server.wait_members("4242", 1).await;

    bob.send(Message::text("ok")).await.unwrap();
    assert_eq!(next_text(&mut bob).await, "ok");
}

#[tokio::test]
async fn test_room_client_round_trip() {
    let mut config = test_config();
    config.hub.welcome = true;
    let server = start_test_server(config).await;
    let base = format!("ws://{}", server.addr);

    let mut alice = RoomClient::new(&base, "4242");
    let mut alice_events = alice.take_event_rx().unwrap();
    alice.connect().await.unwrap();
    assert_eq!(alice.connection_state().await, ConnectionState::Connected);

    let event = timeout(Duration::from_secs(2), alice_events.recv()).await.unwrap();
    assert_eq!(event, Some(ClientEvent::Connected));
    match timeout(Duration::from_secs(2), alice_events.recv()).await.unwrap() {
        Some(ClientEvent::Message(payload)) => {
            assert_eq!(SystemMessage::decode(&payload), Some(SystemMessage::joined("4242")));
        }
        other => panic!("expected welcome, got {other:?}"),
    }

    let mut bob = RoomClient::new(&base, "4242");
    let mut bob_events = bob.take_event_rx().unwrap();
    bob.connect().await.unwrap();
    server.wait_members("4242", 2).await;
    assert_eq!(
        timeout(Duration::from_secs(2), bob_events.recv()).await.unwrap(),
        Some(ClientEvent::Connected)
    );
    // Bob's own welcome.
    let _ = timeout(Duration::from_secs(2), bob_events.recv()).await.unwrap();

    alice.send_text("hello bob").await.unwrap();
    assert_eq!(
        timeout(Duration::from_secs(2), bob_events.recv()).await.unwrap(),
        Some(ClientEvent::Message(Payload::text("hello bob")))
    );

    bob.close().await.unwrap();
    assert_eq!(bob.connection_state().await, ConnectionState::Disconnected);
    assert!(bob.send_text("too late").await.is_err());
    server.wait_members("4242", 1).await;
}

#[tokio::test]
async fn test_shutdown_closes_clients() {
    let mut server = start_test_server(test_config()).await;

    let mut alice = connect(&server, "4242").await;
    server.wait_members("4242", 1).await;

    server.shutdown.take().unwrap().send(()).unwrap();

    match next_message(&mut alice).await {
        Message::Close(Some(frame)) => assert_eq!(frame.code, CloseCode::Away),
        other => panic!("expected going-away close, got {other:?}"),
    }
    timeout(Duration::from_secs(3), server.task).await.unwrap().unwrap();
    assert!(server.registry.is_shutting_down());
    assert_eq!(server.registry.room_count().await, 0);
}

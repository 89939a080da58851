//! End-to-end WebSocket tests
//!
//! Each test binds the full application to an ephemeral port and talks to it
//! with a real WebSocket client.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::json;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio_test::assert_ok;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use broadcaster_hub::auth::{AllowAll, AuthorizationGate, PredicateGate};
use broadcaster_hub::config::Settings;
use broadcaster_hub::hub::Hub;
use broadcaster_hub::relay::{subscription_channel, BackoffConfig, FanoutRelay, MemoryStore};
use broadcaster_hub::server::{create_app, AppState};
use broadcaster_hub::websocket::ServerMessage;

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

const STEP_TIMEOUT: Duration = Duration::from_secs(5);

struct TestServer {
    addr: SocketAddr,
    url: String,
    hub: Hub,
}

async fn spawn_server(hub: Hub, gate: Arc<dyn AuthorizationGate>) -> TestServer {
    spawn_server_with(Settings::default(), hub, gate).await
}

async fn spawn_server_with(
    settings: Settings,
    hub: Hub,
    gate: Arc<dyn AuthorizationGate>,
) -> TestServer {
    let state = AppState::new(settings, hub.clone(), gate);
    let app = create_app(state);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    TestServer {
        addr,
        url: format!("ws://{}/ws", addr),
        hub,
    }
}

async fn connect(server: &TestServer) -> Client {
    let (client, _) = connect_async(server.url.as_str()).await.unwrap();
    client
}

async fn send(client: &mut Client, value: serde_json::Value) {
    client
        .send(Message::Text(value.to_string()))
        .await
        .unwrap();
}

/// Next protocol message from the server
async fn receive(client: &mut Client) -> ServerMessage {
    loop {
        let frame = tokio::time::timeout(STEP_TIMEOUT, client.next())
            .await
            .expect("timed out waiting for a server message")
            .expect("connection ended")
            .expect("receive failed");

        match frame {
            Message::Text(text) => return serde_json::from_str(&text).unwrap(),
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("unexpected frame: {:?}", other),
        }
    }
}

/// Wait until the server terminates the connection
async fn assert_closed(client: &mut Client) {
    let closed = tokio::time::timeout(STEP_TIMEOUT, async {
        loop {
            match client.next().await {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => return,
                Some(Ok(_)) => continue,
            }
        }
    })
    .await;
    assert_ok!(closed, "server did not close the connection");
}

async fn authenticate(client: &mut Client) {
    send(client, json!({ "__type": "auth", "auth": { "user": "alice" } })).await;
    assert_eq!(receive(client).await, ServerMessage::AuthOk);
}

#[tokio::test]
async fn test_auth_counts_connection() {
    let server = spawn_server(Hub::new(&Default::default()), Arc::new(AllowAll)).await;
    let mut client = connect(&server).await;

    authenticate(&mut client).await;

    let stats = assert_ok!(server.hub.stats().await);
    assert_eq!(stats.connections, 1);
}

#[tokio::test]
async fn test_refused_connection_is_closed_and_not_counted() {
    let gate = PredicateGate::new().with_can_connect(|_| false);
    let server = spawn_server(Hub::new(&Default::default()), Arc::new(gate)).await;
    let mut client = connect(&server).await;

    send(&mut client, json!({ "__type": "auth", "auth": {} })).await;
    assert_closed(&mut client).await;

    assert_eq!(server.hub.stats().await.unwrap().connections, 0);
}

#[tokio::test]
async fn test_silent_client_is_closed_after_auth_timeout() {
    let mut settings = Settings::default();
    settings.websocket.auth_timeout = 1;
    let server = spawn_server_with(settings, Hub::new(&Default::default()), Arc::new(AllowAll)).await;
    let mut client = connect(&server).await;

    assert_closed(&mut client).await;
    assert_eq!(server.hub.stats().await.unwrap().connections, 0);
}

#[tokio::test]
async fn test_command_before_auth_is_closed() {
    let server = spawn_server(Hub::new(&Default::default()), Arc::new(AllowAll)).await;
    let mut client = connect(&server).await;

    send(&mut client, json!({ "__type": "subscribe", "channel": "news" })).await;
    assert_closed(&mut client).await;

    let stats = server.hub.stats().await.unwrap();
    assert_eq!(stats.connections, 0);
    assert_eq!(stats.subscription_count("news"), 0);
}

#[tokio::test]
async fn test_unknown_command_after_auth_deregisters() {
    let server = spawn_server(Hub::new(&Default::default()), Arc::new(AllowAll)).await;
    let mut client = connect(&server).await;

    authenticate(&mut client).await;
    assert_eq!(server.hub.stats().await.unwrap().connections, 1);

    send(&mut client, json!({ "__type": "bogus" })).await;
    assert_closed(&mut client).await;

    assert_eq!(server.hub.stats().await.unwrap().connections, 0);
}

#[tokio::test]
async fn test_malformed_frame_after_auth_deregisters() {
    let server = spawn_server(Hub::new(&Default::default()), Arc::new(AllowAll)).await;
    let mut client = connect(&server).await;

    authenticate(&mut client).await;
    client
        .send(Message::Text("not json".to_string()))
        .await
        .unwrap();
    assert_closed(&mut client).await;

    assert_eq!(server.hub.stats().await.unwrap().connections, 0);
}

#[tokio::test]
async fn test_subscribe_updates_counts() {
    let server = spawn_server(Hub::new(&Default::default()), Arc::new(AllowAll)).await;
    let mut first = connect(&server).await;
    let mut second = connect(&server).await;

    authenticate(&mut first).await;
    authenticate(&mut second).await;

    for client in [&mut first, &mut second] {
        send(client, json!({ "__type": "subscribe", "channel": "test" })).await;
        assert_eq!(
            receive(client).await,
            ServerMessage::SubscribeOk {
                channel: "test".to_string()
            }
        );
    }

    // Subscribing again keeps a single membership
    send(&mut first, json!({ "__type": "subscribe", "channel": "test" })).await;
    receive(&mut first).await;

    let stats = server.hub.stats().await.unwrap();
    assert_eq!(stats.connections, 2);
    assert_eq!(stats.subscription_count("test"), 2);
}

#[tokio::test]
async fn test_refused_subscription_closes_and_cleans_up() {
    let gate = PredicateGate::new().with_can_subscribe(|_, channel| channel != "secret");
    let server = spawn_server(Hub::new(&Default::default()), Arc::new(gate)).await;
    let mut client = connect(&server).await;

    authenticate(&mut client).await;
    send(&mut client, json!({ "__type": "subscribe", "channel": "test" })).await;
    receive(&mut client).await;

    send(&mut client, json!({ "__type": "subscribe", "channel": "secret" })).await;
    assert_closed(&mut client).await;

    let stats = server.hub.stats().await.unwrap();
    assert_eq!(stats.connections, 0);
    assert_eq!(stats.subscription_count("test"), 0);
    assert_eq!(stats.subscription_count("secret"), 0);
}

#[tokio::test]
async fn test_client_close_deregisters() {
    let server = spawn_server(Hub::new(&Default::default()), Arc::new(AllowAll)).await;
    let mut client = connect(&server).await;

    authenticate(&mut client).await;
    send(&mut client, json!({ "__type": "subscribe", "channel": "test" })).await;
    receive(&mut client).await;

    client.close(None).await.unwrap();
    drop(client);

    let mut stats = server.hub.stats().await.unwrap();
    for _ in 0..50 {
        if stats.connections == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        stats = server.hub.stats().await.unwrap();
    }

    assert_eq!(stats.connections, 0);
    assert_eq!(stats.subscription_count("test"), 0);
}

#[tokio::test]
async fn test_upstream_message_reaches_subscriber() {
    let store = MemoryStore::new();
    let (upstream, requests) = subscription_channel();
    let hub = Hub::with_upstream(&Default::default(), upstream);

    let relay = FanoutRelay::new(
        Arc::new(store.clone()),
        hub.clone(),
        requests,
        BackoffConfig::default(),
    );
    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let relay_handle = tokio::spawn(relay.run(shutdown_rx));

    let server = spawn_server(hub, Arc::new(AllowAll)).await;
    let mut client = connect(&server).await;

    authenticate(&mut client).await;
    send(&mut client, json!({ "__type": "subscribe", "channel": "news" })).await;
    receive(&mut client).await;

    let subscribed = tokio::time::timeout(STEP_TIMEOUT, async {
        while !store.is_subscribed("news").await {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert_ok!(subscribed);

    store.publish("news", "breaking");

    assert_eq!(
        receive(&mut client).await,
        ServerMessage::Message {
            channel: "news".to_string(),
            body: "breaking".to_string(),
        }
    );

    shutdown_tx.send(()).unwrap();
    let joined = assert_ok!(tokio::time::timeout(STEP_TIMEOUT, relay_handle).await);
    assert_ok!(joined, "relay task failed");
}

// ============================================================================
// Close codes on the wire
// ============================================================================
//
// WebSocket client libraries rewrite close codes below 1000, so these tests
// speak the framing directly and read the close payload as sent.

const MASK: [u8; 4] = [0x1f, 0x2e, 0x3d, 0x4c];

/// Minimal WebSocket client that exposes raw close frames
struct RawClient {
    stream: TcpStream,
}

impl RawClient {
    async fn connect(server: &TestServer) -> Self {
        let mut stream = TcpStream::connect(server.addr).await.unwrap();
        let request = format!(
            "GET /ws HTTP/1.1\r\n\
             Host: {}\r\n\
             Upgrade: websocket\r\n\
             Connection: Upgrade\r\n\
             Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
             Sec-WebSocket-Version: 13\r\n\r\n",
            server.addr
        );
        stream.write_all(request.as_bytes()).await.unwrap();

        let head = read_http_head(&mut stream).await;
        assert!(head.starts_with("HTTP/1.1 101"), "upgrade refused: {}", head);

        Self { stream }
    }

    async fn send_text(&mut self, text: &str) {
        let payload = text.as_bytes();
        let mut frame = vec![0x81];
        if payload.len() < 126 {
            frame.push(0x80 | payload.len() as u8);
        } else {
            frame.push(0x80 | 126);
            frame.extend_from_slice(&(payload.len() as u16).to_be_bytes());
        }
        frame.extend_from_slice(&MASK);
        frame.extend(payload.iter().enumerate().map(|(i, b)| b ^ MASK[i % 4]));
        self.stream.write_all(&frame).await.unwrap();
    }

    async fn send_json(&mut self, value: serde_json::Value) {
        self.send_text(&value.to_string()).await;
    }

    /// Next frame from the server as (opcode, payload)
    async fn read_frame(&mut self) -> (u8, Vec<u8>) {
        let mut header = [0u8; 2];
        self.stream.read_exact(&mut header).await.unwrap();
        let opcode = header[0] & 0x0f;
        let len = match header[1] & 0x7f {
            126 => {
                let mut ext = [0u8; 2];
                self.stream.read_exact(&mut ext).await.unwrap();
                u16::from_be_bytes(ext) as usize
            }
            127 => {
                let mut ext = [0u8; 8];
                self.stream.read_exact(&mut ext).await.unwrap();
                u64::from_be_bytes(ext) as usize
            }
            n => n as usize,
        };
        let mut payload = vec![0u8; len];
        self.stream.read_exact(&mut payload).await.unwrap();
        (opcode, payload)
    }

    /// Next text frame, decoded as a server message
    async fn receive(&mut self) -> ServerMessage {
        let (opcode, payload) = tokio::time::timeout(STEP_TIMEOUT, self.read_frame())
            .await
            .expect("timed out waiting for a server message");
        assert_eq!(opcode, 0x1, "expected a text frame");
        serde_json::from_slice(&payload).unwrap()
    }

    /// Skip to the close frame and return its code and reason
    async fn close_frame(&mut self) -> (u16, String) {
        let read = async {
            loop {
                let (opcode, payload) = self.read_frame().await;
                if opcode == 0x8 {
                    assert!(payload.len() >= 2, "close frame without a code");
                    let code = u16::from_be_bytes([payload[0], payload[1]]);
                    let reason = String::from_utf8(payload[2..].to_vec()).unwrap();
                    return (code, reason);
                }
            }
        };
        tokio::time::timeout(STEP_TIMEOUT, read)
            .await
            .expect("timed out waiting for a close frame")
    }
}

async fn read_http_head(stream: &mut TcpStream) -> String {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        stream.read_exact(&mut byte).await.unwrap();
        head.push(byte[0]);
    }
    String::from_utf8(head).unwrap()
}

#[tokio::test]
async fn test_wire_close_unauthorized() {
    let gate = PredicateGate::new().with_can_connect(|_| false);
    let server = spawn_server(Hub::new(&Default::default()), Arc::new(gate)).await;
    let mut client = RawClient::connect(&server).await;

    client.send_json(json!({ "__type": "auth", "auth": {} })).await;

    assert_eq!(client.close_frame().await, (401, "Unauthorized".to_string()));
    assert_eq!(server.hub.stats().await.unwrap().connections, 0);
}

#[tokio::test]
async fn test_wire_close_auth_expected() {
    let server = spawn_server(Hub::new(&Default::default()), Arc::new(AllowAll)).await;
    let mut client = RawClient::connect(&server).await;

    client
        .send_json(json!({ "__type": "subscribe", "channel": "test" }))
        .await;

    assert_eq!(client.close_frame().await, (401, "Auth expected".to_string()));
    let stats = server.hub.stats().await.unwrap();
    assert_eq!(stats.connections, 0);
    assert_eq!(stats.subscription_count("test"), 0);
}

#[tokio::test]
async fn test_wire_close_unexpected_message() {
    let server = spawn_server(Hub::new(&Default::default()), Arc::new(AllowAll)).await;
    let mut client = RawClient::connect(&server).await;

    client.send_json(json!({ "__type": "auth", "auth": null })).await;
    assert_eq!(client.receive().await, ServerMessage::AuthOk);
    client.send_json(json!({ "__type": "unknown" })).await;

    assert_eq!(
        client.close_frame().await,
        (400, "Unexpected message".to_string())
    );
    assert_eq!(server.hub.stats().await.unwrap().connections, 0);
}

#[tokio::test]
async fn test_wire_close_channel_refused() {
    let gate = PredicateGate::new().with_can_subscribe(|_, _| false);
    let server = spawn_server(Hub::new(&Default::default()), Arc::new(gate)).await;
    let mut client = RawClient::connect(&server).await;

    client.send_json(json!({ "__type": "auth", "auth": {} })).await;
    assert_eq!(client.receive().await, ServerMessage::AuthOk);
    client
        .send_json(json!({ "__type": "subscribe", "channel": "test" }))
        .await;

    assert_eq!(client.close_frame().await, (403, "Channel refused".to_string()));
    let stats = server.hub.stats().await.unwrap();
    assert_eq!(stats.connections, 0);
    assert_eq!(stats.subscription_count("test"), 0);
}

// ============================================================================
// HTTP surface
// ============================================================================

/// Issue a GET and return the status code and JSON body
async fn http_get(server: &TestServer, path: &str) -> (u16, serde_json::Value) {
    let mut stream = TcpStream::connect(server.addr).await.unwrap();
    let request = format!(
        "GET {} HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n",
        path, server.addr
    );
    stream.write_all(request.as_bytes()).await.unwrap();

    let mut response = Vec::new();
    tokio::time::timeout(STEP_TIMEOUT, stream.read_to_end(&mut response))
        .await
        .expect("timed out waiting for an HTTP response")
        .unwrap();
    let response = String::from_utf8(response).unwrap();

    let (head, body) = response.split_once("\r\n\r\n").unwrap();
    let status = head.split_whitespace().nth(1).unwrap().parse().unwrap();
    (status, serde_json::from_str(body).unwrap())
}

#[tokio::test]
async fn test_stats_endpoint_reports_subscriptions() {
    let server = spawn_server(Hub::new(&Default::default()), Arc::new(AllowAll)).await;
    let mut first = connect(&server).await;
    let mut second = connect(&server).await;

    authenticate(&mut first).await;
    authenticate(&mut second).await;
    send(&mut first, json!({ "__type": "subscribe", "channel": "test" })).await;
    receive(&mut first).await;

    let (status, body) = http_get(&server, "/stats").await;
    assert_eq!(status, 200);
    assert_eq!(
        body,
        json!({ "connections": 2, "subscriptionCounts": { "test": 1 } })
    );
}

#[tokio::test]
async fn test_health_endpoint() {
    let server = spawn_server(Hub::new(&Default::default()), Arc::new(AllowAll)).await;

    let (status, body) = http_get(&server, "/health").await;
    assert_eq!(status, 200);
    assert_eq!(body["status"], "healthy");
    assert!(body["version"].is_string());
}

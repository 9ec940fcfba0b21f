//! End-to-end tests against a running node on loopback sockets.

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use shelfcast_node::auth::TokenVerifier;
use shelfcast_node::config::NodeConfig;
use shelfcast_node::Node;
use shelfcast_realtime::UpstreamState;
use shelfcast_types::{EventKind, Identity, NotificationEvent, ProgressEvent};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio_tungstenite::{connect_async, tungstenite::Message};

const SECRET: &str = "e2e-secret";

fn test_config() -> NodeConfig {
    let mut config = NodeConfig::default();
    config.http.listen = "127.0.0.1:0".parse().unwrap();
    config.http.shutdown_grace_ms = 200;
    config.stream.listen = "127.0.0.1:0".parse().unwrap();
    config.datagram.listen = "127.0.0.1:0".parse().unwrap();
    config.bridge.retry_delay_ms = 50;
    config.auth.secret = SECRET.to_string();
    config
}

fn token(user_id: &str, username: &str) -> String {
    TokenVerifier::new(SECRET.as_bytes(), None)
        .issue(&Identity::new(user_id, username), Duration::from_secs(300))
        .unwrap()
}

async fn wait_online(node: &Node, kind: EventKind) {
    let mut state = node.state().bridge.watch(kind);
    tokio::time::timeout(
        Duration::from_secs(5),
        state.wait_for(|s| *s == UpstreamState::Online),
    )
    .await
    .expect("bridge online in time")
    .unwrap();
}

/// Opens an SSE stream over a raw HTTP/1.1 connection.
async fn open_events(node: &Node, path: &str) -> TcpStream {
    let mut stream = TcpStream::connect(node.http_addr()).await.unwrap();
    let request = format!(
        "GET {path} HTTP/1.1\r\nHost: localhost\r\nAccept: text/event-stream\r\n\r\n"
    );
    stream.write_all(request.as_bytes()).await.unwrap();
    stream
}

async fn read_until(stream: &mut TcpStream, seen: &mut String, needle: &str) {
    let mut buf = [0u8; 4096];
    while !seen.contains(needle) {
        let n = tokio::time::timeout(Duration::from_secs(5), stream.read(&mut buf))
            .await
            .unwrap_or_else(|_| panic!("timed out waiting for {needle:?}, got {seen:?}"))
            .unwrap();
        assert!(n > 0, "stream closed while waiting for {needle:?}");
        seen.push_str(&String::from_utf8_lossy(&buf[..n]));
    }
}

#[tokio::test]
async fn test_stream_peers_receive_identical_lines() {
    let node = Node::start(test_config()).await.unwrap();

    let mut readers = Vec::new();
    for _ in 0..3 {
        let socket = TcpStream::connect(node.stream_addr()).await.unwrap();
        readers.push(BufReader::new(socket));
    }
    // three clients plus the bridge
    for _ in 0..100 {
        if node.state().stream.peer_count().await.unwrap() == 4 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(node.state().stream.peer_count().await.unwrap(), 4);

    let event = ProgressEvent::new("u-1", "alice", "book-1", 0.5);
    assert_eq!(
        node.state()
            .stream
            .broadcast_confirmed(event.clone())
            .await
            .unwrap(),
        4
    );

    let mut lines = Vec::new();
    for reader in &mut readers {
        let mut line = String::new();
        tokio::time::timeout(Duration::from_secs(2), reader.read_line(&mut line))
            .await
            .unwrap()
            .unwrap();
        lines.push(line);
    }
    assert!(lines.iter().all(|l| l == &lines[0]));
    let parsed: ProgressEvent = serde_json::from_str(lines[0].trim_end()).unwrap();
    assert_eq!(parsed, event);

    node.shutdown().await;
}

#[tokio::test]
async fn test_chat_rooms_over_websocket() {
    let node = Node::start(test_config()).await.unwrap();
    let url = |user: &str| {
        format!(
            "ws://{}/ws/chat?token={}",
            node.http_addr(),
            token(&format!("id-{user}"), user)
        )
    };

    let (mut a, _) = connect_async(url("alice")).await.unwrap();
    let (mut b, _) = connect_async(url("bob")).await.unwrap();
    let (mut c, _) = connect_async(url("carol")).await.unwrap();

    let join = |room: &str| Message::text(json!({ "type": "join", "room": room }).to_string());
    let get_users = || Message::text(json!({ "type": "get_users" }).to_string());

    async fn next_json<S>(ws: &mut S) -> Value
    where
        S: futures_util::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>>
            + Unpin,
    {
        loop {
            let msg = tokio::time::timeout(Duration::from_secs(2), ws.next())
                .await
                .expect("frame in time")
                .expect("socket open")
                .unwrap();
            if let Message::Text(text) = msg {
                return serde_json::from_str(text.as_str()).unwrap();
            }
        }
    }

    // alice is in r1 once her user_list comes back
    a.send(join("r1")).await.unwrap();
    a.send(get_users()).await.unwrap();
    assert_eq!(next_json(&mut a).await["users"], json!(["alice"]));

    b.send(join("r1")).await.unwrap();
    c.send(join("r2")).await.unwrap();

    // alice learns bob joined r1
    let notice = next_json(&mut a).await;
    assert_eq!(notice["type"], "join");
    assert_eq!(notice["username"], "bob");

    a.send(Message::text(
        json!({ "type": "message", "message": "hello r1" }).to_string(),
    ))
    .await
    .unwrap();

    let received = next_json(&mut b).await;
    assert_eq!(received["type"], "message");
    assert_eq!(received["username"], "alice");
    assert_eq!(received["user_id"], "id-alice");
    assert_eq!(received["message"], "hello r1");
    assert_eq!(received["room"], "r1");

    // the sender gets its own message back; carol gets nothing
    assert_eq!(next_json(&mut a).await["message"], "hello r1");
    assert!(tokio::time::timeout(Duration::from_millis(300), c.next())
        .await
        .is_err());

    b.send(get_users()).await.unwrap();
    let users = next_json(&mut b).await;
    assert_eq!(users["type"], "user_list");
    assert_eq!(users["users"], json!(["alice", "bob"]));

    b.close(None).await.unwrap();
    let left = next_json(&mut a).await;
    assert_eq!(left["type"], "leave");
    assert_eq!(left["username"], "bob");

    let rooms = node.state().rooms.snapshot().await.unwrap();
    assert_eq!(rooms.get("r1"), Some(&vec!["alice".to_string()]));
    assert_eq!(rooms.get("r2"), Some(&vec!["carol".to_string()]));

    node.shutdown().await;
}

#[tokio::test]
async fn test_progress_bridged_to_event_stream() {
    let node = Node::start(test_config()).await.unwrap();
    let mut events = open_events(
        &node,
        &format!("/events/progress?token={}", token("u-1", "alice")),
    )
    .await;
    let mut seen = String::new();
    read_until(&mut events, &mut seen, "event: status").await;

    wait_online(&node, EventKind::Progress).await;
    read_until(&mut events, &mut seen, "online").await;

    // the bridge registers shortly after connecting
    let event = ProgressEvent::new("u-1", "alice", "book-42", 0.9);
    for _ in 0..100 {
        let delivered = node
            .state()
            .stream
            .broadcast_confirmed(event.clone())
            .await
            .unwrap();
        if delivered > 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    read_until(&mut events, &mut seen, "event: progress").await;
    read_until(&mut events, &mut seen, "book-42").await;

    node.shutdown().await;
}

#[tokio::test]
async fn test_notifications_bridged_to_event_stream() {
    let node = Node::start(test_config()).await.unwrap();
    let mut events = open_events(
        &node,
        &format!("/events/notifications?token={}", token("u-2", "bob")),
    )
    .await;
    let mut seen = String::new();
    read_until(&mut events, &mut seen, "event: status").await;

    wait_online(&node, EventKind::Notification).await;
    assert_eq!(node.state().datagram.client_count().await.unwrap(), 1);

    node.state()
        .datagram
        .broadcast_confirmed(NotificationEvent::new("new_review", "book-5", "Five stars"))
        .await
        .unwrap();

    read_until(&mut events, &mut seen, "event: notification").await;
    read_until(&mut events, &mut seen, "new_review").await;

    node.shutdown().await;
}

#[tokio::test]
async fn test_status_reports_everything() {
    let node = Node::start(test_config()).await.unwrap();
    wait_online(&node, EventKind::Progress).await;
    wait_online(&node, EventKind::Notification).await;

    let mut http = TcpStream::connect(node.http_addr()).await.unwrap();
    http.write_all(
        b"GET /api/realtime/status HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
    )
    .await
    .unwrap();
    let mut response = String::new();
    tokio::time::timeout(Duration::from_secs(5), http.read_to_string(&mut response))
        .await
        .unwrap()
        .unwrap();

    assert!(response.starts_with("HTTP/1.1 200"));
    let body = &response[response.find("\r\n\r\n").unwrap() + 4..];
    let status: Value = serde_json::from_str(body).unwrap();
    assert_eq!(status["bridge"]["stream"], "online");
    assert_eq!(status["bridge"]["datagram"], "online");
    assert_eq!(status["datagram_peers"], 1);

    node.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_with_open_streams() {
    let node = Node::start(test_config()).await.unwrap();
    let mut events = open_events(
        &node,
        &format!("/events/progress?token={}", token("u-1", "alice")),
    )
    .await;
    let mut seen = String::new();
    read_until(&mut events, &mut seen, "event: status").await;

    tokio::time::timeout(Duration::from_secs(5), node.shutdown())
        .await
        .expect("shutdown completes despite open streams");
}

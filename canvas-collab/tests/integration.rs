//! End-to-end tests: a real listener, real WebSocket clients.

use canvas_collab::hub::{Hub, HubConfig, HubHandle};
use canvas_collab::protocol::{CursorPosition, Event, Message};
use canvas_collab::server::{CollabServer, ServerConfig};
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Duration};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct TestServer {
    addr: SocketAddr,
    hub: HubHandle,
    stop: oneshot::Sender<()>,
    server_task: JoinHandle<()>,
    hub_task: JoinHandle<canvas_collab::HubStats>,
}

impl TestServer {
    async fn start() -> Self {
        Self::start_with(ServerConfig {
            shutdown_grace: Duration::from_millis(200),
            ..ServerConfig::default()
        })
        .await
    }

    async fn start_with(config: ServerConfig) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (hub, handle) = Hub::new(HubConfig::default());
        let hub_task = hub.start();

        let config = ServerConfig {
            bind_addr: addr.to_string(),
            ..config
        };
        let server = CollabServer::new(config, handle.clone());
        let (stop, stopped) = oneshot::channel::<()>();
        let server_task = tokio::spawn(async move {
            server
                .serve(listener, async {
                    let _ = stopped.await;
                })
                .await
                .unwrap();
        });

        Self {
            addr,
            hub: handle,
            stop,
            server_task,
            hub_task,
        }
    }

    async fn connect(&self, query: &str) -> Socket {
        let url = format!("ws://{}/ws?{query}", self.addr);
        let (socket, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
        socket
    }

    async fn join(&self, user: &str, room: &str) -> Socket {
        let before = self.hub.members(room).await.unwrap().len();
        let socket = self.connect(&format!("user_id={user}&design_id={room}")).await;
        self.wait_for_members(room, before + 1).await;
        socket
    }

    async fn wait_for_members(&self, room: &str, count: usize) {
        for _ in 0..200 {
            if self.hub.members(room).await.unwrap().len() == count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("room {room} never reached {count} members");
    }

    async fn shutdown(self) {
        let _ = self.stop.send(());
        self.server_task.await.unwrap();
        self.hub.shutdown().await.unwrap();
        self.hub_task.await.unwrap();
    }
}

async fn next_message(socket: &mut Socket) -> Message {
    loop {
        let frame = timeout(Duration::from_secs(2), socket.next())
            .await
            .expect("timed out waiting for frame")
            .expect("stream ended")
            .expect("websocket error");
        match frame {
            WsMessage::Text(text) => return Message::decode(text.as_bytes()).unwrap(),
            WsMessage::Ping(_) | WsMessage::Pong(_) => continue,
            other => panic!("unexpected frame {other:?}"),
        }
    }
}

async fn assert_silent(socket: &mut Socket) {
    let result = timeout(Duration::from_millis(150), socket.next()).await;
    assert!(result.is_err(), "expected no frame, got {result:?}");
}

async fn send_json(socket: &mut Socket, value: serde_json::Value) {
    socket
        .send(WsMessage::Text(value.to_string().into()))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_frame_fans_out_to_room_including_sender() {
    let server = TestServer::start().await;
    let mut alice = server.join("u1", "designX").await;
    let mut bob = server.join("u2", "designX").await;

    send_json(
        &mut alice,
        json!({"type": "cursor_move", "data": {"x": 10, "y": 20}}),
    )
    .await;

    for socket in [&mut alice, &mut bob] {
        let message = next_message(socket).await;
        assert_eq!(message.user_id, "u1");
        assert_eq!(message.design_id, "designX");
        assert_eq!(
            message.event,
            Event::CursorMove(CursorPosition {
                user_id: "u1".into(),
                x: 10.0,
                y: 20.0,
            })
        );
    }

    server.shutdown().await;
}

#[tokio::test]
async fn test_rooms_are_isolated() {
    let server = TestServer::start().await;
    let mut alice = server.join("u1", "designX").await;
    let mut carol = server.join("u3", "designZ").await;

    send_json(
        &mut alice,
        json!({"type": "design_update", "data": {"objects": [{"id": "r1"}]}}),
    )
    .await;

    let message = next_message(&mut alice).await;
    assert!(matches!(message.event, Event::DesignUpdate(_)));
    assert_silent(&mut carol).await;

    server.shutdown().await;
}

#[tokio::test]
async fn test_sender_cannot_target_another_room() {
    let server = TestServer::start().await;
    let mut mallory = server.join("u9", "designX").await;
    let mut victim = server.join("u2", "designZ").await;

    send_json(
        &mut mallory,
        json!({"type": "design_update", "data": {}, "design_id": "designZ"}),
    )
    .await;

    let echoed = next_message(&mut mallory).await;
    assert_eq!(echoed.design_id, "designX");
    assert_silent(&mut victim).await;

    server.shutdown().await;
}

#[tokio::test]
async fn test_missing_identity_is_closed_without_registering() {
    let server = TestServer::start().await;

    for query in ["design_id=designX", "user_id=u1", "user_id=&design_id=designX"] {
        let mut socket = server.connect(query).await;
        let frame = timeout(Duration::from_secs(2), socket.next()).await.unwrap();
        assert!(
            matches!(frame, Some(Ok(WsMessage::Close(_))) | Some(Err(_)) | None),
            "expected connection to close for {query}, got {frame:?}"
        );
    }

    let stats = server.hub.stats().await.unwrap();
    assert_eq!(stats.clients, 0);
    assert_eq!(stats.rooms, 0);

    server.shutdown().await;
}

#[tokio::test]
async fn test_disconnect_removes_member_and_room() {
    let server = TestServer::start().await;
    let alice = server.join("u1", "designY").await;
    assert_eq!(server.hub.members("designY").await.unwrap().len(), 1);

    drop(alice);
    server.wait_for_members("designY", 0).await;
    assert_eq!(server.hub.stats().await.unwrap().rooms, 0);

    server.shutdown().await;
}

#[tokio::test]
async fn test_malformed_frame_disconnects_only_sender() {
    let server = TestServer::start().await;
    let mut alice = server.join("u1", "designX").await;
    let mut bob = server.join("u2", "designX").await;

    bob.send(WsMessage::Text("garbage".to_string().into()))
        .await
        .unwrap();
    server.wait_for_members("designX", 1).await;

    send_json(&mut alice, json!({"type": "cursor_move", "data": {"x": 1, "y": 1}})).await;
    let message = next_message(&mut alice).await;
    assert_eq!(message.user_id, "u1");

    server.shutdown().await;
}

#[tokio::test]
async fn test_rest_announcement_reaches_connected_editors() {
    let server = TestServer::start().await;
    let mut alice = server.join("u1", "designX").await;
    let mut bob = server.join("u2", "designX").await;

    server
        .hub
        .broadcast_design_update("designX", json!({"title": "Summer sale"}))
        .await;

    for socket in [&mut alice, &mut bob] {
        let message = next_message(socket).await;
        assert_eq!(message.user_id, "");
        match message.event {
            Event::DesignUpdate(data) => assert_eq!(data["title"], "Summer sale"),
            other => panic!("expected design update, got {other:?}"),
        }
    }

    server.shutdown().await;
}

#[tokio::test]
async fn test_unknown_event_types_are_relayed() {
    let server = TestServer::start().await;
    let mut alice = server.join("u1", "designX").await;
    let mut bob = server.join("u2", "designX").await;

    send_json(
        &mut alice,
        json!({"type": "selection_change", "data": {"ids": ["a"]}}),
    )
    .await;

    let message = next_message(&mut bob).await;
    assert_eq!(message.kind(), "selection_change");

    server.shutdown().await;
}

#[tokio::test]
async fn test_hub_shutdown_closes_connections() {
    let server = TestServer::start().await;
    let mut alice = server.join("u1", "designX").await;

    server.hub.shutdown().await.unwrap();

    let frame = timeout(Duration::from_secs(2), alice.next()).await.unwrap();
    assert!(
        matches!(frame, Some(Ok(WsMessage::Close(_)))),
        "expected close frame, got {frame:?}"
    );

    let _ = server.stop.send(());
    server.server_task.await.unwrap();
    server.hub_task.await.unwrap();
}

#[tokio::test]
async fn test_slow_reader_is_evicted_while_room_keeps_receiving() {
    let server = TestServer::start_with(ServerConfig {
        client_queue_capacity: 8,
        shutdown_grace: Duration::from_millis(200),
        ..ServerConfig::default()
    })
    .await;
    let mut reader = server.join("u1", "designX").await;
    let mut stalled = server.join("u2", "designX").await;

    // Large updates fill the stalled peer's TCP buffers, then its queue.
    let payload = json!({"blob": "x".repeat(64 * 1024)});
    let mut evicted = false;
    for _ in 0..2000 {
        server
            .hub
            .broadcast_design_update("designX", payload.clone())
            .await;
        let message = next_message(&mut reader).await;
        assert!(matches!(message.event, Event::DesignUpdate(_)));
        if server.hub.members("designX").await.unwrap().len() == 1 {
            evicted = true;
            break;
        }
    }
    assert!(evicted, "stalled reader was never evicted");
    let members = server.hub.members("designX").await.unwrap();
    assert_eq!(members[0].user_id, "u1");

    // Nothing the evicted connection sends reaches the room.
    let _ = stalled
        .send(WsMessage::Text(
            json!({"type": "cursor_move", "data": {"x": 5, "y": 5}})
                .to_string()
                .into(),
        ))
        .await;
    assert_silent(&mut reader).await;

    let ended = timeout(Duration::from_secs(10), async {
        while let Some(Ok(_)) = stalled.next().await {}
    })
    .await;
    assert!(ended.is_ok(), "evicted connection was left open");

    send_json(&mut reader, json!({"type": "cursor_move", "data": {"x": 1, "y": 2}})).await;
    let message = next_message(&mut reader).await;
    assert_eq!(message.user_id, "u1");

    server.shutdown().await;
}

#[tokio::test]
async fn test_serve_waits_for_open_connections_to_close() {
    let server = TestServer::start_with(ServerConfig {
        shutdown_grace: Duration::from_secs(5),
        ..ServerConfig::default()
    })
    .await;
    let mut alice = server.join("u1", "designX").await;

    let _ = server.stop.send(());
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(
        !server.server_task.is_finished(),
        "serve returned while a connection was still open"
    );

    server.hub.shutdown().await.unwrap();
    let frame = timeout(Duration::from_secs(2), alice.next()).await.unwrap();
    assert!(
        matches!(frame, Some(Ok(WsMessage::Close(_)))),
        "expected close frame, got {frame:?}"
    );

    timeout(Duration::from_secs(3), server.server_task)
        .await
        .expect("serve kept waiting after connections closed")
        .unwrap();
    server.hub_task.await.unwrap();
}

//! One collaborator's WebSocket connection.
//!
//! Each connection runs two tasks sharing the client's outbound queue:
//! - receive: frame → [`Message`] → stamped with sender/room/time → hub broadcast
//! - send: outbound queue → JSON text frame → socket
//!
//! ## State Machine
//! ```text
//! Connecting -> Registered -> Active -> Unregistering -> Closed
//!      |            |           |            |
//!      +------------+-----------+------------+--> Closed
//! ```
//!
//! The hub ends a connection (eviction, shutdown) by dropping the client's
//! queue sender and firing its hangup channel. The receive task stops at
//! once, and the send task gets [`CLOSE_GRACE`] to flush a close frame
//! before it is aborted and the socket dropped. The peer ends it by closing
//! or breaking the socket, which ends the receive task and unregisters.

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::error::ProtocolError as WsProtocolError;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message as WsMessage};
use tokio_tungstenite::WebSocketStream;
use uuid::Uuid;

use crate::hub::{ClientHandle, ClientId, HubHandle, Outbound};
use crate::protocol::{Message, RoomId, UserId};

/// How long a send task may keep writing after the hub let go of its client.
pub const CLOSE_GRACE: Duration = Duration::from_secs(1);

/// Which side ended the receive loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Hangup {
    Peer,
    Hub,
}

/// Lifecycle of one connection. No state is re-entered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Handshake done, not yet known to the hub
    Connecting,
    /// Hub accepted the registration
    Registered,
    /// Receive and send tasks running
    Active,
    /// Receive task ended, leaving the hub
    Unregistering,
    Closed,
}

impl ConnectionState {
    /// Forward-only transitions; `Closed` is reachable from anywhere but itself.
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (Connecting, Registered)
                | (Registered, Active)
                | (Active, Unregistering)
                | (Connecting | Registered | Active | Unregistering, Closed)
        )
    }
}

/// Per-connection state: identity, room and queue sizing.
#[derive(Debug)]
pub struct Client {
    id: ClientId,
    user_id: UserId,
    room_id: RoomId,
    queue_capacity: usize,
    state: ConnectionState,
}

impl Client {
    pub fn new(user_id: impl Into<UserId>, room_id: impl Into<RoomId>, queue_capacity: usize) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id: user_id.into(),
            room_id: room_id.into(),
            queue_capacity: queue_capacity.max(1),
            state: ConnectionState::Connecting,
        }
    }

    pub fn id(&self) -> ClientId {
        self.id
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    fn transition(&mut self, next: ConnectionState) {
        if !self.state.can_transition_to(next) {
            log::warn!(
                "Client {} ignoring transition {:?} -> {:?}",
                self.id,
                self.state,
                next
            );
            return;
        }
        log::trace!("Client {}: {:?} -> {:?}", self.id, self.state, next);
        self.state = next;
    }

    /// Drive the connection until it closes.
    ///
    /// Registers with the hub, spawns the send task, and runs the receive
    /// loop on the calling task. Always ends unregistered and `Closed`.
    pub async fn run<S>(mut self, ws: WebSocketStream<S>, hub: HubHandle) -> ConnectionState
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (queue_tx, queue_rx) = mpsc::channel(self.queue_capacity);
        let (hangup_tx, hangup_rx) = oneshot::channel();
        let (mut sink, stream) = ws.split();

        let handle = ClientHandle::new(self.id, self.user_id.clone(), self.room_id.clone(), queue_tx)
            .with_hangup(hangup_tx);
        if let Err(e) = hub.register(handle).await {
            log::warn!("Client {} ({}) could not register: {e}", self.user_id, self.id);
            let _ = sink.send(WsMessage::Close(None)).await;
            let _ = sink.close().await;
            self.transition(ConnectionState::Closed);
            return self.state;
        }
        self.transition(ConnectionState::Registered);

        let writer = tokio::spawn(send_loop(self.id, queue_rx, sink));
        self.transition(ConnectionState::Active);

        match self.receive_loop(stream, &hub, hangup_rx).await {
            Hangup::Peer => {
                self.transition(ConnectionState::Unregistering);
                if let Err(e) = hub.unregister(self.id).await {
                    log::debug!("Client {} unregister skipped: {e}", self.id);
                }
            }
            Hangup::Hub => {
                log::debug!("Client {} ({}) released by the hub", self.user_id, self.id);
            }
        }
        self.finish_writer(writer).await;

        self.transition(ConnectionState::Closed);
        log::debug!(
            "Connection closed for {} ({}) in room {}",
            self.user_id,
            self.id,
            self.room_id
        );
        self.state
    }

    /// Give the send task [`CLOSE_GRACE`] to finish, then abort it.
    ///
    /// A peer that stopped reading leaves the writer parked on a full
    /// socket; aborting it drops the last half of the socket.
    async fn finish_writer(&self, mut writer: JoinHandle<()>) {
        let result = match tokio::time::timeout(CLOSE_GRACE, &mut writer).await {
            Ok(result) => result,
            Err(_) => {
                log::warn!(
                    "Send task for {} ({}) stuck on write, dropping connection",
                    self.user_id,
                    self.id
                );
                writer.abort();
                writer.await
            }
        };
        if let Err(e) = result {
            if !e.is_cancelled() {
                log::error!("Send task for client {} failed: {e}", self.id);
            }
        }
    }

    async fn receive_loop<S>(
        &self,
        mut stream: SplitStream<WebSocketStream<S>>,
        hub: &HubHandle,
        mut hangup: oneshot::Receiver<()>,
    ) -> Hangup
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        loop {
            let frame = tokio::select! {
                biased;
                _ = &mut hangup => return Hangup::Hub,
                frame = stream.next() => frame,
            };
            let Some(frame) = frame else {
                log::debug!("Stream ended for client {} ({})", self.user_id, self.id);
                return Hangup::Peer;
            };
            let decoded = match frame {
                Ok(WsMessage::Text(text)) => Message::decode(text.as_bytes()),
                Ok(WsMessage::Binary(data)) => Message::decode(&data),
                Ok(WsMessage::Close(frame)) => {
                    self.log_close(frame.as_ref());
                    return Hangup::Peer;
                }
                Ok(_) => continue,
                Err(e) => {
                    self.log_transport_error(&e);
                    return Hangup::Peer;
                }
            };

            let message = match decoded {
                Ok(message) => message.stamp_sender(&self.user_id, &self.room_id),
                Err(e) => {
                    log::warn!(
                        "Dropping connection {} ({}) in room {}: {e}",
                        self.user_id,
                        self.id,
                        self.room_id
                    );
                    return Hangup::Peer;
                }
            };

            log::trace!("{} from {} in room {}", message.kind(), self.user_id, self.room_id);
            if let Err(e) = hub.broadcast(message).await {
                log::debug!("Client {} stopping receive: {e}", self.id);
                return Hangup::Hub;
            }
        }
    }

    fn log_close(&self, frame: Option<&CloseFrame>) {
        match frame.map(|f| f.code) {
            None | Some(CloseCode::Normal) | Some(CloseCode::Away) => {
                log::debug!("Client {} ({}) closed the connection", self.user_id, self.id);
            }
            Some(code) => {
                log::warn!(
                    "Client {} ({}) closed the connection with code {code:?}",
                    self.user_id,
                    self.id
                );
            }
        }
    }

    fn log_transport_error(&self, error: &WsError) {
        if is_expected_closure(error) {
            log::debug!("Client {} ({}) disconnected: {error}", self.user_id, self.id);
        } else {
            log::warn!("WebSocket error from {} ({}): {error}", self.user_id, self.id);
        }
    }
}

/// Closures that are part of normal operation rather than faults.
pub fn is_expected_closure(error: &WsError) -> bool {
    matches!(
        error,
        WsError::ConnectionClosed
            | WsError::AlreadyClosed
            | WsError::Protocol(WsProtocolError::ResetWithoutClosingHandshake)
    )
}

async fn send_loop<S>(
    client_id: ClientId,
    mut queue: mpsc::Receiver<Outbound>,
    mut sink: SplitSink<WebSocketStream<S>, WsMessage>,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    while let Some(message) = queue.recv().await {
        let text = match message.encode() {
            Ok(text) => text,
            Err(e) => {
                log::error!("Failed to encode {} for client {client_id}: {e}", message.kind());
                continue;
            }
        };
        if let Err(e) = sink.send(WsMessage::Text(text.into())).await {
            if is_expected_closure(&e) {
                log::debug!("Client {client_id} gone before write: {e}");
            } else {
                log::warn!("WebSocket write error for client {client_id}: {e}");
            }
            let _ = sink.close().await;
            return;
        }
    }

    // Queue closed by the hub: unregistered, evicted or shutting down.
    let _ = sink.send(WsMessage::Close(None)).await;
    let _ = sink.close().await;
    log::trace!("Send task for client {client_id} finished");
}

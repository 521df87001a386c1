//! WebSocket listener that turns upgraded connections into hub clients.
//!
//! Architecture:
//! ```text
//! TcpListener ── accept ── handshake (?user_id=..&design_id=..)
//!                               │
//!                 missing id ───┼──► close, never registered
//!                               ▼
//!                        Client::run ──► Hub
//! ```
//!
//! The hub is not owned here: the caller constructs it, starts its
//! coordinator and passes a [`HubHandle`] in. Stopping the hub is what ends
//! open connections, so a caller that wants a clean exit stops the hub from
//! inside the shutdown future it hands to [`CollabServer::serve`].

use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use url::form_urlencoded;

use crate::client::Client;
use crate::error::CollabError;
use crate::hub::{HubConfig, HubHandle, DEFAULT_CLIENT_QUEUE_CAPACITY};
use crate::protocol::{RoomId, UserId};

/// Largest inbound message accepted before the connection is dropped.
pub const DEFAULT_MAX_MESSAGE_BYTES: usize = 1 << 20;

/// How long `serve` waits for open connections after shutdown.
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Outbound messages buffered per client before eviction
    pub client_queue_capacity: usize,
    /// Maximum inbound message (and frame) size in bytes
    pub max_message_bytes: usize,
    /// Time open connections get to finish once accepting stops
    pub shutdown_grace: Duration,
    pub hub: HubConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8080".to_string(),
            client_queue_capacity: DEFAULT_CLIENT_QUEUE_CAPACITY,
            max_message_bytes: DEFAULT_MAX_MESSAGE_BYTES,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
            hub: HubConfig::default(),
        }
    }
}

/// Identity supplied on the upgrade request's query string.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectParams {
    pub user_id: Option<UserId>,
    pub design_id: Option<RoomId>,
}

impl ConnectParams {
    /// Parse `user_id` and `design_id`; the first occurrence of each wins.
    pub fn from_query(query: &str) -> Self {
        let mut params = Self::default();
        for (key, value) in form_urlencoded::parse(query.as_bytes()) {
            let slot = match &*key {
                "user_id" => &mut params.user_id,
                "design_id" => &mut params.design_id,
                _ => continue,
            };
            if slot.is_none() {
                *slot = Some(value.into_owned());
            }
        }
        params
    }

    /// Both identifiers, if both are present and non-empty.
    pub fn into_identity(self) -> Option<(UserId, RoomId)> {
        match (self.user_id, self.design_id) {
            (Some(user_id), Some(design_id)) if !user_id.is_empty() && !design_id.is_empty() => {
                Some((user_id, design_id))
            }
            _ => None,
        }
    }
}

/// The collaboration listener.
pub struct CollabServer {
    config: ServerConfig,
    hub: HubHandle,
}

impl CollabServer {
    pub fn new(config: ServerConfig, hub: HubHandle) -> Self {
        Self { config, hub }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn hub(&self) -> &HubHandle {
        &self.hub
    }

    /// Bind `bind_addr` and serve until `shutdown` resolves.
    pub async fn run<F>(&self, shutdown: F) -> Result<(), CollabError>
    where
        F: Future<Output = ()>,
    {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        self.serve(listener, shutdown).await
    }

    /// Accept connections on `listener` until `shutdown` resolves.
    ///
    /// Then waits up to `shutdown_grace` for open connections to finish
    /// writing their close frames. Connections still open after that are
    /// left running; they end when the hub is stopped or their peer
    /// disconnects.
    pub async fn serve<F>(&self, listener: TcpListener, shutdown: F) -> Result<(), CollabError>
    where
        F: Future<Output = ()>,
    {
        log::info!("Collaboration server listening on {}", listener.local_addr()?);
        tokio::pin!(shutdown);
        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                Some(finished) = connections.join_next(), if !connections.is_empty() => {
                    if let Err(e) = finished {
                        log::error!("Connection task failed: {e}");
                    }
                }
                accepted = listener.accept() => {
                    let (stream, addr) = match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            log::warn!("Failed to accept connection: {e}");
                            continue;
                        }
                    };
                    log::debug!("New TCP connection from {addr}");

                    let hub = self.hub.clone();
                    let config = self.config.clone();
                    connections.spawn(async move {
                        if let Err(e) = handle_connection(stream, addr, hub, config).await {
                            log::error!("Connection error from {addr}: {e}");
                        }
                    });
                }
            }
        }

        log::info!("Shutdown requested, no longer accepting connections");
        self.drain(connections).await;
        Ok(())
    }

    async fn drain(&self, mut connections: JoinSet<()>) {
        if connections.is_empty() {
            return;
        }
        let grace = self.config.shutdown_grace;
        log::info!("Waiting up to {grace:?} for {} open connections", connections.len());

        let finished = tokio::time::timeout(grace, async {
            while connections.join_next().await.is_some() {}
        })
        .await;
        if finished.is_err() {
            log::warn!(
                "{} connections still open after {grace:?}, leaving them to the hub",
                connections.len()
            );
            connections.detach_all();
        }
    }
}

/// Upgrade one TCP connection and run it as a client.
async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    hub: HubHandle,
    config: ServerConfig,
) -> Result<(), CollabError> {
    let mut params = ConnectParams::default();
    let capture = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
        params = ConnectParams::from_query(request.uri().query().unwrap_or_default());
        Ok(response)
    };
    let ws_config = WebSocketConfig::default()
        .max_message_size(Some(config.max_message_bytes))
        .max_frame_size(Some(config.max_message_bytes));

    let mut ws = tokio_tungstenite::accept_hdr_async_with_config(stream, capture, Some(ws_config)).await?;

    let Some((user_id, design_id)) = params.into_identity() else {
        log::info!("Closing connection from {addr}: user_id and design_id are required");
        if let Err(e) = ws.close(None).await {
            log::debug!("Close to {addr} failed: {e}");
        }
        return Ok(());
    };

    log::debug!("WebSocket connection established from {addr} for {user_id} in {design_id}");
    Client::new(user_id, design_id, config.client_queue_capacity)
        .run(ws, hub)
        .await;
    Ok(())
}

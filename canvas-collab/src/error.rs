use thiserror::Error;
use tokio_tungstenite::tungstenite;

use crate::protocol::ProtocolError;

#[derive(Debug, Error)]
pub enum CollabError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// The coordinator task has stopped; no further hub operations are possible.
    #[error("Hub coordinator is not running")]
    HubClosed,
}

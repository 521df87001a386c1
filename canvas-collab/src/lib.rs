//! # canvas-collab: Real-time collaboration hub for the canvas designer
//!
//! Lets everyone editing the same design exchange live updates (canvas
//! edits, cursor positions, presence) over WebSocket connections.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐    WebSocket     ┌──────────────────────────┐
//! │ Editor tab  │ ◄──────────────► │ Client                   │
//! │ (browser)   │    JSON frames   │  receive task  send task │
//! └─────────────┘                  └──────┬────────────▲──────┘
//!                                         │ broadcast  │ bounded queue (256)
//!                                         ▼            │
//! ┌─────────────┐   announcements  ┌──────────────────────────┐
//! │ REST layer  │ ───────────────► │ Hub (single coordinator) │
//! └─────────────┘                  │ clients + rooms          │
//!                                  └──────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: JSON wire message and typed events
//! - [`hub`]: room membership and fan-out with slow-reader eviction
//! - [`client`]: per-connection receive/send tasks
//! - [`broadcast`]: one-shot announcements from outside the live session
//! - [`server`]: WebSocket listener and connection admission
//!
//! Delivery is best effort: nothing is persisted or replayed, and there is
//! no ordering guarantee across rooms.

pub mod broadcast;
pub mod client;
pub mod error;
pub mod hub;
pub mod protocol;
pub mod server;

pub use client::{Client, ConnectionState};
pub use error::CollabError;
pub use hub::{Hub, HubConfig, HubHandle, HubStats};
pub use protocol::{Event, Message};
pub use server::{CollabServer, ServerConfig};

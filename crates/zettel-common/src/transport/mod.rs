//! Real-time collaboration transport layer.
//!
//! This module provides the infrastructure for real-time collaborative editing:
//! - `CollabSession`: per-document session with auth, acks and reconnection
//! - `CollabMessage`: wire protocol for CRDT updates, sync, cursors, presence
//! - `Connector`/`Channel`: the frame transport, with WebSocket and in-memory
//!   implementations
//! - `PresenceTracker`: ephemeral collaborator state

mod backoff;
mod channel;
mod memory;
mod messages;
mod presence;
mod session;
mod ws;

pub use backoff::Backoff;
pub use channel::{Channel, Connector, TransportError};
pub use memory::{MemoryChannel, MemoryConnector, MemoryHub};
pub use messages::CollabMessage;
pub use presence::{
    COLLABORATOR_COLORS, Collaborator, PresenceTracker, RemoteCursor, color_for_replica,
};
pub use session::{
    CollabSession, ConnectionStatus, SessionConfig, SessionError, SessionEvent, SessionParams,
};
pub use ws::{WsChannel, WsConnector};

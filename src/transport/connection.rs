//! # Connection Handles
//!
//! Live peer connections and the registry tracking them. A `Connection` is
//! the handle shared between the transport adapter and the endpoint core:
//! the routing tables refer to connections by [`ConnectionId`] and resolve
//! them here when they need to send.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tracing::debug;

use super::TransportError;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Opaque handle identifying one peer connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Connection lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Handshake in progress
    Connecting,
    /// Open and exchanging frames
    Open,
    /// Close requested, waiting for the peer to acknowledge
    Closing,
    /// Fully closed
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Open => write!(f, "open"),
            ConnectionState::Closing => write!(f, "closing"),
            ConnectionState::Closed => write!(f, "closed"),
        }
    }
}

/// One live peer connection
#[derive(Debug)]
pub struct Connection {
    id: ConnectionId,
    peer: String,
    state: RwLock<ConnectionState>,
    sender: mpsc::UnboundedSender<Message>,
}

impl Connection {
    /// Create a connection handle around an outbound frame channel
    pub fn new(peer: impl Into<String>, sender: mpsc::UnboundedSender<Message>) -> Self {
        Self {
            id: ConnectionId::next(),
            peer: peer.into(),
            state: RwLock::new(ConnectionState::Connecting),
            sender,
        }
    }

    /// This connection's handle
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// The peer address or URI, for diagnostics
    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Current lifecycle state
    pub async fn state(&self) -> ConnectionState {
        *self.state.read().await
    }

    pub(crate) async fn set_state(&self, state: ConnectionState) {
        *self.state.write().await = state;
    }

    /// Enqueue one text frame for sending. Non-blocking; delivery is
    /// handled by the connection's I/O task.
    pub fn send(&self, frame: String) -> Result<(), TransportError> {
        self.sender
            .send(Message::Text(frame))
            .map_err(|_| TransportError::ChannelClosed)
    }

    /// Enqueue a normal close frame with the given reason
    pub fn close(&self, reason: &str) -> Result<(), TransportError> {
        self.sender
            .send(Message::Close(Some(CloseFrame {
                code: CloseCode::Normal,
                reason: reason.to_string().into(),
            })))
            .map_err(|_| TransportError::ChannelClosed)
    }
}

/// Registry of live connections, shared between the transport adapter and
/// the endpoint core
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: RwLock<HashMap<ConnectionId, Arc<Connection>>>,
}

impl ConnectionRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a connection
    pub async fn register(&self, connection: Arc<Connection>) {
        debug!(
            "Registered connection {} to {}",
            connection.id(),
            connection.peer()
        );
        self.connections
            .write()
            .await
            .insert(connection.id(), connection);
    }

    /// Stop tracking a connection
    pub async fn remove(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        let removed = self.connections.write().await.remove(&id);
        if removed.is_some() {
            debug!("Removed connection {}", id);
        }
        removed
    }

    /// Resolve a handle to its connection
    pub async fn get(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        self.connections.read().await.get(&id).cloned()
    }

    /// All tracked connections
    pub async fn all(&self) -> Vec<Arc<Connection>> {
        self.connections.read().await.values().cloned().collect()
    }

    /// Number of tracked connections
    pub async fn count(&self) -> usize {
        self.connections.read().await.len()
    }

    /// Drop every tracked connection
    pub async fn clear(&self) {
        self.connections.write().await.clear();
    }
}

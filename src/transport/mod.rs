//! # Transport Adapter
//!
//! Owns the WebSocket connections of an endpoint. The adapter is expressed
//! as a capability set (connect, resolve, close, stop) with one
//! implementation per security mode ([`TcpTransport`], [`TlsTransport`]);
//! the mode is routed once at configure time. Every connection runs on its
//! own I/O task which pumps the outbound frame channel and the inbound
//! stream, delivering [`TransportEvents`] in order.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{Connector, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error};

pub mod connection;
pub mod tcp;
pub mod tls;

pub use connection::{Connection, ConnectionId, ConnectionRegistry, ConnectionState};
pub use tcp::TcpTransport;
pub use tls::TlsTransport;

/// Default handshake timeout for outbound dials
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Transport-layer errors
#[derive(Debug, Error)]
pub enum TransportError {
    /// The dial URI could not be turned into a handshake request
    #[error("invalid URI: {0}")]
    InvalidUri(String),

    /// The dial or WebSocket handshake failed
    #[error("connection failed: {0}")]
    ConnectFailed(String),

    /// The dial did not complete in time
    #[error("connection timeout")]
    Timeout,

    /// TLS context setup failed
    #[error("TLS setup failed: {0}")]
    Tls(String),

    /// No connection is registered under the handle
    #[error("connection {0} is not registered")]
    NotFound(ConnectionId),

    /// The connection's I/O task is gone
    #[error("failed to enqueue message, connection is gone")]
    ChannelClosed,

    /// I/O errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Connection-originated events, delivered in order per connection by that
/// connection's I/O task
#[async_trait]
pub trait TransportEvents: Send + Sync {
    /// A connection finished its handshake
    async fn on_open(&self, connection: Arc<Connection>);
    /// A text frame arrived
    async fn on_message(&self, connection: Arc<Connection>, frame: String);
    /// A connection reached its end of life
    async fn on_close(&self, connection: Arc<Connection>);
    /// An outbound dial failed
    async fn on_fail(&self, uri: &str, reason: &str);
}

/// The transport capability set
#[async_trait]
pub trait Transport: Send + Sync {
    /// Dial a peer (client mode)
    async fn connect(&self, uri: &str) -> Result<Arc<Connection>, TransportError>;

    /// Resolve a connection handle
    async fn get_connection(&self, id: ConnectionId) -> Option<Arc<Connection>>;

    /// Request a normal close of a connection
    async fn close(&self, id: ConnectionId, reason: &str) -> Result<(), TransportError>;

    /// Stop all connection tasks and forget tracked connections
    async fn stop(&self);
}

/// Build the client handshake request for a dial, attaching the bearer
/// token as a subprotocol when one is configured.
pub(crate) fn build_request(
    uri: &str,
    auth_token: Option<&str>,
) -> Result<Request, TransportError> {
    use tokio_tungstenite::tungstenite::client::IntoClientRequest;

    let mut request = uri
        .into_client_request()
        .map_err(|e| TransportError::InvalidUri(e.to_string()))?;
    if let Some(token) = auth_token {
        crate::auth::attach_auth(&mut request, token);
    }
    Ok(request)
}

/// Perform the dial and WebSocket handshake with an optional TLS connector
pub(crate) async fn dial(
    request: Request,
    connector: Option<Connector>,
    connect_timeout: Duration,
) -> Result<WebSocketStream<MaybeTlsStream<TcpStream>>, TransportError> {
    let handshake =
        tokio_tungstenite::connect_async_tls_with_config(request, None, false, connector);

    match timeout(connect_timeout, handshake).await {
        Ok(Ok((stream, _response))) => Ok(stream),
        Ok(Err(e)) => Err(TransportError::ConnectFailed(e.to_string())),
        Err(_) => Err(TransportError::Timeout),
    }
}

/// Wrap an established WebSocket stream in a tracked connection and spawn
/// its I/O task. Used for both dialed and accepted streams.
pub(crate) async fn adopt_stream<S>(
    ws_stream: WebSocketStream<S>,
    peer: String,
    registry: Arc<ConnectionRegistry>,
    events: Arc<dyn TransportEvents>,
) -> (Arc<Connection>, JoinHandle<()>)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (sender, receiver) = mpsc::unbounded_channel();
    let connection = Arc::new(Connection::new(peer, sender));
    registry.register(connection.clone()).await;

    let task = tokio::spawn(run_connection(
        ws_stream,
        connection.clone(),
        receiver,
        registry,
        events,
    ));

    (connection, task)
}

/// The per-connection I/O loop: pump outbound frames and inbound messages
/// until either side ends the connection.
async fn run_connection<S>(
    ws_stream: WebSocketStream<S>,
    connection: Arc<Connection>,
    mut receiver: mpsc::UnboundedReceiver<Message>,
    registry: Arc<ConnectionRegistry>,
    events: Arc<dyn TransportEvents>,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    // Deliver on_open (which replays the startup log into the outbound
    // channel) before the connection is reported open, so nothing gated on
    // the open state can enqueue ahead of the replay.
    events.on_open(connection.clone()).await;
    connection.set_state(ConnectionState::Open).await;

    loop {
        tokio::select! {
            incoming = ws_receiver.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        events.on_message(connection.clone(), text).await;
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        if ws_sender.send(Message::Pong(payload)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        debug!(
                            "Connection {} closed by peer: {:?}",
                            connection.id(),
                            frame
                        );
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        error!("WebSocket error on connection {}: {}", connection.id(), e);
                        break;
                    }
                    None => break,
                }
            }

            outgoing = receiver.recv() => {
                match outgoing {
                    Some(message) => {
                        if matches!(message, Message::Close(_)) {
                            connection.set_state(ConnectionState::Closing).await;
                        }
                        if let Err(e) = ws_sender.send(message).await {
                            error!(
                                "Failed to send on connection {}: {}",
                                connection.id(),
                                e
                            );
                            break;
                        }
                    }
                    None => break,
                }
            }
        }
    }

    connection.set_state(ConnectionState::Closed).await;
    registry.remove(connection.id()).await;
    events.on_close(connection.clone()).await;
    debug!("Connection task for {} stopped", connection.id());
}

//! # Plain TCP Transport
//!
//! WebSocket transport over unencrypted TCP (`ws://` URIs).

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::info;

use super::{
    adopt_stream, build_request, dial, Connection, ConnectionId, ConnectionRegistry,
    Transport, TransportError, TransportEvents, DEFAULT_CONNECT_TIMEOUT,
};

/// Transport over plain TCP
pub struct TcpTransport {
    registry: Arc<ConnectionRegistry>,
    events: Arc<dyn TransportEvents>,
    auth_token: Option<String>,
    connect_timeout: Duration,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl TcpTransport {
    /// Create a TCP transport delivering events to the given handler
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        events: Arc<dyn TransportEvents>,
        auth_token: Option<String>,
    ) -> Self {
        Self {
            registry,
            events,
            auth_token,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Override the dial timeout
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn connect(&self, uri: &str) -> Result<Arc<Connection>, TransportError> {
        let request = build_request(uri, self.auth_token.as_deref())?;

        match dial(request, None, self.connect_timeout).await {
            Ok(stream) => {
                let (connection, task) = adopt_stream(
                    stream,
                    uri.to_string(),
                    self.registry.clone(),
                    self.events.clone(),
                )
                .await;
                let mut tasks = self.tasks.lock().await;
                tasks.retain(|t| !t.is_finished());
                tasks.push(task);
                info!("Established TCP connection {} to '{}'", connection.id(), uri);
                Ok(connection)
            }
            Err(e) => {
                self.events.on_fail(uri, &e.to_string()).await;
                Err(e)
            }
        }
    }

    async fn get_connection(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        self.registry.get(id).await
    }

    async fn close(&self, id: ConnectionId, reason: &str) -> Result<(), TransportError> {
        let connection = self
            .registry
            .get(id)
            .await
            .ok_or(TransportError::NotFound(id))?;
        connection.close(reason)
    }

    async fn stop(&self) {
        for task in self.tasks.lock().await.drain(..) {
            task.abort();
        }
        self.registry.clear().await;
    }
}

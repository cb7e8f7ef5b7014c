//! # Bridge Client
//!
//! The dialing variant of the bridge endpoint. Holds one connection at a
//! time to the remote server and re-dials it from the host's periodic
//! `spin_once` whenever the connection is missing or closed.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::{Mutex, RwLock};
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::config::{EndpointConfig, SearchPaths, SecurityMode};
use crate::encoding::make_encoding;
use crate::endpoint::{
    CallHandle, EndpointCore, RequestCallback, ServiceProxy, SubscriptionCallback,
    TopicPublisher,
};
use crate::error::Result;
use crate::transport::{
    Connection, ConnectionRegistry, ConnectionState, TcpTransport, TlsTransport, Transport,
};
use crate::types::{DynamicType, DynamicValue};

/// Minimum pause between reconnection attempts
pub const RECONNECT_DEBOUNCE: Duration = Duration::from_secs(2);

/// How long `spin_once` yields to the I/O tasks before returning
pub const SPIN_YIELD: Duration = Duration::from_millis(100);

/// Poll interval while waiting for the close handshake on shutdown
pub const SHUTDOWN_POLL: Duration = Duration::from_millis(200);

/// Upper bound on the close handshake wait
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// The client-side bridge endpoint
pub struct BridgeClient {
    core: Arc<EndpointCore>,
    transport: Arc<dyn Transport>,
    host_uri: String,
    connection: RwLock<Option<Arc<Connection>>>,
    last_attempt: Mutex<Option<Instant>>,
    has_spun_once: AtomicBool,
    closing_down: AtomicBool,
}

impl BridgeClient {
    /// Configure a client from its configuration node, resolving file
    /// names through the environment's search paths.
    pub fn configure(configuration: &Value) -> Result<Self> {
        Self::configure_with_search(configuration, &SearchPaths::from_env())
    }

    /// Configure a client with explicit search paths
    pub fn configure_with_search(configuration: &Value, search: &SearchPaths) -> Result<Self> {
        let config = EndpointConfig::from_value(configuration)?;

        let encoding = make_encoding(config.encoding);
        let registry = Arc::new(ConnectionRegistry::new());
        let core = Arc::new(EndpointCore::new(
            "websocket_client",
            encoding,
            registry.clone(),
            config.max_pending_calls,
        ));

        let transport: Arc<dyn Transport> = match config.security {
            SecurityMode::None => {
                info!("Security disabled, creating TCP endpoint...");
                Arc::new(TcpTransport::new(
                    registry,
                    core.clone(),
                    config.auth.token.clone(),
                ))
            }
            SecurityMode::Tls => {
                info!("Security enabled, creating TLS endpoint...");
                Arc::new(TlsTransport::configure(
                    &config.cert_authorities,
                    search,
                    registry,
                    core.clone(),
                    config.auth.token.clone(),
                )?)
            }
        };

        let host_uri = config.uri();
        info!("Configured endpoint '{}'", host_uri);

        Ok(Self {
            core,
            transport,
            host_uri,
            connection: RwLock::new(None),
            last_attempt: Mutex::new(None),
            has_spun_once: AtomicBool::new(false),
            closing_down: AtomicBool::new(false),
        })
    }

    /// The endpoint core, for registration and traffic
    pub fn core(&self) -> &Arc<EndpointCore> {
        &self.core
    }

    /// The URI this client dials
    pub fn host_uri(&self) -> &str {
        &self.host_uri
    }

    /// Whether a connection object currently exists (it may not be open)
    pub async fn okay(&self) -> bool {
        self.connection.read().await.is_some()
    }

    /// Drive the reconnect loop once.
    ///
    /// Dials when there is no connection, or the connection has fully
    /// closed, and at least [`RECONNECT_DEBOUNCE`] has passed since the
    /// last attempt. Always yields [`SPIN_YIELD`] to the I/O tasks.
    /// Returns whether a connection object exists.
    pub async fn spin_once(&self) -> bool {
        let first_spin = !self.has_spun_once.swap(true, Ordering::SeqCst);

        let (disconnected, lost_connection) = match self.connection.read().await.as_ref() {
            None => (true, false),
            Some(connection) => {
                let closed = connection.state().await == ConnectionState::Closed;
                (closed, closed)
            }
        };
        let debounced = self
            .last_attempt
            .lock()
            .await
            .map_or(true, |at| at.elapsed() >= RECONNECT_DEBOUNCE);

        if first_spin || (disconnected && debounced) {
            if lost_connection && !self.closing_down.load(Ordering::SeqCst) {
                warn!(
                    "The connection to the server is closing early. Attempting to reconnect to \
                     '{}'",
                    self.host_uri
                );
            }

            *self.last_attempt.lock().await = Some(Instant::now());
            debug!(
                "{}connecting to '{}'",
                if first_spin { "C" } else { "Re" },
                self.host_uri
            );

            match self.transport.connect(&self.host_uri).await {
                Ok(connection) => {
                    *self.connection.write().await = Some(connection);
                }
                Err(_) => {
                    // Already reported through the transport's failure
                    // path, which suppresses repeats within one run.
                }
            }
        }

        sleep(SPIN_YIELD).await;
        self.connection.read().await.is_some()
    }

    /// Close the connection, wait for the peer to acknowledge, and stop
    /// the transport.
    pub async fn shutdown(&self) {
        self.closing_down.store(true, Ordering::SeqCst);

        let connection = self.connection.read().await.clone();
        if let Some(connection) = connection {
            if connection.state().await == ConnectionState::Open {
                info!("Closing connection to server.");
                let _ = self.transport.close(connection.id(), "shutdown").await;

                let start = Instant::now();
                while connection.state().await != ConnectionState::Closed {
                    sleep(SHUTDOWN_POLL).await;
                    if start.elapsed() > SHUTDOWN_TIMEOUT {
                        warn!(
                            "Timed out while waiting for the remote server to acknowledge the \
                             connection shutdown request"
                        );
                        break;
                    }
                }
            }
        }

        self.transport.stop().await;
    }

    // ------------------------------------------------------------------
    // Registration and traffic, delegated to the core
    // ------------------------------------------------------------------

    /// Subscribe to a topic
    pub async fn subscribe(
        &self,
        topic: &str,
        message_type: &DynamicType,
        callback: SubscriptionCallback,
        configuration: &Value,
    ) -> Result<()> {
        self.core
            .subscribe(topic, message_type, callback, configuration)
            .await
    }

    /// Advertise a topic this endpoint publishes
    pub fn advertise(
        &self,
        topic: &str,
        message_type: &DynamicType,
        configuration: &Value,
    ) -> Arc<TopicPublisher> {
        self.core.advertise(topic, message_type, configuration)
    }

    /// Serve a service for remote callers
    pub async fn create_client_proxy(
        &self,
        service: &str,
        request_type: &DynamicType,
        reply_type: Option<&DynamicType>,
        callback: RequestCallback,
        configuration: &Value,
    ) -> Result<()> {
        self.core
            .create_client_proxy(service, request_type, reply_type, callback, configuration)
            .await
    }

    /// Prepare to call a remote service
    pub async fn create_service_proxy(
        &self,
        service: &str,
        request_type: &DynamicType,
        reply_type: Option<&DynamicType>,
        configuration: &Value,
    ) -> Arc<ServiceProxy> {
        self.core
            .create_service_proxy(service, request_type, reply_type, configuration)
            .await
    }

    /// Send the host's reply to an inbound service request
    pub async fn receive_response(&self, call_handle: &CallHandle, response: &DynamicValue) {
        self.core.receive_response(call_handle, response).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_configure_rejects_missing_port() {
        let result = BridgeClient::configure(&json!({"security": "none"}));
        assert!(result.is_err());
    }

    #[test]
    fn test_configure_tcp_endpoint() {
        let client =
            BridgeClient::configure(&json!({"port": 19100, "security": "none"})).unwrap();
        assert_eq!(client.host_uri(), "ws://localhost:19100");
    }

    #[tokio::test]
    async fn test_spin_once_reports_missing_connection() {
        let client = BridgeClient::configure(&json!({
            "port": 59996,
            "security": "none",
            "host": "127.0.0.1"
        }))
        .unwrap();

        // Nothing is listening: the dial fails and no connection exists.
        assert!(!client.spin_once().await);
        assert!(!client.okay().await);

        // The next spin lands inside the debounce window and does not dial.
        let before = client.last_attempt.lock().await.unwrap();
        assert!(!client.spin_once().await);
        assert_eq!(client.last_attempt.lock().await.unwrap(), before);
    }

    #[tokio::test]
    async fn test_shutdown_without_connection() {
        let client = BridgeClient::configure(&json!({
            "port": 59995,
            "security": "none"
        }))
        .unwrap();
        client.shutdown().await;
        assert!(!client.okay().await);
    }
}

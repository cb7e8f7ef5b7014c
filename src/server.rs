//! # Bridge Server
//!
//! The accepting variant of the bridge endpoint. Mirrors the client's
//! transport setup: the same configuration surface selects plain TCP or
//! TLS, and accepted connections join the same endpoint core and registry
//! a client connection would. A configured JWT secret gates the WebSocket
//! upgrade: the token a peer offers as its subprotocol must carry a valid
//! HS256 signature before any frame is processed.

use std::net::SocketAddr;
use std::sync::Arc;

use serde_json::Value;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::header::SEC_WEBSOCKET_PROTOCOL;
use tokio_tungstenite::tungstenite::http::StatusCode;
use tracing::{debug, error, info, warn};

use crate::auth::validate_token;
use crate::config::{EndpointConfig, SearchPaths, SecurityMode};
use crate::encoding::make_encoding;
use crate::endpoint::{
    CallHandle, EndpointCore, RequestCallback, ServiceProxy, SubscriptionCallback,
    TopicPublisher,
};
use crate::error::{BridgeError, Result};
use crate::transport::tls::{load_certificates, load_private_key};
use crate::transport::{adopt_stream, ConnectionRegistry, TransportError};
use crate::types::{DynamicType, DynamicValue};

/// Address the server listens on
pub const DEFAULT_BIND_ADDRESS: &str = "0.0.0.0";

/// The server-side bridge endpoint
pub struct BridgeServer {
    core: Arc<EndpointCore>,
    registry: Arc<ConnectionRegistry>,
    port: u16,
    jwt_secret: Option<String>,
    tls_acceptor: Option<TlsAcceptor>,
    local_addr: RwLock<Option<SocketAddr>>,
    shutdown_tx: Mutex<Option<mpsc::Sender<()>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl BridgeServer {
    /// Configure a server from its configuration node, resolving file
    /// names through the environment's search paths.
    pub fn configure(configuration: &Value) -> Result<Self> {
        Self::configure_with_search(configuration, &SearchPaths::from_env())
    }

    /// Configure a server with explicit search paths
    pub fn configure_with_search(configuration: &Value, search: &SearchPaths) -> Result<Self> {
        let config = EndpointConfig::from_value(configuration)?;

        let encoding = make_encoding(config.encoding);
        let registry = Arc::new(ConnectionRegistry::new());
        let core = Arc::new(EndpointCore::new(
            "websocket_server",
            encoding,
            registry.clone(),
            config.max_pending_calls,
        ));

        let tls_acceptor = match config.security {
            SecurityMode::None => {
                info!("Security disabled, creating TCP endpoint...");
                None
            }
            SecurityMode::Tls => {
                info!("Security enabled, creating TLS endpoint...");
                Some(build_tls_acceptor(&config, search)?)
            }
        };

        Ok(Self {
            core,
            registry,
            port: config.port,
            jwt_secret: config.auth.jwt_secret,
            tls_acceptor,
            local_addr: RwLock::new(None),
            shutdown_tx: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// The endpoint core, for registration and traffic
    pub fn core(&self) -> &Arc<EndpointCore> {
        &self.core
    }

    /// The bound listen address, available once `run` has started
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.read().await
    }

    /// Accept peers until `shutdown` is called
    pub async fn run(&self) -> Result<()> {
        let listener = TcpListener::bind((DEFAULT_BIND_ADDRESS, self.port))
            .await
            .map_err(|e| {
                BridgeError::configuration(format!("failed to bind port {}: {}", self.port, e))
            })?;
        *self.local_addr.write().await = listener.local_addr().ok();

        let scheme = if self.tls_acceptor.is_some() {
            "wss"
        } else {
            "ws"
        };
        info!(
            "WebSocket server listening on {}://{}:{}",
            scheme, DEFAULT_BIND_ADDRESS, self.port
        );

        let (shutdown_tx, mut shutdown_rx) = mpsc::channel(1);
        *self.shutdown_tx.lock().await = Some(shutdown_tx);

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, peer_addr)) => {
                            self.handle_connection(stream, peer_addr).await;
                        }
                        Err(e) => {
                            error!("Failed to accept connection: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("WebSocket server shutting down");
                    break;
                }
            }
        }

        Ok(())
    }

    /// Upgrade one accepted stream and hand it to the endpoint core
    async fn handle_connection(&self, stream: TcpStream, peer_addr: SocketAddr) {
        debug!("New connection from {}", peer_addr);

        let registry = self.registry.clone();
        let core = self.core.clone();
        let jwt_secret = self.jwt_secret.clone();
        let tls_acceptor = self.tls_acceptor.clone();

        let task = tokio::spawn(async move {
            let callback = upgrade_callback(jwt_secret, peer_addr);

            let result: std::result::Result<JoinHandle<()>, TransportError> = async {
                match tls_acceptor {
                    Some(acceptor) => {
                        let tls_stream = acceptor
                            .accept(stream)
                            .await
                            .map_err(|e| TransportError::Tls(e.to_string()))?;
                        let ws_stream =
                            tokio_tungstenite::accept_hdr_async(tls_stream, callback)
                                .await
                                .map_err(|e| TransportError::ConnectFailed(e.to_string()))?;
                        let (_connection, task) =
                            adopt_stream(ws_stream, peer_addr.to_string(), registry, core).await;
                        Ok(task)
                    }
                    None => {
                        let ws_stream = tokio_tungstenite::accept_hdr_async(stream, callback)
                            .await
                            .map_err(|e| TransportError::ConnectFailed(e.to_string()))?;
                        let (_connection, task) =
                            adopt_stream(ws_stream, peer_addr.to_string(), registry, core).await;
                        Ok(task)
                    }
                }
            }
            .await;

            match result {
                Ok(connection_task) => {
                    // The connection task owns the rest of this peer's life.
                    let _ = connection_task.await;
                }
                Err(e) => {
                    warn!("WebSocket handshake failed for {}: {}", peer_addr, e);
                }
            }
        });

        let mut tasks = self.tasks.lock().await;
        tasks.retain(|t| !t.is_finished());
        tasks.push(task);
    }

    /// Stop accepting, close live connections, and stop their tasks
    pub async fn shutdown(&self) {
        if let Some(tx) = self.shutdown_tx.lock().await.take() {
            let _ = tx.send(()).await;
        }

        for connection in self.registry.all().await {
            let _ = connection.close("shutdown");
        }
        for task in self.tasks.lock().await.drain(..) {
            task.abort();
        }
        self.registry.clear().await;
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

/// Build the handshake callback: echo the offered subprotocol (the peer's
/// bearer token) and reject the upgrade when a configured secret does not
/// validate it.
fn upgrade_callback(
    jwt_secret: Option<String>,
    peer_addr: SocketAddr,
) -> impl FnOnce(&Request, Response) -> std::result::Result<Response, ErrorResponse> {
    move |request: &Request, mut response: Response| {
        match request.headers().get(SEC_WEBSOCKET_PROTOCOL) {
            Some(protocol) => {
                if let Some(secret) = &jwt_secret {
                    let offered = protocol.to_str().unwrap_or_default();
                    if !validate_token(offered, secret) {
                        warn!(
                            "Rejecting connection from {}: token validation failed",
                            peer_addr
                        );
                        return Err(unauthorized());
                    }
                }
                // The handshake only completes if the selected subprotocol
                // matches one the peer offered; echo the token back.
                response
                    .headers_mut()
                    .insert(SEC_WEBSOCKET_PROTOCOL, protocol.clone());
            }
            None => {
                if jwt_secret.is_some() {
                    warn!(
                        "Rejecting connection from {}: no authentication token was offered",
                        peer_addr
                    );
                    return Err(unauthorized());
                }
            }
        }
        Ok(response)
    }
}

fn unauthorized() -> ErrorResponse {
    let mut response = ErrorResponse::new(Some("invalid authentication token".to_string()));
    *response.status_mut() = StatusCode::UNAUTHORIZED;
    response
}

/// Load the server certificate chain and private key named in the
/// configuration and build the TLS acceptor.
fn build_tls_acceptor(config: &EndpointConfig, search: &SearchPaths) -> Result<TlsAcceptor> {
    let cert_name = config.cert.as_deref().ok_or_else(|| {
        BridgeError::configuration("TLS server mode requires a 'cert' setting")
    })?;
    let key_name = config.private_key.as_deref().ok_or_else(|| {
        BridgeError::configuration("TLS server mode requires a 'private_key' setting")
    })?;

    let cert_path = search.find_file(cert_name).ok_or_else(|| {
        error!(
            "Could not find the specified certificate '{}'. The following paths were checked: {:?}",
            cert_name,
            search.candidates(cert_name)
        );
        BridgeError::configuration(format!("certificate '{}' not found", cert_name))
    })?;
    let key_path = search.find_file(key_name).ok_or_else(|| {
        error!(
            "Could not find the specified private key '{}'. The following paths were checked: {:?}",
            key_name,
            search.candidates(key_name)
        );
        BridgeError::configuration(format!("private key '{}' not found", key_name))
    })?;

    let certs = load_certificates(&cert_path)?;
    let key = load_private_key(&key_path)?;

    let tls_config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| TransportError::Tls(format!("failed to build TLS acceptor: {}", e)))?;

    Ok(TlsAcceptor::from(Arc::new(tls_config)))
}

//! # TLS Transport
//!
//! WebSocket transport over TLS (`wss://` URIs). The client context trusts
//! the system certificate store plus any extra authorities named in the
//! configuration, resolved through the endpoint's search paths. Peer
//! certificates are verified with hostname matching. Any failure while
//! assembling the context fails the whole configure.

use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::RootCertStore;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_tungstenite::Connector;
use tracing::{debug, error, info};

use crate::config::SearchPaths;

use super::{
    adopt_stream, build_request, dial, Connection, ConnectionId, ConnectionRegistry,
    Transport, TransportError, TransportEvents, DEFAULT_CONNECT_TIMEOUT,
};

/// Transport over TLS
pub struct TlsTransport {
    registry: Arc<ConnectionRegistry>,
    events: Arc<dyn TransportEvents>,
    auth_token: Option<String>,
    tls_config: Arc<rustls::ClientConfig>,
    connect_timeout: Duration,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl TlsTransport {
    /// Build the TLS context and create the transport.
    ///
    /// `cert_authorities` entries are file names resolved against `search`;
    /// a name that cannot be resolved or loaded fails the configure.
    pub fn configure(
        cert_authorities: &[String],
        search: &SearchPaths,
        registry: Arc<ConnectionRegistry>,
        events: Arc<dyn TransportEvents>,
        auth_token: Option<String>,
    ) -> Result<Self, TransportError> {
        let tls_config = Arc::new(build_client_tls_config(cert_authorities, search)?);
        Ok(Self {
            registry,
            events,
            auth_token,
            tls_config,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Override the dial timeout
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

#[async_trait]
impl Transport for TlsTransport {
    async fn connect(&self, uri: &str) -> Result<Arc<Connection>, TransportError> {
        let request = build_request(uri, self.auth_token.as_deref())?;
        let connector = Connector::Rustls(self.tls_config.clone());

        match dial(request, Some(connector), self.connect_timeout).await {
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
                info!("Established TLS connection {} to '{}'", connection.id(), uri);
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

/// Assemble the client-side TLS configuration: system CA store, extra
/// authorities, peer verification with hostname matching.
pub(crate) fn build_client_tls_config(
    cert_authorities: &[String],
    search: &SearchPaths,
) -> Result<rustls::ClientConfig, TransportError> {
    let mut roots = RootCertStore::empty();

    let native = rustls_native_certs::load_native_certs().map_err(|e| {
        error!("Failed to load the default certificate authorities: {}", e);
        TransportError::Tls(format!("failed to load default certificate authorities: {}", e))
    })?;
    for cert in native {
        // Individual unparsable system certificates are skipped, matching
        // the platform store's own tolerance.
        let _ = roots.add(cert);
    }
    debug!("Loaded the default certificate authorities");

    for ca_file in cert_authorities {
        let Some(path) = search.find_file(ca_file) else {
            error!(
                "Could not find the specified certificate authority '{}'. The following paths were checked: {:?}",
                ca_file,
                search.candidates(ca_file)
            );
            return Err(TransportError::Tls(format!(
                "certificate authority '{}' not found",
                ca_file
            )));
        };

        for cert in load_certificates(&path)? {
            roots.add(cert).map_err(|e| {
                error!(
                    "Failed to load the specified certificate authority '{}': {}",
                    path.display(),
                    e
                );
                TransportError::Tls(format!(
                    "failed to load certificate authority '{}': {}",
                    path.display(),
                    e
                ))
            })?;
        }

        info!("Using an extra certificate authority '{}'", path.display());
    }

    Ok(rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth())
}

/// Read every PEM certificate out of a file
pub(crate) fn load_certificates(
    path: &std::path::Path,
) -> Result<Vec<CertificateDer<'static>>, TransportError> {
    let data = std::fs::read(path)?;
    let certs: Vec<_> = rustls_pemfile::certs(&mut Cursor::new(data))
        .collect::<Result<_, _>>()
        .map_err(|e| {
            TransportError::Tls(format!("failed to parse '{}': {}", path.display(), e))
        })?;

    if certs.is_empty() {
        return Err(TransportError::Tls(format!(
            "no certificates found in '{}'",
            path.display()
        )));
    }
    Ok(certs)
}

/// Read the first PEM private key out of a file
pub(crate) fn load_private_key(
    path: &std::path::Path,
) -> Result<PrivateKeyDer<'static>, TransportError> {
    let data = std::fs::read(path)?;
    rustls_pemfile::private_key(&mut Cursor::new(data))
        .map_err(|e| TransportError::Tls(format!("failed to parse '{}': {}", path.display(), e)))?
        .ok_or_else(|| {
            TransportError::Tls(format!("no private key found in '{}'", path.display()))
        })
}

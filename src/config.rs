//! # Endpoint Configuration
//!
//! Parses the configuration node the host hands to a bridge endpoint. The
//! node arrives pre-parsed (configuration file loading lives in the host);
//! only the keys recognized here have any effect, everything else is
//! ignored. File names for certificate material are resolved through
//! [`SearchPaths`], first relative to the host's configuration directory,
//! then relative to the user's home directory.

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::{debug, error};

use crate::auth::AuthConfig;
use crate::error::{BridgeError, Result};

/// Default peer hostname (client only)
pub const DEFAULT_HOSTNAME: &str = "localhost";

/// Default upper bound on in-flight outbound service calls
pub const DEFAULT_MAX_PENDING_CALLS: usize = 1024;

/// URI scheme prefix for TLS endpoints
pub const TLS_URI_PREFIX: &str = "wss://";

/// URI scheme prefix for plain TCP endpoints
pub const TCP_URI_PREFIX: &str = "ws://";

const KEY_HOST: &str = "host";
const KEY_PORT: &str = "port";
const KEY_SECURITY: &str = "security";
const KEY_CERT_AUTHORITIES: &str = "cert_authorities";
const KEY_CERT: &str = "cert";
const KEY_PRIVATE_KEY: &str = "private_key";
const KEY_AUTHENTICATION: &str = "authentication";
const KEY_ENCODING: &str = "encoding";
const KEY_MAX_PENDING_CALLS: &str = "max_pending_calls";

/// Whether the transport runs over plain TCP or TLS
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecurityMode {
    /// Plain TCP (`security: "none"`)
    None,
    /// TLS with peer verification (any other `security` value, or absent)
    Tls,
}

/// Wire encoding selection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncodingKind {
    /// JSON text frames (the only supported encoding)
    Json,
}

/// Parsed endpoint configuration
#[derive(Debug, Clone)]
pub struct EndpointConfig {
    /// Peer hostname (client) or bind host (server)
    pub host: String,
    /// TCP port
    pub port: u16,
    /// TCP vs TLS
    pub security: SecurityMode,
    /// Extra certificate authority file names (TLS only)
    pub cert_authorities: Vec<String>,
    /// Server certificate file name (TLS server only)
    pub cert: Option<String>,
    /// Server private key file name (TLS server only)
    pub private_key: Option<String>,
    /// Authentication material
    pub auth: AuthConfig,
    /// Wire encoding
    pub encoding: EncodingKind,
    /// Upper bound on the in-flight call ledger
    pub max_pending_calls: usize,
}

impl EndpointConfig {
    /// Parse the recognized keys out of a configuration node.
    ///
    /// A missing or invalid `port` and an unknown `encoding` value are
    /// configuration failures; everything else falls back to defaults.
    pub fn from_value(configuration: &Value) -> Result<Self> {
        let encoding = parse_encoding(configuration)?;
        let port = parse_port(configuration)?;
        let host = parse_hostname(configuration);

        let security = match configuration.get(KEY_SECURITY).and_then(Value::as_str) {
            Some("none") => SecurityMode::None,
            _ => SecurityMode::Tls,
        };

        let cert_authorities = configuration
            .get(KEY_CERT_AUTHORITIES)
            .and_then(Value::as_array)
            .map(|entries| {
                entries
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        let cert = configuration
            .get(KEY_CERT)
            .and_then(Value::as_str)
            .map(str::to_string);
        let private_key = configuration
            .get(KEY_PRIVATE_KEY)
            .and_then(Value::as_str)
            .map(str::to_string);

        let auth = AuthConfig::from_value(configuration.get(KEY_AUTHENTICATION));

        let max_pending_calls = configuration
            .get(KEY_MAX_PENDING_CALLS)
            .and_then(Value::as_u64)
            .map(|n| n as usize)
            .unwrap_or(DEFAULT_MAX_PENDING_CALLS);

        Ok(Self {
            host,
            port,
            security,
            cert_authorities,
            cert,
            private_key,
            auth,
            encoding,
            max_pending_calls,
        })
    }

    /// The peer URI this configuration dials (`ws://` or `wss://`)
    pub fn uri(&self) -> String {
        let prefix = match self.security {
            SecurityMode::Tls => TLS_URI_PREFIX,
            SecurityMode::None => TCP_URI_PREFIX,
        };
        format!("{}{}:{}", prefix, self.host, self.port)
    }
}

/// Parse the required `port` key
fn parse_port(configuration: &Value) -> Result<u16> {
    match configuration.get(KEY_PORT) {
        Some(node) => match node.as_u64().filter(|p| *p > 0 && *p <= u16::MAX as u64) {
            Some(port) => {
                debug!("Using port: {}", port);
                Ok(port as u16)
            }
            None => {
                error!(
                    "Could not parse an unsigned integer value for the port setting '{}'",
                    node
                );
                Err(BridgeError::configuration(format!(
                    "invalid port setting '{}'",
                    node
                )))
            }
        },
        None => {
            error!("You must specify a port setting in your WebSocket configuration!");
            Err(BridgeError::configuration("a port setting is required"))
        }
    }
}

/// Parse the `host` key, defaulting to `localhost`
fn parse_hostname(configuration: &Value) -> String {
    configuration
        .get(KEY_HOST)
        .and_then(Value::as_str)
        .unwrap_or(DEFAULT_HOSTNAME)
        .to_string()
}

/// Parse the `encoding` key; only `json` is recognized
fn parse_encoding(configuration: &Value) -> Result<EncodingKind> {
    match configuration.get(KEY_ENCODING) {
        Some(node) => {
            let requested = node.as_str().unwrap_or_default().to_ascii_lowercase();
            if requested == "json" {
                debug!("Using JSON encoding");
                Ok(EncodingKind::Json)
            } else {
                error!("Unknown encoding type was requested: '{}'", node);
                Err(BridgeError::configuration(format!(
                    "unknown encoding '{}'",
                    node
                )))
            }
        }
        None => {
            debug!("Using JSON encoding");
            Ok(EncodingKind::Json)
        }
    }
}

/// File search paths for certificate material.
///
/// Mirrors the host's search service contract: a file name is resolved
/// against the configuration directory first, then the home directory.
/// Absolute paths are used as-is.
#[derive(Debug, Clone, Default)]
pub struct SearchPaths {
    config_dir: Option<PathBuf>,
    home_dir: Option<PathBuf>,
}

impl SearchPaths {
    /// Search paths taken from the process environment
    pub fn from_env() -> Self {
        Self {
            config_dir: None,
            home_dir: std::env::var_os("HOME").map(PathBuf::from),
        }
    }

    /// Set the configuration directory to search first
    pub fn with_config_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config_dir = Some(dir.into());
        self
    }

    /// Set the home directory to search second
    pub fn with_home_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.home_dir = Some(dir.into());
        self
    }

    /// All candidate paths for a file name, in search order
    pub fn candidates(&self, file_name: &str) -> Vec<PathBuf> {
        if Path::new(file_name).is_absolute() {
            return vec![PathBuf::from(file_name)];
        }

        let mut paths = Vec::new();
        if let Some(dir) = &self.config_dir {
            paths.push(dir.join(file_name));
        }
        if let Some(dir) = &self.home_dir {
            paths.push(dir.join(file_name));
        }
        paths
    }

    /// Resolve a file name to the first candidate that exists on disk
    pub fn find_file(&self, file_name: &str) -> Option<PathBuf> {
        self.candidates(file_name).into_iter().find(|p| p.is_file())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_minimal_config() {
        let config = EndpointConfig::from_value(&json!({"port": 8080})).unwrap();
        assert_eq!(config.host, "localhost");
        assert_eq!(config.port, 8080);
        assert_eq!(config.security, SecurityMode::Tls);
        assert_eq!(config.encoding, EncodingKind::Json);
        assert_eq!(config.max_pending_calls, DEFAULT_MAX_PENDING_CALLS);
        assert_eq!(config.uri(), "wss://localhost:8080");
    }

    #[test]
    fn test_security_none_selects_tcp() {
        let config =
            EndpointConfig::from_value(&json!({"port": 80, "security": "none", "host": "peer"}))
                .unwrap();
        assert_eq!(config.security, SecurityMode::None);
        assert_eq!(config.uri(), "ws://peer:80");
    }

    #[test]
    fn test_missing_port_fails() {
        let result = EndpointConfig::from_value(&json!({"host": "peer"}));
        assert!(matches!(result, Err(BridgeError::Configuration(_))));
    }

    #[test]
    fn test_invalid_port_fails() {
        let result = EndpointConfig::from_value(&json!({"port": "not-a-number"}));
        assert!(matches!(result, Err(BridgeError::Configuration(_))));

        let result = EndpointConfig::from_value(&json!({"port": 123456}));
        assert!(matches!(result, Err(BridgeError::Configuration(_))));
    }

    #[test]
    fn test_unknown_encoding_fails() {
        let result = EndpointConfig::from_value(&json!({"port": 80, "encoding": "cbor"}));
        assert!(matches!(result, Err(BridgeError::Configuration(_))));
    }

    #[test]
    fn test_encoding_case_insensitive() {
        let config = EndpointConfig::from_value(&json!({"port": 80, "encoding": "JSON"})).unwrap();
        assert_eq!(config.encoding, EncodingKind::Json);
    }

    #[test]
    fn test_cert_authorities_list() {
        let config = EndpointConfig::from_value(
            &json!({"port": 443, "cert_authorities": ["ca1.pem", "ca2.pem"]}),
        )
        .unwrap();
        assert_eq!(config.cert_authorities, vec!["ca1.pem", "ca2.pem"]);
    }

    #[test]
    fn test_search_paths_resolution() {
        let config_dir = tempfile::tempdir().unwrap();
        let home_dir = tempfile::tempdir().unwrap();
        std::fs::write(config_dir.path().join("ca.pem"), "config").unwrap();
        std::fs::write(home_dir.path().join("ca.pem"), "home").unwrap();
        std::fs::write(home_dir.path().join("other.pem"), "home").unwrap();

        let search = SearchPaths::default()
            .with_config_dir(config_dir.path())
            .with_home_dir(home_dir.path());

        // Config dir wins over home dir.
        assert_eq!(
            search.find_file("ca.pem").unwrap(),
            config_dir.path().join("ca.pem")
        );
        assert_eq!(
            search.find_file("other.pem").unwrap(),
            home_dir.path().join("other.pem")
        );
        assert!(search.find_file("missing.pem").is_none());
        assert_eq!(search.candidates("missing.pem").len(), 2);
    }
}

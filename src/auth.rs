//! # Authentication
//!
//! Bearer-token handling for the bridge endpoint. The wire protocol carries
//! the token as a WebSocket subprotocol name on the opening handshake; that
//! quirk is isolated here behind [`attach_auth`] so the rest of the crate
//! never touches the header directly. Servers configured with a JWT secret
//! verify the offered token's HS256 signature before any frame flows; the
//! token's claims stay opaque to this endpoint.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use hmac::{Hmac, Mac};
use serde_json::Value;
use sha2::Sha256;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::header::{HeaderValue, SEC_WEBSOCKET_PROTOCOL};
use tracing::{debug, warn};

const KEY_TOKEN: &str = "token";
const KEY_JWT_SECRET: &str = "jwt_secret";

/// Parsed `authentication` configuration node
#[derive(Debug, Clone, Default)]
pub struct AuthConfig {
    /// Bearer token attached to each outbound handshake (client)
    pub token: Option<String>,
    /// Secret used to verify offered tokens (server)
    pub jwt_secret: Option<String>,
}

impl AuthConfig {
    /// Read `token` and `jwt_secret` out of the `authentication` node
    pub fn from_value(node: Option<&Value>) -> Self {
        let Some(node) = node else {
            return Self::default();
        };

        let token = node
            .get(KEY_TOKEN)
            .and_then(Value::as_str)
            .map(str::to_string);
        if token.is_some() {
            debug!("Loaded an authentication token");
        }

        let jwt_secret = node
            .get(KEY_JWT_SECRET)
            .and_then(Value::as_str)
            .map(str::to_string);
        if jwt_secret.is_some() {
            debug!("Loaded a JWT verification secret");
        }

        Self { token, jwt_secret }
    }

    /// Whether a bearer token is configured
    pub fn has_token(&self) -> bool {
        self.token.is_some()
    }
}

/// Attach a bearer token to an outgoing handshake request as a WebSocket
/// subprotocol entry.
///
/// A token that cannot be carried in the header, or a request that already
/// carries one, is tolerated: the attempt is logged at warn level and the
/// handshake proceeds without it.
pub fn attach_auth(request: &mut Request, token: &str) {
    if request.headers().contains_key(SEC_WEBSOCKET_PROTOCOL) {
        warn!("Failed to add subprotocol: a subprotocol is already attached");
        return;
    }

    match HeaderValue::from_str(token) {
        Ok(value) => {
            request.headers_mut().insert(SEC_WEBSOCKET_PROTOCOL, value);
        }
        Err(e) => {
            warn!("Failed to add subprotocol: {}", e);
        }
    }
}

/// Verify the HS256 signature of an offered token.
///
/// The token must have the `header.payload.signature` JWT shape with a
/// base64url-encoded signature. Claims are not inspected.
pub fn validate_token(token: &str, secret: &str) -> bool {
    let mut parts = token.split('.');
    let (Some(header), Some(payload), Some(signature), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return false;
    };

    let Ok(signature) = URL_SAFE_NO_PAD.decode(signature) else {
        return false;
    };

    let Ok(mut mac) = Hmac::<Sha256>::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(header.as_bytes());
    mac.update(b".");
    mac.update(payload.as_bytes());
    mac.verify_slice(&signature).is_ok()
}

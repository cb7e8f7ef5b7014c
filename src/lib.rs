//! # ws-bridge
//!
//! A bidirectional bridge endpoint that exposes publish/subscribe and
//! request/reply over a WebSocket transport, with an optional TLS layer.
//! It plugs into a larger integration framework that routes typed messages
//! between disparate middlewares; this crate is one such transport adapter,
//! able to act as a client (dialing a remote peer) or a server (accepting
//! peers).
//!
//! ## Architecture
//!
//! - **Encoding**: wire frame (de)serialization and the type-name registry
//! - **Transport**: WebSocket connections over TCP or TLS, one I/O task per
//!   connection, a shared registry of live connection handles
//! - **Endpoint**: the routing state machine: topic subscriptions and
//!   publications, service providers and proxies, the in-flight call
//!   ledger, and the startup-message log replayed to every new peer
//! - **Client / Server**: the dialing and accepting variants built on the
//!   same core
//!
//! ## Protocol
//!
//! A single peer-to-peer WebSocket carries multiplexed topic publications,
//! subscriptions, service advertisements, service calls, and service
//! responses, each a self-describing JSON text frame selected by its `op`
//! field. Topic and service compatibility is type-name equality; a peer
//! advertising the wrong type for a subscribed topic is blacklisted for
//! that topic until it re-advertises correctly.
//!
//! ## Usage
//!
//! ```ignore
//! use std::sync::Arc;
//! use serde_json::json;
//! use ws_bridge::{BridgeClient, DynamicType};
//!
//! # async fn example() -> ws_bridge::Result<()> {
//! let client = BridgeClient::configure(&json!({
//!     "host": "bridge.example.com",
//!     "port": 8443,
//!     "authentication": { "token": "..." },
//! }))?;
//!
//! client.subscribe(
//!     "chat/Msg",
//!     &DynamicType::new("Str"),
//!     Arc::new(|value| println!("got: {:?}", value)),
//!     &json!(null),
//! ).await?;
//!
//! loop {
//!     client.spin_once().await;
//! }
//! # }
//! ```

pub mod auth;
pub mod client;
pub mod config;
pub mod encoding;
pub mod endpoint;
pub mod error;
pub mod server;
pub mod transport;
pub mod types;

pub use auth::AuthConfig;
pub use client::BridgeClient;
pub use config::{EncodingKind, EndpointConfig, SearchPaths, SecurityMode};
pub use encoding::{Encoding, EncodingError, JsonEncoding, WireMessage};
pub use endpoint::{
    CallHandle, CallToken, EndpointCore, RequestCallback, ServiceClient, ServiceProxy,
    SubscriptionCallback, TopicPublisher,
};
pub use error::{BridgeError, Result};
pub use server::BridgeServer;
pub use transport::{
    Connection, ConnectionId, ConnectionRegistry, ConnectionState, TcpTransport, TlsTransport,
    Transport, TransportError,
};
pub use types::{DynamicType, DynamicValue};

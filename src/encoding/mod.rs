//! # Wire Encoding
//!
//! Serialization of bridge frames and the type-name registry. Encoding is
//! selected by name at configure time; JSON is the only registered encoding.
//! Encoders return an explicit error when they refuse a value; callers treat
//! a refusal as a logged drop and keep the connection.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::config::EncodingKind;
use crate::endpoint::EndpointCore;
use crate::transport::ConnectionId;
use crate::types::{DynamicType, DynamicValue};

pub mod json;

pub use json::{JsonEncoding, WireMessage};

/// Errors produced while encoding or interpreting wire frames
#[derive(Debug, Error, Clone)]
pub enum EncodingError {
    /// The frame is not a recognized bridge message
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    /// The named type has not been registered with the encoding
    #[error("type '{0}' is not registered")]
    UnknownType(String),

    /// A value's type does not match the type expected at this position
    #[error("value of type '{value}' cannot be encoded as '{expected}'")]
    TypeMismatch {
        /// The type the route expects
        expected: String,
        /// The type the value carries
        value: String,
    },

    /// Serialization to the wire form failed
    #[error("serialization failed: {0}")]
    Serialization(String),
}

/// A wire encoding: frame construction, frame interpretation, and the
/// registry of types both sides refer to by name.
#[async_trait]
pub trait Encoding: Send + Sync {
    /// Register a type so later encode/decode operations can resolve it.
    /// Re-registering a name keeps the first registration.
    fn add_type(&self, ty: DynamicType);

    /// Whether a type name has been registered
    fn has_type(&self, name: &str) -> bool;

    /// Encode a topic advertisement
    fn encode_advertise(
        &self,
        topic: &str,
        type_name: &str,
        id: &str,
        configuration: &Value,
    ) -> Result<String, EncodingError>;

    /// Encode a topic publication
    fn encode_publication(
        &self,
        topic: &str,
        type_name: &str,
        id: &str,
        message: &DynamicValue,
    ) -> Result<String, EncodingError>;

    /// Encode a topic subscription request
    fn encode_subscribe(
        &self,
        topic: &str,
        type_name: &str,
        id: &str,
        configuration: &Value,
    ) -> Result<String, EncodingError>;

    /// Encode a service advertisement
    fn encode_advertise_service(
        &self,
        service: &str,
        request_type: &str,
        reply_type: &str,
        id: &str,
        configuration: &Value,
    ) -> Result<String, EncodingError>;

    /// Encode an outbound service call
    fn encode_call_service(
        &self,
        service: &str,
        request_type: &str,
        request: &DynamicValue,
        id: &str,
        configuration: &Value,
    ) -> Result<String, EncodingError>;

    /// Encode a service response
    fn encode_service_response(
        &self,
        service: &str,
        reply_type: &str,
        id: &str,
        response: &DynamicValue,
        success: bool,
    ) -> Result<String, EncodingError>;

    /// Parse one frame and dispatch it into the endpoint's receive handlers.
    ///
    /// Conversion failures surface as errors to the caller; they never tear
    /// down the connection.
    async fn interpret(
        &self,
        frame: &str,
        endpoint: &EndpointCore,
        connection: ConnectionId,
    ) -> Result<(), EncodingError>;
}

/// Construct the encoding registered under the given kind
pub fn make_encoding(kind: EncodingKind) -> Arc<dyn Encoding> {
    match kind {
        EncodingKind::Json => Arc::new(JsonEncoding::new()),
    }
}

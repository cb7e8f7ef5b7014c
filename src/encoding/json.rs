//! # JSON Encoding
//!
//! The default (and only) wire encoding: each frame is a JSON object whose
//! `op` field selects the message kind. The shape is compatible with the
//! rosbridge-style gateway protocol, including the opaque `configuration`
//! object echoed through unchanged.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::endpoint::EndpointCore;
use crate::transport::ConnectionId;
use crate::types::{DynamicType, DynamicValue};

use super::{Encoding, EncodingError};

fn default_true() -> bool {
    true
}

/// One bridge frame, tagged by its `op` field
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum WireMessage {
    /// A peer announces it will publish a topic
    Advertise {
        topic: String,
        #[serde(rename = "type")]
        type_name: String,
        #[serde(default, skip_serializing_if = "String::is_empty")]
        id: String,
        #[serde(default, skip_serializing_if = "Value::is_null")]
        configuration: Value,
    },
    /// A peer stops publishing a topic
    Unadvertise {
        topic: String,
        #[serde(default, skip_serializing_if = "String::is_empty")]
        id: String,
    },
    /// One topic sample
    Publish {
        topic: String,
        msg: Value,
        #[serde(default, skip_serializing_if = "String::is_empty")]
        id: String,
    },
    /// A peer asks to receive a topic
    Subscribe {
        topic: String,
        #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
        type_name: Option<String>,
        #[serde(default, skip_serializing_if = "String::is_empty")]
        id: String,
        #[serde(default, skip_serializing_if = "Value::is_null")]
        configuration: Value,
    },
    /// A peer stops receiving a topic
    Unsubscribe {
        topic: String,
        #[serde(default, skip_serializing_if = "String::is_empty")]
        id: String,
    },
    /// A peer announces it serves a service
    AdvertiseService {
        service: String,
        request_type: String,
        #[serde(default)]
        response_type: String,
        #[serde(default, skip_serializing_if = "String::is_empty")]
        id: String,
        #[serde(default, skip_serializing_if = "Value::is_null")]
        configuration: Value,
    },
    /// A peer stops serving a service
    UnadvertiseService { service: String },
    /// A service request
    CallService {
        service: String,
        args: Value,
        #[serde(default, skip_serializing_if = "String::is_empty")]
        id: String,
        #[serde(default, skip_serializing_if = "Value::is_null")]
        configuration: Value,
    },
    /// A service reply
    ServiceResponse {
        service: String,
        #[serde(default)]
        values: Value,
        #[serde(default, skip_serializing_if = "String::is_empty")]
        id: String,
        #[serde(default = "default_true")]
        result: bool,
    },
}

/// JSON implementation of [`Encoding`]
#[derive(Debug, Default)]
pub struct JsonEncoding {
    types: RwLock<HashMap<String, DynamicType>>,
}

impl JsonEncoding {
    /// Create an encoding with an empty type registry
    pub fn new() -> Self {
        Self::default()
    }

    fn serialize(&self, message: &WireMessage) -> Result<String, EncodingError> {
        serde_json::to_string(message).map_err(|e| EncodingError::Serialization(e.to_string()))
    }

    /// Refuse values whose type is unregistered or does not match the route
    fn check_value(&self, expected: &str, value: &DynamicValue) -> Result<(), EncodingError> {
        if !self.has_type(expected) {
            return Err(EncodingError::UnknownType(expected.to_string()));
        }
        if value.type_name() != expected {
            return Err(EncodingError::TypeMismatch {
                expected: expected.to_string(),
                value: value.type_name().to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl Encoding for JsonEncoding {
    fn add_type(&self, ty: DynamicType) {
        let mut types = self.types.write().unwrap_or_else(|e| e.into_inner());
        let name = ty.name().to_string();
        if types.contains_key(&name) {
            debug!("Type '{}' is already registered, keeping the first registration", name);
            return;
        }
        types.insert(name, ty);
    }

    fn has_type(&self, name: &str) -> bool {
        self.types
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(name)
    }

    fn encode_advertise(
        &self,
        topic: &str,
        type_name: &str,
        id: &str,
        configuration: &Value,
    ) -> Result<String, EncodingError> {
        self.serialize(&WireMessage::Advertise {
            topic: topic.to_string(),
            type_name: type_name.to_string(),
            id: id.to_string(),
            configuration: configuration.clone(),
        })
    }

    fn encode_publication(
        &self,
        topic: &str,
        type_name: &str,
        id: &str,
        message: &DynamicValue,
    ) -> Result<String, EncodingError> {
        self.check_value(type_name, message)?;
        self.serialize(&WireMessage::Publish {
            topic: topic.to_string(),
            msg: message.data().clone(),
            id: id.to_string(),
        })
    }

    fn encode_subscribe(
        &self,
        topic: &str,
        type_name: &str,
        id: &str,
        configuration: &Value,
    ) -> Result<String, EncodingError> {
        self.serialize(&WireMessage::Subscribe {
            topic: topic.to_string(),
            type_name: Some(type_name.to_string()),
            id: id.to_string(),
            configuration: configuration.clone(),
        })
    }

    fn encode_advertise_service(
        &self,
        service: &str,
        request_type: &str,
        reply_type: &str,
        id: &str,
        configuration: &Value,
    ) -> Result<String, EncodingError> {
        self.serialize(&WireMessage::AdvertiseService {
            service: service.to_string(),
            request_type: request_type.to_string(),
            response_type: reply_type.to_string(),
            id: id.to_string(),
            configuration: configuration.clone(),
        })
    }

    fn encode_call_service(
        &self,
        service: &str,
        request_type: &str,
        request: &DynamicValue,
        id: &str,
        configuration: &Value,
    ) -> Result<String, EncodingError> {
        self.check_value(request_type, request)?;
        self.serialize(&WireMessage::CallService {
            service: service.to_string(),
            args: request.data().clone(),
            id: id.to_string(),
            configuration: configuration.clone(),
        })
    }

    fn encode_service_response(
        &self,
        service: &str,
        reply_type: &str,
        id: &str,
        response: &DynamicValue,
        success: bool,
    ) -> Result<String, EncodingError> {
        if !reply_type.is_empty() {
            self.check_value(reply_type, response)?;
        }
        self.serialize(&WireMessage::ServiceResponse {
            service: service.to_string(),
            values: response.data().clone(),
            id: id.to_string(),
            result: success,
        })
    }

    async fn interpret(
        &self,
        frame: &str,
        endpoint: &EndpointCore,
        connection: ConnectionId,
    ) -> Result<(), EncodingError> {
        let message: WireMessage = serde_json::from_str(frame)
            .map_err(|e| EncodingError::MalformedFrame(e.to_string()))?;

        match message {
            WireMessage::Advertise {
                topic,
                type_name,
                id,
                ..
            } => {
                endpoint
                    .receive_topic_advertisement(&topic, &type_name, &id, connection)
                    .await;
                Ok(())
            }
            WireMessage::Unadvertise { topic, id } => {
                endpoint
                    .receive_topic_unadvertisement(&topic, &id, connection)
                    .await;
                Ok(())
            }
            WireMessage::Publish { topic, msg, .. } => {
                endpoint.receive_publication(&topic, msg, connection).await
            }
            WireMessage::Subscribe {
                topic,
                type_name,
                id,
                ..
            } => {
                endpoint
                    .receive_subscribe_request(&topic, type_name.as_deref(), &id, connection)
                    .await;
                Ok(())
            }
            WireMessage::Unsubscribe { topic, id } => {
                endpoint
                    .receive_unsubscribe_request(&topic, &id, connection)
                    .await;
                Ok(())
            }
            WireMessage::AdvertiseService {
                service,
                request_type,
                response_type,
                ..
            } => {
                endpoint
                    .receive_service_advertisement(&service, &request_type, &response_type, connection)
                    .await;
                Ok(())
            }
            WireMessage::UnadvertiseService { service } => {
                endpoint
                    .receive_service_unadvertisement(&service, connection)
                    .await;
                Ok(())
            }
            WireMessage::CallService {
                service, args, id, ..
            } => {
                endpoint
                    .receive_service_request(&service, args, &id, connection)
                    .await
            }
            WireMessage::ServiceResponse {
                service,
                values,
                id,
                result,
            } => {
                if !result {
                    debug!(
                        "Service response {} for '{}' reports failure",
                        id, service
                    );
                }
                endpoint
                    .receive_service_response(&service, values, &id, connection)
                    .await
            }
        }
    }
}

//! # Host-Facing Handles
//!
//! The objects a host holds after registering with the endpoint: a
//! [`TopicPublisher`] per advertised topic and a [`ServiceProxy`] per
//! remote service it calls.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde_json::Value;

use crate::error::Result;
use crate::types::DynamicValue;

use super::{CallToken, EndpointCore, ServiceClient};

/// Publisher handle for one advertised topic.
///
/// The topic's advertisement is deferred: the first `publish` records it in
/// the startup log and announces it to every open connection, then every
/// publish (including the first) fans the sample out to the listeners.
pub struct TopicPublisher {
    core: Arc<EndpointCore>,
    topic: String,
    type_name: String,
    configuration: Value,
    advertised: AtomicBool,
}

impl TopicPublisher {
    pub(crate) fn new(
        core: Arc<EndpointCore>,
        topic: &str,
        type_name: &str,
        configuration: Value,
    ) -> Arc<Self> {
        Arc::new(Self {
            core,
            topic: topic.to_string(),
            type_name: type_name.to_string(),
            configuration,
            advertised: AtomicBool::new(false),
        })
    }

    /// The topic this publisher feeds
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Publish one sample to every listening connection
    pub async fn publish(&self, message: &DynamicValue) -> Result<()> {
        if !self.advertised.swap(true, Ordering::SeqCst) {
            self.core
                .startup_advertisement(&self.topic, &self.type_name, "", &self.configuration)
                .await;
            self.core
                .runtime_advertisement(&self.topic, &self.type_name, "", &self.configuration)
                .await;
        }
        self.core.publish(&self.topic, message).await
    }
}

/// Caller handle for one remote service
pub struct ServiceProxy {
    core: Arc<EndpointCore>,
    service: String,
}

impl ServiceProxy {
    pub(crate) fn new(core: Arc<EndpointCore>, service: &str) -> Arc<Self> {
        Arc::new(Self {
            core,
            service: service.to_string(),
        })
    }

    /// The service this proxy calls
    pub fn service(&self) -> &str {
        &self.service
    }

    /// Issue a call; the response is delivered to `client` with `token`.
    /// Returns the allocated call id.
    pub async fn call(
        &self,
        request: &DynamicValue,
        client: Arc<dyn ServiceClient>,
        token: CallToken,
    ) -> Result<String> {
        self.core
            .call_service(&self.service, request, client, token)
            .await
    }
}

//! # Endpoint Core
//!
//! The routing state machine shared by the client and server variants of
//! the bridge. It owns the topic and service routing tables, the in-flight
//! service-call ledger, the startup-message log replayed to every new peer,
//! and the reactions to connection lifecycle events.
//!
//! ## Concurrency
//!
//! Host-initiated operations and connection-task callbacks both land here.
//! All routing tables live behind one endpoint-wide mutex; the call ledger
//! and the monotonic call-id counter each have their own guard. For one
//! outbound call, id allocation, ledger insertion, encoding, and send run
//! in that order, so the ledger entry exists before any matching response
//! can be observed.

use std::any::Any;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::encoding::{Encoding, EncodingError};
use crate::error::{BridgeError, Result};
use crate::transport::{
    Connection, ConnectionId, ConnectionRegistry, ConnectionState, TransportEvents,
};
use crate::types::{DynamicType, DynamicValue};

pub mod publisher;

pub use publisher::{ServiceProxy, TopicPublisher};

/// Host callback invoked with each decoded publication
pub type SubscriptionCallback = Arc<dyn Fn(DynamicValue) + Send + Sync>;

/// Host callback invoked with each decoded inbound service request
pub type RequestCallback = Arc<dyn Fn(DynamicValue, CallHandle) + Send + Sync>;

/// Opaque host-side correlation token for an outbound call, surfaced
/// unchanged when the response is delivered
pub type CallToken = Arc<dyn Any + Send + Sync>;

/// Host-side receiver for responses to outbound service calls
#[async_trait]
pub trait ServiceClient: Send + Sync {
    /// Deliver the response to a call previously issued with this client
    async fn receive_response(&self, token: CallToken, response: DynamicValue);
}

/// Pins an inbound service request to the connection it arrived on, so the
/// host's reply can be routed back over the same connection.
#[derive(Debug, Clone)]
pub struct CallHandle {
    service_name: String,
    request_type: String,
    reply_type: String,
    id: String,
    connection: ConnectionId,
}

impl CallHandle {
    /// The service being called
    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    /// The request type name
    pub fn request_type(&self) -> &str {
        &self.request_type
    }

    /// The reply type name (empty when the proxy declared none)
    pub fn reply_type(&self) -> &str {
        &self.reply_type
    }

    /// The caller-chosen request id
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The connection the request arrived on
    pub fn connection(&self) -> ConnectionId {
        self.connection
    }
}

/// Per-topic state for a subscription this endpoint holds
struct TopicSubscribeInfo {
    type_name: String,
    callback: SubscriptionCallback,
    /// Connections whose publications must be dropped due to a type
    /// mismatch on their last advertisement
    blacklist: HashSet<ConnectionId>,
}

/// Per-topic state for a topic this endpoint publishes
#[derive(Default)]
struct TopicPublishInfo {
    type_name: String,
    /// Subscription ids per listening connection; an empty id set removes
    /// the connection entry
    listeners: HashMap<ConnectionId, HashSet<String>>,
}

/// Per-service state for a service this endpoint provides to remote callers
struct ClientProxyInfo {
    req_type: String,
    reply_type: Option<String>,
    callback: RequestCallback,
    configuration: Value,
}

/// Per-service state for a service this endpoint calls remotely
struct ServiceProviderInfo {
    req_type: String,
    reply_type: Option<String>,
    /// The connection of the remote provider; `None` until one advertises
    connection: Option<ConnectionId>,
    configuration: Value,
}

/// One in-flight outbound service call
struct ServiceRequestInfo {
    client: Arc<dyn ServiceClient>,
    token: CallToken,
    reply_type: Option<String>,
}

/// All routing state, behind the single endpoint mutex
#[derive(Default)]
struct RoutingTables {
    topic_subscribe: HashMap<String, TopicSubscribeInfo>,
    topic_publish: HashMap<String, TopicPublishInfo>,
    client_proxies: HashMap<String, ClientProxyInfo>,
    service_providers: HashMap<String, ServiceProviderInfo>,
    /// Pre-encoded frames replayed, in order, to every new connection
    startup_messages: Vec<String>,
}

/// The bounded in-flight call ledger. Entries whose connection has closed
/// are retained so a response can still be delivered after a reconnect;
/// the bound keeps abandoned entries from accumulating without limit.
struct PendingCalls {
    capacity: usize,
    entries: HashMap<String, ServiceRequestInfo>,
    order: VecDeque<String>,
}

impl PendingCalls {
    fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    /// Insert an entry, returning the ids evicted to stay within capacity
    fn insert(&mut self, id: String, info: ServiceRequestInfo) -> Vec<String> {
        let mut dropped = Vec::new();
        while self.entries.len() >= self.capacity {
            match self.order.pop_front() {
                Some(oldest) => {
                    if self.entries.remove(&oldest).is_some() {
                        dropped.push(oldest);
                    }
                }
                None => break,
            }
        }
        self.order.push_back(id.clone());
        self.entries.insert(id, info);
        dropped
    }

    fn remove(&mut self, id: &str) -> Option<ServiceRequestInfo> {
        self.entries.remove(id)
    }

    fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

/// The bridge endpoint state machine
pub struct EndpointCore {
    name: String,
    encoding: Arc<dyn Encoding>,
    registry: Arc<ConnectionRegistry>,
    tables: Mutex<RoutingTables>,
    pending_calls: Mutex<PendingCalls>,
    next_call_id: Mutex<u64>,
    connection_failed: AtomicBool,
}

impl EndpointCore {
    /// Create a core around an encoding and a connection registry
    pub fn new(
        name: impl Into<String>,
        encoding: Arc<dyn Encoding>,
        registry: Arc<ConnectionRegistry>,
        max_pending_calls: usize,
    ) -> Self {
        Self {
            name: name.into(),
            encoding,
            registry,
            tables: Mutex::new(RoutingTables::default()),
            pending_calls: Mutex::new(PendingCalls::new(max_pending_calls)),
            next_call_id: Mutex::new(1),
            connection_failed: AtomicBool::new(false),
        }
    }

    /// The encoding this endpoint speaks
    pub fn encoding(&self) -> &Arc<dyn Encoding> {
        &self.encoding
    }

    /// The registry of live connections
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Whether loop-back de-duplication applies. The transport is
    /// connection-oriented: publications are directed at specific
    /// subscriptions, never flooded, so nothing is ever internal.
    pub fn is_internal_message(&self) -> bool {
        false
    }

    // ------------------------------------------------------------------
    // Registration (host → endpoint)
    // ------------------------------------------------------------------

    /// Subscribe to a topic: registers the type, appends the subscription
    /// to the startup log, and stores the delivery callback.
    pub async fn subscribe(
        &self,
        topic: &str,
        message_type: &DynamicType,
        callback: SubscriptionCallback,
        configuration: &Value,
    ) -> Result<()> {
        debug!(
            "Subscribing to topic '{}' with topic type '{}'",
            topic,
            message_type.name()
        );

        self.encoding.add_type(message_type.clone());

        let frame =
            self.encoding
                .encode_subscribe(topic, message_type.name(), "", configuration)?;

        let mut tables = self.tables.lock().await;
        tables.startup_messages.push(frame);
        match tables.topic_subscribe.get_mut(topic) {
            Some(info) => {
                info.type_name = message_type.name().to_string();
                info.callback = callback;
            }
            None => {
                tables.topic_subscribe.insert(
                    topic.to_string(),
                    TopicSubscribeInfo {
                        type_name: message_type.name().to_string(),
                        callback,
                        blacklist: HashSet::new(),
                    },
                );
            }
        }
        Ok(())
    }

    /// Advertise a topic this endpoint will publish. The advertisement is
    /// deferred: it reaches the startup log and the live connections when
    /// the returned publisher first publishes.
    pub fn advertise(
        self: &Arc<Self>,
        topic: &str,
        message_type: &DynamicType,
        configuration: &Value,
    ) -> Arc<TopicPublisher> {
        debug!(
            "Advertising topic publisher '{}' with topic type '{}'",
            topic,
            message_type.name()
        );

        self.encoding.add_type(message_type.clone());
        TopicPublisher::new(
            self.clone(),
            topic,
            message_type.name(),
            configuration.clone(),
        )
    }

    /// Register this endpoint as the provider of `service` for remote
    /// callers. The service advertisement joins the startup log when the
    /// reply type is known.
    pub async fn create_client_proxy(
        &self,
        service: &str,
        request_type: &DynamicType,
        reply_type: Option<&DynamicType>,
        callback: RequestCallback,
        configuration: &Value,
    ) -> Result<()> {
        debug!(
            "Creating service client proxy for service '{}' with request type '{}'",
            service,
            request_type.name()
        );

        self.encoding.add_type(request_type.clone());
        if let Some(reply) = reply_type {
            self.encoding.add_type(reply.clone());
        }

        let mut tables = self.tables.lock().await;
        tables.client_proxies.insert(
            service.to_string(),
            ClientProxyInfo {
                req_type: request_type.name().to_string(),
                reply_type: reply_type.map(|t| t.name().to_string()),
                callback,
                configuration: configuration.clone(),
            },
        );

        // The advertisement tells the peer which services we serve; without
        // a reply type there is nothing complete to advertise yet.
        let advertisement = tables.client_proxies.get(service).and_then(|info| {
            info.reply_type
                .as_ref()
                .map(|reply| (info.req_type.clone(), reply.clone(), info.configuration.clone()))
        });
        if let Some((req_type, reply, proxy_config)) = advertisement {
            let frame = self.encoding.encode_advertise_service(
                service,
                &req_type,
                &reply,
                "",
                &proxy_config,
            )?;
            tables.startup_messages.push(frame);
        }
        Ok(())
    }

    /// Register a remote service this endpoint will call. No startup
    /// message: the remote side announces itself with an advertisement.
    pub async fn create_service_proxy(
        self: &Arc<Self>,
        service: &str,
        request_type: &DynamicType,
        reply_type: Option<&DynamicType>,
        configuration: &Value,
    ) -> Arc<ServiceProxy> {
        debug!(
            "Creating service server proxy for service '{}' with request type '{}'",
            service,
            request_type.name()
        );

        self.encoding.add_type(request_type.clone());
        if let Some(reply) = reply_type {
            self.encoding.add_type(reply.clone());
        }

        let mut tables = self.tables.lock().await;
        let existing_connection = tables
            .service_providers
            .get(service)
            .and_then(|info| info.connection);
        tables.service_providers.insert(
            service.to_string(),
            ServiceProviderInfo {
                req_type: request_type.name().to_string(),
                reply_type: reply_type.map(|t| t.name().to_string()),
                connection: existing_connection,
                configuration: configuration.clone(),
            },
        );
        drop(tables);

        ServiceProxy::new(self.clone(), service)
    }

    // ------------------------------------------------------------------
    // Outbound traffic
    // ------------------------------------------------------------------

    /// Record a topic advertisement in the publish table and the startup log
    pub async fn startup_advertisement(
        &self,
        topic: &str,
        type_name: &str,
        id: &str,
        configuration: &Value,
    ) {
        let mut tables = self.tables.lock().await;
        let info = tables.topic_publish.entry(topic.to_string()).or_default();
        info.type_name = type_name.to_string();

        match self
            .encoding
            .encode_advertise(topic, type_name, id, configuration)
        {
            Ok(frame) => tables.startup_messages.push(frame),
            Err(e) => error!("Failed to encode advertisement for topic '{}': {}", topic, e),
        }
    }

    /// Send a topic advertisement to every currently open connection
    pub async fn runtime_advertisement(
        &self,
        topic: &str,
        type_name: &str,
        id: &str,
        configuration: &Value,
    ) {
        let frame = match self
            .encoding
            .encode_advertise(topic, type_name, id, configuration)
        {
            Ok(frame) => frame,
            Err(e) => {
                error!("Failed to encode advertisement for topic '{}': {}", topic, e);
                return;
            }
        };

        for connection in self.registry.all().await {
            if connection.state().await == ConnectionState::Open {
                if let Err(e) = connection.send(frame.clone()) {
                    error!(
                        "Failed to advertise topic '{}' on connection {}: {}",
                        topic,
                        connection.id(),
                        e
                    );
                }
            }
        }
    }

    /// Publish one sample: one send per listening connection, zero work
    /// when nobody listens. Encode refusals drop that listener's send.
    pub async fn publish(&self, topic: &str, message: &DynamicValue) -> Result<()> {
        let (type_name, listeners) = {
            let tables = self.tables.lock().await;
            let info = tables.topic_publish.get(topic).ok_or_else(|| {
                BridgeError::unknown_route(format!("topic '{}' is not advertised", topic))
            })?;

            // If no one is listening, then don't bother publishing.
            if info.listeners.is_empty() {
                return Ok(());
            }
            (
                info.type_name.clone(),
                info.listeners.keys().copied().collect::<Vec<_>>(),
            )
        };

        for connection_id in listeners {
            // Encoded once per listener, leaving the door open for
            // per-peer filtering.
            let payload = match self.encoding.encode_publication(topic, &type_name, "", message)
            {
                Ok(payload) => payload,
                Err(e) => {
                    error!("Failed to encode publication on topic '{}': {}", topic, e);
                    continue;
                }
            };

            let Some(connection) = self.registry.get(connection_id).await else {
                warn!(
                    "Listener connection {} for topic '{}' is gone",
                    connection_id, topic
                );
                continue;
            };

            match connection.send(payload) {
                Ok(()) => debug!("Sent publication on topic '{}' to {}", topic, connection_id),
                Err(e) => error!(
                    "Failed to send publication on topic '{}', error: {}",
                    topic, e
                ),
            }
        }
        Ok(())
    }

    /// Issue an outbound service call. Returns the allocated call id.
    ///
    /// The ledger entry is inserted before anything can fail, matching the
    /// send ordering guarantee; an encode refusal silently discards the
    /// call and leaves the entry for the ledger bound to reclaim.
    pub async fn call_service(
        &self,
        service: &str,
        request: &DynamicValue,
        client: Arc<dyn ServiceClient>,
        token: CallToken,
    ) -> Result<String> {
        let id = {
            let mut next = self.next_call_id.lock().await;
            let id = *next;
            *next += 1;
            id.to_string()
        };

        let reply_type = {
            let tables = self.tables.lock().await;
            tables
                .service_providers
                .get(service)
                .and_then(|info| info.reply_type.clone())
        };

        {
            let mut pending = self.pending_calls.lock().await;
            for dropped in pending.insert(
                id.clone(),
                ServiceRequestInfo {
                    client,
                    token,
                    reply_type,
                },
            ) {
                warn!(
                    "Dropped the oldest in-flight service call '{}': the call ledger is full",
                    dropped
                );
            }
        }

        let (connection_id, req_type, configuration) = {
            let tables = self.tables.lock().await;
            let info = tables.service_providers.get(service).ok_or_else(|| {
                BridgeError::unknown_route(format!(
                    "no provider is known for service '{}'",
                    service
                ))
            })?;
            (info.connection, info.req_type.clone(), info.configuration.clone())
        };

        let Some(connection_id) = connection_id else {
            error!(
                "Cannot call service '{}': no remote provider has advertised it",
                service
            );
            return Err(BridgeError::unknown_route(format!(
                "service '{}' has no live provider",
                service
            )));
        };

        let payload = match self.encoding.encode_call_service(
            service,
            &req_type,
            request,
            &id,
            &configuration,
        ) {
            Ok(payload) => payload,
            Err(e) => {
                error!(
                    "Failed to encode call to service '{}' with request type '{}': {}",
                    service, req_type, e
                );
                return Ok(id);
            }
        };

        match self.registry.get(connection_id).await {
            Some(connection) => match connection.send(payload) {
                Ok(()) => debug!("Service request {}:: called service '{}'", id, service),
                Err(e) => error!("Failed to call service '{}', error: {}", service, e),
            },
            None => error!(
                "Cannot call service '{}': provider connection {} is gone",
                service, connection_id
            ),
        }

        Ok(id)
    }

    /// Send the host's reply to an inbound service request back over the
    /// connection the request arrived on.
    pub async fn receive_response(&self, call_handle: &CallHandle, response: &DynamicValue) {
        let payload = match self.encoding.encode_service_response(
            &call_handle.service_name,
            &call_handle.reply_type,
            &call_handle.id,
            response,
            true,
        ) {
            Ok(payload) => payload,
            Err(e) => {
                error!(
                    "Failed to encode response for service '{}': {}",
                    call_handle.service_name, e
                );
                return;
            }
        };

        match self.registry.get(call_handle.connection).await {
            Some(connection) => match connection.send(payload) {
                Ok(()) => debug!(
                    "Sent response {} for service '{}'",
                    call_handle.id, call_handle.service_name
                ),
                Err(e) => error!(
                    "Failed to send response for service '{}', error: {}",
                    call_handle.service_name, e
                ),
            },
            None => error!(
                "Cannot send response for service '{}': connection {} is gone",
                call_handle.service_name, call_handle.connection
            ),
        }
    }

    // ------------------------------------------------------------------
    // Incoming dispatch (invoked by Encoding::interpret)
    // ------------------------------------------------------------------

    /// A peer announced it publishes `topic`
    pub async fn receive_topic_advertisement(
        &self,
        topic: &str,
        type_name: &str,
        _id: &str,
        connection: ConnectionId,
    ) {
        let mut tables = self.tables.lock().await;
        match tables.topic_subscribe.get_mut(topic) {
            Some(info) => {
                if type_name != info.type_name {
                    info.blacklist.insert(connection);
                    warn!(
                        "A remote connection advertised the topic '{}', to which we want to \
                         subscribe, but with the wrong message type ({}). The expected type is \
                         '{}'. Messages from this connection will be ignored.",
                        topic, type_name, info.type_name
                    );
                } else {
                    info!(
                        "Connection {} is advertising topic '{}' with message type '{}'",
                        connection, topic, type_name
                    );
                    info.blacklist.remove(&connection);
                }
            }
            None => {
                warn!(
                    "A remote connection advertised the topic '{}' but no subscriber was found \
                     for this topic. Maybe you misspelled the topic name?",
                    topic
                );
            }
        }
    }

    /// A peer stopped publishing a topic. Connections are cleaned up when
    /// they close, so there is nothing to do here.
    pub async fn receive_topic_unadvertisement(
        &self,
        _topic: &str,
        _id: &str,
        _connection: ConnectionId,
    ) {
    }

    /// One topic sample arrived
    pub async fn receive_publication(
        &self,
        topic: &str,
        message: Value,
        connection: ConnectionId,
    ) -> std::result::Result<(), EncodingError> {
        let (callback, type_name) = {
            let tables = self.tables.lock().await;
            let Some(info) = tables.topic_subscribe.get(topic) else {
                return Ok(());
            };
            if info.blacklist.contains(&connection) {
                return Ok(());
            }
            (info.callback.clone(), info.type_name.clone())
        };

        if !self.encoding.has_type(&type_name) {
            return Err(EncodingError::UnknownType(type_name));
        }

        // Invoked outside the endpoint lock: the callback may publish or
        // call services itself.
        callback(DynamicValue::new(type_name, message));
        Ok(())
    }

    /// A peer asked to receive a topic
    pub async fn receive_subscribe_request(
        &self,
        topic: &str,
        type_name: Option<&str>,
        id: &str,
        connection: ConnectionId,
    ) {
        let mut tables = self.tables.lock().await;
        let inserted = !tables.topic_publish.contains_key(topic);
        let info = tables.topic_publish.entry(topic.to_string()).or_default();

        if inserted {
            warn!(
                "Received a subscription request for the topic '{}', which we are not currently \
                 advertising",
                topic
            );
        } else if let Some(requested) = type_name {
            if requested != info.type_name {
                error!(
                    "Received subscription request for topic '{}', but the requested message \
                     type '{}' does not match the one we are publishing ({})",
                    topic, requested, info.type_name
                );
                return;
            }
            debug!(
                "Received subscription request for topic '{}', with message type '{}'",
                topic, requested
            );
        }

        info.listeners
            .entry(connection)
            .or_default()
            .insert(id.to_string());
    }

    /// A peer stopped receiving a topic. An empty id removes the whole
    /// connection from the listener map.
    pub async fn receive_unsubscribe_request(
        &self,
        topic: &str,
        id: &str,
        connection: ConnectionId,
    ) {
        let mut tables = self.tables.lock().await;
        let Some(info) = tables.topic_publish.get_mut(topic) else {
            error!(
                "Received an unsubscription request for the topic '{}', which we are not \
                 currently advertising",
                topic
            );
            return;
        };

        let Some(listeners) = info.listeners.get_mut(&connection) else {
            return;
        };

        debug!("Received unsubscription request for topic '{}'", topic);

        if id.is_empty() {
            info.listeners.remove(&connection);
            return;
        }

        listeners.remove(id);
        if listeners.is_empty() {
            info.listeners.remove(&connection);
        }
    }

    /// A peer announced it serves a service. Last writer wins; any prior
    /// provider for the name is replaced.
    pub async fn receive_service_advertisement(
        &self,
        service: &str,
        request_type: &str,
        reply_type: &str,
        connection: ConnectionId,
    ) {
        debug!(
            "Received advertise for service '{}' with request type '{}', and reply type '{}'",
            service, request_type, reply_type
        );

        let mut tables = self.tables.lock().await;
        tables.service_providers.insert(
            service.to_string(),
            ServiceProviderInfo {
                req_type: request_type.to_string(),
                reply_type: if reply_type.is_empty() {
                    None
                } else {
                    Some(reply_type.to_string())
                },
                connection: Some(connection),
                configuration: Value::Null,
            },
        );
    }

    /// A peer stopped serving a service. Only honored when the recorded
    /// provider connection matches the source.
    pub async fn receive_service_unadvertisement(
        &self,
        service: &str,
        connection: ConnectionId,
    ) {
        let mut tables = self.tables.lock().await;
        match tables.service_providers.get(service) {
            None => {
                warn!(
                    "Received unadvertise for the service '{}', which we do not know a provider \
                     for",
                    service
                );
            }
            Some(info) => {
                debug!("Received unadvertise for service '{}'", service);
                if info.connection == Some(connection) {
                    tables.service_providers.remove(service);
                }
            }
        }
    }

    /// A service request arrived for a service this endpoint provides
    pub async fn receive_service_request(
        &self,
        service: &str,
        request: Value,
        id: &str,
        connection: ConnectionId,
    ) -> std::result::Result<(), EncodingError> {
        let (callback, handle) = {
            let tables = self.tables.lock().await;
            let Some(info) = tables.client_proxies.get(service) else {
                error!(
                    "Received a service request for a service '{}' that we are not providing!",
                    service
                );
                return Ok(());
            };
            (
                info.callback.clone(),
                CallHandle {
                    service_name: service.to_string(),
                    request_type: info.req_type.clone(),
                    reply_type: info.reply_type.clone().unwrap_or_default(),
                    id: id.to_string(),
                    connection,
                },
            )
        };

        if !self.encoding.has_type(&handle.request_type) {
            return Err(EncodingError::UnknownType(handle.request_type));
        }

        debug!("Received a service request for service '{}'", service);
        let request = DynamicValue::new(handle.request_type.clone(), request);
        callback(request, handle);
        Ok(())
    }

    /// A response arrived for an outbound call. The source connection is
    /// deliberately not checked against the original provider: ledger
    /// entries may outlive their connection across a reconnect.
    pub async fn receive_service_response(
        &self,
        service: &str,
        response: Value,
        id: &str,
        _connection: ConnectionId,
    ) -> std::result::Result<(), EncodingError> {
        let info = {
            let mut pending = self.pending_calls.lock().await;
            if !pending.contains(id) {
                error!(
                    "A remote connection provided a service response for service '{}' with an \
                     unrecognized id '{}'",
                    service, id
                );
                return Ok(());
            }

            let reply_type = pending
                .entries
                .get(id)
                .and_then(|entry| entry.reply_type.clone())
                .unwrap_or_default();
            if !reply_type.is_empty() && !self.encoding.has_type(&reply_type) {
                return Err(EncodingError::UnknownType(reply_type));
            }

            match pending.remove(id) {
                Some(info) => info,
                None => return Ok(()),
            }
        };

        debug!(
            "Service response {}:: received response for service '{}'",
            id, service
        );
        let reply_type = info.reply_type.unwrap_or_default();
        info.client
            .receive_response(info.token, DynamicValue::new(reply_type, response))
            .await;
        Ok(())
    }

    /// Number of in-flight outbound calls
    pub async fn pending_call_count(&self) -> usize {
        self.pending_calls.lock().await.len()
    }

    /// Whether a remote provider with a live connection is known for
    /// `service`
    pub async fn has_service_provider(&self, service: &str) -> bool {
        let tables = self.tables.lock().await;
        tables
            .service_providers
            .get(service)
            .map_or(false, |info| info.connection.is_some())
    }

    /// Number of connections listening to `topic`
    pub async fn listener_count(&self, topic: &str) -> usize {
        let tables = self.tables.lock().await;
        tables
            .topic_publish
            .get(topic)
            .map_or(0, |info| info.listeners.len())
    }
}

#[async_trait]
impl TransportEvents for EndpointCore {
    async fn on_open(&self, connection: Arc<Connection>) {
        debug!("{}: connection {} opened", self.name, connection.id());
        self.connection_failed.store(false, Ordering::SeqCst);

        let startup = self.tables.lock().await.startup_messages.clone();
        for frame in startup {
            if let Err(e) = connection.send(frame) {
                error!(
                    "Failed to replay a startup message on connection {}: {}",
                    connection.id(),
                    e
                );
            }
        }
    }

    async fn on_message(&self, connection: Arc<Connection>, frame: String) {
        debug!(
            "{}: message from connection {}: [[ {} ]]",
            self.name,
            connection.id(),
            frame
        );

        if let Err(e) = self
            .encoding
            .interpret(&frame, self, connection.id())
            .await
        {
            error!(
                "Failed to interpret a message from connection {}: {}",
                connection.id(),
                e
            );
        }
    }

    async fn on_close(&self, connection: Arc<Connection>) {
        debug!("{}: connection {} closed", self.name, connection.id());
        let id = connection.id();

        let mut tables = self.tables.lock().await;
        for info in tables.topic_subscribe.values_mut() {
            info.blacklist.remove(&id);
        }
        for info in tables.topic_publish.values_mut() {
            info.listeners.remove(&id);
        }
        tables
            .service_providers
            .retain(|_, info| info.connection != Some(id));

        // The call ledger stays: a response may still arrive after the
        // peer reconnects. The ledger bound reclaims abandoned entries.
    }

    async fn on_fail(&self, uri: &str, reason: &str) {
        // Print this only once for each time a connection fails.
        if !self.connection_failed.swap(true, Ordering::SeqCst) {
            error!(
                "Failed to establish a connection to the host '{}': {}. We will periodically \
                 attempt to reconnect.",
                uri, reason
            );
        }
    }
}

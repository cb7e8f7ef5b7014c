//! # Bridge Integration Tests
//!
//! End-to-end scenarios running a real server and client pair (or a raw
//! WebSocket peer) over loopback:
//! - Subscribe/publish happy path
//! - Type-mismatch blacklisting and recovery
//! - Service round-trips and ledger cleanup
//! - Startup-message replay across a reconnect
//! - Routing-table cleanup when a connection closes
//! - Unknown service responses leaving state untouched

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::sync::{mpsc, Mutex};
use tokio::time::{sleep, timeout};
use tokio_tungstenite::tungstenite::Message;

use ws_bridge::{
    BridgeClient, BridgeServer, CallToken, DynamicType, DynamicValue, ServiceClient,
};

/// Poll a condition until it holds or five seconds pass
async fn wait_for<F, Fut>(mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if condition().await {
            return true;
        }
        sleep(Duration::from_millis(50)).await;
    }
    false
}

/// Start a bridge server on the given port and wait for it to listen
async fn start_server(configuration: Value) -> Arc<BridgeServer> {
    let server = Arc::new(BridgeServer::configure(&configuration).expect("server configure"));
    let runner = server.clone();
    tokio::spawn(async move {
        let _ = runner.run().await;
    });
    assert!(
        wait_for(|| async { server.local_addr().await.is_some() }).await,
        "server did not start listening"
    );
    server
}

/// Connect a bridge client to a local port and spin until the connection
/// object exists
async fn connect_client(port: u16) -> Arc<BridgeClient> {
    let client = Arc::new(
        BridgeClient::configure(&json!({
            "host": "127.0.0.1",
            "port": port,
            "security": "none"
        }))
        .expect("client configure"),
    );
    assert!(client.spin_once().await, "client did not connect");
    client
}

struct RecordingServiceClient {
    responses: Mutex<Vec<DynamicValue>>,
}

impl RecordingServiceClient {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            responses: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl ServiceClient for RecordingServiceClient {
    async fn receive_response(&self, _token: CallToken, response: DynamicValue) {
        self.responses.lock().await.push(response);
    }
}

/// Scenario A: a publication flows from the client's publisher to the
/// server's subscriber with the expected type and payload.
#[tokio::test]
async fn test_subscribe_publish_happy_path() {
    let server = start_server(json!({"port": 19301, "security": "none"})).await;

    let received = Arc::new(std::sync::Mutex::new(Vec::new()));
    let sink = received.clone();
    server
        .subscribe(
            "chat/Msg",
            &DynamicType::new("Str"),
            Arc::new(move |value| sink.lock().unwrap().push(value)),
            &Value::Null,
        )
        .await
        .unwrap();

    let client = connect_client(19301).await;
    let publisher = client.advertise("chat/Msg", &DynamicType::new("Str"), &Value::Null);

    // The server's startup subscription reaches the client asynchronously;
    // keep publishing until delivery is observed.
    let delivered = wait_for(|| async {
        publisher
            .publish(&DynamicValue::new("Str", json!({"data": "hi"})))
            .await
            .unwrap();
        !received.lock().unwrap().is_empty()
    })
    .await;
    assert!(delivered, "publication never reached the subscriber");

    let values = received.lock().unwrap();
    assert_eq!(values[0].type_name(), "Str");
    assert_eq!(values[0].field("data"), Some(&json!("hi")));
    drop(values);

    client.shutdown().await;
    server.shutdown().await;
}

/// Scenario B: a wrong-typed advertisement blacklists the peer for that
/// topic; re-advertising the correct type lifts the blacklist.
#[tokio::test]
async fn test_type_mismatch_blacklist_and_recovery() {
    let server = start_server(json!({"port": 19302, "security": "none"})).await;

    let received = Arc::new(std::sync::Mutex::new(Vec::new()));
    let sink = received.clone();
    server
        .subscribe(
            "chat/Msg",
            &DynamicType::new("Str"),
            Arc::new(move |value| sink.lock().unwrap().push(value)),
            &Value::Null,
        )
        .await
        .unwrap();

    let (mut ws, _) = tokio_tungstenite::connect_async("ws://127.0.0.1:19302")
        .await
        .expect("raw connect");

    // Wrong type: the publication that follows must be dropped.
    ws.send(Message::Text(
        r#"{"op":"advertise","topic":"chat/Msg","type":"Int"}"#.to_string(),
    ))
    .await
    .unwrap();
    ws.send(Message::Text(
        r#"{"op":"publish","topic":"chat/Msg","msg":{"data":"blocked"}}"#.to_string(),
    ))
    .await
    .unwrap();

    sleep(Duration::from_millis(500)).await;
    assert!(
        received.lock().unwrap().is_empty(),
        "blacklisted publication was delivered"
    );

    // Correct type: delivery resumes.
    ws.send(Message::Text(
        r#"{"op":"advertise","topic":"chat/Msg","type":"Str"}"#.to_string(),
    ))
    .await
    .unwrap();
    ws.send(Message::Text(
        r#"{"op":"publish","topic":"chat/Msg","msg":{"data":"hi"}}"#.to_string(),
    ))
    .await
    .unwrap();

    assert!(
        wait_for(|| async { !received.lock().unwrap().is_empty() }).await,
        "publication after recovery was not delivered"
    );
    let values = received.lock().unwrap();
    assert_eq!(values.len(), 1);
    assert_eq!(values[0].field("data"), Some(&json!("hi")));
    drop(values);

    let _ = ws.close(None).await;
    server.shutdown().await;
}

/// Scenario C: a full service round-trip. The client calls, the server's
/// request callback replies, the client's service client receives the
/// response once and the ledger entry is gone.
#[tokio::test]
async fn test_service_round_trip() {
    let server = start_server(json!({"port": 19303, "security": "none"})).await;

    let server_core = server.core().clone();
    server
        .create_client_proxy(
            "add",
            &DynamicType::new("Pair"),
            Some(&DynamicType::new("Int")),
            Arc::new(move |request, handle| {
                let core = server_core.clone();
                tokio::spawn(async move {
                    let a = request.field("a").and_then(Value::as_i64).unwrap_or(0);
                    let b = request.field("b").and_then(Value::as_i64).unwrap_or(0);
                    core.receive_response(
                        &handle,
                        &DynamicValue::new("Int", json!({"value": a + b})),
                    )
                    .await;
                });
            }),
            &Value::Null,
        )
        .await
        .unwrap();

    let client = connect_client(19303).await;
    let proxy = client
        .create_service_proxy(
            "add",
            &DynamicType::new("Pair"),
            Some(&DynamicType::new("Int")),
            &Value::Null,
        )
        .await;

    // Wait for the server's startup advertisement to assign the provider.
    assert!(
        wait_for(|| async { client.core().has_service_provider("add").await }).await,
        "service provider never advertised"
    );

    let responses = RecordingServiceClient::new();
    let id = proxy
        .call(
            &DynamicValue::new("Pair", json!({"a": 1, "b": 2})),
            responses.clone(),
            Arc::new("call-token".to_string()),
        )
        .await
        .unwrap();
    assert_eq!(id, "1");

    assert!(
        wait_for(|| async { !responses.responses.lock().await.is_empty() }).await,
        "service response never arrived"
    );

    let values = responses.responses.lock().await;
    assert_eq!(values.len(), 1);
    assert_eq!(values[0].type_name(), "Int");
    assert_eq!(values[0].field("value"), Some(&json!(3)));
    drop(values);

    // The ledger no longer tracks the completed call.
    assert_eq!(client.core().pending_call_count().await, 0);

    client.shutdown().await;
    server.shutdown().await;
}

/// Scenario D: the client replays the identical startup log, in the same
/// order, on the connection it opens after a reconnect.
#[tokio::test]
async fn test_reconnect_replays_startup_messages() {
    // A raw server that collects two text frames per connection, then
    // closes the connection and reports what it saw.
    let listener = tokio::net::TcpListener::bind("127.0.0.1:19304")
        .await
        .expect("bind raw server");
    let (frames_tx, mut frames_rx) = mpsc::unbounded_channel::<Vec<String>>();

    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            let frames_tx = frames_tx.clone();
            tokio::spawn(async move {
                let Ok(mut ws) = tokio_tungstenite::accept_async(stream).await else {
                    return;
                };
                let mut frames = Vec::new();
                while frames.len() < 2 {
                    match ws.next().await {
                        Some(Ok(Message::Text(text))) => frames.push(text),
                        Some(Ok(_)) => {}
                        _ => break,
                    }
                }
                let _ = frames_tx.send(frames);
                let _ = ws.close(None).await;
            });
        }
    });

    let client = Arc::new(
        BridgeClient::configure(&json!({
            "host": "127.0.0.1",
            "port": 19304,
            "security": "none"
        }))
        .unwrap(),
    );
    client
        .subscribe(
            "chat/Msg",
            &DynamicType::new("Str"),
            Arc::new(|_| {}),
            &Value::Null,
        )
        .await
        .unwrap();
    client
        .create_client_proxy(
            "add",
            &DynamicType::new("Pair"),
            Some(&DynamicType::new("Int")),
            Arc::new(|_, _| {}),
            &Value::Null,
        )
        .await
        .unwrap();

    // Spin in the background: the first dial connects, the raw server
    // closes after the replay, and a later spin re-dials past the 2 s
    // debounce.
    let spinner = client.clone();
    let spin_task = tokio::spawn(async move {
        for _ in 0..60 {
            spinner.spin_once().await;
        }
    });

    let first = timeout(Duration::from_secs(10), frames_rx.recv())
        .await
        .expect("first replay timed out")
        .expect("raw server gone");
    let second = timeout(Duration::from_secs(10), frames_rx.recv())
        .await
        .expect("second replay timed out")
        .expect("raw server gone");

    assert_eq!(first.len(), 2);
    assert!(first[0].contains(r#""op":"subscribe""#));
    assert!(first[1].contains(r#""op":"advertise_service""#));
    assert_eq!(first, second, "replayed startup log differed across reconnect");

    spin_task.abort();
    client.shutdown().await;
}

/// Scenario E: when a connection closes, its listeners disappear and
/// subsequent publishes issue zero sends.
#[tokio::test]
async fn test_closed_connection_cleans_listeners() {
    let server = start_server(json!({"port": 19305, "security": "none"})).await;

    let (mut ws, _) = tokio_tungstenite::connect_async("ws://127.0.0.1:19305")
        .await
        .expect("raw connect");
    ws.send(Message::Text(
        r#"{"op":"subscribe","topic":"topic/a","id":"s1"}"#.to_string(),
    ))
    .await
    .unwrap();
    ws.send(Message::Text(
        r#"{"op":"subscribe","topic":"topic/b","id":"s2"}"#.to_string(),
    ))
    .await
    .unwrap();

    let core = server.core().clone();
    assert!(
        wait_for(|| async {
            core.listener_count("topic/a").await == 1 && core.listener_count("topic/b").await == 1
        })
        .await,
        "subscriptions were not recorded"
    );

    ws.close(None).await.unwrap();
    assert!(
        wait_for(|| async {
            core.listener_count("topic/a").await == 0 && core.listener_count("topic/b").await == 0
        })
        .await,
        "listeners survived the close"
    );

    // Publishing now is a no-op success for both topics.
    core.publish("topic/a", &DynamicValue::new("Str", json!({})))
        .await
        .unwrap();
    core.publish("topic/b", &DynamicValue::new("Str", json!({})))
        .await
        .unwrap();

    server.shutdown().await;
}

/// Scenario F: a service response with an unknown id is logged and
/// ignored; the endpoint keeps serving afterwards.
#[tokio::test]
async fn test_unknown_service_response_changes_nothing() {
    let server = start_server(json!({"port": 19306, "security": "none"})).await;
    let core = server.core().clone();

    let (mut ws, _) = tokio_tungstenite::connect_async("ws://127.0.0.1:19306")
        .await
        .expect("raw connect");
    ws.send(Message::Text(
        r#"{"op":"service_response","service":"add","values":{"value":3},"id":"999"}"#.to_string(),
    ))
    .await
    .unwrap();

    sleep(Duration::from_millis(300)).await;
    assert_eq!(core.pending_call_count().await, 0);

    // The connection survives and the endpoint still processes frames.
    ws.send(Message::Text(
        r#"{"op":"subscribe","topic":"still/alive","id":"s1"}"#.to_string(),
    ))
    .await
    .unwrap();
    assert!(
        wait_for(|| async { core.listener_count("still/alive").await == 1 }).await,
        "endpoint stopped processing frames"
    );

    let _ = ws.close(None).await;
    server.shutdown().await;
}

/// A client configured with a bearer token offers it as the WebSocket
/// subprotocol, and a server with a matching JWT secret accepts the dial.
#[tokio::test]
async fn test_bearer_token_round_trip() {
    // HS256 token signed with "s3cret" (header/payload/signature built by
    // the auth module's own test helper shape).
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;
    use base64::Engine;
    use hmac::{Hmac, Mac};
    use sha2::Sha256;

    let head = URL_SAFE_NO_PAD.encode(r#"{"alg":"HS256","typ":"JWT"}"#);
    let body = URL_SAFE_NO_PAD.encode(r#"{"sub":"bridge-peer"}"#);
    let mut mac = Hmac::<Sha256>::new_from_slice(b"s3cret").unwrap();
    mac.update(format!("{}.{}", head, body).as_bytes());
    let token = format!(
        "{}.{}.{}",
        head,
        body,
        URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes())
    );

    let server = start_server(json!({
        "port": 19307,
        "security": "none",
        "authentication": {"jwt_secret": "s3cret"}
    }))
    .await;

    let client = Arc::new(
        BridgeClient::configure(&json!({
            "host": "127.0.0.1",
            "port": 19307,
            "security": "none",
            "authentication": {"token": token}
        }))
        .unwrap(),
    );
    assert!(client.spin_once().await, "authenticated dial failed");
    assert!(
        wait_for(|| async { server.core().registry().count().await == 1 }).await,
        "server never registered the connection"
    );

    // A peer with no token is turned away before any frame flows.
    let rejected = tokio_tungstenite::connect_async("ws://127.0.0.1:19307").await;
    assert!(rejected.is_err(), "unauthenticated dial was accepted");

    client.shutdown().await;
    server.shutdown().await;
}

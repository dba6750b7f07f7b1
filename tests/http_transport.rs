use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use lilith_mcp::mcp::client::{ClientOptions, EnhancedClient};
use lilith_mcp::mcp::transport::{create_transport, HttpConfig, TransportConfig, TransportState};
use lilith_mcp::McpError;
use serde_json::{json, Value};

#[derive(Clone, Default)]
struct Upstream {
    hits: Arc<AtomicUsize>,
    seen: Arc<Mutex<Vec<Value>>>,
}

fn reply(body: &Value, result: Value) -> Response {
    Json(json!({"jsonrpc": "2.0", "id": body["id"], "result": result})).into_response()
}

async fn echo(State(up): State<Upstream>, Json(body): Json<Value>) -> Response {
    up.hits.fetch_add(1, Ordering::SeqCst);
    up.seen.lock().unwrap().push(body.clone());
    let params = body["params"].clone();
    reply(&body, json!({"echo": params}))
}

async fn slow(State(up): State<Upstream>, Json(body): Json<Value>) -> Response {
    up.hits.fetch_add(1, Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(120)).await;
    reply(&body, json!({"late": true}))
}

async fn flaky(State(up): State<Upstream>, Json(body): Json<Value>) -> Response {
    let n = up.hits.fetch_add(1, Ordering::SeqCst) + 1;
    if n < 3 {
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }
    reply(&body, json!({"attempt": n}))
}

async fn missing(State(up): State<Upstream>) -> Response {
    up.hits.fetch_add(1, Ordering::SeqCst);
    StatusCode::NOT_FOUND.into_response()
}

async fn streamed(State(up): State<Upstream>, Json(body): Json<Value>) -> Response {
    up.hits.fetch_add(1, Ordering::SeqCst);
    let event = json!({"jsonrpc": "2.0", "id": body["id"], "result": {"streamed": true}});
    (
        [("content-type", "text/event-stream")],
        format!(": keep-alive\n\ndata: {}\n\n", event),
    )
        .into_response()
}

async fn serve(upstream: Upstream) -> String {
    let app = Router::new()
        .route("/echo", post(echo))
        .route("/slow", post(slow))
        .route("/flaky", post(flaky))
        .route("/missing", post(missing))
        .route("/stream", post(streamed))
        .with_state(upstream);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}", addr)
}

fn http(url: String, timeout_ms: u64) -> TransportConfig {
    TransportConfig::Http(HttpConfig {
        url,
        headers: BTreeMap::new(),
        timeout_ms: Some(timeout_ms),
        max_retries: Some(3),
        retry_delay_ms: Some(10),
    })
}

async fn connected(config: TransportConfig) -> EnhancedClient {
    let options = ClientOptions::from_transport_config(&config);
    let client = EnhancedClient::new(create_transport(config).unwrap(), options);
    client.connect().await.unwrap();
    client
}

#[tokio::test]
async fn test_response_resolves_request() {
    let up = Upstream::default();
    let base = serve(up.clone()).await;
    let client = connected(http(format!("{}/echo", base), 1_000)).await;

    let result = client.request("tools/list", Some(json!({"cursor": "a"}))).await.unwrap();
    assert_eq!(result["echo"]["cursor"], "a");
    assert_eq!(up.hits.load(Ordering::SeqCst), 1);
    client.close().await.unwrap();
}

#[tokio::test]
async fn test_slow_upstream_times_out_and_stays_connected() {
    let up = Upstream::default();
    let base = serve(up.clone()).await;
    let client = connected(http(format!("{}/slow", base), 40)).await;

    let err = client.request("ping", None).await.unwrap_err();
    assert!(matches!(err, McpError::Timeout(_)), "got {:?}", err);
    assert_eq!(client.transport().state(), TransportState::Connected);
    // Timeouts are not retried.
    assert_eq!(up.hits.load(Ordering::SeqCst), 1);
    assert_eq!(client.pending_count(), 0);
}

#[tokio::test]
async fn test_server_errors_are_retried() {
    let up = Upstream::default();
    let base = serve(up.clone()).await;
    let client = connected(http(format!("{}/flaky", base), 1_000)).await;

    let result = client.request("ping", None).await.unwrap();
    assert_eq!(result["attempt"], 3);
    assert_eq!(up.hits.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_client_errors_are_not_retried() {
    let up = Upstream::default();
    let base = serve(up.clone()).await;
    let transport = create_transport(http(format!("{}/missing", base), 1_000)).unwrap();
    transport.connect().await.unwrap();

    let err = transport
        .send(&json!({"jsonrpc": "2.0", "id": 1, "method": "ping"}))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("404"), "got {}", err);
    assert_eq!(up.hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_sensitive_params_are_redacted_on_the_wire() {
    let up = Upstream::default();
    let base = serve(up.clone()).await;
    let client = connected(http(format!("{}/echo", base), 1_000)).await;

    client
        .call_tool("login", json!({"user": "ada", "password": "hunter2"}))
        .await
        .unwrap();

    let seen = up.seen.lock().unwrap().clone();
    assert_eq!(seen.len(), 1);
    let wire = seen[0].to_string();
    assert!(!wire.contains("hunter2"));
    assert_eq!(seen[0]["params"]["arguments"]["password"], "[REDACTED]");
    assert_eq!(seen[0]["params"]["arguments"]["user"], "ada");
}

#[tokio::test]
async fn test_event_stream_response_body_is_parsed() {
    let up = Upstream::default();
    let base = serve(up.clone()).await;
    let client = connected(http(format!("{}/stream", base), 1_000)).await;

    let result = client.request("ping", None).await.unwrap();
    assert_eq!(result["streamed"], true);
}

//! Wire-level transport tests against a mocked HTTP server.

use std::time::Duration;

use pretty_assertions::assert_eq;
use serde_json::json;
use tokio::sync::mpsc;
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use tests::{init_tracing, server_name};
use toolbus_core::{EventBus, McpError, TransportKind};
use toolbus_runtime::transport::{HttpTransport, NotificationRouter, SseTransport, Transport};

fn router_for(name: &str) -> NotificationRouter {
    let bus = EventBus::new();
    let (refresh_tx, _refresh_rx) = mpsc::unbounded_channel();
    NotificationRouter::new(server_name(name), bus.sender(), refresh_tx)
}

#[tokio::test]
async fn http_request_round_trips() {
    init_tracing();
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/mcp"))
        .and(body_partial_json(json!({"method": "ping"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "jsonrpc": "2.0",
            "id": 1,
            "result": {"pong": true},
        })))
        .mount(&server)
        .await;

    let transport = HttpTransport::new(
        server_name("search"),
        &format!("{}/mcp", server.uri()),
        Duration::from_secs(2),
    )
    .unwrap();

    let result = transport
        .request("ping", json!({}), Duration::from_secs(2))
        .await
        .unwrap();
    assert_eq!(result["pong"], true);
    assert_eq!(transport.kind(), TransportKind::Http);
    assert!(transport.description().starts_with("http:"));
}

#[tokio::test]
async fn http_server_error_maps_to_invoke_failed() {
    init_tracing();
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "jsonrpc": "2.0",
            "id": 1,
            "error": {"code": -32601, "message": "method not found"},
        })))
        .mount(&server)
        .await;

    let transport = HttpTransport::new(
        server_name("search"),
        &server.uri(),
        Duration::from_secs(2),
    )
    .unwrap();

    match transport
        .request("tools/call", json!({}), Duration::from_secs(2))
        .await
    {
        Err(McpError::InvokeFailed(msg)) => assert!(msg.contains("method not found")),
        other => panic!("unexpected: {:?}", other),
    }
}

#[tokio::test]
async fn http_status_failure_maps_to_invoke_failed() {
    init_tracing();
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let transport = HttpTransport::new(
        server_name("search"),
        &server.uri(),
        Duration::from_secs(2),
    )
    .unwrap();

    match transport
        .request("ping", json!({}), Duration::from_secs(2))
        .await
    {
        Err(McpError::InvokeFailed(msg)) => assert!(msg.contains("500")),
        other => panic!("unexpected: {:?}", other),
    }
}

#[tokio::test]
async fn http_slow_response_times_out() {
    init_tracing();
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_delay(Duration::from_secs(5))
                .set_body_json(json!({"jsonrpc": "2.0", "id": 1, "result": {}})),
        )
        .mount(&server)
        .await;

    let transport = HttpTransport::new(
        server_name("search"),
        &server.uri(),
        Duration::from_secs(2),
    )
    .unwrap();

    let result = transport
        .request("ping", json!({}), Duration::from_millis(100))
        .await;
    assert!(matches!(result, Err(McpError::InvokeTimeout(_))));
}

#[tokio::test]
async fn sse_connect_discovers_endpoint() {
    init_tracing();
    let server = MockServer::start().await;

    // The stream delivers the endpoint event and then ends; enough for
    // connect to succeed and advertise the POST target.
    Mock::given(method("GET"))
        .and(path("/sse"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "text/event-stream")
                .set_body_raw(
                    "event: endpoint\ndata: /messages?session=abc123\n\n",
                    "text/event-stream",
                ),
        )
        .mount(&server)
        .await;

    let transport = SseTransport::connect(
        server_name("files"),
        &format!("{}/sse", server.uri()),
        router_for("files"),
        Duration::from_secs(2),
    )
    .await
    .unwrap();

    assert_eq!(transport.kind(), TransportKind::Sse);
    assert!(transport.description().starts_with("sse:"));
    transport.close().await.unwrap();
}

#[tokio::test]
async fn sse_connect_times_out_without_endpoint_event() {
    init_tracing();
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "text/event-stream")
                // Keep-alive comment only; no endpoint event.
                .set_body_raw(": waiting\n\n", "text/event-stream")
                .set_delay(Duration::from_millis(10)),
        )
        .mount(&server)
        .await;

    let result = SseTransport::connect(
        server_name("files"),
        &server.uri(),
        router_for("files"),
        Duration::from_millis(300),
    )
    .await;

    match result {
        Err(McpError::ConnectTimeout(_)) | Err(McpError::ConnectFailed(_)) => {}
        other => panic!("unexpected: {:?}", other),
    }
}

#[tokio::test]
async fn sse_rejects_http_error_status() {
    init_tracing();
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let result = SseTransport::connect(
        server_name("files"),
        &server.uri(),
        router_for("files"),
        Duration::from_secs(1),
    )
    .await;

    match result {
        Err(McpError::ConnectFailed(msg)) => assert!(msg.contains("404")),
        other => panic!("unexpected: {:?}", other),
    }
}

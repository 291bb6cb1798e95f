//! SSE transport: HTTP+Server-Sent-Events MCP servers.
//!
//! The client opens a GET event-stream; the server's first `endpoint`
//! event advertises where requests are POSTed. Responses and
//! notifications both arrive on the stream, routed by request id.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use url::Url;

use toolbus_core::{McpError, ServerName, TransportKind};

use super::wire::{PendingCalls, RequestIdGen, RpcMessage, RpcNotification, RpcRequest};
use super::{route_message, NotificationRouter, Transport};

/// One decoded SSE frame.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SseEvent {
    pub event: String,
    pub data: String,
}

/// Incremental SSE frame decoder: feed chunks, get completed events.
#[derive(Default)]
pub struct SseDecoder {
    buffer: String,
    event: String,
    data: Vec<String>,
}

impl SseDecoder {
    pub fn push(&mut self, chunk: &str) -> Vec<SseEvent> {
        self.buffer.push_str(chunk);
        let mut events = Vec::new();
        while let Some(pos) = self.buffer.find('\n') {
            let line: String = self.buffer.drain(..=pos).collect();
            let line = line.trim_end_matches(['\n', '\r']);
            if line.is_empty() {
                if !self.event.is_empty() || !self.data.is_empty() {
                    let name = if self.event.is_empty() {
                        "message".to_string()
                    } else {
                        std::mem::take(&mut self.event)
                    };
                    events.push(SseEvent {
                        event: name,
                        data: self.data.join("\n"),
                    });
                    self.event.clear();
                    self.data.clear();
                }
            } else if let Some(rest) = line.strip_prefix("event:") {
                self.event = rest.trim_start().to_string();
            } else if let Some(rest) = line.strip_prefix("data:") {
                self.data.push(rest.strip_prefix(' ').unwrap_or(rest).to_string());
            } else if line.starts_with(':') {
                // comment, keep-alive
            }
            // id:/retry: fields are irrelevant to this client
        }
        events
    }
}

/// SSE MCP transport.
#[derive(Debug)]
pub struct SseTransport {
    server: ServerName,
    stream_url: String,
    post_url: String,
    client: reqwest::Client,
    pending: Arc<PendingCalls>,
    ids: RequestIdGen,
    reader: JoinHandle<()>,
}

impl SseTransport {
    /// Open the event stream and wait for the server to advertise its
    /// request endpoint, all within `connect_timeout`.
    pub async fn connect(
        server: ServerName,
        url: &str,
        router: NotificationRouter,
        connect_timeout: Duration,
    ) -> Result<Self, McpError> {
        let base = Url::parse(url)
            .map_err(|e| McpError::ConnectFailed(format!("invalid sse url: {}", e)))?;

        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .build()
            .map_err(|e| McpError::ConnectFailed(format!("failed to build HTTP client: {}", e)))?;

        let response = tokio::time::timeout(
            connect_timeout,
            client
                .get(url)
                .header(reqwest::header::ACCEPT, "text/event-stream")
                .send(),
        )
        .await
        .map_err(|_| McpError::ConnectTimeout(connect_timeout))?
        .map_err(|e| McpError::ConnectFailed(format!("event stream request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(McpError::ConnectFailed(format!(
                "event stream returned HTTP {}",
                status
            )));
        }

        let pending = Arc::new(PendingCalls::default());
        let (endpoint_tx, endpoint_rx) = oneshot::channel::<String>();

        let reader = {
            let pending = Arc::clone(&pending);
            let server = server.clone();
            tokio::spawn(async move {
                let mut stream = response.bytes_stream();
                let mut decoder = SseDecoder::default();
                let mut endpoint_tx = Some(endpoint_tx);
                while let Some(chunk) = stream.next().await {
                    let bytes = match chunk {
                        Ok(bytes) => bytes,
                        Err(e) => {
                            warn!(server = %server, error = %e, "event stream read failed");
                            break;
                        }
                    };
                    for event in decoder.push(&String::from_utf8_lossy(&bytes)) {
                        match event.event.as_str() {
                            "endpoint" => {
                                if let Some(tx) = endpoint_tx.take() {
                                    let _ = tx.send(event.data);
                                }
                            }
                            "message" => match serde_json::from_str::<RpcMessage>(&event.data) {
                                Ok(message) => {
                                    route_message(&server, message, &pending, &router);
                                }
                                Err(e) => {
                                    warn!(server = %server, error = %e, "unparsable frame on event stream");
                                }
                            },
                            other => {
                                debug!(server = %server, event = other, "ignoring sse event");
                            }
                        }
                    }
                }
                debug!(server = %server, "event stream ended");
                pending.fail_all(&McpError::ConnectFailed(
                    "event stream closed".to_string(),
                ));
            })
        };

        let endpoint = match tokio::time::timeout(connect_timeout, endpoint_rx).await {
            Ok(Ok(endpoint)) => endpoint,
            Ok(Err(_)) => {
                reader.abort();
                return Err(McpError::ConnectFailed(
                    "stream closed before endpoint event".to_string(),
                ));
            }
            Err(_) => {
                reader.abort();
                return Err(McpError::ConnectTimeout(connect_timeout));
            }
        };

        let post_url = base
            .join(&endpoint)
            .map_err(|e| {
                reader.abort();
                McpError::ConnectFailed(format!("invalid endpoint '{}': {}", endpoint, e))
            })?
            .to_string();

        info!(server = %server, url = %url, endpoint = %post_url, "sse transport connected");

        Ok(Self {
            server,
            stream_url: url.to_string(),
            post_url,
            client,
            pending,
            ids: RequestIdGen::default(),
            reader,
        })
    }
}

#[async_trait]
impl Transport for SseTransport {
    async fn request(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value, McpError> {
        let id = self.ids.next();
        let request = RpcRequest::new(id, method, params);
        let rx = self.pending.register(id);

        let posted = self
            .client
            .post(&self.post_url)
            .timeout(timeout)
            .json(&request)
            .send()
            .await;
        match posted {
            Ok(response) if !response.status().is_success() => {
                self.pending.forget(id);
                return Err(McpError::InvokeFailed(format!(
                    "request POST returned HTTP {}",
                    response.status()
                )));
            }
            Ok(_) => {}
            Err(e) => {
                self.pending.forget(id);
                if e.is_timeout() {
                    return Err(McpError::InvokeTimeout(timeout));
                }
                return Err(McpError::InvokeFailed(format!("request POST failed: {}", e)));
            }
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(McpError::InvokeFailed(
                "event stream closed while awaiting response".to_string(),
            )),
            Err(_) => {
                self.pending.forget(id);
                Err(McpError::InvokeTimeout(timeout))
            }
        }
    }

    async fn notify(&self, method: &str, params: Value) -> Result<(), McpError> {
        let notification = RpcNotification::new(method, params);
        self.client
            .post(&self.post_url)
            .json(&notification)
            .send()
            .await
            .map_err(|e| McpError::InvokeFailed(format!("notification failed: {}", e)))?;
        Ok(())
    }

    async fn close(&self) -> anyhow::Result<()> {
        self.reader.abort();
        self.pending
            .fail_all(&McpError::ConnectFailed("transport closed".to_string()));
        info!(server = %self.server, "sse transport closed");
        Ok(())
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Sse
    }

    fn description(&self) -> String {
        format!("sse:{}", self.stream_url)
    }
}

impl Drop for SseTransport {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

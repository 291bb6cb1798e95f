//! HTTP transport: one POST per request.
//!
//! Stateless on our side, so calls pipeline freely - reqwest's pool
//! handles connection reuse. Server-originated notifications do not
//! exist on this transport; servers that need a push channel use SSE.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, info};

use toolbus_core::{McpError, ServerName, TransportKind};

use super::wire::{RequestIdGen, RpcMessage, RpcNotification, RpcRequest};
use super::Transport;

/// Streamable-HTTP MCP transport.
pub struct HttpTransport {
    server: ServerName,
    url: String,
    client: reqwest::Client,
    ids: RequestIdGen,
}

impl HttpTransport {
    pub fn new(server: ServerName, url: &str, connect_timeout: Duration) -> Result<Self, McpError> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .build()
            .map_err(|e| McpError::ConnectFailed(format!("failed to build HTTP client: {}", e)))?;

        info!(server = %server, url = %url, "http transport ready");

        Ok(Self {
            server,
            url: url.to_string(),
            client,
            ids: RequestIdGen::default(),
        })
    }

    fn map_send_error(&self, e: reqwest::Error, timeout: Duration) -> McpError {
        if e.is_timeout() {
            McpError::InvokeTimeout(timeout)
        } else if e.is_connect() {
            McpError::ConnectFailed(format!("connection to {} failed: {}", self.url, e))
        } else {
            McpError::InvokeFailed(format!("request failed: {}", e))
        }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn request(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value, McpError> {
        let request = RpcRequest::new(self.ids.next(), method, params);
        debug!(server = %self.server, method = method, "posting request");

        let response = self
            .client
            .post(&self.url)
            .timeout(timeout)
            .json(&request)
            .send()
            .await
            .map_err(|e| self.map_send_error(e, timeout))?;

        let status = response.status();
        if !status.is_success() {
            return Err(McpError::InvokeFailed(format!(
                "server returned HTTP {}",
                status
            )));
        }

        let message: RpcMessage = response
            .json()
            .await
            .map_err(|e| McpError::InvokeFailed(format!("unparsable response: {}", e)))?;
        message.into_result()
    }

    async fn notify(&self, method: &str, params: Value) -> Result<(), McpError> {
        let notification = RpcNotification::new(method, params);
        self.client
            .post(&self.url)
            .json(&notification)
            .send()
            .await
            .map_err(|e| McpError::InvokeFailed(format!("notification failed: {}", e)))?;
        Ok(())
    }

    async fn close(&self) -> anyhow::Result<()> {
        // Nothing held open; the connection pool drops with the client.
        Ok(())
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Http
    }

    fn description(&self) -> String {
        format!("http:{}", self.url)
    }
}

//! Transport abstraction for MCP connections.
//!
//! A [`Transport`] is a connected channel speaking the JSON-RPC envelope:
//! `request` sends and awaits a reply under a deadline, `notify` is
//! fire-and-forget, `close` tears the channel down. The factory seam
//! exists so the connection manager can be exercised against mock
//! transports; the production factory builds stdio/HTTP/SSE transports
//! from a validated config.

pub mod http;
pub mod sse;
pub mod stdio;
pub mod wire;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use toolbus_core::{ClientEvent, EventSender, McpError, McpServerConfig, ServerName, TransportConfig, TransportKind};

pub use http::HttpTransport;
pub use sse::SseTransport;
pub use stdio::StdioTransport;

/// A connected MCP channel.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send a request and await its response within `timeout`.
    async fn request(&self, method: &str, params: Value, timeout: Duration)
        -> Result<Value, McpError>;

    /// Send a notification; no reply expected.
    async fn notify(&self, method: &str, params: Value) -> Result<(), McpError>;

    /// Tear down the channel. Best-effort: errors are for reporting,
    /// the transport is unusable afterwards either way.
    async fn close(&self) -> anyhow::Result<()>;

    fn kind(&self) -> TransportKind;

    /// Short form for logging, e.g. `stdio:search-server`.
    fn description(&self) -> String;
}

/// Routes server-originated notifications onto the manager's event bus.
///
/// Progress and resource updates become client events directly;
/// `tools/list_changed` is queued for the manager, which re-discovers
/// that server's tools under its lock.
#[derive(Clone)]
pub struct NotificationRouter {
    server: ServerName,
    events: EventSender,
    refresh_tx: mpsc::UnboundedSender<ServerName>,
}

impl NotificationRouter {
    pub fn new(
        server: ServerName,
        events: EventSender,
        refresh_tx: mpsc::UnboundedSender<ServerName>,
    ) -> Self {
        Self {
            server,
            events,
            refresh_tx,
        }
    }

    pub fn server(&self) -> &ServerName {
        &self.server
    }

    /// Handle one notification frame from the server.
    pub fn handle(&self, method: &str, params: Option<&Value>) {
        match method {
            "notifications/progress" => {
                let progress = params
                    .and_then(|p| p.get("progress"))
                    .and_then(Value::as_u64)
                    .unwrap_or(0);
                let total = params.and_then(|p| p.get("total")).and_then(Value::as_u64);
                self.events.emit(ClientEvent::Progress {
                    name: self.server.clone(),
                    progress,
                    total,
                });
            }
            "notifications/resources/updated" => {
                let uri = params
                    .and_then(|p| p.get("uri"))
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                self.events.emit(ClientEvent::ResourceUpdated {
                    name: self.server.clone(),
                    uri,
                });
            }
            "notifications/tools/list_changed" => {
                if self.refresh_tx.send(self.server.clone()).is_err() {
                    debug!(server = %self.server, "manager gone, dropping tools/list_changed");
                }
            }
            other => {
                debug!(server = %self.server, method = other, "ignoring notification");
            }
        }
    }
}

/// Builds connected transports. The production implementation is
/// [`DefaultTransportFactory`]; tests substitute mocks.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    /// Construct and connect a transport for `config`.
    ///
    /// The SSRF guard has already vetted any URL by the time this runs;
    /// this is the first point where a socket may open.
    async fn create(
        &self,
        config: &McpServerConfig,
        router: NotificationRouter,
        connect_timeout: Duration,
    ) -> Result<Arc<dyn Transport>, McpError>;
}

/// Production factory covering the three wire transports.
#[derive(Debug, Default)]
pub struct DefaultTransportFactory;

#[async_trait]
impl TransportFactory for DefaultTransportFactory {
    async fn create(
        &self,
        config: &McpServerConfig,
        router: NotificationRouter,
        connect_timeout: Duration,
    ) -> Result<Arc<dyn Transport>, McpError> {
        match &config.transport {
            TransportConfig::Stdio { command, args } => {
                let transport =
                    StdioTransport::spawn(config.name.clone(), command, args, &config.env, router)?;
                Ok(Arc::new(transport))
            }
            TransportConfig::Http { url } => {
                let transport = HttpTransport::new(config.name.clone(), url, connect_timeout)?;
                Ok(Arc::new(transport))
            }
            TransportConfig::Sse { url } => {
                let transport =
                    SseTransport::connect(config.name.clone(), url, router, connect_timeout)
                        .await?;
                Ok(Arc::new(transport))
            }
        }
    }
}

/// Close a transport, logging instead of propagating.
pub(crate) async fn close_quietly(transport: &dyn Transport, server: &ServerName) {
    if let Err(e) = transport.close().await {
        warn!(server = %server, error = %e, "transport close failed");
    }
}

/// Route one incoming frame: responses to their waiters, notifications
/// to the router. Shared by the framed transports (stdio, SSE).
pub(crate) fn route_message(
    server: &ServerName,
    message: wire::RpcMessage,
    pending: &wire::PendingCalls,
    router: &NotificationRouter,
) {
    if let Some(id) = message.response_id() {
        pending.complete(id, message.into_result());
    } else if message.is_notification() {
        let method = message.method.clone().unwrap_or_default();
        router.handle(&method, message.params.as_ref());
    } else {
        debug!(server = %server, "dropping frame with no id and no method");
    }
}

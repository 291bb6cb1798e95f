//! Mock transports and audit sinks for exercising the connection
//! manager without real servers.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex as PlMutex;
use serde_json::{json, Value};

use toolbus_core::{McpError, McpServerConfig, ServerName, TransportKind};
use toolbus_runtime::ssrf::{AuditEvent, AuditSink};
use toolbus_runtime::transport::{NotificationRouter, Transport, TransportFactory};

/// Scripted behavior for one mock server.
pub struct MockBehavior {
    /// Entries returned from `tools/list`.
    pub tools: PlMutex<Vec<Value>>,
    /// Entries returned from `prompts/list`.
    pub prompts: PlMutex<Vec<Value>>,
    /// When set, `ping` fails.
    pub fail_pings: AtomicBool,
    /// When set, `tools/call` fails.
    pub fail_calls: AtomicBool,
    /// Delay applied to `tools/call` before responding.
    pub call_delay: PlMutex<Duration>,
    /// When set, `close` reports an error (transport still unusable).
    pub fail_close: AtomicBool,
    /// Methods seen, in order.
    pub requests: PlMutex<Vec<String>>,
    /// Set once `close` ran.
    pub closed: AtomicBool,
}

impl Default for MockBehavior {
    fn default() -> Self {
        Self {
            tools: PlMutex::new(vec![Self::tool_entry("run")]),
            prompts: PlMutex::new(Vec::new()),
            fail_pings: AtomicBool::new(false),
            fail_calls: AtomicBool::new(false),
            call_delay: PlMutex::new(Duration::ZERO),
            fail_close: AtomicBool::new(false),
            requests: PlMutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }
    }
}

impl MockBehavior {
    /// A well-formed `tools/list` entry.
    pub fn tool_entry(name: &str) -> Value {
        json!({
            "name": name,
            "description": format!("mock tool {}", name),
            "inputSchema": {"type": "object", "properties": {}},
        })
    }

    pub fn methods(&self) -> Vec<String> {
        self.requests.lock().clone()
    }
}

/// Transport whose responses come from a [`MockBehavior`] script.
pub struct MockTransport {
    server: ServerName,
    kind: TransportKind,
    behavior: Arc<MockBehavior>,
    router: NotificationRouter,
}

impl MockTransport {
    /// Inject a server-originated notification, as if it arrived on the
    /// wire.
    pub fn push_notification(&self, method: &str, params: &Value) {
        self.router.handle(method, Some(params));
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn request(
        &self,
        method: &str,
        _params: Value,
        timeout: Duration,
    ) -> Result<Value, McpError> {
        self.behavior.requests.lock().push(method.to_string());
        let work = async {
            match method {
                "initialize" => Ok(json!({"capabilities": {}})),
                "tools/list" => Ok(json!({"tools": self.behavior.tools.lock().clone()})),
                "prompts/list" => Ok(json!({"prompts": self.behavior.prompts.lock().clone()})),
                "ping" => {
                    if self.behavior.fail_pings.load(Ordering::SeqCst) {
                        Err(McpError::InvokeFailed("ping failed".to_string()))
                    } else {
                        Ok(json!({}))
                    }
                }
                "tools/call" => {
                    let delay = *self.behavior.call_delay.lock();
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    if self.behavior.fail_calls.load(Ordering::SeqCst) {
                        Err(McpError::InvokeFailed("scripted failure".to_string()))
                    } else {
                        Ok(json!({
                            "content": [{"type": "text", "text": "ok"}],
                            "isError": false,
                        }))
                    }
                }
                other => Err(McpError::InvokeFailed(format!("unexpected method {}", other))),
            }
        };
        match tokio::time::timeout(timeout, work).await {
            Ok(result) => result,
            Err(_) => Err(McpError::InvokeTimeout(timeout)),
        }
    }

    async fn notify(&self, _method: &str, _params: Value) -> Result<(), McpError> {
        Ok(())
    }

    async fn close(&self) -> anyhow::Result<()> {
        self.behavior.closed.store(true, Ordering::SeqCst);
        if self.behavior.fail_close.load(Ordering::SeqCst) {
            anyhow::bail!("scripted close failure");
        }
        Ok(())
    }

    fn kind(&self) -> TransportKind {
        self.kind
    }

    fn description(&self) -> String {
        format!("mock:{}", self.server)
    }
}

/// Factory producing [`MockTransport`]s, with per-server scripting.
#[derive(Default)]
pub struct MockTransportFactory {
    behaviors: DashMap<String, Arc<MockBehavior>>,
    /// Fail the next N `create` calls per server.
    fail_next: DashMap<String, AtomicU32>,
    created: PlMutex<Vec<String>>,
    /// The most recently created transport per server, for notification
    /// injection.
    transports: DashMap<String, Arc<MockTransport>>,
}

impl MockTransportFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// The behavior script for `server`, created on first access.
    pub fn behavior(&self, server: &str) -> Arc<MockBehavior> {
        self.behaviors
            .entry(server.to_string())
            .or_insert_with(|| Arc::new(MockBehavior::default()))
            .clone()
    }

    /// Make the next `count` connection attempts for `server` fail.
    pub fn fail_next_connects(&self, server: &str, count: u32) {
        self.fail_next
            .entry(server.to_string())
            .or_insert_with(|| AtomicU32::new(0))
            .store(count, Ordering::SeqCst);
    }

    /// Descriptions of every transport ever constructed.
    pub fn created(&self) -> Vec<String> {
        self.created.lock().clone()
    }

    pub fn transport(&self, server: &str) -> Option<Arc<MockTransport>> {
        self.transports
            .get(server)
            .map(|entry| Arc::clone(entry.value()))
    }
}

#[async_trait]
impl TransportFactory for MockTransportFactory {
    async fn create(
        &self,
        config: &McpServerConfig,
        router: NotificationRouter,
        _connect_timeout: Duration,
    ) -> Result<Arc<dyn Transport>, McpError> {
        let server = config.name.as_str().to_string();
        self.created.lock().push(server.clone());

        if let Some(remaining) = self.fail_next.get(&server) {
            let left = remaining.load(Ordering::SeqCst);
            if left > 0 {
                remaining.store(left - 1, Ordering::SeqCst);
                return Err(McpError::ConnectFailed("scripted connect failure".to_string()));
            }
        }

        let transport = Arc::new(MockTransport {
            server: config.name.clone(),
            kind: config.transport.kind(),
            behavior: self.behavior(&server),
            router,
        });
        self.transports.insert(server, Arc::clone(&transport));
        Ok(transport)
    }
}

/// Audit sink that captures every event for assertions.
#[derive(Default)]
pub struct CapturingAuditSink {
    events: PlMutex<Vec<AuditEvent>>,
}

impl CapturingAuditSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().clone()
    }
}

impl AuditSink for CapturingAuditSink {
    fn record(&self, event: &AuditEvent) {
        self.events.lock().push(event.clone());
    }
}

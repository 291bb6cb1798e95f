//! Connection manager: the owner of per-server state machines.
//!
//! Lifecycle operations (add, remove, reconnect) run under the server's
//! entry in a [`KeyedMutex`], so the same server is strictly serialized
//! while distinct servers proceed in parallel. State is published by
//! replacing the whole per-server record - readers take lock-free
//! snapshots and never observe a half-updated record. URL transports
//! pass the SSRF guard before any socket opens, on every attempt.

mod health;
mod reconnect;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex as PlMutex;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use toolbus_core::{
    CallToolResult, ClientEvent, ClientSettings, ConnectionState, ConnectionSummary, EventBus,
    EventReceiver, EventSender, McpError, McpPrompt, McpServerConfig, McpTool, ServerName,
    ServerStats, ToolName, TransportKind,
};

use crate::lock::{KeyedMutex, LockDiagnostics};
use crate::ssrf::SsrfGuard;
use crate::transport::wire::initialize_params;
use crate::transport::{
    close_quietly, DefaultTransportFactory, NotificationRouter, Transport, TransportFactory,
};

pub(crate) use reconnect::ReconnectHandle;

/// Immutable per-server record; replaced wholesale on every transition.
struct ServerRecord {
    config: McpServerConfig,
    state: ConnectionState,
    transport: Option<Arc<dyn Transport>>,
    /// Liveness flag flipped by the health checker. Diagnostic only -
    /// never part of the authoritative state machine.
    unhealthy: AtomicBool,
    stats: PlMutex<ServerStats>,
}

/// Client-side MCP runtime: owns connections, registries, the health
/// ticker, and the reconnection scheduler.
pub struct ConnectionManager {
    settings: ClientSettings,
    servers: DashMap<ServerName, Arc<ServerRecord>>,
    tools: DashMap<ServerName, Arc<Vec<McpTool>>>,
    prompts: DashMap<ServerName, Arc<Vec<McpPrompt>>>,
    locks: KeyedMutex,
    guard: SsrfGuard,
    factory: Arc<dyn TransportFactory>,
    bus: EventBus,
    events: EventSender,
    refresh_tx: mpsc::UnboundedSender<ServerName>,
    reconnects: DashMap<ServerName, ReconnectHandle>,
    shutdown: CancellationToken,
    shutting_down: AtomicBool,
    tasks: PlMutex<Vec<JoinHandle<()>>>,
}

impl ConnectionManager {
    /// Production manager: default transports and SSRF guard, background
    /// tasks started. A `health_check_interval_ms` of zero disables the
    /// health ticker.
    pub fn new(settings: ClientSettings) -> Arc<Self> {
        Self::with_parts(settings, Arc::new(DefaultTransportFactory), SsrfGuard::new())
    }

    /// Manager with a custom transport factory (mocks in tests).
    pub fn with_factory(settings: ClientSettings, factory: Arc<dyn TransportFactory>) -> Arc<Self> {
        Self::with_parts(settings, factory, SsrfGuard::new())
    }

    pub fn with_parts(
        settings: ClientSettings,
        factory: Arc<dyn TransportFactory>,
        guard: SsrfGuard,
    ) -> Arc<Self> {
        let bus = EventBus::new();
        let events = bus.sender();
        let (refresh_tx, refresh_rx) = mpsc::unbounded_channel();

        let manager = Arc::new(Self {
            settings,
            servers: DashMap::new(),
            tools: DashMap::new(),
            prompts: DashMap::new(),
            locks: KeyedMutex::new(),
            guard,
            factory,
            bus,
            events,
            refresh_tx,
            reconnects: DashMap::new(),
            shutdown: CancellationToken::new(),
            shutting_down: AtomicBool::new(false),
            tasks: PlMutex::new(Vec::new()),
        });

        let mut tasks = Vec::new();
        if manager.settings.health_check_interval_ms > 0 {
            tasks.push(health::spawn_health_checker(&manager));
        }
        tasks.push(Self::spawn_refresh_listener(&manager, refresh_rx));
        *manager.tasks.lock() = tasks;

        manager
    }

    // =========================================================================
    // Lifecycle operations
    // =========================================================================

    /// Validate, SSRF-check, connect, and register a server.
    ///
    /// A rejected URL aborts before the state machine moves past Idle and
    /// before any transport exists. Re-adding a Connected server is an
    /// error; `remove_server` first.
    pub async fn add_server(&self, config: McpServerConfig) -> Result<(), McpError> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(McpError::ShutdownInProgress);
        }
        config.validate()?;
        if let Some(url) = config.transport.url() {
            self.guard.validate_resolved(url).await.into_result()?;
        }

        let name = config.name.clone();
        // A fresh add supersedes any scheduled reconnect for this name.
        self.cancel_reconnect(&name);

        self.locks
            .run_exclusive(name.as_str(), "add_server", || async {
                let already_connected = self
                    .servers
                    .get(&name)
                    .map(|record| record.state.is_connected())
                    .unwrap_or(false);
                if already_connected {
                    return Err(McpError::InvalidConfig(format!(
                        "server '{}' is already connected; remove it first",
                        name
                    )));
                }
                self.connect_locked(&config).await.map(|_| ())
            })
            .await
    }

    /// Remove a server from any state. Close failures are reported, not
    /// fatal; the entry always goes away. Removing an unknown server is
    /// a no-op.
    pub async fn remove_server(&self, name: &ServerName) -> Result<(), McpError> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(McpError::ShutdownInProgress);
        }
        self.cancel_reconnect(name);

        self.locks
            .run_exclusive(name.as_str(), "remove_server", || async {
                let Some((_, record)) = self.servers.remove(name) else {
                    debug!(server = %name, "remove for unknown server, nothing to do");
                    return;
                };
                if let Some(transport) = record.transport.as_ref() {
                    if let Err(e) = transport.close().await {
                        warn!(server = %name, error = %e, "close failed during removal");
                        self.events.emit(ClientEvent::ServerError {
                            name: name.clone(),
                            error: format!("close failed: {}", e),
                        });
                    }
                }
                self.tools.remove(name);
                self.prompts.remove(name);
                info!(server = %name, "server removed");
                self.events
                    .emit(ClientEvent::ServerRemoved { name: name.clone() });
            })
            .await;

        self.locks.clear(name.as_str());
        Ok(())
    }

    /// Invoke a tool on its owning server.
    ///
    /// No lifecycle lock is taken: the per-call ordering policy lives in
    /// the transport (stdio serializes, HTTP/SSE pipeline).
    pub async fn call_tool(&self, tool: &ToolName, args: Value) -> Result<CallToolResult, McpError> {
        let server = tool.server();
        let record = self
            .servers
            .get(&server)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| McpError::NotConnected(server.to_string()))?;

        let transport = match (&record.state, &record.transport) {
            (ConnectionState::Connected { .. }, Some(transport)) => Arc::clone(transport),
            _ => return Err(McpError::NotConnected(server.to_string())),
        };

        let known = self
            .tools
            .get(&server)
            .map(|list| list.iter().any(|t| t.name == *tool))
            .unwrap_or(false);
        if !known {
            return Err(McpError::InvokeFailed(format!("unknown tool '{}'", tool)));
        }

        let timeout = record.config.call_timeout(&self.settings);
        let params = json!({ "name": tool.bare(), "arguments": args });
        match transport.request("tools/call", params, timeout).await {
            Ok(value) => {
                let mut stats = record.stats.lock();
                stats.requests_served += 1;
                stats.consecutive_failures = 0;
                stats.last_error = None;
                drop(stats);
                serde_json::from_value(value)
                    .map_err(|e| McpError::InvokeFailed(format!("malformed tool result: {}", e)))
            }
            Err(e) => {
                let mut stats = record.stats.lock();
                stats.consecutive_failures += 1;
                stats.last_error = Some(e.to_string());
                drop(stats);
                Err(e)
            }
        }
    }

    /// Refresh the prompt registry from every connected server,
    /// collecting per-server failures instead of stopping at the first.
    pub async fn discover_prompts(&self) -> Result<(), McpError> {
        let targets: Vec<(ServerName, Arc<dyn Transport>)> = self
            .servers
            .iter()
            .filter_map(|entry| match (&entry.state, &entry.transport) {
                (ConnectionState::Connected { .. }, Some(transport)) => {
                    Some((entry.key().clone(), Arc::clone(transport)))
                }
                _ => None,
            })
            .collect();

        let mut failures = Vec::new();
        for (name, transport) in targets {
            match transport
                .request("prompts/list", json!({}), self.settings.call_timeout())
                .await
            {
                Ok(value) => {
                    let prompts = parse_prompts(&name, &value);
                    debug!(server = %name, count = prompts.len(), "prompts discovered");
                    self.prompts.insert(name, Arc::new(prompts));
                }
                Err(e) => {
                    warn!(server = %name, error = %e, "prompt discovery failed");
                    failures.push(format!("{}: {}", name, e));
                }
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(McpError::InvokeFailed(format!(
                "prompt discovery failed for {}",
                failures.join("; ")
            )))
        }
    }

    /// Stop everything: timers cancelled, transports closed best-effort,
    /// registries and locks cleared. Idempotent.
    pub async fn shutdown(&self) -> Result<(), McpError> {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            debug!("shutdown already performed");
            return Ok(());
        }
        info!("shutting down connection manager");
        self.shutdown.cancel();

        let scheduled: Vec<ServerName> = self.reconnects.iter().map(|e| e.key().clone()).collect();
        for name in scheduled {
            if let Some((_, handle)) = self.reconnects.remove(&name) {
                handle.abort();
            }
        }

        let records: Vec<(ServerName, Arc<ServerRecord>)> = self
            .servers
            .iter()
            .map(|entry| (entry.key().clone(), Arc::clone(entry.value())))
            .collect();
        let mut failures = Vec::new();
        for (name, record) in records {
            if let Some(transport) = record.transport.as_ref() {
                if let Err(e) = transport.close().await {
                    warn!(server = %name, error = %e, "close failed during shutdown");
                    failures.push(format!("{}: {}", name, e));
                }
            }
        }

        self.servers.clear();
        self.tools.clear();
        self.prompts.clear();
        self.locks.clear_all();
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }

        if !failures.is_empty() {
            warn!(
                count = failures.len(),
                "shutdown completed with close failures: {}",
                failures.join("; ")
            );
        }
        info!("connection manager shut down");
        Ok(())
    }

    // =========================================================================
    // Getters (side-effect free)
    // =========================================================================

    pub fn servers(&self) -> Vec<ServerName> {
        let mut names: Vec<ServerName> = self.servers.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Current state; unknown servers read as Idle.
    pub fn connection_state(&self, name: &ServerName) -> ConnectionState {
        self.servers
            .get(name)
            .map(|record| record.state.clone())
            .unwrap_or(ConnectionState::Idle)
    }

    pub fn tools(&self) -> Vec<McpTool> {
        self.tools
            .iter()
            .flat_map(|entry| entry.value().iter().cloned().collect::<Vec<_>>())
            .collect()
    }

    pub fn prompts(&self) -> Vec<McpPrompt> {
        self.prompts
            .iter()
            .flat_map(|entry| entry.value().iter().cloned().collect::<Vec<_>>())
            .collect()
    }

    pub fn transport_kind(&self, name: &ServerName) -> Result<TransportKind, McpError> {
        match self.connection_state(name) {
            ConnectionState::Connected { transport, .. } => Ok(transport),
            _ => Err(McpError::NotConnected(name.to_string())),
        }
    }

    pub fn connection_status(&self) -> ConnectionSummary {
        let mut summary = ConnectionSummary::default();
        for entry in self.servers.iter() {
            summary.total += 1;
            match entry.state {
                ConnectionState::Connected { .. } => summary.connected += 1,
                ConnectionState::Failed { .. } => summary.failed += 1,
                ConnectionState::Connecting { .. } => summary.connecting += 1,
                ConnectionState::Idle => {}
            }
        }
        summary
    }

    pub fn server_stats(&self, name: &ServerName) -> Option<ServerStats> {
        self.servers.get(name).map(|record| record.stats.lock().clone())
    }

    /// Health-checker verdict; orthogonal to `connection_state`.
    pub fn is_unhealthy(&self, name: &ServerName) -> bool {
        self.servers
            .get(name)
            .map(|record| record.unhealthy.load(Ordering::SeqCst))
            .unwrap_or(false)
    }

    /// Subscribe to this manager's event stream.
    pub fn subscribe(&self) -> EventReceiver {
        self.bus.subscribe()
    }

    pub fn lock_diagnostics(&self) -> Vec<LockDiagnostics> {
        self.locks.diagnostics()
    }

    pub fn settings(&self) -> &ClientSettings {
        &self.settings
    }

    // =========================================================================
    // Internals
    // =========================================================================

    /// Connect flow, caller holds the server's lock. Publishes
    /// Connecting, then Connected or Failed; registers tools/prompts on
    /// success and emits the matching event either way.
    async fn connect_locked(&self, config: &McpServerConfig) -> Result<usize, McpError> {
        let name = config.name.clone();

        // A reconnect may find a live-but-unhealthy transport; retire it
        // before dialing again.
        let previous = self
            .servers
            .get(&name)
            .and_then(|record| record.transport.clone());
        if let Some(old) = previous {
            close_quietly(old.as_ref(), &name).await;
        }

        self.publish(
            config,
            ConnectionState::Connecting {
                started_at: Utc::now(),
            },
            None,
        );

        match self.establish(config).await {
            Ok((transport, tools, prompts)) => {
                let tool_count = tools.len();
                let kind = transport.kind();
                self.tools.insert(name.clone(), Arc::new(tools));
                self.prompts.insert(name.clone(), Arc::new(prompts));
                self.publish(
                    config,
                    ConnectionState::Connected {
                        since: Utc::now(),
                        transport: kind,
                    },
                    Some(transport),
                );
                info!(server = %name, tool_count, "server connected");
                self.events.emit(ClientEvent::ServerAdded {
                    name,
                    tool_count,
                });
                Ok(tool_count)
            }
            Err(e) => {
                let sanitized = sanitize_error(&e.to_string());
                self.publish(
                    config,
                    ConnectionState::Failed {
                        since: Utc::now(),
                        error: sanitized.clone(),
                    },
                    None,
                );
                error!(server = %name, error = %sanitized, "connection failed");
                self.events.emit(ClientEvent::ServerError {
                    name,
                    error: sanitized,
                });
                Err(e)
            }
        }
    }

    /// Build the transport, run the initialize handshake, and discover
    /// tools/prompts. On any failure the transport is closed before the
    /// error propagates - no orphaned children or streams.
    async fn establish(
        &self,
        config: &McpServerConfig,
    ) -> Result<(Arc<dyn Transport>, Vec<McpTool>, Vec<McpPrompt>), McpError> {
        let name = config.name.clone();
        let router =
            NotificationRouter::new(name.clone(), self.events.clone(), self.refresh_tx.clone());
        let connect_timeout = self.settings.connect_timeout();

        let transport = self.factory.create(config, router, connect_timeout).await?;

        let handshake = async {
            transport
                .request("initialize", initialize_params(), connect_timeout)
                .await?;
            transport
                .notify("notifications/initialized", Value::Null)
                .await?;
            let tools_value = transport
                .request("tools/list", json!({}), connect_timeout)
                .await?;
            // Prompt support is optional; a refusal is not a failed connect.
            let prompts_value = match transport
                .request("prompts/list", json!({}), connect_timeout)
                .await
            {
                Ok(value) => value,
                Err(e) => {
                    debug!(server = %name, error = %e, "prompt discovery unsupported");
                    Value::Null
                }
            };
            Ok::<_, McpError>((tools_value, prompts_value))
        };

        match handshake.await {
            Ok((tools_value, prompts_value)) => {
                let tools = self.parse_tools(&name, &tools_value);
                let prompts = parse_prompts(&name, &prompts_value);
                Ok((transport, tools, prompts))
            }
            Err(e) => {
                close_quietly(transport.as_ref(), &name).await;
                Err(as_connect_error(e))
            }
        }
    }

    /// Atomic state publication: the whole record is replaced, request
    /// stats carry over, and the unhealthy flag resets.
    fn publish(
        &self,
        config: &McpServerConfig,
        state: ConnectionState,
        transport: Option<Arc<dyn Transport>>,
    ) {
        let name = config.name.clone();
        let stats = self
            .servers
            .get(&name)
            .map(|record| record.stats.lock().clone())
            .unwrap_or_default();
        self.servers.insert(
            name,
            Arc::new(ServerRecord {
                config: config.clone(),
                state,
                transport,
                unhealthy: AtomicBool::new(false),
                stats: PlMutex::new(stats),
            }),
        );
    }

    /// Parse a `tools/list` result, emitting `schema_validation_failed`
    /// for entries that cannot be registered.
    fn parse_tools(&self, server: &ServerName, value: &Value) -> Vec<McpTool> {
        let entries = value
            .get("tools")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        let mut tools = Vec::with_capacity(entries.len());
        for entry in entries {
            let raw_name = entry.get("name").and_then(Value::as_str).unwrap_or_default();
            let mut errors = Vec::new();

            if raw_name.is_empty() {
                errors.push("missing tool name".to_string());
            }
            let schema = entry.get("inputSchema").cloned().unwrap_or_else(|| json!({}));
            if !schema.is_object() {
                errors.push("inputSchema is not an object".to_string());
            }
            let qualified = match ToolName::qualified(server, raw_name) {
                Ok(name) => Some(name),
                Err(e) => {
                    if !raw_name.is_empty() {
                        errors.push(e.to_string());
                    }
                    None
                }
            };

            match (qualified, errors.is_empty()) {
                (Some(name), true) => {
                    tools.push(McpTool {
                        name,
                        description: entry
                            .get("description")
                            .and_then(Value::as_str)
                            .map(str::to_string),
                        input_schema: schema,
                        server: server.clone(),
                    });
                }
                _ => {
                    warn!(
                        server = %server,
                        tool = raw_name,
                        "skipping tool with invalid schema: {}",
                        errors.join(", ")
                    );
                    self.events.emit(ClientEvent::SchemaValidationFailed {
                        name: server.clone(),
                        tool: raw_name.to_string(),
                        errors,
                    });
                }
            }
        }
        tools
    }

    /// Re-discover one server's tools after a `tools/list_changed`
    /// notification, under the server's lock.
    async fn refresh_tools(&self, name: &ServerName) {
        self.locks
            .run_exclusive(name.as_str(), "refresh_tools", || async {
                let transport = self.servers.get(name).and_then(|record| {
                    record
                        .state
                        .is_connected()
                        .then(|| record.transport.clone())
                        .flatten()
                });
                let Some(transport) = transport else {
                    return;
                };
                match transport
                    .request("tools/list", json!({}), self.settings.call_timeout())
                    .await
                {
                    Ok(value) => {
                        let tools = self.parse_tools(name, &value);
                        debug!(server = %name, count = tools.len(), "tools refreshed");
                        self.tools.insert(name.clone(), Arc::new(tools));
                    }
                    Err(e) => {
                        warn!(server = %name, error = %e, "tool refresh failed");
                    }
                }
            })
            .await;
    }

    /// The listener holds only a weak handle: background tasks must not
    /// keep the manager alive after its last real owner drops it.
    fn spawn_refresh_listener(
        manager: &Arc<Self>,
        mut refresh_rx: mpsc::UnboundedReceiver<ServerName>,
    ) -> JoinHandle<()> {
        let weak = Arc::downgrade(manager);
        let shutdown = manager.shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    maybe = refresh_rx.recv() => match maybe {
                        Some(name) => {
                            let Some(manager) = weak.upgrade() else { break };
                            manager.refresh_tools(&name).await;
                        }
                        None => break,
                    },
                }
            }
        })
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.shutdown.cancel();
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        for entry in self.reconnects.iter() {
            entry.value().abort_ref();
        }
    }
}

/// Handshake-phase errors read as connect failures, not invoke failures.
fn as_connect_error(error: McpError) -> McpError {
    match error {
        McpError::InvokeTimeout(timeout) => McpError::ConnectTimeout(timeout),
        McpError::InvokeFailed(message) => McpError::ConnectFailed(message),
        other => other,
    }
}

/// Strip control characters and bound the length before an error string
/// lands in state or events.
fn sanitize_error(message: &str) -> String {
    const MAX_LEN: usize = 300;
    let cleaned: String = message
        .chars()
        .map(|c| if c.is_control() { ' ' } else { c })
        .collect();
    let mut out = cleaned.split_whitespace().collect::<Vec<_>>().join(" ");
    if out.len() > MAX_LEN {
        out.truncate(MAX_LEN);
        out.push_str("...");
    }
    out
}

fn parse_prompts(server: &ServerName, value: &Value) -> Vec<McpPrompt> {
    value
        .get("prompts")
        .and_then(Value::as_array)
        .map(|entries| {
            entries
                .iter()
                .filter_map(|entry| {
                    let name = entry.get("name").and_then(Value::as_str)?;
                    Some(McpPrompt {
                        name: name.to_string(),
                        description: entry
                            .get("description")
                            .and_then(Value::as_str)
                            .map(str::to_string),
                        arguments: entry
                            .get("arguments")
                            .and_then(Value::as_array)
                            .cloned()
                            .unwrap_or_default(),
                        server: server.clone(),
                    })
                })
                .collect()
        })
        .unwrap_or_default()
}

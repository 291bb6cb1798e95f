//! JSON-RPC 2.0 envelope for MCP traffic.
//!
//! Only the envelope lives here - requests, responses, notifications,
//! and the pending-call table shared by the framed transports. The full
//! MCP schema is the caller's concern.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex as PlMutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::oneshot;

use toolbus_core::McpError;

pub const JSONRPC_VERSION: &str = "2.0";
/// MCP protocol revision offered during the initialize handshake.
pub const PROTOCOL_VERSION: &str = "2024-11-05";

/// Outgoing request.
#[derive(Debug, Clone, Serialize)]
pub struct RpcRequest {
    pub jsonrpc: &'static str,
    pub id: u64,
    pub method: String,
    #[serde(skip_serializing_if = "Value::is_null")]
    pub params: Value,
}

impl RpcRequest {
    pub fn new(id: u64, method: &str, params: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            id,
            method: method.to_string(),
            params,
        }
    }
}

/// Outgoing notification (no id, no reply).
#[derive(Debug, Clone, Serialize)]
pub struct RpcNotification {
    pub jsonrpc: &'static str,
    pub method: String,
    #[serde(skip_serializing_if = "Value::is_null")]
    pub params: Value,
}

impl RpcNotification {
    pub fn new(method: &str, params: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            method: method.to_string(),
            params,
        }
    }
}

/// Error object in a response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcErrorObject {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Any incoming frame: a response (id + result/error) or a
/// server-originated notification (method, no id).
#[derive(Debug, Clone, Deserialize)]
pub struct RpcMessage {
    #[serde(default)]
    pub id: Option<Value>,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub params: Option<Value>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<RpcErrorObject>,
}

impl RpcMessage {
    /// Numeric id, if this is a response to one of our requests.
    pub fn response_id(&self) -> Option<u64> {
        self.id.as_ref().and_then(Value::as_u64)
    }

    pub fn is_notification(&self) -> bool {
        self.id.is_none() && self.method.is_some()
    }

    /// Resolve this response into the result value or a typed error.
    pub fn into_result(self) -> Result<Value, McpError> {
        if let Some(error) = self.error {
            return Err(McpError::InvokeFailed(format!(
                "server error {}: {}",
                error.code, error.message
            )));
        }
        Ok(self.result.unwrap_or(Value::Null))
    }
}

/// Monotonic request-id allocator.
#[derive(Debug, Default)]
pub struct RequestIdGen(AtomicU64);

impl RequestIdGen {
    pub fn next(&self) -> u64 {
        self.0.fetch_add(1, Ordering::Relaxed) + 1
    }
}

/// In-flight request table for transports whose responses arrive on a
/// separate read path (stdio pipe, SSE stream).
#[derive(Debug, Default)]
pub struct PendingCalls {
    inner: PlMutex<HashMap<u64, oneshot::Sender<Result<Value, McpError>>>>,
}

impl PendingCalls {
    pub fn register(&self, id: u64) -> oneshot::Receiver<Result<Value, McpError>> {
        let (tx, rx) = oneshot::channel();
        self.inner.lock().insert(id, tx);
        rx
    }

    /// Route an incoming response to its waiter. Unknown ids are dropped;
    /// late responses after a timeout land here.
    pub fn complete(&self, id: u64, result: Result<Value, McpError>) {
        if let Some(tx) = self.inner.lock().remove(&id) {
            let _ = tx.send(result);
        }
    }

    /// Forget a request after its caller gave up waiting.
    pub fn forget(&self, id: u64) {
        self.inner.lock().remove(&id);
    }

    /// Fail every in-flight request, used when the read path dies.
    pub fn fail_all(&self, error: &McpError) {
        let pending: Vec<_> = {
            let mut inner = self.inner.lock();
            inner.drain().collect()
        };
        for (_, tx) in pending {
            let _ = tx.send(Err(error.clone()));
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

/// Parameters for the initialize handshake.
pub fn initialize_params() -> Value {
    json!({
        "protocolVersion": PROTOCOL_VERSION,
        "capabilities": {},
        "clientInfo": {
            "name": "toolbus",
            "version": env!("CARGO_PKG_VERSION"),
        },
    })
}

//! Connection state machine types and per-server diagnostics.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::config::TransportKind;

/// Authoritative per-server connection state.
///
/// Exactly one state per server at any moment; the connection manager is
/// the sole mutator and publishes transitions by replacing the whole
/// server record, never by mutating in place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ConnectionState {
    /// Not connected and no attempt in flight
    Idle,
    /// Connection attempt in flight
    Connecting { started_at: DateTime<Utc> },
    /// Handshake complete, tools/prompts registered
    Connected {
        since: DateTime<Utc>,
        transport: TransportKind,
    },
    /// Last attempt failed; `error` is sanitized for display
    Failed {
        since: DateTime<Utc>,
        error: String,
    },
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected { .. })
    }

    pub fn status_name(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Connecting { .. } => "connecting",
            Self::Connected { .. } => "connected",
            Self::Failed { .. } => "failed",
        }
    }
}

/// Per-server request counters, diagnostic only.
///
/// Never authoritative for the state machine: a server can rack up
/// failures here while `ConnectionState` stays Connected until the
/// health checker and reconnect scheduler act on it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerStats {
    pub requests_served: u64,
    pub consecutive_failures: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// Aggregate counts across all servers, for the status line.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionSummary {
    pub connected: usize,
    pub failed: usize,
    pub connecting: usize,
    pub total: usize,
}

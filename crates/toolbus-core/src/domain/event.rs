//! Client events emitted by the connection manager.
//!
//! Consumers (diagnostics panel, terminal UI, audit log) subscribe through
//! the manager's event bus and decide which kinds they care about. Events
//! are facts that happened; they are never mutated and carry everything a
//! renderer needs without reaching back into the manager.

use serde::{Deserialize, Serialize};

use crate::domain::ids::ServerName;

/// Everything the connection manager reports to the outside world.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientEvent {
    /// Server connected and its tools were registered
    ServerAdded { name: ServerName, tool_count: usize },
    /// A lifecycle or invocation failure worth surfacing
    ServerError { name: ServerName, error: String },
    /// Server removed and its registrations cleared
    ServerRemoved { name: ServerName },
    /// Health probe failed; authoritative state unchanged
    ServerUnhealthy { name: ServerName, error: String },
    /// A reconnect attempt was scheduled
    ReconnectionScheduled {
        name: ServerName,
        attempt: u32,
        delay_ms: u64,
    },
    /// Reconnect succeeded after `attempts` tries
    ReconnectionSucceeded { name: ServerName, attempts: u32 },
    /// Reconnect gave up
    ReconnectionFailed {
        name: ServerName,
        attempts: u32,
        reason: String,
    },
    /// Progress notification forwarded from a server
    Progress {
        name: ServerName,
        progress: u64,
        total: Option<u64>,
    },
    /// Resource-updated notification forwarded from a server
    ResourceUpdated { name: ServerName, uri: String },
    /// A discovered tool was skipped because its schema was malformed
    SchemaValidationFailed {
        name: ServerName,
        tool: String,
        errors: Vec<String>,
    },
}

impl ClientEvent {
    /// Stable tag for subscribers that filter by kind.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::ServerAdded { .. } => "server_added",
            Self::ServerError { .. } => "server_error",
            Self::ServerRemoved { .. } => "server_removed",
            Self::ServerUnhealthy { .. } => "server_unhealthy",
            Self::ReconnectionScheduled { .. } => "reconnection_scheduled",
            Self::ReconnectionSucceeded { .. } => "reconnection_succeeded",
            Self::ReconnectionFailed { .. } => "reconnection_failed",
            Self::Progress { .. } => "progress",
            Self::ResourceUpdated { .. } => "resource_updated",
            Self::SchemaValidationFailed { .. } => "schema_validation_failed",
        }
    }

    /// The server this event concerns.
    pub fn server(&self) -> &ServerName {
        match self {
            Self::ServerAdded { name, .. }
            | Self::ServerError { name, .. }
            | Self::ServerRemoved { name }
            | Self::ServerUnhealthy { name, .. }
            | Self::ReconnectionScheduled { name, .. }
            | Self::ReconnectionSucceeded { name, .. }
            | Self::ReconnectionFailed { name, .. }
            | Self::Progress { name, .. }
            | Self::ResourceUpdated { name, .. }
            | Self::SchemaValidationFailed { name, .. } => name,
        }
    }
}

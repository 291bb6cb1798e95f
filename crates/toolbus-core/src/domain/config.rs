//! Server and client configuration.
//!
//! These types are the contract with the host's settings layer: it owns
//! persistence and hands us deserialized values. Shape validation happens
//! here, once, before anything touches a lock or a socket.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::domain::ids::ServerName;
use crate::error::McpError;

/// Transport discriminant, used in state reporting and diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Stdio,
    Http,
    Sse,
}

impl TransportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stdio => "stdio",
            Self::Http => "http",
            Self::Sse => "sse",
        }
    }
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How to reach a server: a child process or a URL endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum TransportConfig {
    Stdio {
        command: String,
        #[serde(default)]
        args: Vec<String>,
    },
    Http {
        url: String,
    },
    Sse {
        url: String,
    },
}

impl TransportConfig {
    pub fn kind(&self) -> TransportKind {
        match self {
            Self::Stdio { .. } => TransportKind::Stdio,
            Self::Http { .. } => TransportKind::Http,
            Self::Sse { .. } => TransportKind::Sse,
        }
    }

    /// URL for network transports, `None` for stdio.
    pub fn url(&self) -> Option<&str> {
        match self {
            Self::Http { url } | Self::Sse { url } => Some(url),
            Self::Stdio { .. } => None,
        }
    }
}

/// Configuration for a single tool server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct McpServerConfig {
    pub name: ServerName,
    pub transport: TransportConfig,
    /// Extra environment for stdio child processes.
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Per-server override of the per-call timeout.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

impl McpServerConfig {
    /// Shape validation. Name format is already enforced by [`ServerName`];
    /// this checks the transport-specific fields.
    pub fn validate(&self) -> Result<(), McpError> {
        match &self.transport {
            TransportConfig::Stdio { command, .. } => {
                if command.trim().is_empty() {
                    return Err(McpError::InvalidConfig(format!(
                        "server '{}': stdio transport requires a command",
                        self.name
                    )));
                }
            }
            TransportConfig::Http { url } | TransportConfig::Sse { url } => {
                if url.trim().is_empty() {
                    return Err(McpError::InvalidConfig(format!(
                        "server '{}': {} transport requires a url",
                        self.name,
                        self.transport.kind()
                    )));
                }
            }
        }
        if self.timeout_ms == Some(0) {
            return Err(McpError::InvalidConfig(format!(
                "server '{}': timeout_ms must be positive",
                self.name
            )));
        }
        Ok(())
    }

    /// Per-call timeout for this server, falling back to the global setting.
    pub fn call_timeout(&self, settings: &ClientSettings) -> Duration {
        self.timeout_ms
            .map(Duration::from_millis)
            .unwrap_or_else(|| settings.call_timeout())
    }
}

/// Retry policy for the reconnection scheduler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay_ms: 1_000,
            max_delay_ms: 30_000,
        }
    }
}

impl ReconnectPolicy {
    /// Exponential backoff: `initial * 2^(attempt-1)`, capped at `max_delay_ms`.
    /// Attempts are 1-based.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31);
        let raw = self.initial_delay_ms.saturating_mul(1u64 << exp);
        Duration::from_millis(raw.min(self.max_delay_ms))
    }
}

/// Global runtime settings, consumed from the host's settings collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientSettings {
    pub connect_timeout_ms: u64,
    pub call_timeout_ms: u64,
    pub health_check_interval_ms: u64,
    pub reconnect: ReconnectPolicy,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 30_000,
            call_timeout_ms: 60_000,
            health_check_interval_ms: 60_000,
            reconnect: ReconnectPolicy::default(),
        }
    }
}

impl ClientSettings {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }
}

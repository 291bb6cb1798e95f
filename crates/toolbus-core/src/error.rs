//! Error taxonomy for the ToolBus runtime.
//!
//! Every failure that crosses a public boundary is one of these variants.
//! Each carries a stable `kind()` tag and a human-readable message so the
//! host UI can render it without inspecting internals.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Category attached to an SSRF rejection.
///
/// Serialized in SCREAMING_SNAKE_CASE to match the audit log format
/// consumed by the host's security tooling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SsrfCategory {
    /// Input could not be parsed as a URL
    InvalidUrl,
    /// Scheme other than http/https (file, ftp, gopher, data, ...)
    InvalidProtocol,
    /// Hostname appears on the fixed blocklist
    BlockedHostname,
    /// Literal IP (after canonicalization) falls in a private/special range
    PrivateIp,
}

impl SsrfCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidUrl => "INVALID_URL",
            Self::InvalidProtocol => "INVALID_PROTOCOL",
            Self::BlockedHostname => "BLOCKED_HOSTNAME",
            Self::PrivateIp => "PRIVATE_IP",
        }
    }
}

impl std::fmt::Display for SsrfCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unified error type for all public ToolBus operations.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum McpError {
    /// Server configuration failed shape validation
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Outbound URL rejected by the SSRF guard
    #[error("url blocked ({category}): {reason}")]
    SsrfBlocked {
        category: SsrfCategory,
        reason: String,
    },

    /// Connection attempt exceeded its deadline
    #[error("connect timed out after {0:?}")]
    ConnectTimeout(Duration),

    /// Connection attempt failed outright
    #[error("connect failed: {0}")]
    ConnectFailed(String),

    /// Operation requires a Connected server
    #[error("server '{0}' is not connected")]
    NotConnected(String),

    /// Tool invocation exceeded its deadline
    #[error("tool call timed out after {0:?}")]
    InvokeTimeout(Duration),

    /// Tool invocation failed
    #[error("tool call failed: {0}")]
    InvokeFailed(String),

    /// A lock token was used after it stopped being the current holder.
    /// This is a programming error, not a runtime condition: callers must
    /// surface it immediately instead of swallowing it.
    #[error("lock token for '{0}' was already released")]
    LockAlreadyReleased(String),

    /// The manager is shutting down and no longer accepts lifecycle operations
    #[error("shutdown in progress")]
    ShutdownInProgress,
}

impl McpError {
    /// Stable machine-readable tag for UI display and event payloads.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidConfig(_) => "invalid_config",
            Self::SsrfBlocked { .. } => "ssrf_blocked",
            Self::ConnectTimeout(_) => "connect_timeout",
            Self::ConnectFailed(_) => "connect_failed",
            Self::NotConnected(_) => "not_connected",
            Self::InvokeTimeout(_) => "invoke_timeout",
            Self::InvokeFailed(_) => "invoke_failed",
            Self::LockAlreadyReleased(_) => "lock_already_released",
            Self::ShutdownInProgress => "shutdown_in_progress",
        }
    }

    /// Permanent errors are never retried by the reconnection scheduler.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            Self::SsrfBlocked { .. } | Self::InvalidConfig(_) | Self::ShutdownInProgress
        )
    }
}

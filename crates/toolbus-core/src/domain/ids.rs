//! Validated identifiers for servers and tools.
//!
//! Raw strings are validated once at the boundary; everything past the
//! constructors works with these wrappers and never re-checks format.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize};

use crate::error::McpError;

const MAX_SERVER_NAME_LEN: usize = 64;
const MAX_TOOL_NAME_LEN: usize = 192;

fn is_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '-' || c == '_'
}

/// Validated server identifier: 1-64 chars of `[A-Za-z0-9_-]`,
/// starting with an alphanumeric.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct ServerName(String);

impl ServerName {
    /// Validate and wrap a raw string.
    pub fn parse(raw: &str) -> Result<Self, McpError> {
        if raw.is_empty() || raw.len() > MAX_SERVER_NAME_LEN {
            return Err(McpError::InvalidConfig(format!(
                "server name must be 1-{} characters, got {}",
                MAX_SERVER_NAME_LEN,
                raw.len()
            )));
        }
        let mut chars = raw.chars();
        let first = chars.next().unwrap_or('-');
        if !first.is_ascii_alphanumeric() {
            return Err(McpError::InvalidConfig(format!(
                "server name '{}' must start with an alphanumeric character",
                raw
            )));
        }
        if !raw.chars().all(is_name_char) {
            return Err(McpError::InvalidConfig(format!(
                "server name '{}' contains invalid characters (allowed: A-Z a-z 0-9 - _)",
                raw
            )));
        }
        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ServerName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for ServerName {
    type Err = McpError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl<'de> Deserialize<'de> for ServerName {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        Self::parse(&raw).map_err(serde::de::Error::custom)
    }
}

/// Validated qualified tool identifier: `<server>.<tool>`.
///
/// The server segment obeys [`ServerName`] rules; the tool segment is
/// 1+ chars of `[A-Za-z0-9_-]`. The qualified form is how tools appear
/// in the registry and in `call_tool` requests; the bare segment is
/// what goes over the wire to the owning server.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct ToolName(String);

impl ToolName {
    /// Validate and wrap a qualified `server.tool` string.
    pub fn parse(raw: &str) -> Result<Self, McpError> {
        if raw.len() > MAX_TOOL_NAME_LEN {
            return Err(McpError::InvalidConfig(format!(
                "tool name exceeds {} characters",
                MAX_TOOL_NAME_LEN
            )));
        }
        let (server, tool) = raw.split_once('.').ok_or_else(|| {
            McpError::InvalidConfig(format!(
                "tool name '{}' must be qualified as <server>.<tool>",
                raw
            ))
        })?;
        ServerName::parse(server)?;
        if tool.is_empty() || !tool.chars().all(is_name_char) {
            return Err(McpError::InvalidConfig(format!(
                "tool segment of '{}' contains invalid characters",
                raw
            )));
        }
        Ok(Self(raw.to_string()))
    }

    /// Build from already-validated parts.
    pub fn qualified(server: &ServerName, tool: &str) -> Result<Self, McpError> {
        Self::parse(&format!("{}.{}", server, tool))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The owning server's name.
    pub fn server(&self) -> ServerName {
        // Qualification was validated in parse.
        let server = self.0.split_once('.').map(|(s, _)| s).unwrap_or(&self.0);
        ServerName(server.to_string())
    }

    /// The bare tool segment sent to the owning server.
    pub fn bare(&self) -> &str {
        self.0.split_once('.').map(|(_, t)| t).unwrap_or(&self.0)
    }
}

impl fmt::Display for ToolName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for ToolName {
    type Err = McpError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl<'de> Deserialize<'de> for ToolName {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        Self::parse(&raw).map_err(serde::de::Error::custom)
    }
}

//! Tools and prompts discovered from connected servers.
//!
//! Registries hold these under their qualified names and replace a
//! server's entries wholesale on every (re)connection, so stale entries
//! never outlive a disconnect.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::ids::{ServerName, ToolName};

/// A callable tool advertised by a server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpTool {
    /// Qualified `server.tool` name used by callers
    pub name: ToolName,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// JSON Schema for the tool's arguments, kept as raw JSON
    pub input_schema: Value,
    /// Owning server
    pub server: ServerName,
}

/// A prompt template advertised by a server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpPrompt {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Argument descriptors, kept as raw JSON
    #[serde(default)]
    pub arguments: Vec<Value>,
    pub server: ServerName,
}

/// Result of a tool invocation.
///
/// Content blocks stay raw JSON: the full MCP content schema is the
/// caller's concern, not this runtime's.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CallToolResult {
    #[serde(default)]
    pub content: Vec<Value>,
    #[serde(default, rename = "isError")]
    pub is_error: bool,
}

impl CallToolResult {
    /// Concatenated text of all `{"type": "text"}` content blocks.
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|block| {
                if block.get("type")?.as_str()? != "text" {
                    return None;
                }
                block.get("text")?.as_str()
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

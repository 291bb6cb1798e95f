//! Core domain entities: identifiers, configuration, connection state,
//! discovered features, and client events.

pub mod config;
pub mod event;
pub mod feature;
pub mod ids;
pub mod state;

pub use config::{ClientSettings, McpServerConfig, ReconnectPolicy, TransportConfig, TransportKind};
pub use event::ClientEvent;
pub use feature::{CallToolResult, McpPrompt, McpTool};
pub use ids::{ServerName, ToolName};
pub use state::{ConnectionState, ConnectionSummary, ServerStats};

//! # ToolBus Core Library
//!
//! Domain types, events, and the error taxonomy for the ToolBus MCP
//! client runtime.
//!
//! ## Modules
//!
//! - `domain` - Identifiers, configuration, connection state, features, events
//! - `error` - Unified error taxonomy with stable kind tags
//! - `event_bus` - Per-manager broadcast event distribution

pub mod domain;
pub mod error;
pub mod event_bus;

// Re-export commonly used types
pub use domain::*;
pub use error::{McpError, SsrfCategory};
pub use event_bus::{EventBus, EventReceiver, EventSender};

//! # ToolBus Runtime
//!
//! Client-side MCP runtime: lock primitives, transports, the SSRF
//! guard, and the connection manager that ties them together.
//!
//! ## Modules
//!
//! - `lock` - FIFO-fair mutex with linear tokens, keyed mutex map
//! - `ssrf` - outbound URL vetting with audit trail
//! - `transport` - stdio/HTTP/SSE transports over the JSON-RPC envelope
//! - `manager` - per-server state machines, health checks, reconnection

pub mod lock;
pub mod manager;
pub mod ssrf;
pub mod transport;

// Re-export commonly used types
pub use lock::{FairMutex, KeyedMutex, LockDiagnostics, LockToken};
pub use manager::ConnectionManager;
pub use ssrf::{validate_url, AuditEvent, AuditSink, SsrfGuard, TracingAuditSink, UrlValidation};
pub use transport::{
    DefaultTransportFactory, NotificationRouter, Transport, TransportFactory,
};

//! Shared helpers for the ToolBus integration tests.

pub mod mocks;

use std::collections::HashMap;
use std::sync::Once;
use std::time::Duration;

use toolbus_core::{
    ClientEvent, ClientSettings, EventReceiver, McpServerConfig, ReconnectPolicy, ServerName,
    TransportConfig,
};

static INIT: Once = Once::new();

/// Initialize tracing once for all tests (RUST_LOG-controlled).
pub fn init_tracing() {
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

pub fn server_name(raw: &str) -> ServerName {
    ServerName::parse(raw).expect("valid server name")
}

/// Stdio config pointing at a command that exists only in mocks.
pub fn stdio_config(name: &str) -> McpServerConfig {
    McpServerConfig {
        name: server_name(name),
        transport: TransportConfig::Stdio {
            command: format!("{}-server", name),
            args: vec![],
        },
        env: HashMap::new(),
        timeout_ms: None,
    }
}

pub fn http_config(name: &str, url: &str) -> McpServerConfig {
    McpServerConfig {
        name: server_name(name),
        transport: TransportConfig::Http {
            url: url.to_string(),
        },
        env: HashMap::new(),
        timeout_ms: None,
    }
}

/// Settings tuned for tests: no background health ticker unless a test
/// opts in, fast reconnect backoff.
pub fn test_settings() -> ClientSettings {
    ClientSettings {
        connect_timeout_ms: 2_000,
        call_timeout_ms: 2_000,
        health_check_interval_ms: 0,
        reconnect: ReconnectPolicy {
            max_attempts: 3,
            initial_delay_ms: 10,
            max_delay_ms: 40,
        },
    }
}

/// Await the next event of `kind`, skipping others, within `max`.
pub async fn wait_for_event(
    receiver: &mut EventReceiver,
    kind: &str,
    max: Duration,
) -> Option<ClientEvent> {
    let deadline = tokio::time::Instant::now() + max;
    loop {
        let remaining = deadline.checked_duration_since(tokio::time::Instant::now())?;
        match tokio::time::timeout(remaining, receiver.recv()).await {
            Ok(Some(event)) if event.type_name() == kind => return Some(event),
            Ok(Some(_)) => continue,
            Ok(None) | Err(_) => return None,
        }
    }
}

//! Audit trail for SSRF verdicts.
//!
//! Every validation emits one event, pass or block. The sink is a
//! collaborator owned by the host (security log, telemetry); the default
//! sink writes to the tracing stream. Sinks are fire-and-forget: a sink
//! must not panic, and nothing it does can change the verdict.

use std::net::IpAddr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use toolbus_core::SsrfCategory;

/// One validation verdict.
#[derive(Debug, Clone, Serialize)]
pub struct AuditEvent {
    pub id: Uuid,
    pub at: DateTime<Utc>,
    pub url: String,
    pub allowed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<SsrfCategory>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolved_ip: Option<IpAddr>,
}

impl AuditEvent {
    pub(crate) fn new(
        url: &str,
        allowed: bool,
        category: Option<SsrfCategory>,
        reason: Option<String>,
        resolved_ip: Option<IpAddr>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            at: Utc::now(),
            url: url.to_string(),
            allowed,
            category,
            reason,
            resolved_ip,
        }
    }
}

/// Receiver for audit events.
pub trait AuditSink: Send + Sync {
    fn record(&self, event: &AuditEvent);
}

/// Default sink: structured log lines on the tracing stream.
#[derive(Debug, Default)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record(&self, event: &AuditEvent) {
        if event.allowed {
            info!(
                audit_id = %event.id,
                url = %event.url,
                resolved_ip = ?event.resolved_ip,
                "url validation passed"
            );
        } else {
            warn!(
                audit_id = %event.id,
                url = %event.url,
                category = event.category.map(|c| c.as_str()).unwrap_or("UNKNOWN"),
                reason = event.reason.as_deref().unwrap_or(""),
                "url blocked"
            );
        }
    }
}

/// Shared sink handle used by the guard.
pub type SharedAuditSink = Arc<dyn AuditSink>;

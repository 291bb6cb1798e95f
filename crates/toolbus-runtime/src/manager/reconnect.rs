//! Reconnection scheduling with bounded exponential backoff.
//!
//! At most one scheduled sequence per server: the entry in the
//! `reconnects` map is both the timer handle and the duplicate guard.
//! Each attempt re-runs the full connect path - SSRF guard included -
//! under the server's lock, exactly like a manual `add_server`. A manual
//! `remove_server`/`add_server` cancels the sequence so a zombie retry
//! can never race a fresh connection.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use chrono::Utc;
use dashmap::mapref::entry::Entry;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use toolbus_core::{ClientEvent, ConnectionState, McpError, McpServerConfig, ServerName};

use super::{sanitize_error, ConnectionManager};

/// Live reconnect sequence for one server.
pub(crate) struct ReconnectHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl ReconnectHandle {
    /// Stop the sequence: cancel the backoff sleep and abort the task.
    /// Safe mid-attempt - the lock guard releases on drop.
    pub(crate) fn abort(self) {
        self.cancel.cancel();
        self.task.abort();
    }

    pub(crate) fn abort_ref(&self) {
        self.cancel.cancel();
        self.task.abort();
    }
}

impl ConnectionManager {
    /// Start a reconnect sequence unless one is already running.
    pub(crate) fn schedule_reconnect(self: &Arc<Self>, name: ServerName) {
        if self.shutting_down.load(Ordering::SeqCst) {
            return;
        }
        match self.reconnects.entry(name.clone()) {
            Entry::Occupied(_) => {
                debug!(server = %name, "reconnect already scheduled");
            }
            Entry::Vacant(slot) => {
                let cancel = self.shutdown.child_token();
                let task = {
                    let manager = Arc::clone(self);
                    let token = cancel.clone();
                    tokio::spawn(async move { manager.reconnect_loop(name, token).await })
                };
                slot.insert(ReconnectHandle { cancel, task });
            }
        }
    }

    /// Cancel any scheduled reconnect for `name`.
    pub(crate) fn cancel_reconnect(&self, name: &ServerName) {
        if let Some((_, handle)) = self.reconnects.remove(name) {
            handle.abort();
            debug!(server = %name, "cancelled scheduled reconnect");
        }
    }

    async fn reconnect_loop(self: Arc<Self>, name: ServerName, cancel: CancellationToken) {
        let policy = self.settings.reconnect.clone();
        let mut attempt = 0u32;
        let mut last_error = String::from("unknown");

        let outcome: Result<u32, String> = loop {
            if attempt >= policy.max_attempts {
                break Err(format!(
                    "exhausted {} attempts; last error: {}",
                    policy.max_attempts, last_error
                ));
            }
            attempt += 1;
            let delay = policy.delay_for(attempt);
            info!(
                server = %name,
                attempt,
                delay_ms = delay.as_millis() as u64,
                "reconnect scheduled"
            );
            self.events.emit(ClientEvent::ReconnectionScheduled {
                name: name.clone(),
                attempt,
                delay_ms: delay.as_millis() as u64,
            });

            tokio::select! {
                _ = cancel.cancelled() => {
                    self.reconnects.remove(&name);
                    return;
                }
                _ = tokio::time::sleep(delay) => {}
            }

            // The server may have been removed while we slept.
            let Some(config) = self.servers.get(&name).map(|record| record.config.clone())
            else {
                self.reconnects.remove(&name);
                return;
            };

            match self.attempt_reconnect(&config).await {
                Ok(_) => break Ok(attempt),
                Err(e) if e.is_permanent() => {
                    break Err(sanitize_error(&e.to_string()));
                }
                Err(e) => {
                    last_error = sanitize_error(&e.to_string());
                    warn!(server = %name, attempt, error = %last_error, "reconnect attempt failed");
                }
            }
        };

        self.reconnects.remove(&name);
        match outcome {
            Ok(attempts) => {
                info!(server = %name, attempts, "reconnect succeeded");
                self.events
                    .emit(ClientEvent::ReconnectionSucceeded { name, attempts });
            }
            Err(reason) => {
                // Terminal: leave the server Failed with the full story.
                let config = self.servers.get(&name).map(|record| record.config.clone());
                if let Some(config) = config {
                    self.publish(
                        &config,
                        ConnectionState::Failed {
                            since: Utc::now(),
                            error: reason.clone(),
                        },
                        None,
                    );
                }
                warn!(server = %name, attempts = attempt, reason = %reason, "reconnect failed");
                self.events.emit(ClientEvent::ReconnectionFailed {
                    name,
                    attempts: attempt,
                    reason,
                });
            }
        }
    }

    /// One attempt: SSRF guard first (never cached across attempts),
    /// then the connect flow under the server's lock.
    async fn attempt_reconnect(&self, config: &McpServerConfig) -> Result<usize, McpError> {
        if let Some(url) = config.transport.url() {
            self.guard.validate_resolved(url).await.into_result()?;
        }
        self.locks
            .run_exclusive(config.name.as_str(), "reconnect", || {
                self.connect_locked(config)
            })
            .await
    }
}

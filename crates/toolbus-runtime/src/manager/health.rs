//! Background health checking.
//!
//! A single ticker pings every Connected server outside any lock. A
//! failed ping flips the server's diagnostic unhealthy flag, emits
//! `server_unhealthy`, and hands the name to the reconnection scheduler.
//! Authoritative `ConnectionState` is never touched from here - only a
//! reconnect attempt (under the server's lock) moves the state machine.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use serde_json::Value;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use toolbus_core::{ClientEvent, ConnectionState, ServerName};

use crate::transport::Transport;

use super::ConnectionManager;

/// The ticker holds only a weak handle so it cannot keep the manager
/// alive after its last real owner drops it.
pub(super) fn spawn_health_checker(manager: &Arc<ConnectionManager>) -> JoinHandle<()> {
    let weak = Arc::downgrade(manager);
    let interval = manager.settings.health_check_interval();
    let shutdown = manager.shutdown.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // interval fires immediately; consume that so the first probe
        // lands one full interval after startup.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let Some(manager) = weak.upgrade() else { break };
            manager.run_health_pass().await;
        }
        debug!("health checker stopped");
    })
}

impl ConnectionManager {
    /// One probe round over every Connected server.
    pub(crate) async fn run_health_pass(self: &Arc<Self>) {
        let targets: Vec<(ServerName, Arc<dyn Transport>)> = self
            .servers
            .iter()
            .filter_map(|entry| match (&entry.state, &entry.transport) {
                (ConnectionState::Connected { .. }, Some(transport)) => {
                    Some((entry.key().clone(), Arc::clone(transport)))
                }
                _ => None,
            })
            .collect();

        for (name, transport) in targets {
            if self.shutdown.is_cancelled() {
                return;
            }
            match transport
                .request("ping", Value::Null, self.settings.call_timeout())
                .await
            {
                Ok(_) => {
                    if let Some(record) = self.servers.get(&name) {
                        record.unhealthy.store(false, Ordering::SeqCst);
                    }
                }
                Err(e) => {
                    let Some(record) = self.servers.get(&name).map(|r| Arc::clone(r.value()))
                    else {
                        continue;
                    };
                    if !record.state.is_connected() {
                        // A lifecycle operation got there first.
                        continue;
                    }
                    // First failure starts exactly one reconnect sequence;
                    // repeats while already unhealthy are just noise.
                    if !record.unhealthy.swap(true, Ordering::SeqCst) {
                        warn!(server = %name, error = %e, "health check failed");
                        self.events.emit(ClientEvent::ServerUnhealthy {
                            name: name.clone(),
                            error: e.to_string(),
                        });
                        self.schedule_reconnect(name);
                    }
                }
            }
        }
    }
}

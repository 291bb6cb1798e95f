//! Keyed mutex map: one fair mutex per application-level key.
//!
//! The connection manager keys these by server name, so lifecycle
//! operations on the same server are strictly serialized while distinct
//! servers proceed fully in parallel. Entries are created lazily on
//! first acquire; the dashmap entry API guarantees a key never gets two
//! mutex instances under concurrent first access.

use std::future::Future;
use std::sync::Arc;

use dashmap::DashMap;
use serde::Serialize;

use toolbus_core::McpError;

use super::mutex::{FairMutex, LockToken};

/// One diagnostics row per known key.
#[derive(Debug, Clone, Serialize)]
pub struct LockDiagnostics {
    pub key: String,
    pub locked: bool,
    pub holder: Option<String>,
}

/// Map of independently-locked keys.
#[derive(Default)]
pub struct KeyedMutex {
    locks: DashMap<String, Arc<FairMutex>>,
}

impl KeyedMutex {
    pub fn new() -> Self {
        Self {
            locks: DashMap::new(),
        }
    }

    fn entry(&self, key: &str) -> Arc<FairMutex> {
        self.locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(FairMutex::new(key)))
            .clone()
    }

    /// Acquire the mutex for `key`, creating it on first use.
    pub async fn acquire(&self, key: &str, label: impl Into<String>) -> LockToken {
        self.entry(key).acquire(label).await
    }

    /// Release a token against the mutex it came from.
    pub fn release(&self, token: LockToken) -> Result<(), McpError> {
        let mutex = self
            .locks
            .get(token.key())
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| McpError::LockAlreadyReleased(token.key().to_string()))?;
        mutex.release(token)
    }

    /// Acquire `key`, run `f`, and unconditionally release.
    pub async fn run_exclusive<F, Fut, T>(&self, key: &str, label: impl Into<String>, f: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        self.entry(key).run_exclusive(label, f).await
    }

    // ── Introspection (never mutates lock state) ──

    pub fn is_locked(&self, key: &str) -> bool {
        self.locks
            .get(key)
            .map(|entry| entry.is_locked())
            .unwrap_or(false)
    }

    pub fn queue_len(&self, key: &str) -> usize {
        self.locks
            .get(key)
            .map(|entry| entry.queue_len())
            .unwrap_or(0)
    }

    pub fn keys(&self) -> Vec<String> {
        self.locks.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn diagnostics(&self) -> Vec<LockDiagnostics> {
        self.locks
            .iter()
            .map(|entry| LockDiagnostics {
                key: entry.key().clone(),
                locked: entry.is_locked(),
                holder: entry.holder(),
            })
            .collect()
    }

    // ── Maintenance ──

    /// Drop the entry for `key`. Meaningful only while unlocked; a locked
    /// entry is left in place and `false` is returned.
    pub fn clear(&self, key: &str) -> bool {
        self.locks
            .remove_if(key, |_, mutex| !mutex.is_locked())
            .is_some()
    }

    /// Drop every unlocked entry, returning how many were removed.
    pub fn clear_all(&self) -> usize {
        let before = self.locks.len();
        self.locks.retain(|_, mutex| mutex.is_locked());
        before - self.locks.len()
    }
}

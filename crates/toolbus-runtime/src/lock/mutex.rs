//! Fair async mutex with linear lock tokens.
//!
//! Unlike `tokio::sync::Mutex`, waiters are granted strictly in arrival
//! order and the holder is observable for diagnostics. Ownership of the
//! critical section is represented by a [`LockToken`]: a one-time-use
//! capability consumed by `release`, so the compiler already rejects a
//! double release. A token that is no longer the current holder (stale
//! after a `clear`, or raced by the `run_exclusive` drop guard) is
//! detected at runtime and raises `LockAlreadyReleased`.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex as PlMutex;
use tokio::sync::oneshot;
use tracing::trace;

use toolbus_core::McpError;

struct Holder {
    seq: u64,
    label: String,
    since: Instant,
}

struct Waiter {
    seq: u64,
    label: String,
    tx: oneshot::Sender<()>,
}

struct State {
    holder: Option<Holder>,
    queue: VecDeque<Waiter>,
    next_seq: u64,
}

/// One-time-use capability proving exclusive ownership of a critical
/// section. Not `Clone`; consumed by `release`.
#[derive(Debug)]
#[must_use = "a lock token must be released or the mutex stays locked"]
pub struct LockToken {
    key: String,
    label: String,
    seq: u64,
    acquired_at: Instant,
}

impl LockToken {
    /// Key of the mutex this token belongs to.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Label supplied at acquisition, shown in diagnostics.
    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn acquired_at(&self) -> Instant {
        self.acquired_at
    }

    pub(crate) fn seq(&self) -> u64 {
        self.seq
    }
}

/// FIFO-fair async mutex.
pub struct FairMutex {
    key: String,
    state: Arc<PlMutex<State>>,
}

impl FairMutex {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            state: Arc::new(PlMutex::new(State {
                holder: None,
                queue: VecDeque::new(),
                next_seq: 0,
            })),
        }
    }

    /// Key this mutex guards (the server name, for the keyed map).
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Acquire the lock, suspending until every earlier-queued acquirer
    /// has held and released it.
    pub async fn acquire(&self, label: impl Into<String>) -> LockToken {
        let label = label.into();
        let seq = self.lock_internal(label.clone()).await;
        LockToken {
            key: self.key.clone(),
            label,
            seq,
            acquired_at: Instant::now(),
        }
    }

    /// Release the lock, consuming the token.
    ///
    /// Fails with `LockAlreadyReleased` if the token is not the current
    /// holder: wrong mutex, stale after a `clear`, or already force-released.
    pub fn release(&self, token: LockToken) -> Result<(), McpError> {
        if token.key != self.key {
            return Err(McpError::LockAlreadyReleased(token.key));
        }
        self.unlock_internal(token.seq)
    }

    /// Acquire, run `f`, and unconditionally release - on success, error,
    /// panic unwind, or cancellation of the returned future.
    pub async fn run_exclusive<F, Fut, T>(&self, label: impl Into<String>, f: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let seq = self.lock_internal(label.into()).await;
        let _guard = ReleaseGuard { mutex: self, seq };
        f().await
    }

    // ── Introspection (never mutates) ──

    pub fn is_locked(&self) -> bool {
        self.state.lock().holder.is_some()
    }

    pub fn queue_len(&self) -> usize {
        self.state.lock().queue.len()
    }

    /// Label of the current holder, if any.
    pub fn holder(&self) -> Option<String> {
        self.state.lock().holder.as_ref().map(|h| h.label.clone())
    }

    /// How long the current holder has held the lock.
    pub fn lock_duration(&self) -> Option<Duration> {
        self.state.lock().holder.as_ref().map(|h| h.since.elapsed())
    }

    // ── Internals ──

    async fn lock_internal(&self, label: String) -> u64 {
        let pending = {
            let mut state = self.state.lock();
            let seq = state.next_seq;
            state.next_seq += 1;
            if state.holder.is_none() {
                debug_assert!(state.queue.is_empty(), "waiters require a holder");
                state.holder = Some(Holder {
                    seq,
                    label,
                    since: Instant::now(),
                });
                return seq;
            }
            let (tx, rx) = oneshot::channel();
            state.queue.push_back(Waiter { seq, label, tx });
            (seq, rx)
        };

        let (seq, rx) = pending;
        // Cannot fail: a waiter is only dropped after a successful grant
        // send, and the queue state is kept alive by the Arc in `self`.
        let _ = rx.await;
        trace!(key = %self.key, seq, "lock granted");
        seq
    }

    fn unlock_internal(&self, seq: u64) -> Result<(), McpError> {
        let mut state = self.state.lock();
        match &state.holder {
            Some(holder) if holder.seq == seq => {
                state.holder = None;
                Self::grant_next(&mut state);
                Ok(())
            }
            _ => Err(McpError::LockAlreadyReleased(self.key.clone())),
        }
    }

    /// Hand the lock to the first live waiter, skipping any whose future
    /// was cancelled while queued.
    fn grant_next(state: &mut State) {
        while let Some(waiter) = state.queue.pop_front() {
            let holder = Holder {
                seq: waiter.seq,
                label: waiter.label,
                since: Instant::now(),
            };
            if waiter.tx.send(()).is_ok() {
                state.holder = Some(holder);
                return;
            }
            // Waiter gone; try the next one.
        }
    }
}

/// Releases on drop, covering error returns, panics, and cancellation
/// inside `run_exclusive`.
struct ReleaseGuard<'a> {
    mutex: &'a FairMutex,
    seq: u64,
}

impl Drop for ReleaseGuard<'_> {
    fn drop(&mut self) {
        let _ = self.mutex.unlock_internal(self.seq);
    }
}

//! Exclusive-access primitives used by the connection manager.
//!
//! [`FairMutex`] is a FIFO-fair async mutex whose ownership is carried by
//! a linear [`LockToken`]; [`KeyedMutex`] maps application keys (server
//! names) to lazily-created mutexes so distinct keys never contend.

mod keyed;
mod mutex;

pub use keyed::{KeyedMutex, LockDiagnostics};
pub use mutex::{FairMutex, LockToken};

//! Event bus - per-manager event distribution.
//!
//! A thin wrapper over a tokio broadcast channel. Each connection manager
//! owns one bus; producers emit [`ClientEvent`]s and every subscriber gets
//! its own copy. There is no global bus - the bus dies with its manager.

use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::domain::ClientEvent;

/// Default channel capacity for the event bus
const DEFAULT_CAPACITY: usize = 256;

/// Broadcast hub for [`ClientEvent`]s.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<ClientEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Get a sender for emitting events. Cheaply cloneable.
    pub fn sender(&self) -> EventSender {
        EventSender {
            sender: self.sender.clone(),
        }
    }

    /// Subscribe to events emitted after this call.
    pub fn subscribe(&self) -> EventReceiver {
        EventReceiver {
            receiver: self.sender.subscribe(),
        }
    }

    /// Number of active subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Producer handle used by the manager and its background tasks.
#[derive(Clone)]
pub struct EventSender {
    sender: broadcast::Sender<ClientEvent>,
}

impl EventSender {
    /// Emit an event. Returns the number of receivers that got it;
    /// zero subscribers is not an error.
    pub fn emit(&self, event: ClientEvent) -> usize {
        let type_name = event.type_name();
        match self.sender.send(event) {
            Ok(count) => {
                debug!(event_type = type_name, receivers = count, "emitted event");
                count
            }
            Err(_) => {
                debug!(event_type = type_name, "no receivers for event");
                0
            }
        }
    }

    pub fn has_subscribers(&self) -> bool {
        self.sender.receiver_count() > 0
    }
}

/// Consumer handle. Lag is logged and skipped, never fatal.
pub struct EventReceiver {
    receiver: broadcast::Receiver<ClientEvent>,
}

impl EventReceiver {
    /// Receive the next event; `None` once the bus is dropped.
    pub async fn recv(&mut self) -> Option<ClientEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped_events = skipped, "event receiver lagged");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    debug!("event bus closed");
                    return None;
                }
            }
        }
    }

    /// Non-blocking receive.
    pub fn try_recv(&mut self) -> Option<ClientEvent> {
        match self.receiver.try_recv() {
            Ok(event) => Some(event),
            Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                warn!(skipped_events = skipped, "event receiver lagged on try_recv");
                self.receiver.try_recv().ok()
            }
            Err(_) => None,
        }
    }
}

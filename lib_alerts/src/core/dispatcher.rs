//! # Alert Dispatcher
//!
//! An [`AlertSink`] that fans every sink event out to any number of
//! subscribers, such as a UI task, a desktop notifier and a logger.
//!
//! ## Design
//!
//! 1.  **Shared frames**: each event is wrapped in one `Arc<SinkEvent>`; every
//!     subscriber receives a pointer to the same allocation.
//!
//! 2.  **Non-blocking delivery**: subscribers own unbounded MPSC receivers, so
//!     the delivery loop never waits on a slow renderer.
//!
//! 3.  **Self-cleaning**: a subscriber whose receiver was dropped is removed on
//!     the next broadcast.

use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::mpsc;

use crate::core::alert::Alert;
use crate::core::sink::{AlertSink, ConnectionState};

/// One sink call, as seen by subscribers.
#[derive(Debug, Clone, PartialEq)]
pub enum SinkEvent {
    /// `on_alert`
    Alert(Alert),
    /// `on_error`
    Error(String),
    /// `on_status`
    Status {
        /// Connection phase.
        state: ConnectionState,
        /// Human-readable detail.
        message: String,
    },
}

/// A registered receiver.
struct Subscriber {
    /// Caller-chosen name, used for removal and logs.
    id: String,
    sender: mpsc::UnboundedSender<Arc<SinkEvent>>,
}

/// Fan-out sink.
#[derive(Default)]
pub struct AlertDispatcher {
    subscribers: Mutex<Vec<Subscriber>>,
}

impl AlertDispatcher {
    /// Dispatcher without subscribers. Events are dropped until one registers.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Subscriber>> {
        self.subscribers.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// # Add Subscriber
    ///
    /// Registers `id` and returns the receiving half of its event queue. Only
    /// events broadcast after registration are delivered.
    pub fn add_subscriber(&self, id: &str) -> mpsc::UnboundedReceiver<Arc<SinkEvent>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().push(Subscriber {
            id: id.to_string(),
            sender: tx,
        });
        log::debug!("Sink subscriber '{}' registered", id);
        rx
    }

    /// Removes a subscriber by id.
    pub fn remove_subscriber(&self, id: &str) {
        self.lock().retain(|s| s.id != id);
        log::debug!("Sink subscriber '{}' removed", id);
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.lock().len()
    }

    /// Sends `event` to every subscriber, pruning the disconnected ones.
    pub fn broadcast(&self, event: SinkEvent) {
        let frame = Arc::new(event);
        self.lock().retain(|subscriber| match subscriber.sender.send(Arc::clone(&frame)) {
            Ok(()) => true,
            Err(_) => {
                log::debug!("Sink subscriber '{}' disconnected, removing", subscriber.id);
                false
            }
        });
    }
}

impl AlertSink for AlertDispatcher {
    fn on_alert(&self, alert: &Alert) {
        self.broadcast(SinkEvent::Alert(alert.clone()));
    }

    fn on_error(&self, message: &str) {
        self.broadcast(SinkEvent::Error(message.to_string()));
    }

    fn on_status(&self, state: ConnectionState, message: &str) {
        self.broadcast(SinkEvent::Status {
            state,
            message: message.to_string(),
        });
    }
}

//! # Alert Sink
//!
//! The outward-facing interface of the delivery core. Rendering layers,
//! notification popups or test recorders implement it; the loop only calls in.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::core::alert::Alert;

/// Connection phase reported alongside status messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// Resolving identity and opening the channel.
    Connecting,
    /// Alerts or status are flowing.
    Connected,
    /// Channel is healthy, nothing to deliver right now.
    Waiting,
    /// A failure occurred and a retry is scheduled.
    Reconnecting,
    /// Stopped on request.
    Stopped,
    /// Reconnect budget exhausted.
    Failed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Waiting => "waiting",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Stopped => "stopped",
            ConnectionState::Failed => "failed",
        };
        f.write_str(label)
    }
}

/// Consumer of delivered alerts.
///
/// Calls arrive from the loop task, one at a time and in delivery order.
/// Implementations should return quickly.
pub trait AlertSink: Send + Sync + 'static {
    /// A new, not previously surfaced alert.
    fn on_alert(&self, alert: &Alert);
    /// A user-visible failure. Only sent when delivery cannot continue.
    fn on_error(&self, message: &str);
    /// Connection state change or server notice.
    fn on_status(&self, state: ConnectionState, message: &str);
}

impl<S: AlertSink + ?Sized> AlertSink for Arc<S> {
    fn on_alert(&self, alert: &Alert) {
        (**self).on_alert(alert)
    }

    fn on_error(&self, message: &str) {
        (**self).on_error(message)
    }

    fn on_status(&self, state: ConnectionState, message: &str) {
        (**self).on_status(state, message)
    }
}

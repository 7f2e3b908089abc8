//! # Delivery Channels
//!
//! Transports that move alerts from the server to one client. Both variants
//! share the [`DeliveryChannel`] contract, so the delivery loop, dedup and retry
//! logic are written once.
//!
//! ## Contained Modules:
//!
//! - **`long_polling`**: one HTTP request per acquire; the server holds it open
//!   until an alert is ready or the timeout hint elapses.
//! - **`alerts_wss`**: a persistent WebSocket subscription; every pushed frame
//!   is one acquire result, with ping/pong latency probes interleaved.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use crate::core::alert::Alert;
use crate::core::metrics::DeliveryMetrics;
use crate::core::retry::OutcomeKind;

/// HTTP long-poll transport.
pub mod long_polling;
/// WebSocket stream transport.
pub mod alerts_wss;

pub use alerts_wss::StreamChannel;
pub use long_polling::LongPollChannel;

/// Which transport a channel uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    /// Request/response cycle.
    LongPoll,
    /// Persistent subscription.
    Stream,
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelKind::LongPoll => f.write_str("long-poll"),
            ChannelKind::Stream => f.write_str("stream"),
        }
    }
}

/// What one acquire produced.
#[derive(Debug, Clone, PartialEq)]
pub enum DeliveryResult {
    /// An alert, possibly a replay.
    Alert(Alert),
    /// Nothing to deliver within the hold window.
    Timeout,
    /// Well-formed error from the server.
    ServerError(String),
    /// Connection-level failure.
    TransportError(String),
    /// Payload of an unexpected shape.
    ProtocolError(String),
    /// Server status notice (stream only).
    Status(String),
}

impl DeliveryResult {
    /// Scheduling class of this result.
    pub fn outcome(&self) -> OutcomeKind {
        match self {
            DeliveryResult::Alert(alert) if alert.has_backlog() => OutcomeKind::AlertWithBacklog,
            DeliveryResult::Alert(_) => OutcomeKind::AlertCaughtUp,
            DeliveryResult::Timeout => OutcomeKind::Timeout,
            DeliveryResult::ServerError(_) => OutcomeKind::ServerError,
            DeliveryResult::TransportError(_) => OutcomeKind::TransportError,
            DeliveryResult::ProtocolError(_) => OutcomeKind::ProtocolError,
            DeliveryResult::Status(_) => OutcomeKind::Status,
        }
    }
}

/// # Delivery Channel
///
/// One transport bound to one client. The loop calls `acquire` strictly in
/// sequence and never concurrently; implementations may therefore keep
/// connection state in `&mut self` without locking.
///
/// The timeout hint is part of the channel's configuration rather than an
/// argument, because the stream variant has no per-acquire hold window.
pub trait DeliveryChannel: Send + 'static {
    /// Transport variant.
    fn kind(&self) -> ChannelKind;

    /// Hands the channel the loop's metrics, for transports that measure
    /// probe round trips.
    fn attach_metrics(&mut self, metrics: Arc<DeliveryMetrics>) {
        let _ = metrics;
    }

    /// Waits for the next result. Cancel-safe: dropping the future abandons the
    /// attempt and leaves the channel usable.
    fn acquire(&mut self, client_id: &str) -> impl Future<Output = DeliveryResult> + Send;

    /// Acknowledges receipt of `alert`. Returns true when an acknowledgement
    /// was sent.
    fn confirm(&mut self, client_id: &str, alert: &Alert) -> impl Future<Output = bool> + Send {
        let _ = (client_id, alert);
        async { false }
    }

    /// Best-effort stop notice followed by closing any open connection.
    fn close(&mut self, client_id: &str) -> impl Future<Output = ()> + Send {
        let _ = client_id;
        async {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outcome_follows_backlog_signal() {
        let more = Alert::new("a1", "X", "Y").in_batch(1, 2);
        let last = Alert::new("a2", "X", "Y").in_batch(2, 2);
        assert_eq!(DeliveryResult::Alert(more).outcome(), OutcomeKind::AlertWithBacklog);
        assert_eq!(DeliveryResult::Alert(last).outcome(), OutcomeKind::AlertCaughtUp);
        assert_eq!(DeliveryResult::Status("ok".into()).outcome(), OutcomeKind::Status);
    }
}

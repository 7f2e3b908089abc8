//! # Core Delivery Engine
//!
//! The transport-independent half of alert delivery. Everything here is shared
//! by the long-poll and stream variants; the transports themselves live in
//! `channels`.
//!
//! ## Core Components:
//!
//! - **`alert`**: the wire model of one alert and its identity rules.
//!
//! - **`dedup`**: the per-client seen-set that keeps replays away from the
//!   sink, with FIFO eviction past a capacity.
//!
//! - **`retry`**: the outcome-driven delay table, exponential transport
//!   backoff and the reconnect budget.
//!
//! - **`delivery_loop`**: the single-task loop tying a channel, the dedup
//!   tracker and the retry scheduler to an `AlertSink`, with start/stop/reset
//!   control and a stale-response guard.
//!
//! - **`sink`** and **`dispatcher`**: the outward `AlertSink` interface and a
//!   fan-out implementation over MPSC channels.
//!
//! - **`metrics`**: delivery counters and probe latency statistics.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

/// The alert wire model.
pub mod alert;
/// Duplicate suppression.
pub mod dedup;
/// The single-task delivery loop.
pub mod delivery_loop;
/// Fan-out sink.
pub mod dispatcher;
/// Delivery error taxonomy.
pub mod error;
/// Counters and latency statistics.
pub mod metrics;
/// Retry policy and scheduler.
pub mod retry;
/// The outward sink interface.
pub mod sink;

pub use alert::Alert;
pub use dedup::DedupTracker;
pub use delivery_loop::{DeliveryLoop, LoopState, PollLoop, StreamLoop};
pub use dispatcher::{AlertDispatcher, SinkEvent};
pub use error::DeliveryError;
pub use metrics::{DeliveryMetrics, LatencyStats, MetricsSnapshot};
pub use retry::{OutcomeKind, RetryDecision, RetryPolicy, RetryScheduler};
pub use sink::{AlertSink, ConnectionState};

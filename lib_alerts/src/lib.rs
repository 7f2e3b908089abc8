//! # lib_alerts
//!
//! Client-side alert delivery with at-most-once rendering over unreliable
//! transports. A delivery loop acquires alerts through a channel (HTTP long
//! polling or a WebSocket stream), suppresses duplicates per client identity,
//! and backs off on failures while preserving delivery order.
//!
//! Folders are feature gated the same way across the workspace:
//!
//! - **`configs`**: delivery tunables and JSON config loading.
//! - **`identity`**: stable per-client identifiers in a local key/value store.
//! - **`retrieve`**: HTTP client with retry middleware for control calls.
//! - **`delivery`**: the `core` engine (alert model, dedup, retry, loop, sinks,
//!   metrics) and the `channels` it drives.

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms, unused_qualifications)]

#[cfg(feature = "configs")]
pub mod configs;
#[cfg(feature = "identity")]
pub mod identity;
#[cfg(feature = "retrieve")]
pub mod retrieve;

#[cfg(feature = "delivery")]
pub mod channels;
#[cfg(feature = "delivery")]
pub mod core;

#[cfg(feature = "configs")]
pub use crate::configs::{load_delivery_config, read_delivery_config, ConfigError, DeliveryConfig};
#[cfg(feature = "identity")]
pub use crate::identity::{ClientIdentity, FileIdentityStore, IdentityError, IdentityStore, MemoryIdentityStore};

#[cfg(feature = "delivery")]
pub use crate::channels::{ChannelKind, DeliveryChannel, DeliveryResult, LongPollChannel, StreamChannel};
#[cfg(feature = "delivery")]
pub use crate::core::{
    Alert, AlertDispatcher, AlertSink, ConnectionState, DedupTracker, DeliveryError,
    DeliveryLoop, DeliveryMetrics, LatencyStats, LoopState, MetricsSnapshot, OutcomeKind,
    PollLoop, RetryDecision, RetryPolicy, RetryScheduler, SinkEvent, StreamLoop,
};

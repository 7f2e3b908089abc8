//! # Configuration Module
//!
//! Holds the tunables of the delivery subsystem: server endpoints, long-poll
//! timing, retry policy, dedup capacity, stream heartbeats and identity
//! storage. Values come from built-in defaults, optionally overlaid by a JSON
//! file; callers (such as the `alert_client` binary) may layer environment and
//! command-line overrides on top.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

/// Delivery tunables and the JSON loader.
pub mod config_delivery;

pub use config_delivery::{load_delivery_config, read_delivery_config, ConfigError, DeliveryConfig};

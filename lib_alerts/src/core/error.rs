use thiserror::Error;

use crate::configs::ConfigError;
use crate::identity::IdentityError;

/// Errors surfaced by the delivery API.
///
/// Inside the loop, transport and server failures are retried and never
/// escape; these variants reach callers only through control operations
/// (`reset`, channel construction) or as the terminal outcome.
#[derive(Debug, Error)]
pub enum DeliveryError {
    /// Connection-level failure: refused, aborted, DNS, timeout past margin.
    #[error("Transport error: {0}")]
    Transport(String),

    /// The server answered with an error payload or status.
    #[error("Server error: {0}")]
    Server(String),

    /// The payload did not have the expected shape.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The identity store failed outright.
    #[error("Identity error: {0}")]
    Identity(#[from] IdentityError),

    /// The configuration was rejected.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// An endpoint URL is missing or unusable.
    #[error("Endpoint not configured: {0}")]
    NotConfigured(String),

    /// The loop task went away before answering.
    #[error("Delivery loop is no longer available")]
    LoopClosed,

    /// The reconnect budget ran out.
    #[error("Gave up after {attempts} reconnect attempts")]
    Exhausted {
        /// Consecutive failed attempts.
        attempts: u32,
    },
}

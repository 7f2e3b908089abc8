//! # Data Retrieval Module
//!
//! Generic HTTP plumbing for the control calls of the delivery subsystem
//! (cursor reset, delivery confirmation).
//!
//! ## Contained Modules:
//!
//! - **`ky_http`**: An `ApiClient` built on `reqwest` and `reqwest-middleware`,
//!   with exponential backoff retries for transient failures. Long-poll
//!   requests deliberately bypass it: their retry timing belongs to the
//!   delivery loop's `RetryScheduler`.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

/// Generic HTTP API client with retry middleware for resilient control requests.
pub mod ky_http;

pub use ky_http::{ApiClient, ApiResponse};

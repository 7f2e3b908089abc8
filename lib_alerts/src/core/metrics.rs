//! # Delivery Metrics
//!
//! Counters for one delivery loop plus a rolling window of probe round-trip
//! times. Purely observational: nothing here feeds back into dedup, ordering
//! or retry decisions.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use serde::Serialize;

/// Number of probe samples kept.
const LATENCY_WINDOW: usize = 256;

/// Rolling window of latency samples in milliseconds.
#[derive(Debug, Clone)]
pub struct LatencyStats {
    samples: VecDeque<f64>,
    window: usize,
}

impl Default for LatencyStats {
    fn default() -> Self {
        Self::with_window(LATENCY_WINDOW)
    }
}

impl LatencyStats {
    /// Keeps the last `window` samples.
    pub fn with_window(window: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(window.min(LATENCY_WINDOW)),
            window: window.max(1),
        }
    }

    /// Adds one sample, evicting the oldest when full.
    pub fn record(&mut self, rtt: Duration) {
        if self.samples.len() == self.window {
            self.samples.pop_front();
        }
        self.samples.push_back(rtt.as_secs_f64() * 1000.0);
    }

    /// Number of samples in the window.
    pub fn count(&self) -> usize {
        self.samples.len()
    }

    /// Arithmetic mean, 0 when empty.
    pub fn mean(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        self.samples.iter().sum::<f64>() / self.samples.len() as f64
    }

    /// Smallest sample, 0 when empty.
    pub fn min(&self) -> f64 {
        self.samples.iter().copied().reduce(f64::min).unwrap_or(0.0)
    }

    /// Largest sample, 0 when empty.
    pub fn max(&self) -> f64 {
        self.samples.iter().copied().reduce(f64::max).unwrap_or(0.0)
    }

    /// Percentile with linear interpolation between closest ranks.
    pub fn percentile(&self, pct: f64) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        let mut sorted: Vec<f64> = self.samples.iter().copied().collect();
        sorted.sort_by(|a, b| a.total_cmp(b));

        let rank = (pct.clamp(0.0, 100.0) / 100.0) * (sorted.len() - 1) as f64;
        let lower = rank.floor() as usize;
        let upper = rank.ceil() as usize;
        if lower == upper {
            sorted[lower]
        } else {
            sorted[lower] + (sorted[upper] - sorted[lower]) * (rank - lower as f64)
        }
    }
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    /// Alerts handed to the sink.
    pub alerts_delivered: u64,
    /// Replays suppressed by dedup.
    pub duplicates_suppressed: u64,
    /// Empty acquires.
    pub timeouts: u64,
    /// Server error payloads.
    pub server_errors: u64,
    /// Connection failures.
    pub transport_errors: u64,
    /// Malformed payloads.
    pub protocol_errors: u64,
    /// Successful acquires that followed a failure.
    pub recoveries: u64,
    /// Delivery confirmations acknowledged.
    pub confirmations_sent: u64,
    /// Probe round trips measured.
    pub probe_count: usize,
    /// Mean probe RTT in ms.
    pub probe_mean_ms: f64,
    /// Fastest probe RTT in ms.
    pub probe_min_ms: f64,
    /// Slowest probe RTT in ms.
    pub probe_max_ms: f64,
    /// 95th percentile probe RTT in ms.
    pub probe_p95_ms: f64,
}

/// Counters for one loop: atomics for the tallies, a mutex around the probe
/// latency window.
#[derive(Debug, Default)]
pub struct DeliveryMetrics {
    alerts_delivered: AtomicU64,
    duplicates_suppressed: AtomicU64,
    timeouts: AtomicU64,
    server_errors: AtomicU64,
    transport_errors: AtomicU64,
    protocol_errors: AtomicU64,
    recoveries: AtomicU64,
    confirmations_sent: AtomicU64,
    probes: Mutex<LatencyStats>,
}

impl DeliveryMetrics {
    /// Zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn alert_delivered(&self) {
        self.alerts_delivered.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn duplicate_suppressed(&self) {
        self.duplicates_suppressed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn timeout(&self) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn server_error(&self) {
        self.server_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn transport_error(&self) {
        self.transport_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn protocol_error(&self) {
        self.protocol_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn recovery(&self) {
        self.recoveries.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn confirmation_sent(&self) {
        self.confirmations_sent.fetch_add(1, Ordering::Relaxed);
    }

    /// Records one ping/pong round trip.
    pub fn record_probe(&self, rtt: Duration) {
        let mut probes = self.probes.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        probes.record(rtt);
    }

    /// Copies the current values.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let probes = self
            .probes
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        MetricsSnapshot {
            alerts_delivered: self.alerts_delivered.load(Ordering::Relaxed),
            duplicates_suppressed: self.duplicates_suppressed.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            server_errors: self.server_errors.load(Ordering::Relaxed),
            transport_errors: self.transport_errors.load(Ordering::Relaxed),
            protocol_errors: self.protocol_errors.load(Ordering::Relaxed),
            recoveries: self.recoveries.load(Ordering::Relaxed),
            confirmations_sent: self.confirmations_sent.load(Ordering::Relaxed),
            probe_count: probes.count(),
            probe_mean_ms: probes.mean(),
            probe_min_ms: probes.min(),
            probe_max_ms: probes.max(),
            probe_p95_ms: probes.percentile(95.0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percentile_interpolates() {
        let mut stats = LatencyStats::default();
        for ms in [10, 20, 30, 40, 50] {
            stats.record(Duration::from_millis(ms));
        }
        assert!((stats.mean() - 30.0).abs() < 1e-9);
        assert!((stats.percentile(95.0) - 48.0).abs() < 1e-9);
        assert!((stats.percentile(50.0) - 30.0).abs() < 1e-9);
        assert_eq!(stats.min(), 10.0);
        assert_eq!(stats.max(), 50.0);
    }

    #[test]
    fn window_drops_oldest() {
        let mut stats = LatencyStats::with_window(2);
        stats.record(Duration::from_millis(100));
        stats.record(Duration::from_millis(1));
        stats.record(Duration::from_millis(3));
        assert_eq!(stats.count(), 2);
        assert_eq!(stats.max(), 3.0);
    }

    #[test]
    fn empty_stats_are_zero() {
        let stats = LatencyStats::default();
        assert_eq!(stats.mean(), 0.0);
        assert_eq!(stats.percentile(95.0), 0.0);
    }

    #[test]
    fn snapshot_reflects_counters() {
        let metrics = DeliveryMetrics::new();
        metrics.alert_delivered();
        metrics.duplicate_suppressed();
        metrics.duplicate_suppressed();
        metrics.record_probe(Duration::from_millis(12));

        let snap = metrics.snapshot();
        assert_eq!(snap.alerts_delivered, 1);
        assert_eq!(snap.duplicates_suppressed, 2);
        assert_eq!(snap.probe_count, 1);
        assert!((snap.probe_mean_ms - 12.0).abs() < 1e-9);
    }
}

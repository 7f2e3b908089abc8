//! # Dedup Tracker
//!
//! Remembers which alerts a client has already surfaced. Retries and
//! reconnects may replay alerts; only the first copy reaches the sink.
//!
//! Alerts without a derivable identity are always admitted. A missed dedup
//! shows the user a duplicate; a false positive would hide a real alert.

use std::collections::{HashSet, VecDeque};

use crate::core::alert::Alert;

/// Seen-set with optional FIFO eviction.
#[derive(Debug, Default)]
pub struct DedupTracker {
    seen: HashSet<String>,
    /// Insertion order, used for eviction.
    order: VecDeque<String>,
    capacity: Option<usize>,
}

impl DedupTracker {
    /// Tracker remembering at most `capacity` ids (`None` = unbounded).
    pub fn new(capacity: Option<usize>) -> Self {
        Self {
            seen: HashSet::new(),
            order: VecDeque::new(),
            capacity: capacity.filter(|c| *c > 0),
        }
    }

    /// Returns true the first time `id` is seen and records it.
    pub fn is_new(&mut self, id: &str) -> bool {
        if self.seen.contains(id) {
            return false;
        }
        self.seen.insert(id.to_string());
        self.order.push_back(id.to_string());

        if let Some(cap) = self.capacity {
            while self.order.len() > cap {
                if let Some(oldest) = self.order.pop_front() {
                    self.seen.remove(&oldest);
                    log::trace!("Dedup capacity reached, forgetting {}", oldest);
                }
            }
        }
        true
    }

    /// Applies the identity policy of [`Alert::dedup_key`] and records new alerts.
    pub fn admit(&mut self, alert: &Alert) -> bool {
        match alert.dedup_key() {
            Some(key) => self.is_new(&key),
            None => {
                log::debug!("Alert '{}' has no stable id, admitting without dedup", alert.title);
                true
            }
        }
    }

    /// Forgets everything. Pair with a server-side cursor reset.
    pub fn clear(&mut self) {
        self.seen.clear();
        self.order.clear();
    }

    /// Number of remembered ids.
    pub fn len(&self) -> usize {
        self.seen.len()
    }

    /// True when nothing has been seen yet.
    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

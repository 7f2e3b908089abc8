//! # Alert Model
//!
//! The unit of delivery. Both transports carry the same fields; the stream
//! names the identifier `alert_id`, the long-poll payload names it `id`.

use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// A notification produced by the server. Never mutated after receipt.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    /// Server-assigned identifier.
    #[serde(default, alias = "alert_id", skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Short headline.
    #[serde(default)]
    pub title: String,
    /// Body text.
    #[serde(default)]
    pub message: String,
    /// 1-based position within the current batch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sequence: Option<u64>,
    /// Size of the current batch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total: Option<u64>,
    /// Explicit backlog signal from the server, when it sends one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub has_more: Option<bool>,
    /// Tracking id for delivery confirmation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    /// Whether the server expects a delivery confirmation.
    #[serde(default)]
    pub requires_confirmation: bool,
    /// Server send time, epoch milliseconds.
    #[serde(default, alias = "produced_at", skip_serializing_if = "Option::is_none")]
    pub server_send_timestamp: Option<f64>,
    /// Seconds the alert waited server-side before delivery.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wait_time: Option<f64>,
}

impl Alert {
    /// Builds an alert with a server id and no batch metadata.
    pub fn new(id: impl Into<String>, title: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            title: title.into(),
            message: message.into(),
            ..Default::default()
        }
    }

    /// Sets the batch position.
    pub fn in_batch(mut self, sequence: u64, total: u64) -> Self {
        self.sequence = Some(sequence);
        self.total = Some(total);
        self
    }

    /// `sequence` and `total` travel together.
    pub fn check_batch_position(&self) -> Result<(), String> {
        match (self.sequence, self.total) {
            (Some(_), None) => Err("alert has a sequence but no total".into()),
            (None, Some(_)) => Err("alert has a total but no sequence".into()),
            _ => Ok(()),
        }
    }

    /// Identity used for dedup, in priority order: server id, then
    /// `(title, sequence)`. `None` means the alert cannot be deduplicated.
    ///
    /// The two sources are prefixed so a server id never matches a
    /// synthesized key.
    pub fn dedup_key(&self) -> Option<String> {
        if let Some(id) = self.id.as_deref().filter(|id| !id.trim().is_empty()) {
            return Some(format!("id:{}", id));
        }
        match self.sequence {
            Some(seq) if !self.title.is_empty() => Some(format!("seq:{}#{}", self.title, seq)),
            _ => None,
        }
    }

    /// True when more alerts are queued behind this one.
    pub fn has_backlog(&self) -> bool {
        if let Some(more) = self.has_more {
            return more;
        }
        matches!((self.sequence, self.total), (Some(seq), Some(total)) if seq < total)
    }

    /// The confirmation id, if the server asked for one.
    pub fn confirmation_id(&self) -> Option<&str> {
        if self.requires_confirmation {
            self.message_id.as_deref()
        } else {
            None
        }
    }

    /// Server send time as a UTC timestamp.
    pub fn produced_at(&self) -> Option<DateTime<Utc>> {
        let millis = self.server_send_timestamp?;
        Utc.timestamp_millis_opt(millis as i64).single()
    }

    /// Server-side queueing time.
    pub fn wait_time(&self) -> Option<Duration> {
        self.wait_time.and_then(|secs| Duration::try_from_secs_f64(secs).ok())
    }
}

//! # Long-Poll Channel
//!
//! One `GET <poll-url>?client_id=<id>&timeout=<secs>` per acquire. The server
//! holds the request until an alert is queued for the client or the timeout
//! hint elapses, then answers with one of:
//!
//! ```json
//! {"alert": {"id": "a1", "title": "...", "message": "...", "sequence": 1, "total": 2}}
//! {"timeout": true}
//! {"error": "..."}
//! ```
//!
//! ## Abort Rule
//! The client aborts a request at `timeout hint + margin`. A reply inside the
//! hint is a legitimate hold; silence past the margin is a slow or dead network
//! and is reported as a transport error.

use std::time::Duration;

use chrono::Utc;
use reqwest::{Method, Url};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::channels::{ChannelKind, DeliveryChannel, DeliveryResult};
use crate::configs::DeliveryConfig;
use crate::core::alert::Alert;
use crate::core::error::DeliveryError;
use crate::retrieve::ApiClient;

/// Body of a long-poll reply. Unknown fields are ignored.
#[derive(Debug, Default, Deserialize)]
struct PollEnvelope {
    #[serde(default)]
    alert: Option<Alert>,
    #[serde(default)]
    timeout: Option<bool>,
    #[serde(default)]
    error: Option<Value>,
    #[serde(default)]
    has_more: Option<bool>,
}

fn error_text(value: Value) -> String {
    match value {
        Value::String(s) => s,
        other => other.to_string(),
    }
}

/// # Parse Poll Body
///
/// Classifies one reply. Non-2xx replies are server errors, carrying the
/// server's message when the body has one. A 2xx body that is not one of the
/// three known shapes is a protocol error.
pub fn parse_poll_body(status: u16, body: &str) -> DeliveryResult {
    if !(200..300).contains(&status) {
        let message = serde_json::from_str::<PollEnvelope>(body)
            .ok()
            .and_then(|envelope| envelope.error)
            .map(error_text)
            .unwrap_or_else(|| format!("HTTP {}", status));
        return DeliveryResult::ServerError(message);
    }

    let envelope: PollEnvelope = match serde_json::from_str(body) {
        Ok(envelope) => envelope,
        Err(e) => return DeliveryResult::ProtocolError(format!("unreadable poll reply: {}", e)),
    };

    if let Some(error) = envelope.error {
        return DeliveryResult::ServerError(error_text(error));
    }

    if let Some(mut alert) = envelope.alert {
        if let Err(reason) = alert.check_batch_position() {
            return DeliveryResult::ProtocolError(reason);
        }
        if alert.has_more.is_none() {
            alert.has_more = envelope.has_more;
        }
        return DeliveryResult::Alert(alert);
    }

    if envelope.timeout == Some(true) {
        return DeliveryResult::Timeout;
    }

    DeliveryResult::ProtocolError("poll reply has neither alert, timeout nor error".into())
}

/// # Long-Poll Channel
///
/// Stateless between acquires apart from the pooled HTTP connection.
pub struct LongPollChannel {
    client: reqwest::Client,
    poll_url: Url,
    timeout_hint: Duration,
    abort_timeout: Duration,
    /// Endpoint for delivery confirmations, when the server wants them.
    confirm: Option<ApiClient>,
}

impl LongPollChannel {
    /// Channel polling `poll_url`, aborting each request at `timeout_hint + abort_margin`.
    pub fn new(poll_url: &str, timeout_hint: Duration, abort_margin: Duration) -> Result<Self, DeliveryError> {
        let poll_url = Url::parse(poll_url)
            .map_err(|e| DeliveryError::NotConfigured(format!("poll url '{}': {}", poll_url, e)))?;

        let client = reqwest::Client::builder()
            .user_agent("AlertClient/1.0")
            .build()
            .map_err(|e| DeliveryError::Transport(e.to_string()))?;

        Ok(Self {
            client,
            poll_url,
            timeout_hint,
            abort_timeout: timeout_hint.saturating_add(abort_margin),
            confirm: None,
        })
    }

    /// Channel from the configured poll and confirmation endpoints.
    pub fn from_config(config: &DeliveryConfig) -> Result<Self, DeliveryError> {
        let channel = Self::new(
            &config.poll_url,
            config.timeout_hint(),
            config.abort_timeout().saturating_sub(config.timeout_hint()),
        )?;
        match &config.confirm_url {
            Some(url) => channel.with_confirm_endpoint(url),
            None => Ok(channel),
        }
    }

    /// POSTs delivery confirmations to `url`.
    pub fn with_confirm_endpoint(mut self, url: &str) -> Result<Self, DeliveryError> {
        let client = ApiClient::new(url, None)
            .map_err(|e| DeliveryError::NotConfigured(format!("confirm url '{}': {}", url, e)))?;
        self.confirm = Some(client);
        Ok(self)
    }

    /// Hold window requested from the server.
    pub fn timeout_hint(&self) -> Duration {
        self.timeout_hint
    }

    /// Hard client-side abort.
    pub fn abort_timeout(&self) -> Duration {
        self.abort_timeout
    }

    fn request_url(&self, client_id: &str) -> Url {
        let mut url = self.poll_url.clone();
        url.query_pairs_mut()
            .append_pair("client_id", client_id)
            .append_pair("timeout", &self.timeout_hint.as_secs().to_string());
        url
    }
}

impl DeliveryChannel for LongPollChannel {
    fn kind(&self) -> ChannelKind {
        ChannelKind::LongPoll
    }

    async fn acquire(&mut self, client_id: &str) -> DeliveryResult {
        let url = self.request_url(client_id);
        log::trace!("Long-poll GET {}", url);

        let response = match self.client.get(url).timeout(self.abort_timeout).send().await {
            Ok(response) => response,
            Err(e) if e.is_timeout() => {
                return DeliveryResult::TransportError(format!(
                    "no reply within {}s",
                    self.abort_timeout.as_secs()
                ));
            }
            Err(e) => return DeliveryResult::TransportError(e.to_string()),
        };

        let status = response.status().as_u16();
        match response.text().await {
            Ok(body) => parse_poll_body(status, &body),
            Err(e) => DeliveryResult::TransportError(format!("reply body lost: {}", e)),
        }
    }

    async fn confirm(&mut self, client_id: &str, alert: &Alert) -> bool {
        let (Some(api), Some(notification_id)) = (&self.confirm, alert.confirmation_id()) else {
            return false;
        };

        let body = json!({
            "notification_id": notification_id,
            "client_id": client_id,
            "received_at": Utc::now().timestamp_millis(),
        });

        match api.request::<Value, _>(Method::POST, "", None, Some(body)).await {
            Ok(resp) if resp.success => true,
            Ok(resp) => {
                log::warn!("Confirmation of {} rejected with HTTP {}", notification_id, resp.status);
                false
            }
            Err(e) => {
                log::warn!("Confirmation of {} failed: {}", notification_id, e);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alert_reply() {
        let body = r#"{"alert":{"id":"a1","title":"X","message":"Y","sequence":1,"total":2}}"#;
        match parse_poll_body(200, body) {
            DeliveryResult::Alert(alert) => {
                assert_eq!(alert.id.as_deref(), Some("a1"));
                assert!(alert.has_backlog());
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn envelope_has_more_is_applied() {
        let body = r#"{"alert":{"id":"a1","title":"X","message":"Y"},"has_more":true}"#;
        match parse_poll_body(200, body) {
            DeliveryResult::Alert(alert) => assert!(alert.has_backlog()),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn timeout_and_error_replies() {
        assert_eq!(parse_poll_body(200, r#"{"timeout":true}"#), DeliveryResult::Timeout);
        assert_eq!(
            parse_poll_body(200, r#"{"error":"queue offline"}"#),
            DeliveryResult::ServerError("queue offline".into())
        );
        assert_eq!(
            parse_poll_body(400, r#"{"error":"client_id required"}"#),
            DeliveryResult::ServerError("client_id required".into())
        );
        assert_eq!(parse_poll_body(502, "<html>"), DeliveryResult::ServerError("HTTP 502".into()));
    }

    #[test]
    fn malformed_replies_are_protocol_errors() {
        assert!(matches!(parse_poll_body(200, "not json"), DeliveryResult::ProtocolError(_)));
        assert!(matches!(parse_poll_body(200, r#"{"status":"ok"}"#), DeliveryResult::ProtocolError(_)));
        assert!(matches!(
            parse_poll_body(200, r#"{"alert":{"id":"a1","title":"X","message":"Y","sequence":1}}"#),
            DeliveryResult::ProtocolError(_)
        ));
    }

    #[test]
    fn request_carries_client_and_hint() {
        let channel = LongPollChannel::new(
            "http://localhost:8001/api/poll/alerts/",
            Duration::from_secs(30),
            Duration::from_secs(5),
        )
        .unwrap();
        let url = channel.request_url("client_1");
        assert_eq!(url.query(), Some("client_id=client_1&timeout=30"));
        assert_eq!(channel.abort_timeout(), Duration::from_secs(35));
    }

    #[test]
    fn invalid_url_is_not_configured() {
        let result = LongPollChannel::new("not a url", Duration::from_secs(1), Duration::from_secs(1));
        assert!(matches!(result, Err(DeliveryError::NotConfigured(_))));
    }

    #[test]
    fn abort_timeout_saturates() {
        let channel = LongPollChannel::new("http://localhost/poll/", Duration::MAX, Duration::from_secs(5)).unwrap();
        assert_eq!(channel.abort_timeout(), Duration::MAX);
    }

    #[test]
    fn from_config_uses_margin() {
        let config = DeliveryConfig {
            timeout_hint_secs: 10,
            abort_margin_secs: 5,
            ..Default::default()
        };
        let channel = LongPollChannel::from_config(&config).unwrap();
        assert_eq!(channel.timeout_hint(), Duration::from_secs(10));
        assert_eq!(channel.abort_timeout(), Duration::from_secs(15));
    }
}

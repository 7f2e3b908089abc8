//! # Alert Stream Channel
//!
//! WebSocket subscription to the alert server. The connection is opened lazily
//! on the first acquire after a (re)connect and announces itself with
//! `start_alerts`; from then on every pushed frame is one acquire result.
//!
//! ## Heartbeat
//! - After `ping_interval` without traffic the channel sends a `ping` probe and
//!   yields [`DeliveryResult::Timeout`], so quiet periods look like empty polls
//!   to the loop.
//! - After `silent_failure_timeout` without any inbound frame the socket is
//!   dropped and a transport error is reported; the next acquire reconnects.
//! - `pong` replies feed the probe latency window in [`DeliveryMetrics`] and
//!   nothing else.
//!
//! ## Wire Format
//! Client to server: `start_alerts`, `stop_alerts`, `ping`,
//! `delivery_confirmation`. Server to client: `alert`, `pong`, `status`,
//! `error`. Other message types are ignored.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use reqwest::Url;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::time::{sleep_until, timeout, Instant};
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::channels::{ChannelKind, DeliveryChannel, DeliveryResult};
use crate::configs::DeliveryConfig;
use crate::core::alert::Alert;
use crate::core::error::DeliveryError;
use crate::core::metrics::DeliveryMetrics;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Outstanding probes kept before the table is flushed.
const MAX_PENDING_PINGS: usize = 32;
/// Grace period for the closing handshake.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ServerMessage {
    Alert(Alert),
    Pong {
        #[serde(default)]
        ping_id: Value,
    },
    Status {
        #[serde(default)]
        message: String,
    },
    Error {
        #[serde(default)]
        message: String,
    },
    #[serde(other)]
    Other,
}

/// A decoded server frame.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamFrame {
    /// Something the loop must see.
    Result(DeliveryResult),
    /// Probe reply carrying the echoed ping id.
    Pong(Option<u64>),
    /// Frame without meaning for delivery.
    Ignored,
}

/// Decodes one text frame.
pub fn parse_stream_message(text: &str) -> StreamFrame {
    let message: ServerMessage = match serde_json::from_str(text) {
        Ok(message) => message,
        Err(e) => {
            return StreamFrame::Result(DeliveryResult::ProtocolError(format!(
                "unreadable stream frame: {}",
                e
            )))
        }
    };

    match message {
        ServerMessage::Alert(alert) => match alert.check_batch_position() {
            Ok(()) => StreamFrame::Result(DeliveryResult::Alert(alert)),
            Err(reason) => StreamFrame::Result(DeliveryResult::ProtocolError(reason)),
        },
        ServerMessage::Pong { ping_id } => StreamFrame::Pong(match ping_id {
            Value::Number(n) => n.as_u64(),
            Value::String(s) => s.parse().ok(),
            _ => None,
        }),
        ServerMessage::Status { message } => StreamFrame::Result(DeliveryResult::Status(message)),
        ServerMessage::Error { message } => StreamFrame::Result(DeliveryResult::ServerError(message)),
        ServerMessage::Other => StreamFrame::Ignored,
    }
}

/// An open subscription.
struct Connection {
    ws: WsStream,
    last_inbound: Instant,
    last_ping: Instant,
}

/// Why the acquire wait woke up.
enum Wake {
    Frame(Option<Result<Message, tokio_tungstenite::tungstenite::Error>>),
    PingDue,
    Silent,
}

/// # Stream Channel
///
/// Owns at most one socket. Any transport failure drops it; reconnecting is
/// the next acquire's job, paced by the loop's retry policy.
pub struct StreamChannel {
    url: Url,
    ping_interval: Duration,
    silent_failure_timeout: Duration,
    connection: Option<Connection>,
    metrics: Option<Arc<DeliveryMetrics>>,
    next_ping_id: u64,
    pending_pings: HashMap<u64, Instant>,
}

impl StreamChannel {
    /// Channel for a `ws://` or `wss://` endpoint.
    pub fn new(url: &str, ping_interval: Duration, silent_failure_timeout: Duration) -> Result<Self, DeliveryError> {
        let parsed = Url::parse(url).map_err(|e| DeliveryError::NotConfigured(format!("stream url '{}': {}", url, e)))?;
        if !matches!(parsed.scheme(), "ws" | "wss") {
            return Err(DeliveryError::NotConfigured(format!(
                "stream url '{}' must use ws:// or wss://",
                url
            )));
        }

        Ok(Self {
            url: parsed,
            ping_interval,
            silent_failure_timeout,
            connection: None,
            metrics: None,
            next_ping_id: 1,
            pending_pings: HashMap::new(),
        })
    }

    /// Channel from the configured stream endpoint and heartbeat timings.
    pub fn from_config(config: &DeliveryConfig) -> Result<Self, DeliveryError> {
        Self::new(&config.stream_url, config.ping_interval(), config.silent_failure_timeout())
    }

    /// True while a socket is open.
    pub fn is_connected(&self) -> bool {
        self.connection.is_some()
    }

    async fn connect(&self, client_id: &str) -> Result<Connection, String> {
        log::info!("Connecting to alert stream: {}", self.url);

        let (mut ws, _) = match timeout(self.silent_failure_timeout, connect_async(self.url.as_str())).await {
            Ok(Ok(pair)) => pair,
            Ok(Err(e)) => return Err(format!("stream connect failed: {}", e)),
            Err(_) => {
                return Err(format!(
                    "stream connect timed out after {}s",
                    self.silent_failure_timeout.as_secs()
                ))
            }
        };

        let start = json!({
            "type": "start_alerts",
            "client_id": client_id,
            "timestamp": Utc::now().timestamp_millis(),
        });
        ws.send(Message::Text(start.to_string().into()))
            .await
            .map_err(|e| format!("start_alerts not sent: {}", e))?;

        log::info!("Alert stream subscribed as {}", client_id);
        let now = Instant::now();
        Ok(Connection {
            ws,
            last_inbound: now,
            last_ping: now,
        })
    }

    fn disconnect(&mut self) {
        self.connection = None;
        self.pending_pings.clear();
    }

    async fn send_ping(&mut self) -> Result<(), String> {
        let ping_id = self.next_ping_id;
        self.next_ping_id = self.next_ping_id.wrapping_add(1);

        if self.pending_pings.len() >= MAX_PENDING_PINGS {
            log::debug!("{} probes unanswered, flushing probe table", self.pending_pings.len());
            self.pending_pings.clear();
        }

        let Some(conn) = self.connection.as_mut() else {
            return Err("not connected".into());
        };
        let ping = json!({
            "type": "ping",
            "ping_id": ping_id,
            "timestamp": Utc::now().timestamp_millis(),
        });
        conn.ws
            .send(Message::Text(ping.to_string().into()))
            .await
            .map_err(|e| format!("ping not sent: {}", e))?;

        let now = Instant::now();
        conn.last_ping = now;
        self.pending_pings.insert(ping_id, now);
        log::trace!("Probe {} sent", ping_id);
        Ok(())
    }

    fn record_pong(&mut self, ping_id: Option<u64>) {
        let Some(sent) = ping_id.and_then(|id| self.pending_pings.remove(&id)) else {
            log::debug!("Pong for unknown probe {:?}", ping_id);
            return;
        };
        let rtt = sent.elapsed();
        log::trace!("Probe round trip {}ms", rtt.as_millis());
        if let Some(metrics) = &self.metrics {
            metrics.record_probe(rtt);
        }
    }

    async fn send_json(&mut self, payload: Value) -> Result<(), String> {
        let Some(conn) = self.connection.as_mut() else {
            return Err("not connected".into());
        };
        conn.ws
            .send(Message::Text(payload.to_string().into()))
            .await
            .map_err(|e| e.to_string())
    }
}

impl DeliveryChannel for StreamChannel {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Stream
    }

    fn attach_metrics(&mut self, metrics: Arc<DeliveryMetrics>) {
        self.metrics = Some(metrics);
    }

    async fn acquire(&mut self, client_id: &str) -> DeliveryResult {
        if self.connection.is_none() {
            match self.connect(client_id).await {
                Ok(conn) => self.connection = Some(conn),
                Err(msg) => return DeliveryResult::TransportError(msg),
            }
        }

        loop {
            let Some(conn) = self.connection.as_mut() else {
                return DeliveryResult::TransportError("not connected".into());
            };

            let ping_at = conn.last_inbound.max(conn.last_ping) + self.ping_interval;
            let dead_at = conn.last_inbound + self.silent_failure_timeout;

            let wake = tokio::select! {
                frame = conn.ws.next() => Wake::Frame(frame),
                _ = sleep_until(ping_at) => Wake::PingDue,
                _ = sleep_until(dead_at) => Wake::Silent,
            };

            match wake {
                Wake::Frame(Some(Ok(Message::Text(text)))) => {
                    conn.last_inbound = Instant::now();
                    match parse_stream_message(text.as_str()) {
                        StreamFrame::Result(result) => return result,
                        StreamFrame::Pong(ping_id) => self.record_pong(ping_id),
                        StreamFrame::Ignored => log::debug!("Ignoring stream frame: {}", text.as_str()),
                    }
                }
                Wake::Frame(Some(Ok(Message::Close(frame)))) => {
                    self.disconnect();
                    let reason = frame
                        .map(|f| f.reason.as_str().to_string())
                        .filter(|r| !r.is_empty());
                    return DeliveryResult::TransportError(match reason {
                        Some(reason) => format!("server closed the stream: {}", reason),
                        None => "server closed the stream".into(),
                    });
                }
                Wake::Frame(Some(Ok(_))) => {
                    conn.last_inbound = Instant::now();
                }
                Wake::Frame(Some(Err(e))) => {
                    self.disconnect();
                    return DeliveryResult::TransportError(e.to_string());
                }
                Wake::Frame(None) => {
                    self.disconnect();
                    return DeliveryResult::TransportError("stream ended".into());
                }
                Wake::PingDue => {
                    if let Err(msg) = self.send_ping().await {
                        self.disconnect();
                        return DeliveryResult::TransportError(msg);
                    }
                    return DeliveryResult::Timeout;
                }
                Wake::Silent => {
                    log::warn!(
                        "No inbound traffic for {}s. Dropping stream.",
                        self.silent_failure_timeout.as_secs()
                    );
                    self.disconnect();
                    return DeliveryResult::TransportError("silent failure".into());
                }
            }
        }
    }

    async fn confirm(&mut self, client_id: &str, alert: &Alert) -> bool {
        let Some(message_id) = alert.confirmation_id() else {
            return false;
        };
        let payload = json!({
            "type": "delivery_confirmation",
            "message_id": message_id,
            "client_id": client_id,
            "received_at": Utc::now().timestamp_millis(),
        });
        match self.send_json(payload).await {
            Ok(()) => true,
            Err(e) => {
                log::warn!("Confirmation of {} not sent: {}", message_id, e);
                false
            }
        }
    }

    async fn close(&mut self, client_id: &str) {
        if self.connection.is_none() {
            return;
        }

        let stop = json!({ "type": "stop_alerts", "client_id": client_id });
        if let Err(e) = self.send_json(stop).await {
            log::debug!("stop_alerts not sent: {}", e);
        }

        if let Some(mut conn) = self.connection.take() {
            match timeout(CLOSE_TIMEOUT, conn.ws.close(None)).await {
                Ok(Ok(())) => log::info!("Alert stream closed"),
                Ok(Err(e)) => log::debug!("Close handshake failed: {}", e),
                Err(_) => log::debug!("Close handshake timed out"),
            }
        }
        self.pending_pings.clear();
    }
}

//! # Mock Alert Server
//!
//! An in-process `axum` server speaking the alert server's protocol, for
//! end-to-end tests of both delivery channels.
//!
//! ## Endpoints
//! - `GET /api/poll/alerts/?client_id=&timeout=`: long poll with a per-client
//!   cursor over the published alerts.
//! - `POST /api/poll/reset/` (form `client_id`): rewinds that cursor.
//! - `POST /api/notifications/confirm/` (JSON): records a delivery confirmation.
//! - `GET /ws/alerts/`: WebSocket stream (`start_alerts`, `stop_alerts`,
//!   `ping`, `delivery_confirmation`).
//!
//! Faults can be queued to make the next long poll misbehave.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use axum::{
    Form, Json, Router,
    extract::{
        Query, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{Instant, timeout_at};

use lib_alerts::{DeliveryConfig, SinkEvent};

/// A scripted misbehaviour for the next long poll.
#[derive(Debug, Clone)]
pub enum Fault {
    /// Answer with this status and raw body.
    Reply(u16, String),
    /// Send the previously served alert again without moving the cursor.
    ReplayLast,
}

#[derive(Debug, Clone)]
struct Published {
    id: String,
    title: String,
    message: String,
    confirm: bool,
}

#[derive(Default)]
struct Inner {
    alerts: Vec<Published>,
    cursors: HashMap<String, usize>,
    last_served: HashMap<String, Value>,
    faults: VecDeque<Fault>,
    reset_replies: VecDeque<(u16, String)>,
    poll_requests: Vec<(String, Option<u64>)>,
    resets: Vec<String>,
    confirmations: Vec<String>,
    stream_starts: Vec<String>,
    stream_stops: Vec<String>,
}

/// Shared server state, also used by tests to publish and inspect.
#[derive(Clone, Default)]
pub struct MockState {
    inner: Arc<Mutex<Inner>>,
    published: Arc<Notify>,
}

impl MockState {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Queues an alert for every client.
    pub fn publish(&self, id: &str, title: &str, message: &str) {
        self.push(id, title, message, false);
    }

    /// Queues an alert that asks for a delivery confirmation.
    pub fn publish_confirmable(&self, id: &str, title: &str, message: &str) {
        self.push(id, title, message, true);
    }

    fn push(&self, id: &str, title: &str, message: &str, confirm: bool) {
        self.lock().alerts.push(Published {
            id: id.to_string(),
            title: title.to_string(),
            message: message.to_string(),
            confirm,
        });
        self.published.notify_waiters();
    }

    /// Makes the next long poll misbehave.
    pub fn inject(&self, fault: Fault) {
        self.lock().faults.push_back(fault);
    }

    /// Makes the next reset answer with this status and raw body, leaving
    /// the cursor alone.
    pub fn inject_reset_reply(&self, status: u16, body: &str) {
        self.lock().reset_replies.push_back((status, body.to_string()));
    }

    /// `(client_id, timeout)` of every long poll received.
    pub fn poll_requests(&self) -> Vec<(String, Option<u64>)> {
        self.lock().poll_requests.clone()
    }

    /// Client ids that reset their cursor.
    pub fn resets(&self) -> Vec<String> {
        self.lock().resets.clone()
    }

    /// Confirmed message ids, over either transport.
    pub fn confirmations(&self) -> Vec<String> {
        self.lock().confirmations.clone()
    }

    /// Client ids that sent `start_alerts`.
    pub fn stream_starts(&self) -> Vec<String> {
        self.lock().stream_starts.clone()
    }

    /// Client ids that sent `stop_alerts`.
    pub fn stream_stops(&self) -> Vec<String> {
        self.lock().stream_stops.clone()
    }

    /// Next alert for `client_id`, advancing its cursor.
    fn next_alert(&self, client_id: &str) -> Option<Value> {
        let mut inner = self.lock();
        let cursor = inner.cursors.get(client_id).copied().unwrap_or(0);
        let published = inner.alerts.get(cursor)?.clone();
        let total = inner.alerts.len();

        let mut alert = json!({
            "id": published.id,
            "title": published.title,
            "message": published.message,
            "sequence": cursor + 1,
            "total": total,
            "server_send_timestamp": epoch_millis(),
        });
        if published.confirm {
            alert["message_id"] = json!(format!("msg_{}", published.id));
            alert["requires_confirmation"] = json!(true);
        }

        inner.cursors.insert(client_id.to_string(), cursor + 1);
        inner.last_served.insert(client_id.to_string(), alert.clone());
        Some(alert)
    }
}

fn epoch_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

fn fault_response(fault: Fault, state: &MockState, client_id: &str) -> Response {
    match fault {
        Fault::Reply(status, body) => {
            let status = StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            (status, body).into_response()
        }
        Fault::ReplayLast => {
            let last = state.lock().last_served.get(client_id).cloned();
            match last {
                Some(alert) => Json(json!({ "alert": alert })).into_response(),
                None => Json(json!({ "timeout": true })).into_response(),
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct PollParams {
    client_id: Option<String>,
    timeout: Option<u64>,
}

async fn poll_handler(State(state): State<MockState>, Query(params): Query<PollParams>) -> Response {
    let Some(client_id) = params.client_id.filter(|id| !id.is_empty()) else {
        return (StatusCode::BAD_REQUEST, Json(json!({ "error": "client_id required" }))).into_response();
    };

    let fault = {
        let mut inner = state.lock();
        inner.poll_requests.push((client_id.clone(), params.timeout));
        inner.faults.pop_front()
    };
    if let Some(fault) = fault {
        return fault_response(fault, &state, &client_id);
    }

    let hold = Duration::from_secs(params.timeout.unwrap_or(30).min(60));
    let deadline = Instant::now() + hold;
    loop {
        let notified = state.published.notified();
        if let Some(alert) = state.next_alert(&client_id) {
            let has_more = {
                let inner = state.lock();
                inner.cursors.get(&client_id).copied().unwrap_or(0) < inner.alerts.len()
            };
            return Json(json!({ "alert": alert, "has_more": has_more })).into_response();
        }
        if timeout_at(deadline, notified).await.is_err() {
            return Json(json!({ "timeout": true })).into_response();
        }
    }
}

#[derive(Debug, Deserialize)]
struct ResetForm {
    client_id: Option<String>,
}

async fn reset_handler(State(state): State<MockState>, Form(form): Form<ResetForm>) -> Response {
    let scripted = state.lock().reset_replies.pop_front();
    if let Some((status, body)) = scripted {
        return fault_response(Fault::Reply(status, body), &state, "");
    }
    let Some(client_id) = form.client_id.filter(|id| !id.is_empty()) else {
        return (StatusCode::BAD_REQUEST, Json(json!({ "error": "client_id required" }))).into_response();
    };
    {
        let mut inner = state.lock();
        inner.cursors.insert(client_id.clone(), 0);
        inner.resets.push(client_id.clone());
    }
    Json(json!({ "status": "reset", "client_id": client_id })).into_response()
}

async fn confirm_handler(State(state): State<MockState>, Json(body): Json<Value>) -> Response {
    let Some(id) = body.get("notification_id").and_then(Value::as_str) else {
        return (StatusCode::BAD_REQUEST, Json(json!({ "error": "notification_id required" }))).into_response();
    };
    state.lock().confirmations.push(id.to_string());
    Json(json!({ "status": "confirmed" })).into_response()
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<MockState>) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

async fn send_json(socket: &mut WebSocket, payload: Value) -> bool {
    socket.send(Message::Text(payload.to_string().into())).await.is_ok()
}

async fn handle_socket(mut socket: WebSocket, state: MockState) {
    let mut subscriber: Option<String> = None;

    loop {
        let notified = state.published.notified();

        if let Some(client_id) = &subscriber {
            while let Some(mut alert) = state.next_alert(client_id) {
                if let Some(obj) = alert.as_object_mut() {
                    if let Some(id) = obj.remove("id") {
                        obj.insert("alert_id".into(), id);
                    }
                    obj.insert("type".into(), json!("alert"));
                }
                if !send_json(&mut socket, alert).await {
                    return;
                }
            }
        }

        tokio::select! {
            msg = socket.recv() => match msg {
                Some(Ok(Message::Text(text))) => {
                    let Ok(control) = serde_json::from_str::<Value>(text.as_str()) else {
                        if !send_json(&mut socket, json!({"type": "error", "message": "Invalid JSON"})).await {
                            return;
                        }
                        continue;
                    };
                    let client_id = control.get("client_id").and_then(Value::as_str).unwrap_or_default().to_string();
                    let reply = match control.get("type").and_then(Value::as_str) {
                        Some("start_alerts") => {
                            state.lock().stream_starts.push(client_id.clone());
                            subscriber = Some(client_id);
                            json!({"type": "status", "message": "Alert stream started"})
                        }
                        Some("stop_alerts") => {
                            state.lock().stream_stops.push(client_id);
                            subscriber = None;
                            json!({"type": "status", "message": "Alert stream stopped"})
                        }
                        Some("ping") => {
                            json!({"type": "pong", "ping_id": control.get("ping_id").cloned().unwrap_or(Value::Null)})
                        }
                        Some("delivery_confirmation") => {
                            if let Some(id) = control.get("message_id").and_then(Value::as_str) {
                                state.lock().confirmations.push(id.to_string());
                            }
                            continue;
                        }
                        _ => json!({"type": "error", "message": "Unknown message type"}),
                    };
                    if !send_json(&mut socket, reply).await {
                        return;
                    }
                }
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => return,
                Some(Ok(_)) => {}
            },
            _ = notified => {}
        }
    }
}

/// A running mock server. Aborted on drop.
pub struct MockServer {
    /// Bound address.
    pub addr: SocketAddr,
    /// Shared state for publishing and inspection.
    pub state: MockState,
    handle: JoinHandle<()>,
}

impl MockServer {
    /// Binds an ephemeral port on localhost and starts serving.
    pub async fn spawn() -> anyhow::Result<Self> {
        let state = MockState::default();
        let app = Router::new()
            .route("/api/poll/alerts/", get(poll_handler))
            .route("/api/poll/reset/", post(reset_handler))
            .route("/api/notifications/confirm/", post(confirm_handler))
            .route("/ws/alerts/", get(ws_handler))
            .with_state(state.clone());

        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let handle = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                log::error!("Mock alert server failed: {}", e);
            }
        });

        Ok(Self { addr, state, handle })
    }

    /// Long-poll endpoint URL.
    pub fn poll_url(&self) -> String {
        format!("http://{}/api/poll/alerts/", self.addr)
    }

    /// Reset endpoint URL.
    pub fn reset_url(&self) -> String {
        format!("http://{}/api/poll/reset/", self.addr)
    }

    /// Confirmation endpoint URL.
    pub fn confirm_url(&self) -> String {
        format!("http://{}/api/notifications/confirm/", self.addr)
    }

    /// WebSocket endpoint URL.
    pub fn stream_url(&self) -> String {
        format!("ws://{}/ws/alerts/", self.addr)
    }

    /// Delivery config pointing at this server, with delays shrunk for tests
    /// and the identity stored under `dir`.
    pub fn delivery_config(&self, dir: &Path) -> DeliveryConfig {
        DeliveryConfig {
            poll_url: self.poll_url(),
            reset_url: Some(self.reset_url()),
            confirm_url: Some(self.confirm_url()),
            stream_url: self.stream_url(),
            timeout_hint_secs: 1,
            abort_margin_secs: 1,
            base_delay_ms: 50,
            cap_delay_ms: 200,
            server_error_delay_ms: 50,
            caught_up_delay_ms: 10,
            idle_delay_ms: 10,
            protocol_error_delay_ms: 50,
            ping_interval_secs: 1,
            silent_failure_timeout_secs: 3,
            identity_path: Some(dir.join("identity.json")),
            ..Default::default()
        }
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Receives sink events until `count` alerts arrived or `limit` passed.
/// Returns the alert ids in arrival order.
pub async fn collect_alerts(
    rx: &mut mpsc::UnboundedReceiver<Arc<SinkEvent>>,
    count: usize,
    limit: Duration,
) -> Vec<String> {
    let deadline = Instant::now() + limit;
    let mut ids = Vec::new();
    while ids.len() < count {
        match timeout_at(deadline, rx.recv()).await {
            Ok(Some(event)) => {
                if let SinkEvent::Alert(alert) = &*event {
                    ids.push(alert.id.clone().unwrap_or_default());
                }
            }
            Ok(None) | Err(_) => break,
        }
    }
    ids
}

/// Collects every event that arrives within `window`.
pub async fn drain_events(rx: &mut mpsc::UnboundedReceiver<Arc<SinkEvent>>, window: Duration) -> Vec<Arc<SinkEvent>> {
    let deadline = Instant::now() + window;
    let mut events = Vec::new();
    while let Ok(Some(event)) = timeout_at(deadline, rx.recv()).await {
        events.push(event);
    }
    events
}

/// Polls `check` every 20ms until it holds or `limit` passed.
pub async fn eventually(limit: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + limit;
    loop {
        if check() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

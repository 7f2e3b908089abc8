//! # Delivery Loop
//!
//! Drives one [`DeliveryChannel`] for one client: acquire, dedup, hand new
//! alerts to the sink, wait as the [`RetryScheduler`] says, repeat.
//!
//! ## Concurrency Model
//! - The loop body runs as a single tokio task that owns the channel, the
//!   dedup tracker and the retry scheduler. There is exactly one acquire in
//!   flight at any time and alerts reach the sink in channel order.
//! - `stop()` cancels through a [`CancellationToken`]. An acquire still pending
//!   at that point is dropped, and one that resolves in the same instant is
//!   discarded before it reaches the sink or the scheduler.
//! - When the task ends it hands its state back, so a stopped loop can be
//!   restarted with its dedup memory intact.
//! - Control requests (cursor reset) travel to the task over an mpsc channel
//!   with a oneshot responder, and are served between and during acquires.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::channels::{ChannelKind, DeliveryChannel, DeliveryResult, LongPollChannel, StreamChannel};
use crate::configs::DeliveryConfig;
use crate::core::alert::Alert;
use crate::core::dedup::DedupTracker;
use crate::core::error::DeliveryError;
use crate::core::metrics::DeliveryMetrics;
use crate::core::retry::{OutcomeKind, RetryDecision, RetryPolicy, RetryScheduler};
use crate::core::sink::{AlertSink, ConnectionState};
use crate::identity::{ClientIdentity, FileIdentityStore, IdentityStore, MemoryIdentityStore};
use crate::retrieve::ApiClient;

/// Queue depth for control requests.
const COMMAND_BUFFER: usize = 8;

/// Lifecycle of a delivery loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    /// Not running. Initial state, and the state after `stop()`.
    Stopped,
    /// The loop task is acquiring.
    Running,
    /// The reconnect budget ran out. `start()` may be called again.
    Terminated,
}

/// Long-poll delivery loop.
pub type PollLoop<S> = DeliveryLoop<LongPollChannel, S>;
/// WebSocket delivery loop.
pub type StreamLoop<S> = DeliveryLoop<StreamChannel, S>;

#[derive(Debug)]
enum LoopCommand {
    Reset,
}

/// A control request plus the channel its answer goes back on.
struct LoopRequest {
    command: LoopCommand,
    responder: oneshot::Sender<Result<(), DeliveryError>>,
}

/// Per-client delivery memory, separate from the channel so both can be
/// borrowed at once while an acquire is pending.
struct Session {
    dedup: DedupTracker,
    reset_client: Option<ApiClient>,
    metrics: Arc<DeliveryMetrics>,
}

impl Session {
    /// Resets the server cursor, then forgets local dedup state. The two only
    /// move together: a failed reset leaves dedup untouched.
    async fn reset_cursor(&mut self, client_id: &str) -> Result<(), DeliveryError> {
        let api = self
            .reset_client
            .as_ref()
            .ok_or_else(|| DeliveryError::NotConfigured("reset endpoint".into()))?;

        let resp = api
            .post_form::<Value>("", &[("client_id", client_id)])
            .await
            .map_err(|e| {
                let undecodable = e
                    .downcast_ref::<reqwest::Error>()
                    .is_some_and(reqwest::Error::is_decode);
                if undecodable {
                    DeliveryError::Protocol(format!("reset acknowledgement is not JSON: {}", e))
                } else {
                    DeliveryError::Transport(e.to_string())
                }
            })?;

        if !resp.success {
            return Err(DeliveryError::Server(
                resp.error_body
                    .filter(|body| !body.is_empty())
                    .unwrap_or_else(|| format!("HTTP {}", resp.status)),
            ));
        }
        let ack = resp.data.unwrap_or_default();
        if !ack.is_object() {
            return Err(DeliveryError::Protocol(format!("unexpected reset acknowledgement: {}", ack)));
        }
        if let Some(error) = ack.get("error") {
            let message = error.as_str().map(str::to_string).unwrap_or_else(|| error.to_string());
            return Err(DeliveryError::Server(message));
        }

        let forgotten = self.dedup.len();
        self.dedup.clear();
        log::info!("Delivery cursor reset for {} ({} remembered ids dropped)", client_id, forgotten);
        Ok(())
    }

    async fn handle(&mut self, client_id: &str, request: LoopRequest) {
        let result = match request.command {
            LoopCommand::Reset => self.reset_cursor(client_id).await,
        };
        if request.responder.send(result).is_err() {
            log::debug!("Reset requester went away before the answer");
        }
    }

    /// Awaits `fut` while serving control requests. `None` means cancelled.
    async fn serve<F: std::future::Future>(
        &mut self,
        fut: F,
        client_id: &str,
        cancel: &CancellationToken,
        commands: &mut mpsc::Receiver<LoopRequest>,
    ) -> Option<F::Output> {
        tokio::pin!(fut);
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return None,
                Some(request) = commands.recv() => self.handle(client_id, request).await,
                output = &mut fut => return Some(output),
            }
        }
    }
}

/// Everything the loop task owns.
struct Worker<C, S> {
    channel: C,
    sink: S,
    retry: RetryScheduler,
    session: Session,
    client_id: String,
    /// Last success state announced, to avoid repeating it on every tick.
    announced: Option<ConnectionState>,
    /// The previous acquire failed.
    failing: bool,
}

impl<C: DeliveryChannel, S: AlertSink> Worker<C, S> {
    fn announce(&mut self, state: ConnectionState, message: &str) {
        if self.announced != Some(state) {
            self.announced = Some(state);
            self.sink.on_status(state, message);
        }
    }

    async fn run(
        mut self,
        cancel: CancellationToken,
        mut commands: mpsc::Receiver<LoopRequest>,
        state: watch::Sender<LoopState>,
    ) -> Self {
        log::info!("{} delivery loop started for {}", self.channel.kind(), self.client_id);
        self.announced = None;
        self.announce(ConnectionState::Connecting, "Connecting");

        loop {
            let acquire = self.channel.acquire(&self.client_id);
            let Some(result) = self
                .session
                .serve(acquire, &self.client_id, &cancel, &mut commands)
                .await
            else {
                break;
            };

            // Resolved in the same instant as stop().
            if cancel.is_cancelled() {
                log::debug!("Discarding acquire result that resolved after stop: {:?}", result);
                break;
            }

            let Some(outcome) = self.dispatch(result, &cancel, &mut commands).await else {
                break;
            };

            match self.retry.record(outcome) {
                RetryDecision::RetryAfter(delay) => {
                    if delay > Duration::ZERO {
                        log::trace!("Next acquire in {}ms", delay.as_millis());
                        let pause = tokio::time::sleep(delay);
                        let served = self
                            .session
                            .serve(pause, &self.client_id, &cancel, &mut commands)
                            .await;
                        if served.is_none() {
                            break;
                        }
                    }
                }
                RetryDecision::GiveUp { attempts } => {
                    let err = DeliveryError::Exhausted { attempts };
                    log::error!("{} delivery loop for {}: {}", self.channel.kind(), self.client_id, err);
                    self.sink.on_error(&err.to_string());
                    self.sink.on_status(ConnectionState::Failed, "Connection lost");
                    self.channel.close(&self.client_id).await;
                    state.send_replace(LoopState::Terminated);
                    return self;
                }
            }
        }

        self.channel.close(&self.client_id).await;
        self.sink.on_status(ConnectionState::Stopped, "Stopped");
        log::info!("{} delivery loop stopped for {}", self.channel.kind(), self.client_id);
        self
    }

    /// Applies one result to dedup, sink and metrics, and classifies it for
    /// the scheduler. `None` means the loop was cancelled meanwhile.
    async fn dispatch(
        &mut self,
        result: DeliveryResult,
        cancel: &CancellationToken,
        commands: &mut mpsc::Receiver<LoopRequest>,
    ) -> Option<OutcomeKind> {
        let outcome = result.outcome();
        let metrics = Arc::clone(&self.session.metrics);

        match outcome {
            OutcomeKind::ServerError | OutcomeKind::TransportError | OutcomeKind::ProtocolError => {}
            _ if self.failing => {
                log::info!("Delivery recovered after {} failed attempts", self.retry.attempts());
                metrics.recovery();
                self.failing = false;
            }
            _ => {}
        }

        match result {
            DeliveryResult::Alert(alert) => {
                self.announce(ConnectionState::Connected, "Receiving alerts");
                if !self.deliver(alert, cancel, commands).await {
                    return None;
                }
            }
            DeliveryResult::Timeout => {
                metrics.timeout();
                self.announce(ConnectionState::Waiting, "Waiting for alerts");
            }
            DeliveryResult::Status(message) => {
                log::info!("Server status: {}", message);
                self.announced = Some(ConnectionState::Connected);
                self.sink.on_status(ConnectionState::Connected, &message);
            }
            DeliveryResult::ServerError(message) => {
                metrics.server_error();
                self.failing = true;
                log::warn!("Server error (attempt {}): {}", self.retry.attempts() + 1, message);
                self.announced = Some(ConnectionState::Reconnecting);
                self.sink
                    .on_status(ConnectionState::Reconnecting, &format!("Server error: {}", message));
            }
            DeliveryResult::TransportError(message) => {
                metrics.transport_error();
                self.failing = true;
                log::warn!("Transport error (attempt {}): {}", self.retry.attempts() + 1, message);
                self.announced = Some(ConnectionState::Reconnecting);
                self.sink
                    .on_status(ConnectionState::Reconnecting, &format!("Connection error: {}", message));
            }
            DeliveryResult::ProtocolError(message) => {
                metrics.protocol_error();
                log::warn!("Ignoring malformed payload: {}", message);
            }
        }

        Some(outcome)
    }

    /// Renders a new alert and acknowledges it. False when cancelled while
    /// the acknowledgement was pending.
    async fn deliver(
        &mut self,
        alert: Alert,
        cancel: &CancellationToken,
        commands: &mut mpsc::Receiver<LoopRequest>,
    ) -> bool {
        let metrics = &self.session.metrics;
        if self.session.dedup.admit(&alert) {
            log::debug!("Delivering alert {:?} '{}'", alert.id, alert.title);
            metrics.alert_delivered();
            self.sink.on_alert(&alert);
        } else {
            log::debug!("Suppressed duplicate alert {:?}", alert.dedup_key());
            metrics.duplicate_suppressed();
        }

        // Replays are acknowledged too; the server is still waiting for them.
        if alert.confirmation_id().is_none() {
            return true;
        }
        let confirm = self.channel.confirm(&self.client_id, &alert);
        match self.session.serve(confirm, &self.client_id, cancel, commands).await {
            Some(true) => {
                self.session.metrics.confirmation_sent();
                true
            }
            Some(false) => true,
            None => {
                log::debug!("Confirmation of {:?} abandoned on stop", alert.message_id);
                false
            }
        }
    }
}

/// Handles of a spawned loop task.
struct RunningTask<C, S> {
    cancel: CancellationToken,
    commands: mpsc::Sender<LoopRequest>,
    handle: JoinHandle<Worker<C, S>>,
}

/// # Delivery Loop
///
/// One loop per client identity. Generic over the transport and the sink;
/// see [`PollLoop`] and [`StreamLoop`].
///
/// The loop must be started from within a tokio runtime.
pub struct DeliveryLoop<C: DeliveryChannel, S: AlertSink> {
    identity: ClientIdentity<Box<dyn IdentityStore>>,
    client_id: Option<String>,
    /// Present while stopped.
    worker: Option<Worker<C, S>>,
    /// Present while started (including after termination, until reclaimed).
    running: Option<RunningTask<C, S>>,
    state_tx: watch::Sender<LoopState>,
    metrics: Arc<DeliveryMetrics>,
}

impl<C: DeliveryChannel, S: AlertSink> DeliveryLoop<C, S> {
    /// A stopped loop with an unbounded dedup tracker and no reset endpoint.
    pub fn new(mut channel: C, sink: S, identity: ClientIdentity<Box<dyn IdentityStore>>, policy: RetryPolicy) -> Self {
        let metrics = Arc::new(DeliveryMetrics::new());
        channel.attach_metrics(Arc::clone(&metrics));
        let (state_tx, _) = watch::channel(LoopState::Stopped);

        Self {
            identity,
            client_id: None,
            worker: Some(Worker {
                channel,
                sink,
                retry: RetryScheduler::new(policy),
                session: Session {
                    dedup: DedupTracker::new(None),
                    reset_client: None,
                    metrics: Arc::clone(&metrics),
                },
                client_id: String::new(),
                announced: None,
                failing: false,
            }),
            running: None,
            state_tx,
            metrics,
        }
    }

    /// # From Config
    ///
    /// Wires identity storage, retry policy, dedup capacity and the reset
    /// endpoint from `config`. Long-poll channels retry forever; stream
    /// channels honour `max_reconnect_attempts`.
    ///
    /// Identity falls back to an in-memory store when no file location exists.
    pub fn from_config(config: &DeliveryConfig, channel: C, sink: S) -> Result<Self, DeliveryError> {
        config.validate()?;

        let store: Box<dyn IdentityStore> = match &config.identity_path {
            Some(path) => Box::new(FileIdentityStore::new(path.clone())),
            None => match FileIdentityStore::default_location() {
                Ok(store) => Box::new(store),
                Err(e) => {
                    log::warn!("{}. Client identity will not survive restarts.", e);
                    Box::new(MemoryIdentityStore::new())
                }
            },
        };
        let identity = ClientIdentity::new(store, config.identity_namespace.clone());

        let mut policy = RetryPolicy::from_config(config);
        if channel.kind() == ChannelKind::LongPoll {
            policy = policy.unbounded();
        }

        let delivery = Self::new(channel, sink, identity, policy).with_dedup_capacity(Some(config.dedup_capacity));
        match &config.reset_url {
            Some(url) => delivery.with_reset_endpoint(url),
            None => Ok(delivery),
        }
    }

    /// Replaces the dedup tracker. Only effective while stopped.
    pub fn with_dedup_capacity(mut self, capacity: Option<usize>) -> Self {
        if let Some(worker) = self.worker.as_mut() {
            worker.session.dedup = DedupTracker::new(capacity);
        }
        self
    }

    /// Shares `metrics` with the loop and its channel. Only effective while stopped.
    pub fn with_metrics(mut self, metrics: Arc<DeliveryMetrics>) -> Self {
        if let Some(worker) = self.worker.as_mut() {
            worker.channel.attach_metrics(Arc::clone(&metrics));
            worker.session.metrics = Arc::clone(&metrics);
            self.metrics = metrics;
        }
        self
    }

    /// Enables [`reset`](Self::reset) against `url`.
    pub fn with_reset_endpoint(mut self, url: &str) -> Result<Self, DeliveryError> {
        let api = ApiClient::new(url, None)
            .map_err(|e| DeliveryError::NotConfigured(format!("reset url '{}': {}", url, e)))?;
        if let Some(worker) = self.worker.as_mut() {
            worker.session.reset_client = Some(api);
        }
        Ok(self)
    }

    /// # Start
    ///
    /// Resolves the client identity and spawns the loop task. Returns `false`
    /// without doing anything when the loop is already running, so at most one
    /// acquire is ever in flight for this client.
    pub async fn start(&mut self) -> Result<bool, DeliveryError> {
        if self.is_running() {
            log::debug!("Delivery loop already running, start ignored");
            return Ok(false);
        }
        self.reclaim().await;

        let mut worker = self.worker.take().ok_or(DeliveryError::LoopClosed)?;
        let client_id = self.identity.get_or_create();
        if self.identity.is_transient() {
            log::warn!("Running with a session-only client identity");
        }
        worker.client_id = client_id.clone();
        worker.retry.reset();
        worker.failing = false;
        self.client_id = Some(client_id);

        let cancel = CancellationToken::new();
        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_BUFFER);
        self.state_tx.send_replace(LoopState::Running);

        let handle = tokio::spawn(worker.run(cancel.clone(), commands_rx, self.state_tx.clone()));
        self.running = Some(RunningTask {
            cancel,
            commands: commands_tx,
            handle,
        });
        Ok(true)
    }

    /// # Stop
    ///
    /// Cancels the loop and waits for the task to wind down: a pending acquire
    /// is dropped, the stream channel sends its stop notice, and the loop state
    /// comes back for a later restart. Safe to call in any state.
    pub async fn stop(&mut self) {
        if let Some(task) = self.running.take() {
            task.cancel.cancel();
            match task.handle.await {
                Ok(worker) => self.worker = Some(worker),
                Err(e) => log::error!("Delivery task ended abnormally: {}", e),
            }
        }
        self.state_tx.send_replace(LoopState::Stopped);
    }

    /// # Reset
    ///
    /// Asks the server to rewind this client's delivery cursor and clears the
    /// dedup tracker once the server acknowledged. Works running or stopped.
    pub async fn reset(&mut self) -> Result<(), DeliveryError> {
        if let Some(task) = self.running.as_ref().filter(|_| self.is_running()) {
            let (responder, answer) = oneshot::channel();
            let request = LoopRequest {
                command: LoopCommand::Reset,
                responder,
            };
            task.commands
                .send(request)
                .await
                .map_err(|_| DeliveryError::LoopClosed)?;
            return answer.await.map_err(|_| DeliveryError::LoopClosed)?;
        }

        self.reclaim().await;
        let client_id = self.identity.get_or_create();
        self.client_id = Some(client_id.clone());
        let worker = self.worker.as_mut().ok_or(DeliveryError::LoopClosed)?;
        worker.session.reset_cursor(&client_id).await
    }

    /// Current lifecycle state.
    pub fn state(&self) -> LoopState {
        *self.state_tx.borrow()
    }

    /// Receiver for state changes.
    pub fn subscribe_state(&self) -> watch::Receiver<LoopState> {
        self.state_tx.subscribe()
    }

    /// Waits until the loop reaches `target`.
    pub async fn wait_for_state(&self, target: LoopState) -> LoopState {
        let mut rx = self.state_tx.subscribe();
        if let Ok(state) = rx.wait_for(|state| *state == target).await {
            return *state;
        }
        let current = *rx.borrow();
        current
    }

    /// True while the loop task is alive.
    pub fn is_running(&self) -> bool {
        self.state() != LoopState::Terminated
            && self.running.as_ref().is_some_and(|task| !task.handle.is_finished())
    }

    /// Shared counters of this loop.
    pub fn metrics(&self) -> Arc<DeliveryMetrics> {
        Arc::clone(&self.metrics)
    }

    /// The client id of the last start or reset.
    pub fn client_id(&self) -> Option<&str> {
        self.client_id.as_deref()
    }

    /// Retry policy in use. `None` while the task holds it.
    pub fn retry_policy(&self) -> Option<&RetryPolicy> {
        self.worker.as_ref().map(|worker| worker.retry.policy())
    }

    /// Takes the state back from a task that ended on its own.
    async fn reclaim(&mut self) {
        // A terminated task may still be unwinding; its handle resolves promptly.
        let finished = self
            .running
            .as_ref()
            .is_some_and(|task| task.handle.is_finished() || self.state() == LoopState::Terminated);
        if !finished {
            return;
        }
        if let Some(task) = self.running.take() {
            match task.handle.await {
                Ok(worker) => self.worker = Some(worker),
                Err(e) => log::error!("Delivery task ended abnormally: {}", e),
            }
        }
    }
}

impl<C: DeliveryChannel, S: AlertSink> Drop for DeliveryLoop<C, S> {
    fn drop(&mut self) {
        if let Some(task) = &self.running {
            task.cancel.cancel();
        }
    }
}

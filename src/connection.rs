//! Connection manager for the Event Bus.
//!
//! [`ConnectionManager`] owns one background connection task. The task asks
//! its [`Connector`] for a transport, re-issues every requested room join,
//! announces the new [`ConnectionState`], and then multiplexes outgoing
//! commands, heartbeats, and inbound frames with `tokio::select!`. When the
//! transport drops it reports `Disconnected`, waits according to its
//! [`BackoffPolicy`], and connects again. Failures never surface as errors
//! from the manager itself; they only show up as state transitions.
//!
//! Inbound envelopes are routed by `session_id` to the subscribers registered
//! through a [`ConnectionHandle`], so one connection can serve several
//! sessions without leaking events between them.
//!
//! # Example
//!
//! ```rust,ignore
//! let manager = ConnectionManager::start(connector, ConnectionConfig::default());
//! let handle = manager.handle();
//! handle.join_session_rooms(42, Role::Monitor, None);
//! let mut subscription = handle.subscribe(42);
//! while let Some(envelope) = subscription.events.recv().await {
//!     /* … */
//! }
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use crate::error::{LiveQuizError, Result};
use crate::protocol::{ClientMessage, EventEnvelope, Role, Room, SessionId, UserId};
use crate::rooms::{MembershipChange, RoomMembership};
use crate::transport::{Connector, Transport};

/// Default capacity of each subscriber's event queue.
const DEFAULT_EVENT_CHANNEL_CAPACITY: usize = 256;

/// Default timeout for the graceful shutdown.
const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);

/// Default interval between heartbeat pings.
const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(25);

/// Identity of one registered event subscriber.
pub type SubscriberId = Uuid;

// ── Backoff ─────────────────────────────────────────────────────────

/// Exponential reconnect backoff: `base`, doubling per failed attempt, capped at `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub max: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(500),
            max: Duration::from_secs(30),
        }
    }
}

#[derive(Debug)]
struct Backoff {
    base: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    fn new(policy: BackoffPolicy) -> Self {
        Self {
            base: policy.base,
            max: policy.max,
            current: policy.base,
        }
    }

    fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        let next = self.current.checked_mul(2).unwrap_or(self.max);
        self.current = std::cmp::min(next, self.max);
        delay
    }

    fn reset(&mut self) {
        self.current = self.base;
    }
}

// ── State ───────────────────────────────────────────────────────────

/// Observable connectivity of the Event Bus connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    /// A connection attempt is in progress.
    Connecting,
    /// Connected. `generation` counts successful connections; `1` is the
    /// first connection of this manager, anything higher is a reconnect.
    Connected { generation: u64 },
    /// The last connection or connection attempt failed.
    Disconnected { reason: String },
    /// The manager was shut down.
    Closed,
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected { .. })
    }

    pub fn generation(&self) -> Option<u64> {
        match self {
            Self::Connected { generation } => Some(*generation),
            _ => None,
        }
    }

    /// Human-readable reason for the current lack of connectivity, if any.
    pub fn error(&self) -> Option<&str> {
        match self {
            Self::Disconnected { reason } => Some(reason),
            Self::Closed => Some("connection closed"),
            Self::Connecting | Self::Connected { .. } => None,
        }
    }
}

// ── Configuration ───────────────────────────────────────────────────

/// Configuration for a [`ConnectionManager`].
///
/// # Example
///
/// ```
/// use live_quiz_engine::connection::{BackoffPolicy, ConnectionConfig};
/// use std::time::Duration;
///
/// let config = ConnectionConfig::default()
///     .with_backoff(BackoffPolicy {
///         base: Duration::from_millis(250),
///         max: Duration::from_secs(10),
///     })
///     .with_max_reconnect_attempts(20);
/// assert_eq!(config.max_reconnect_attempts, Some(20));
/// ```
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Capacity of each subscriber's event queue.
    ///
    /// When a session cannot keep up, envelopes are dropped (with a warning
    /// logged) and the subscription is flagged as lagged so the session
    /// resynchronises from a snapshot.
    ///
    /// Defaults to **256**. Values below 1 are clamped to 1.
    pub event_channel_capacity: usize,
    /// Time [`ConnectionManager::shutdown`] waits for the connection task
    /// before aborting it. Defaults to **1 second**.
    pub shutdown_timeout: Duration,
    /// Reconnect backoff. Defaults to 500 ms doubling up to 30 s.
    pub backoff: BackoffPolicy,
    /// Interval between `ping` frames while connected. `None` disables the
    /// heartbeat. Defaults to **25 seconds**.
    pub heartbeat_interval: Option<Duration>,
    /// Consecutive failed connection attempts after which the manager gives
    /// up. `None` retries forever (the default).
    pub max_reconnect_attempts: Option<u32>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            event_channel_capacity: DEFAULT_EVENT_CHANNEL_CAPACITY,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            backoff: BackoffPolicy::default(),
            heartbeat_interval: Some(DEFAULT_HEARTBEAT_INTERVAL),
            max_reconnect_attempts: None,
        }
    }
}

impl ConnectionConfig {
    /// Set the capacity of each subscriber's event queue. Values below 1 are clamped to 1.
    #[must_use]
    pub fn with_event_channel_capacity(mut self, capacity: usize) -> Self {
        self.event_channel_capacity = capacity.max(1);
        self
    }

    #[must_use]
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    /// Set the heartbeat interval; `None` disables heartbeats.
    #[must_use]
    pub fn with_heartbeat_interval(mut self, interval: Option<Duration>) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    #[must_use]
    pub fn with_max_reconnect_attempts(mut self, attempts: u32) -> Self {
        self.max_reconnect_attempts = Some(attempts);
        self
    }
}

// ── Shared registry ─────────────────────────────────────────────────

struct Subscriber {
    session_id: SessionId,
    tx: mpsc::Sender<EventEnvelope>,
    lagged: Arc<AtomicBool>,
}

#[derive(Default)]
struct Registry {
    subscribers: HashMap<SubscriberId, Subscriber>,
    membership: RoomMembership,
}

/// State shared between the handles and the connection task.
struct Shared {
    registry: StdMutex<Registry>,
    state_tx: watch::Sender<ConnectionState>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, state: ConnectionState) {
        debug!(?state, "connection state");
        self.state_tx.send_replace(state);
    }

    fn is_connected(&self) -> bool {
        self.state_tx.borrow().is_connected()
    }
}

/// A registered event stream for one session.
///
/// Dropping the subscription does not unregister it; call
/// [`ConnectionHandle::unsubscribe`] with [`id`](Self::id).
#[derive(Debug)]
pub struct Subscription {
    pub id: SubscriberId,
    pub session_id: SessionId,
    /// Envelopes addressed to `session_id`, in delivery order.
    pub events: mpsc::Receiver<EventEnvelope>,
    lagged: Arc<AtomicBool>,
}

impl Subscription {
    /// Returns `true` (once) if envelopes were dropped because the queue was full.
    pub fn take_lagged(&self) -> bool {
        self.lagged.swap(false, Ordering::AcqRel)
    }
}

// ── Handle ──────────────────────────────────────────────────────────

/// Cloneable handle to a running [`ConnectionManager`].
///
/// All methods are synchronous; outgoing frames are queued to the connection
/// task without awaiting a round trip.
#[derive(Clone)]
pub struct ConnectionHandle {
    cmd_tx: mpsc::UnboundedSender<ClientMessage>,
    shared: Arc<Shared>,
    event_channel_capacity: usize,
}

impl ConnectionHandle {
    /// Returns `true` while the transport is connected.
    pub fn is_connected(&self) -> bool {
        self.shared.is_connected()
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state_tx.borrow().clone()
    }

    /// Observe every connection state transition.
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state_tx.subscribe()
    }

    /// Queue a frame for the Event Bus.
    ///
    /// # Errors
    ///
    /// Returns [`LiveQuizError::NotConnected`] if the transport is not connected.
    pub fn send(&self, msg: ClientMessage) -> Result<()> {
        if !self.shared.is_connected() {
            return Err(LiveQuizError::NotConnected);
        }
        self.cmd_tx
            .send(msg)
            .map_err(|_| LiveQuizError::NotConnected)
    }

    /// Register a subscriber for envelopes addressed to `session_id`.
    pub fn subscribe(&self, session_id: SessionId) -> Subscription {
        let (tx, events) = mpsc::channel(self.event_channel_capacity);
        let lagged = Arc::new(AtomicBool::new(false));
        let id = Uuid::new_v4();
        self.shared.lock().subscribers.insert(
            id,
            Subscriber {
                session_id,
                tx,
                lagged: Arc::clone(&lagged),
            },
        );
        debug!(%id, session_id, "subscriber registered");
        Subscription {
            id,
            session_id,
            events,
            lagged,
        }
    }

    /// Remove every handler registered under `id`. No envelope is queued for
    /// it once this returns. Returns `false` if `id` was not registered.
    pub fn unsubscribe(&self, id: SubscriberId) -> bool {
        let removed = self.shared.lock().subscribers.remove(&id).is_some();
        if removed {
            debug!(%id, "subscriber removed");
        }
        removed
    }

    /// Join the rooms of `session_id` for `role`.
    ///
    /// Idempotent: only rooms not already requested are joined. Without a
    /// `user_id` only the session room is joined; calling again once the
    /// identity resolves joins the role and user rooms. While disconnected the
    /// request is only recorded; the connection task issues it on connect.
    pub fn join_session_rooms(
        &self,
        session_id: SessionId,
        role: Role,
        user_id: Option<UserId>,
    ) -> MembershipChange {
        let (change, connected) = {
            let mut registry = self.shared.lock();
            let change = registry.membership.request(session_id, role, user_id);
            (change, self.shared.is_connected())
        };
        if connected {
            for room in &change.leave {
                self.send_best_effort(ClientMessage::leave(room));
            }
            for room in &change.join {
                self.send_best_effort(ClientMessage::join(room));
            }
        }
        change
    }

    /// Forget the rooms of `session_id` and leave them if connected.
    pub fn leave_session_rooms(&self, session_id: SessionId) -> Vec<Room> {
        let rooms = self.shared.lock().membership.release(session_id);
        for room in &rooms {
            self.send_best_effort(ClientMessage::leave(room));
        }
        rooms
    }

    fn send_best_effort(&self, msg: ClientMessage) {
        if let Err(e) = self.send(msg) {
            debug!("room command not sent: {e}");
        }
    }
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("state", &self.state())
            .finish()
    }
}

// ── Manager ─────────────────────────────────────────────────────────

/// Owner of the Event Bus connection task.
///
/// Created explicitly by whatever composes the engine; there is no global
/// instance. Dropping the manager aborts the task.
pub struct ConnectionManager {
    handle: ConnectionHandle,
    task: Option<tokio::task::JoinHandle<()>>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    shutdown_timeout: Duration,
}

impl ConnectionManager {
    /// Spawn the connection task. It starts connecting immediately.
    pub fn start(connector: impl Connector, config: ConnectionConfig) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel::<ClientMessage>();
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let (state_tx, _) = watch::channel(ConnectionState::Connecting);

        let shared = Arc::new(Shared {
            registry: StdMutex::new(Registry::default()),
            state_tx,
        });

        let handle = ConnectionHandle {
            cmd_tx,
            shared: Arc::clone(&shared),
            event_channel_capacity: config.event_channel_capacity.max(1),
        };
        let shutdown_timeout = config.shutdown_timeout;

        let task = tokio::spawn(connection_loop(
            connector,
            cmd_rx,
            shared,
            config,
            shutdown_rx,
        ));

        Self {
            handle,
            task: Some(task),
            shutdown_tx: Some(shutdown_tx),
            shutdown_timeout,
        }
    }

    pub fn handle(&self) -> ConnectionHandle {
        self.handle.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.handle.is_connected()
    }

    pub fn state(&self) -> ConnectionState {
        self.handle.state()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.handle.subscribe_state()
    }

    /// Close the transport and stop the connection task.
    pub async fn shutdown(&mut self) {
        debug!("ConnectionManager: shutdown requested");

        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }

        if let Some(mut task) = self.task.take() {
            match tokio::time::timeout(self.shutdown_timeout, &mut task).await {
                Ok(Ok(())) => {}
                Ok(Err(join_err)) => {
                    warn!("connection task terminated with join error: {join_err}");
                }
                Err(_) => {
                    warn!("connection task did not exit within timeout; aborting task");
                    task.abort();
                    if let Err(join_err) = task.await {
                        debug!("connection task aborted: {join_err}");
                    }
                }
            }
        }

        self.handle.shared.publish(ConnectionState::Closed);
    }
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("state", &self.state())
            .field("has_task", &self.task.is_some())
            .finish()
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        // Graceful close needs an executor; aborting drops the transport.
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

// ── Connection task ─────────────────────────────────────────────────

enum ConnectionExit {
    Shutdown,
    Dropped(String),
}

async fn connection_loop<C: Connector>(
    mut connector: C,
    mut cmd_rx: mpsc::UnboundedReceiver<ClientMessage>,
    shared: Arc<Shared>,
    config: ConnectionConfig,
    mut shutdown_rx: oneshot::Receiver<()>,
) {
    debug!("connection loop started");

    let mut backoff = Backoff::new(config.backoff);
    let mut generation: u64 = 0;
    let mut failed_attempts: u32 = 0;

    loop {
        shared.publish(ConnectionState::Connecting);

        let attempt = tokio::select! {
            _ = &mut shutdown_rx => break,
            attempt = connector.connect() => attempt,
        };

        match attempt {
            Ok(transport) => {
                generation += 1;
                failed_attempts = 0;
                backoff.reset();
                let exit = run_connection(
                    transport,
                    generation,
                    &mut cmd_rx,
                    &shared,
                    &config,
                    &mut shutdown_rx,
                )
                .await;
                match exit {
                    ConnectionExit::Shutdown => break,
                    ConnectionExit::Dropped(reason) => {
                        warn!(generation, %reason, "event bus connection dropped");
                        shared.publish(ConnectionState::Disconnected { reason });
                    }
                }
            }
            Err(e) => {
                failed_attempts += 1;
                warn!(attempt = failed_attempts, "event bus connect failed: {e}");
                shared.publish(ConnectionState::Disconnected {
                    reason: format!("connect failed: {e}"),
                });
            }
        }

        if config
            .max_reconnect_attempts
            .is_some_and(|max| failed_attempts >= max)
        {
            error!(failed_attempts, "giving up on event bus connection");
            shared.publish(ConnectionState::Disconnected {
                reason: format!("reconnect attempts exhausted after {failed_attempts} failures"),
            });
            return;
        }

        let delay = backoff.next_delay();
        debug!(?delay, "waiting before reconnect");
        tokio::select! {
            _ = &mut shutdown_rx => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }

    shared.publish(ConnectionState::Closed);
    debug!("connection loop exited");
}

/// Drive one established transport until it drops or shutdown is requested.
async fn run_connection<T: Transport>(
    mut transport: T,
    generation: u64,
    cmd_rx: &mut mpsc::UnboundedReceiver<ClientMessage>,
    shared: &Shared,
    config: &ConnectionConfig,
    shutdown_rx: &mut oneshot::Receiver<()>,
) -> ConnectionExit {
    // Collecting the rooms and announcing the state under one lock means a
    // concurrent join either sees `Connected` and sends itself, or lands in
    // this batch.
    let rooms = {
        let registry = shared.lock();
        let rooms = registry.membership.rooms();
        shared.publish(ConnectionState::Connected { generation });
        rooms
    };
    info!(generation, rooms = rooms.len(), "event bus connected");

    for room in &rooms {
        if let Err(e) = send_frame(&mut transport, &ClientMessage::join(room)).await {
            return ConnectionExit::Dropped(format!("transport send error: {e}"));
        }
    }

    let mut heartbeat = interval_timer(config.heartbeat_interval);

    loop {
        tokio::select! {
            _ = &mut *shutdown_rx => {
                debug!("shutdown signal received");
                let _ = transport.close().await;
                return ConnectionExit::Shutdown;
            }

            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(msg) => {
                        if let Err(e) = send_frame(&mut transport, &msg).await {
                            error!("transport send error: {e}");
                            return ConnectionExit::Dropped(format!("transport send error: {e}"));
                        }
                    }
                    // Every handle is gone.
                    None => {
                        debug!("command channel closed, shutting down connection");
                        let _ = transport.close().await;
                        return ConnectionExit::Shutdown;
                    }
                }
            }

            _ = next_tick(&mut heartbeat) => {
                if let Err(e) = send_frame(&mut transport, &ClientMessage::Ping).await {
                    return ConnectionExit::Dropped(format!("heartbeat failed: {e}"));
                }
            }

            incoming = transport.recv() => {
                match incoming {
                    Some(Ok(text)) => dispatch(shared, &text),
                    Some(Err(e)) => {
                        error!("transport receive error: {e}");
                        return ConnectionExit::Dropped(format!("transport receive error: {e}"));
                    }
                    None => {
                        debug!("transport closed by server");
                        return ConnectionExit::Dropped("connection closed by server".into());
                    }
                }
            }
        }
    }
}

async fn send_frame<T: Transport>(transport: &mut T, msg: &ClientMessage) -> Result<()> {
    let json = serde_json::to_string(msg)?;
    trace!(frame = %json, "sending frame");
    transport.send(json).await
}

/// Route one inbound frame to the subscribers of its session.
fn dispatch(shared: &Shared, text: &str) {
    let envelope: EventEnvelope = match serde_json::from_str(text) {
        Ok(envelope) => envelope,
        Err(e) => {
            warn!("failed to deserialize bus frame: {e}; raw: {text}");
            return;
        }
    };

    if envelope.is_pong() {
        trace!("heartbeat acknowledged");
        return;
    }

    let Some(session_id) = envelope.session_id else {
        warn!(kind = %envelope.kind, "dropping bus frame without session_id");
        return;
    };

    let registry = shared.lock();
    for subscriber in registry
        .subscribers
        .values()
        .filter(|subscriber| subscriber.session_id == session_id)
    {
        match subscriber.tx.try_send(envelope.clone()) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(session_id, kind = %envelope.kind, "subscriber queue full, dropping event");
                subscriber.lagged.store(true, Ordering::Release);
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(session_id, "subscriber receiver dropped");
            }
        }
    }
}

/// A periodic timer whose first tick fires one `period` from now.
pub(crate) fn interval_timer(period: Option<Duration>) -> Option<Interval> {
    period.filter(|p| !p.is_zero()).map(|period| {
        let mut interval = tokio::time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        interval
    })
}

/// Wait for the next tick, or forever when there is no timer.
pub(crate) async fn next_tick(timer: &mut Option<Interval>) {
    match timer {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    const WAIT: Duration = Duration::from_secs(2);

    // ── Mock connector ──────────────────────────────────────────────

    /// Client half of an in-process connection.
    struct ChannelTransport {
        tx: mpsc::UnboundedSender<String>,
        rx: mpsc::UnboundedReceiver<String>,
    }

    #[async_trait]
    impl Transport for ChannelTransport {
        async fn send(&mut self, message: String) -> std::result::Result<(), LiveQuizError> {
            self.tx
                .send(message)
                .map_err(|e| LiveQuizError::TransportSend(e.to_string()))
        }

        async fn recv(&mut self) -> Option<std::result::Result<String, LiveQuizError>> {
            self.rx.recv().await.map(Ok)
        }

        async fn close(&mut self) -> std::result::Result<(), LiveQuizError> {
            Ok(())
        }
    }

    /// Bus half of an in-process connection. Dropping it drops the connection.
    struct BusSide {
        sent: mpsc::UnboundedReceiver<String>,
        push: mpsc::UnboundedSender<String>,
    }

    impl BusSide {
        async fn next_frame(&mut self) -> ClientMessage {
            let text = tokio::time::timeout(WAIT, self.sent.recv())
                .await
                .expect("frame in time")
                .expect("connection open");
            serde_json::from_str(&text).unwrap()
        }
    }

    struct TestConnector {
        attempts: Arc<AtomicUsize>,
        refuse_first: usize,
        buses: mpsc::UnboundedSender<BusSide>,
    }

    #[async_trait]
    impl Connector for TestConnector {
        type Transport = ChannelTransport;

        async fn connect(&mut self) -> std::result::Result<ChannelTransport, LiveQuizError> {
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
            if attempt < self.refuse_first {
                return Err(LiveQuizError::TransportSend("connection refused".into()));
            }
            let (client_tx, sent) = mpsc::unbounded_channel();
            let (push, client_rx) = mpsc::unbounded_channel();
            let _ = self.buses.send(BusSide { sent, push });
            Ok(ChannelTransport {
                tx: client_tx,
                rx: client_rx,
            })
        }
    }

    fn fast_config() -> ConnectionConfig {
        ConnectionConfig::default()
            .with_backoff(BackoffPolicy {
                base: Duration::from_millis(5),
                max: Duration::from_millis(20),
            })
            .with_heartbeat_interval(None)
    }

    fn start(
        refuse_first: usize,
        config: ConnectionConfig,
    ) -> (
        ConnectionManager,
        mpsc::UnboundedReceiver<BusSide>,
        Arc<AtomicUsize>,
    ) {
        let (buses_tx, buses) = mpsc::unbounded_channel();
        let attempts = Arc::new(AtomicUsize::new(0));
        let connector = TestConnector {
            attempts: Arc::clone(&attempts),
            refuse_first,
            buses: buses_tx,
        };
        (ConnectionManager::start(connector, config), buses, attempts)
    }

    async fn wait_state(
        manager: &ConnectionManager,
        predicate: impl FnMut(&ConnectionState) -> bool,
    ) -> ConnectionState {
        let mut rx = manager.subscribe_state();
        let state = tokio::time::timeout(WAIT, rx.wait_for(predicate))
            .await
            .expect("state in time")
            .expect("state channel open");
        state.clone()
    }

    fn envelope(session_id: SessionId) -> String {
        format!(r#"{{"type":"session_finished","session_id":{session_id},"payload":{{}}}}"#)
    }

    // ── Tests ───────────────────────────────────────────────────────

    #[test]
    fn backoff_doubles_up_to_max_and_resets() {
        let mut backoff = Backoff::new(BackoffPolicy {
            base: Duration::from_millis(10),
            max: Duration::from_millis(40),
        });
        assert_eq!(backoff.next_delay(), Duration::from_millis(10));
        assert_eq!(backoff.next_delay(), Duration::from_millis(20));
        assert_eq!(backoff.next_delay(), Duration::from_millis(40));
        assert_eq!(backoff.next_delay(), Duration::from_millis(40));
        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_millis(10));
    }

    #[test]
    fn config_defaults_and_clamping() {
        let config = ConnectionConfig::default();
        assert_eq!(config.event_channel_capacity, 256);
        assert_eq!(config.shutdown_timeout, Duration::from_secs(1));
        assert_eq!(config.heartbeat_interval, Some(Duration::from_secs(25)));
        assert!(config.max_reconnect_attempts.is_none());

        let clamped = ConnectionConfig::default().with_event_channel_capacity(0);
        assert_eq!(clamped.event_channel_capacity, 1);
    }

    #[tokio::test]
    async fn first_connection_is_generation_one() {
        let (mut manager, _buses, _attempts) = start(0, fast_config());

        let state = wait_state(&manager, ConnectionState::is_connected).await;
        assert_eq!(state, ConnectionState::Connected { generation: 1 });
        assert!(manager.is_connected());

        manager.shutdown().await;
    }

    #[tokio::test]
    async fn retries_with_backoff_until_connected() {
        let (mut manager, _buses, attempts) = start(2, fast_config());

        wait_state(&manager, ConnectionState::is_connected).await;
        assert_eq!(attempts.load(Ordering::SeqCst), 3);

        manager.shutdown().await;
    }

    #[tokio::test]
    async fn exhausted_attempts_are_reported_as_disconnected() {
        let (mut manager, _buses, attempts) =
            start(usize::MAX, fast_config().with_max_reconnect_attempts(2));

        let state = wait_state(&manager, |state| {
            state.error().is_some_and(|e| e.contains("exhausted"))
        })
        .await;
        assert!(!state.is_connected());
        assert_eq!(attempts.load(Ordering::SeqCst), 2);

        manager.shutdown().await;
    }

    #[tokio::test]
    async fn join_while_connected_sends_only_new_rooms() {
        let (mut manager, mut buses, _attempts) = start(0, fast_config());
        let mut bus = buses.recv().await.unwrap();
        wait_state(&manager, ConnectionState::is_connected).await;

        let handle = manager.handle();
        handle.join_session_rooms(7, Role::Student, None);
        assert_eq!(
            bus.next_frame().await,
            ClientMessage::JoinRoom {
                room: "session:7".into()
            }
        );

        let change = handle.join_session_rooms(7, Role::Student, None);
        assert!(change.is_empty());

        handle.join_session_rooms(7, Role::Student, Some(UserId::from("u1")));
        assert_eq!(
            bus.next_frame().await,
            ClientMessage::JoinRoom {
                room: "session:7:role:student".into()
            }
        );
        assert_eq!(
            bus.next_frame().await,
            ClientMessage::JoinRoom {
                room: "session:7:user:u1".into()
            }
        );

        manager.shutdown().await;
    }

    #[tokio::test]
    async fn reconnect_reissues_room_joins_with_next_generation() {
        let (mut manager, mut buses, _attempts) = start(0, fast_config());
        let handle = manager.handle();
        // Recorded before the first connection completes or right after it.
        handle.join_session_rooms(7, Role::Monitor, Some(UserId::from(9_u64)));

        let first = buses.recv().await.unwrap();
        wait_state(&manager, |s| s.generation() == Some(1)).await;
        drop(first);

        let mut second = buses.recv().await.unwrap();
        let mut rooms = Vec::new();
        for _ in 0..3 {
            if let ClientMessage::JoinRoom { room } = second.next_frame().await {
                rooms.push(room);
            }
        }
        rooms.sort();
        assert_eq!(
            rooms,
            vec![
                "session:7".to_string(),
                "session:7:role:monitor".to_string(),
                "session:7:user:9".to_string(),
            ]
        );
        wait_state(&manager, |s| s.generation() == Some(2)).await;

        manager.shutdown().await;
    }

    #[tokio::test]
    async fn envelopes_are_routed_by_session() {
        let (mut manager, mut buses, _attempts) = start(0, fast_config());
        let bus = buses.recv().await.unwrap();
        wait_state(&manager, ConnectionState::is_connected).await;

        let handle = manager.handle();
        let mut seven = handle.subscribe(7);
        let mut eight = handle.subscribe(8);

        bus.push.send(envelope(7)).unwrap();
        bus.push.send(r#"{"type":"pong"}"#.into()).unwrap();
        bus.push.send("not json".into()).unwrap();

        let received = tokio::time::timeout(WAIT, seven.events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received.session_id, Some(7));
        assert!(eight.events.try_recv().is_err());

        manager.shutdown().await;
    }

    #[tokio::test]
    async fn unsubscribe_stops_delivery() {
        let (mut manager, mut buses, _attempts) = start(0, fast_config());
        let bus = buses.recv().await.unwrap();
        wait_state(&manager, ConnectionState::is_connected).await;

        let handle = manager.handle();
        let mut subscription = handle.subscribe(7);
        assert!(handle.unsubscribe(subscription.id));
        assert!(!handle.unsubscribe(subscription.id));

        bus.push.send(envelope(7)).unwrap();
        // The registry dropped the only sender, so the stream ends.
        let next = tokio::time::timeout(WAIT, subscription.events.recv())
            .await
            .unwrap();
        assert!(next.is_none());

        manager.shutdown().await;
    }

    #[tokio::test]
    async fn full_queue_flags_subscription_as_lagged() {
        let (mut manager, mut buses, _attempts) =
            start(0, fast_config().with_event_channel_capacity(1));
        let bus = buses.recv().await.unwrap();
        wait_state(&manager, ConnectionState::is_connected).await;

        let handle = manager.handle();
        let mut subscription = handle.subscribe(7);
        for _ in 0..3 {
            bus.push.send(envelope(7)).unwrap();
        }

        // Wait for the first envelope, then for the flag.
        tokio::time::timeout(WAIT, subscription.events.recv())
            .await
            .unwrap()
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(subscription.take_lagged());
        assert!(!subscription.take_lagged());

        manager.shutdown().await;
    }

    #[tokio::test]
    async fn heartbeat_sends_ping() {
        let (mut manager, mut buses, _attempts) = start(
            0,
            fast_config().with_heartbeat_interval(Some(Duration::from_millis(10))),
        );
        let mut bus = buses.recv().await.unwrap();

        assert_eq!(bus.next_frame().await, ClientMessage::Ping);

        manager.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_closes_and_rejects_sends() {
        let (mut manager, _buses, _attempts) = start(0, fast_config());
        wait_state(&manager, ConnectionState::is_connected).await;
        let handle = manager.handle();

        manager.shutdown().await;
        manager.shutdown().await; // should not panic

        assert_eq!(manager.state(), ConnectionState::Closed);
        assert!(matches!(
            handle.send(ClientMessage::Ping),
            Err(LiveQuizError::NotConnected)
        ));
    }
}

//! Live quiz session engine.
//!
//! [`QuizSession`] is a thin handle to one background session task. The task
//! owns the session's [`Reconciler`] and is the only code that ever mutates
//! it. It multiplexes, inside one `tokio::select!` loop:
//!
//! - envelopes routed to this session by the [`ConnectionHandle`],
//! - connection state transitions (a reconnect triggers a fresh snapshot),
//! - completed directory snapshot loads (spawned, so events keep flowing),
//! - commands from the handle, and
//! - the polling timer when [`ReconciliationStrategy::Polling`] is selected.
//!
//! After every mutation the task publishes an `Arc<SessionView>` on a `watch`
//! channel for presentation code.
//!
//! # Example
//!
//! ```rust,ignore
//! let session = QuizSession::open(
//!     &connection,
//!     directory,
//!     SessionParams::new(42, Role::Student).with_user_id("u-17"),
//!     SessionConfig::default(),
//! );
//!
//! let mut views = session.subscribe();
//! while views.changed().await.is_ok() {
//!     let view = views.borrow_and_update().clone();
//!     if let Some(summary) = &view.summary {
//!         println!("final score: {:.0}%", summary.final_score_percent);
//!         break;
//!     }
//! }
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::connection::{interval_timer, next_tick, ConnectionHandle, ConnectionState, Subscription};
use crate::directory::SessionDirectory;
use crate::error::{LiveQuizError, Result};
use crate::protocol::{Participant, Role, Session, SessionId, UserId};
use crate::reconciler::{Reconciler, SessionView};

/// Default timeout for [`QuizSession::leave`].
const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);

// ── Configuration ───────────────────────────────────────────────────

/// How a session stays in sync with the directory besides live events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReconciliationStrategy {
    /// Snapshots only on entry, reconnect, lag, and explicit refresh.
    #[default]
    PushOnly,
    /// Additionally reload snapshots every `interval`.
    Polling { interval: Duration },
}

impl ReconciliationStrategy {
    fn poll_interval(self) -> Option<Duration> {
        match self {
            Self::PushOnly => None,
            Self::Polling { interval } => Some(interval),
        }
    }
}

/// Configuration for a [`QuizSession`].
///
/// ```
/// use live_quiz_engine::engine::{ReconciliationStrategy, SessionConfig};
/// use std::time::Duration;
///
/// let config = SessionConfig::default().with_polling(Duration::from_secs(15));
/// assert_eq!(
///     config.reconciliation,
///     ReconciliationStrategy::Polling { interval: Duration::from_secs(15) }
/// );
/// ```
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Defaults to [`ReconciliationStrategy::PushOnly`].
    pub reconciliation: ReconciliationStrategy,
    /// Time [`QuizSession::leave`] waits for the session task before
    /// aborting it. Defaults to **1 second**.
    pub shutdown_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            reconciliation: ReconciliationStrategy::PushOnly,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
        }
    }
}

impl SessionConfig {
    #[must_use]
    pub fn with_reconciliation(mut self, strategy: ReconciliationStrategy) -> Self {
        self.reconciliation = strategy;
        self
    }

    /// Shorthand for [`ReconciliationStrategy::Polling`].
    #[must_use]
    pub fn with_polling(mut self, interval: Duration) -> Self {
        self.reconciliation = ReconciliationStrategy::Polling { interval };
        self
    }

    #[must_use]
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }
}

/// Which session to open, and as whom.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionParams {
    pub session_id: SessionId,
    pub role: Role,
    /// The local user. `None` until the caller's identity is known; see
    /// [`QuizSession::resolve_identity`].
    pub user_id: Option<UserId>,
}

impl SessionParams {
    pub fn new(session_id: SessionId, role: Role) -> Self {
        Self {
            session_id,
            role,
            user_id: None,
        }
    }

    #[must_use]
    pub fn with_user_id(mut self, user_id: impl Into<UserId>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }
}

// ── Session handle ──────────────────────────────────────────────────

enum SessionCommand {
    ResolveIdentity(UserId),
    Refresh,
    ReportMinigameScore(u32),
}

/// Handle to one open session.
///
/// Dropping the handle aborts the session task and leaves the session's rooms.
pub struct QuizSession {
    session_id: SessionId,
    role: Role,
    user_id: Option<UserId>,
    connection: ConnectionHandle,
    directory: Arc<dyn SessionDirectory>,
    subscriber_id: crate::connection::SubscriberId,
    cmd_tx: mpsc::UnboundedSender<SessionCommand>,
    view_rx: watch::Receiver<Arc<SessionView>>,
    detached: Arc<AtomicBool>,
    task: Option<tokio::task::JoinHandle<()>>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    shutdown_timeout: Duration,
}

impl QuizSession {
    /// Open a session: subscribe to its events, join its rooms, load the
    /// initial snapshots, and start applying events.
    ///
    /// Must be called from within a tokio runtime.
    pub fn open(
        connection: &ConnectionHandle,
        directory: Arc<dyn SessionDirectory>,
        params: SessionParams,
        config: SessionConfig,
    ) -> Self {
        let SessionParams {
            session_id,
            role,
            user_id,
        } = params;

        // Subscribe before joining so nothing addressed to the rooms is missed.
        let subscription = connection.subscribe(session_id);
        let subscriber_id = subscription.id;
        connection.join_session_rooms(session_id, role, user_id.clone());

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel::<SessionCommand>();
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let (view_tx, view_rx) = watch::channel(Arc::new(SessionView::loading(session_id)));
        let detached = Arc::new(AtomicBool::new(false));

        let task = SessionTask {
            reconciler: Reconciler::new(session_id, user_id.clone()),
            directory: Arc::clone(&directory),
            subscription,
            state_rx: connection.subscribe_state(),
            view_tx,
            loads: JoinSet::new(),
            next_seq: 0,
            applied_seq: 0,
            last_generation: None,
            is_connected: false,
            connection_error: None,
            detached: Arc::clone(&detached),
        };
        let task = tokio::spawn(task.run(
            cmd_rx,
            shutdown_rx,
            config.reconciliation.poll_interval(),
        ));

        info!(session_id, %role, "session opened");

        Self {
            session_id,
            role,
            user_id,
            connection: connection.clone(),
            directory,
            subscriber_id,
            cmd_tx,
            view_rx,
            detached,
            task: Some(task),
            shutdown_tx: Some(shutdown_tx),
            shutdown_timeout: config.shutdown_timeout,
        }
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn user_id(&self) -> Option<&UserId> {
        self.user_id.as_ref()
    }

    /// Latest published view.
    pub fn view(&self) -> Arc<SessionView> {
        Arc::clone(&self.view_rx.borrow())
    }

    /// Observe every published view.
    pub fn subscribe(&self) -> watch::Receiver<Arc<SessionView>> {
        self.view_rx.clone()
    }

    /// Returns `true` once [`leave`](Self::leave) has been called.
    pub fn is_detached(&self) -> bool {
        self.detached.load(Ordering::Acquire)
    }

    /// Record the local user's identity once it is known. Joins the role and
    /// user rooms and starts tallying this user's answers.
    ///
    /// # Errors
    ///
    /// Returns [`LiveQuizError::SessionDetached`] after [`leave`](Self::leave).
    pub fn resolve_identity(&mut self, user_id: impl Into<UserId>) -> Result<()> {
        let user_id = user_id.into();
        self.ensure_attached()?;
        self.connection
            .join_session_rooms(self.session_id, self.role, Some(user_id.clone()));
        self.user_id = Some(user_id.clone());
        self.command(SessionCommand::ResolveIdentity(user_id))
    }

    /// Reload the participant and session snapshots.
    ///
    /// # Errors
    ///
    /// Returns [`LiveQuizError::SessionDetached`] after [`leave`](Self::leave).
    pub fn refresh(&self) -> Result<()> {
        self.command(SessionCommand::Refresh)
    }

    /// Attach the bonus-round minigame score reported by the local client.
    ///
    /// # Errors
    ///
    /// Returns [`LiveQuizError::SessionDetached`] after [`leave`](Self::leave).
    pub fn report_minigame_score(&self, score: u32) -> Result<()> {
        self.command(SessionCommand::ReportMinigameScore(score))
    }

    /// Start the session (teacher only).
    ///
    /// # Errors
    ///
    /// Returns [`LiveQuizError::RoleNotPermitted`] for other roles, and any
    /// directory error otherwise.
    pub async fn start_session(&self) -> Result<()> {
        self.ensure_permitted("start_session")?;
        self.directory.start_session(self.session_id).await?;
        info!(session_id = self.session_id, "session start requested");
        Ok(())
    }

    /// Reshuffle the remaining questions (teacher only). Call
    /// [`refresh`](Self::refresh) afterwards to pick up the new order.
    ///
    /// # Errors
    ///
    /// Returns [`LiveQuizError::RoleNotPermitted`] for other roles, and any
    /// directory error otherwise.
    pub async fn reshuffle_questions(&self) -> Result<()> {
        self.ensure_permitted("reshuffle_questions")?;
        self.directory.reshuffle_questions(self.session_id).await?;
        info!(session_id = self.session_id, "questions reshuffled");
        Ok(())
    }

    /// Leave the session. Nothing is applied to the view once this returns.
    pub async fn leave(&mut self) {
        if self.detached.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!(session_id = self.session_id, "leaving session");

        self.connection.unsubscribe(self.subscriber_id);
        self.connection.leave_session_rooms(self.session_id);

        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }

        if let Some(mut task) = self.task.take() {
            match tokio::time::timeout(self.shutdown_timeout, &mut task).await {
                Ok(Ok(())) => {}
                Ok(Err(join_err)) => {
                    warn!("session task terminated with join error: {join_err}");
                }
                Err(_) => {
                    warn!("session task did not exit within timeout; aborting task");
                    task.abort();
                    if let Err(join_err) = task.await {
                        debug!("session task aborted: {join_err}");
                    }
                }
            }
        }
        info!(session_id = self.session_id, "session left");
    }

    // ── Internal helpers ────────────────────────────────────────────

    fn ensure_attached(&self) -> Result<()> {
        if self.is_detached() {
            Err(LiveQuizError::SessionDetached(self.session_id))
        } else {
            Ok(())
        }
    }

    fn ensure_permitted(&self, command: &'static str) -> Result<()> {
        self.ensure_attached()?;
        if self.role.controls_session() {
            Ok(())
        } else {
            Err(LiveQuizError::RoleNotPermitted {
                command,
                role: self.role,
            })
        }
    }

    fn command(&self, command: SessionCommand) -> Result<()> {
        self.ensure_attached()?;
        self.cmd_tx
            .send(command)
            .map_err(|_| LiveQuizError::SessionDetached(self.session_id))
    }
}

impl std::fmt::Debug for QuizSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuizSession")
            .field("session_id", &self.session_id)
            .field("role", &self.role)
            .field("user_id", &self.user_id)
            .field("detached", &self.is_detached())
            .finish()
    }
}

impl Drop for QuizSession {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        if !self.detached.swap(true, Ordering::AcqRel) {
            self.connection.unsubscribe(self.subscriber_id);
            self.connection.leave_session_rooms(self.session_id);
        }
    }
}

// ── Session task ────────────────────────────────────────────────────

struct LoadResult {
    seq: u64,
    participants: Result<Vec<Participant>>,
    session: Result<Session>,
}

struct SessionTask {
    reconciler: Reconciler,
    directory: Arc<dyn SessionDirectory>,
    subscription: Subscription,
    state_rx: watch::Receiver<ConnectionState>,
    view_tx: watch::Sender<Arc<SessionView>>,
    loads: JoinSet<LoadResult>,
    next_seq: u64,
    applied_seq: u64,
    last_generation: Option<u64>,
    is_connected: bool,
    connection_error: Option<String>,
    detached: Arc<AtomicBool>,
}

impl SessionTask {
    async fn run(
        mut self,
        mut cmd_rx: mpsc::UnboundedReceiver<SessionCommand>,
        mut shutdown_rx: oneshot::Receiver<()>,
        poll_interval: Option<Duration>,
    ) {
        let session_id = self.reconciler.session_id();
        debug!(session_id, "session task started");

        // The entry snapshot covers whatever connection exists right now, so
        // only later generations trigger a reload.
        let initial = self.state_rx.borrow_and_update().clone();
        self.last_generation = initial.generation();
        self.observe_connection(&initial);
        self.request_snapshot("entry");
        self.publish();

        let mut poll = interval_timer(poll_interval);
        let mut state_open = true;

        loop {
            tokio::select! {
                _ = &mut shutdown_rx => {
                    debug!(session_id, "session shutdown signal received");
                    break;
                }

                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(cmd) => self.handle_command(cmd),
                        // The handle is gone.
                        None => break,
                    }
                }

                envelope = self.subscription.events.recv() => {
                    match envelope {
                        Some(envelope) => {
                            if self.is_detached() {
                                break;
                            }
                            if self.reconciler.apply_envelope(&envelope) {
                                self.publish();
                            }
                        }
                        None => {
                            debug!(session_id, "subscription closed");
                            break;
                        }
                    }
                }

                changed = self.state_rx.changed(), if state_open => {
                    if changed.is_ok() {
                        let state = self.state_rx.borrow_and_update().clone();
                        self.on_connection_state(&state);
                    } else {
                        debug!(session_id, "connection manager gone");
                        state_open = false;
                        self.observe_connection(&ConnectionState::Closed);
                        self.publish();
                    }
                }

                Some(joined) = self.loads.join_next() => {
                    match joined {
                        Ok(result) => self.on_loaded(result),
                        Err(join_err) => warn!(session_id, "snapshot load task failed: {join_err}"),
                    }
                }

                _ = next_tick(&mut poll) => self.request_snapshot("poll"),
            }

            if self.subscription.take_lagged() {
                warn!(session_id, "event queue overflowed, resynchronising");
                self.request_snapshot("lagged");
            }
        }

        self.loads.abort_all();
        debug!(session_id, "session task exited");
    }

    fn is_detached(&self) -> bool {
        self.detached.load(Ordering::Acquire)
    }

    fn handle_command(&mut self, cmd: SessionCommand) {
        match cmd {
            SessionCommand::ResolveIdentity(user_id) => {
                debug!(session_id = self.reconciler.session_id(), %user_id, "identity resolved");
                self.reconciler.set_subject(user_id);
                self.publish();
            }
            SessionCommand::Refresh => self.request_snapshot("refresh"),
            SessionCommand::ReportMinigameScore(score) => {
                if self.reconciler.record_minigame_score(score) {
                    self.publish();
                }
            }
        }
    }

    fn on_connection_state(&mut self, state: &ConnectionState) {
        if let ConnectionState::Connected { generation } = state {
            let previous = self.last_generation.replace(*generation);
            if *generation > 1 && previous != Some(*generation) {
                info!(
                    session_id = self.reconciler.session_id(),
                    generation, "reconnected, reloading snapshots"
                );
                self.request_snapshot("reconnect");
            }
        }
        self.observe_connection(state);
        self.publish();
    }

    fn observe_connection(&mut self, state: &ConnectionState) {
        self.is_connected = state.is_connected();
        match state {
            ConnectionState::Connected { .. } => self.connection_error = None,
            // Keep the last failure visible while retrying.
            ConnectionState::Connecting => {}
            ConnectionState::Disconnected { .. } | ConnectionState::Closed => {
                self.connection_error = state.error().map(str::to_string);
            }
        }
    }

    fn request_snapshot(&mut self, reason: &'static str) {
        self.next_seq += 1;
        let seq = self.next_seq;
        let session_id = self.reconciler.session_id();
        let directory = Arc::clone(&self.directory);
        debug!(session_id, seq, reason, "requesting snapshot");

        self.loads.spawn(async move {
            let (participants, session) = tokio::join!(
                directory.load_participants(session_id),
                directory.load_session(session_id),
            );
            LoadResult {
                seq,
                participants,
                session,
            }
        });
    }

    fn on_loaded(&mut self, result: LoadResult) {
        let session_id = self.reconciler.session_id();
        if result.seq <= self.applied_seq {
            debug!(session_id, seq = result.seq, "dropping stale snapshot");
            return;
        }
        self.applied_seq = result.seq;

        let mut not_found = false;
        match result.participants {
            Ok(participants) => {
                self.reconciler.apply_participants_snapshot(participants);
            }
            Err(LiveQuizError::SessionNotFound(_)) => not_found = true,
            Err(e) => warn!(session_id, "participants snapshot failed: {e}"),
        }
        match result.session {
            Ok(session) => {
                self.reconciler.apply_session_snapshot(session);
            }
            Err(LiveQuizError::SessionNotFound(_)) => not_found = true,
            Err(e) => warn!(session_id, "session snapshot failed: {e}"),
        }
        if not_found {
            warn!(session_id, "session not found in directory");
            self.reconciler.mark_not_found();
        }
        self.publish();
    }

    fn publish(&self) {
        let view = self
            .reconciler
            .view(self.is_connected, self.connection_error.clone());
        self.view_tx.send_replace(Arc::new(view));
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults() {
        let config = SessionConfig::default();
        assert_eq!(config.reconciliation, ReconciliationStrategy::PushOnly);
        assert_eq!(config.shutdown_timeout, Duration::from_secs(1));
        assert_eq!(config.reconciliation.poll_interval(), None);
    }

    #[test]
    fn polling_strategy_exposes_interval() {
        let config = SessionConfig::default().with_polling(Duration::from_millis(250));
        assert_eq!(
            config.reconciliation.poll_interval(),
            Some(Duration::from_millis(250))
        );
    }

    #[test]
    fn params_builder() {
        let params = SessionParams::new(3, Role::Student).with_user_id(17_u64);
        assert_eq!(params.user_id, Some(UserId::from(17_u64)));
        assert_eq!(SessionParams::new(3, Role::Monitor).user_id, None);
    }
}

//! # Live Quiz Engine
//!
//! Client-side engine that keeps a live quiz session consistent for teachers,
//! students, and monitors.
//!
//! Session state comes from two sources: a request/response **Session
//! Directory** that serves authoritative snapshots, and a pub/sub **Event
//! Bus** that pushes incremental events over one long-lived connection. The
//! engine merges both into a per-session store, tracks rounds and the bonus
//! round, ranks participants, and builds an end-of-session summary.
//!
//! ## Features
//!
//! - **Transport-agnostic** — implement [`Transport`] and [`Connector`] for any
//!   bidirectional text channel; the connection manager reconnects with backoff
//! - **Multi-session** — one [`ConnectionManager`] serves any number of
//!   [`QuizSession`]s, routing events by session id
//! - **Self-healing** — snapshots are reloaded after every reconnect, on queue
//!   overflow, on demand, and optionally on a polling interval
//! - **WebSocket built-in** — default `transport-websocket` feature provides
//!   [`WebSocketConnector`]
//! - **HTTP directory** — optional `directory-http` feature provides
//!   [`HttpSessionDirectory`](directories::HttpSessionDirectory)
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! # #[cfg(all(feature = "transport-websocket", feature = "directory-http"))]
//! # async fn example() -> Result<(), live_quiz_engine::LiveQuizError> {
//! use std::sync::Arc;
//! use live_quiz_engine::directories::HttpSessionDirectory;
//! use live_quiz_engine::{
//!     ConnectionConfig, ConnectionManager, QuizSession, Role, SessionConfig, SessionParams,
//!     WebSocketConnector,
//! };
//!
//! let manager = ConnectionManager::start(
//!     WebSocketConnector::new("wss://quiz.example.com/bus"),
//!     ConnectionConfig::default(),
//! );
//! let directory = Arc::new(HttpSessionDirectory::new("https://quiz.example.com/api"));
//!
//! let mut session = QuizSession::open(
//!     &manager.handle(),
//!     directory,
//!     SessionParams::new(42, Role::Student).with_user_id("u-17"),
//!     SessionConfig::default(),
//! );
//!
//! let mut views = session.subscribe();
//! while views.changed().await.is_ok() {
//!     let view = views.borrow_and_update().clone();
//!     for entry in &view.leaderboard {
//!         println!("{}. {} ({})", entry.rank, entry.display_name, entry.score);
//!     }
//!     if view.summary.is_some() {
//!         break;
//!     }
//! }
//!
//! session.leave().await;
//! # Ok(())
//! # }
//! ```

pub mod connection;
pub mod directories;
pub mod directory;
pub mod engine;
pub mod error;
pub mod error_codes;
pub mod leaderboard;
pub mod protocol;
pub mod reconciler;
pub mod rooms;
pub mod rounds;
pub mod store;
pub mod summary;
pub mod transport;
pub mod transports;

// Re-export primary types for ergonomic imports.
pub use connection::{
    BackoffPolicy, ConnectionConfig, ConnectionHandle, ConnectionManager, ConnectionState,
};
pub use directory::SessionDirectory;
pub use engine::{QuizSession, ReconciliationStrategy, SessionConfig, SessionParams};
pub use error::{LiveQuizError, Result};
pub use error_codes::ErrorCode;
pub use leaderboard::LeaderboardEntry;
pub use protocol::{
    ClientMessage, EventEnvelope, Participant, Role, Session, SessionEvent, SessionId,
    SessionStatus, UserId,
};
pub use reconciler::{SessionLookup, SessionView};
pub use rounds::Round;
pub use summary::SessionSummary;
pub use transport::{Connector, Transport};

#[cfg(feature = "transport-websocket")]
pub use transports::{WebSocketConnector, WebSocketTransport};

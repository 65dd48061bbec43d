//! # Live Monitor Example
//!
//! Watches a running quiz session as a read-only monitor:
//!
//! 1. Connect to the Event Bus over WebSocket
//! 2. Load the session snapshots from the HTTP Session Directory
//! 3. Print the leaderboard every time it changes
//! 4. Shut down on Ctrl+C or when the session finishes
//!
//! ## Running
//!
//! ```sh
//! QUIZ_BUS_URL=ws://localhost:8080/bus \
//! QUIZ_DIRECTORY_URL=http://localhost:8080/api \
//! QUIZ_SESSION_ID=42 \
//!     cargo run --example live_monitor --features directory-http
//! ```

use std::sync::Arc;
use std::time::Duration;

use live_quiz_engine::directories::HttpSessionDirectory;
use live_quiz_engine::{
    ConnectionConfig, ConnectionManager, QuizSession, Role, SessionConfig, SessionLookup,
    SessionParams, SessionStatus, WebSocketConnector,
};

const DEFAULT_BUS_URL: &str = "ws://localhost:8080/bus";
const DEFAULT_DIRECTORY_URL: &str = "http://localhost:8080/api";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // ── Logging ─────────────────────────────────────────────────────
    // Set `RUST_LOG=debug` for verbose output.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    // ── Configuration ───────────────────────────────────────────────
    let bus_url = std::env::var("QUIZ_BUS_URL").unwrap_or_else(|_| DEFAULT_BUS_URL.to_string());
    let directory_url =
        std::env::var("QUIZ_DIRECTORY_URL").unwrap_or_else(|_| DEFAULT_DIRECTORY_URL.to_string());
    let session_id: u64 = std::env::var("QUIZ_SESSION_ID")
        .unwrap_or_else(|_| "1".to_string())
        .parse()?;

    let mut directory = HttpSessionDirectory::new(directory_url);
    if let Ok(token) = std::env::var("QUIZ_TOKEN") {
        directory = directory.with_bearer_token(token);
    }

    // ── Connect ─────────────────────────────────────────────────────
    tracing::info!("Connecting to {bus_url}");
    let mut manager = ConnectionManager::start(
        WebSocketConnector::new(bus_url).with_connect_timeout(Duration::from_secs(5)),
        ConnectionConfig::default(),
    );

    // Poll the directory on top of bus events.
    let mut session = QuizSession::open(
        &manager.handle(),
        Arc::new(directory),
        SessionParams::new(session_id, Role::Monitor),
        SessionConfig::default().with_polling(Duration::from_secs(30)),
    );
    let mut views = session.subscribe();

    // ── Event loop ──────────────────────────────────────────────────
    loop {
        tokio::select! {
            changed = views.changed() => {
                if changed.is_err() {
                    tracing::warn!("session task stopped");
                    break;
                }
                let view = Arc::clone(&views.borrow_and_update());

                if view.lookup == SessionLookup::NotFound {
                    tracing::error!("session {session_id} does not exist");
                    break;
                }
                if let Some(error) = &view.connection_error {
                    tracing::warn!("bus unavailable: {error}");
                }

                tracing::info!(
                    "session {session_id} is {:?} with {} participant(s)",
                    view.status(),
                    view.participants.len()
                );
                for entry in view.leaderboard.iter().take(10) {
                    tracing::info!("  {:>2}. {:<20} {:>8.1}", entry.rank, entry.display_name, entry.score);
                }

                if view.status() == SessionStatus::Finished {
                    tracing::info!("session finished");
                    break;
                }
            }

            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Ctrl+C received, leaving session");
                break;
            }
        }
    }

    // ── Clean shutdown ──────────────────────────────────────────────
    session.leave().await;
    manager.shutdown().await;
    Ok(())
}

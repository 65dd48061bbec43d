//! Transport abstraction for the Event Bus.
//!
//! The [`Transport`] trait defines one established, bidirectional text message
//! channel between the engine and the Event Bus. Every frame is one complete
//! JSON document, so implementations must handle framing internally (e.g.
//! WebSocket frames, length-prefixed TCP).
//!
//! Because connections drop and must be re-established with backoff, the
//! [`ConnectionManager`](crate::connection::ConnectionManager) does not take a
//! transport directly. It takes a [`Connector`], a factory it calls once per
//! connection attempt.
//!
//! # Implementing a Custom Transport
//!
//! ```rust,no_run
//! use async_trait::async_trait;
//! use live_quiz_engine::error::LiveQuizError;
//! use live_quiz_engine::transport::{Connector, Transport};
//!
//! struct MyTransport { /* ... */ }
//!
//! #[async_trait]
//! impl Transport for MyTransport {
//!     async fn send(&mut self, message: String) -> Result<(), LiveQuizError> {
//!         // Send the JSON text frame over your transport
//!         todo!()
//!     }
//!
//!     async fn recv(&mut self) -> Option<Result<String, LiveQuizError>> {
//!         // Receive the next JSON text frame
//!         // Return None when the connection is closed cleanly
//!         todo!()
//!     }
//!
//!     async fn close(&mut self) -> Result<(), LiveQuizError> {
//!         todo!()
//!     }
//! }
//!
//! struct MyConnector;
//!
//! #[async_trait]
//! impl Connector for MyConnector {
//!     type Transport = MyTransport;
//!
//!     async fn connect(&mut self) -> Result<MyTransport, LiveQuizError> {
//!         todo!()
//!     }
//! }
//! ```

use async_trait::async_trait;

use crate::error::LiveQuizError;

/// A bidirectional text message transport to the Event Bus.
///
/// Each call to [`send`](Transport::send) transmits one complete JSON frame.
/// Each call to [`recv`](Transport::recv) returns one complete JSON frame.
///
/// # Cancel Safety
///
/// The [`recv`](Transport::recv) method **MUST** be cancel-safe because it is used
/// inside `tokio::select!`. If `recv` is cancelled before completion, calling it
/// again must not lose data. Channel-based implementations (e.g., wrapping
/// `mpsc::Receiver`) are naturally cancel-safe.
#[async_trait]
pub trait Transport: Send + 'static {
    /// Send a JSON text frame to the Event Bus.
    ///
    /// # Errors
    ///
    /// Returns [`LiveQuizError::TransportSend`] if the frame could not be sent
    /// (e.g., connection broken, write buffer full).
    async fn send(&mut self, message: String) -> Result<(), LiveQuizError>;

    /// Receive the next JSON text frame from the Event Bus.
    ///
    /// Returns:
    /// - `Some(Ok(text))` — a complete frame was received
    /// - `Some(Err(e))` — a transport error occurred (e.g., [`LiveQuizError::TransportReceive`])
    /// - `None` — the connection was closed cleanly by the server
    ///
    /// # Cancel Safety
    ///
    /// This method **MUST** be cancel-safe (see [trait documentation](Transport)).
    async fn recv(&mut self) -> Option<Result<String, LiveQuizError>>;

    /// Close the transport connection gracefully.
    ///
    /// # Errors
    ///
    /// Returns an error if the graceful shutdown fails. Implementations should
    /// still release resources even if the close handshake fails.
    async fn close(&mut self) -> Result<(), LiveQuizError>;
}

/// Establishes fresh [`Transport`]s for the connection manager.
///
/// Called once for the initial connection and once per reconnect attempt.
/// A failed attempt is reported as an `Err`; the manager applies its backoff
/// policy and calls `connect` again.
#[async_trait]
pub trait Connector: Send + 'static {
    /// Transport produced by a successful attempt.
    type Transport: Transport;

    /// Open a new connection.
    ///
    /// # Errors
    ///
    /// Returns any error that prevented the connection from being established.
    async fn connect(&mut self) -> Result<Self::Transport, LiveQuizError>;
}

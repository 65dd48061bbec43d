//! WebSocket transport implementation using `tokio-tungstenite`.
//!
//! [`WebSocketTransport`] carries Event Bus frames over one WebSocket
//! connection, and [`WebSocketConnector`] opens a fresh one for every
//! (re)connect attempt of the [`ConnectionManager`](crate::ConnectionManager).
//! Both `ws://` and `wss://` URLs are supported; TLS is handled transparently
//! via [`MaybeTlsStream`](tokio_tungstenite::MaybeTlsStream).
//!
//! # Feature gate
//!
//! This module is only available when the `transport-websocket` feature is enabled
//! (it is enabled by default).
//!
//! # Example
//!
//! ```rust,no_run
//! # async fn example() {
//! use live_quiz_engine::{ConnectionConfig, ConnectionManager, WebSocketConnector};
//!
//! let connector = WebSocketConnector::new("wss://quiz.example.com/bus");
//! let manager = ConnectionManager::start(connector, ConnectionConfig::default());
//! # }
//! ```

use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::protocol::Message;

use crate::error::LiveQuizError;
use crate::transport::{Connector, Transport};

/// Default time allowed for one connection attempt.
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Type alias for the underlying WebSocket stream.
pub type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// A [`Transport`] implementation backed by a WebSocket connection.
///
/// # Cancel Safety
///
/// The [`recv`](Transport::recv) method is cancel-safe. Dropping the future
/// returned by `recv` before it completes will not consume or lose any frames.
#[derive(Debug)]
pub struct WebSocketTransport {
    stream: WsStream,
    closed: bool,
}

impl WebSocketTransport {
    /// Establish a new WebSocket connection to the given URL.
    ///
    /// # Errors
    ///
    /// Returns [`LiveQuizError::Io`] if the URL is invalid or the connection
    /// cannot be established. When the underlying error is an I/O error its
    /// [`ErrorKind`](std::io::ErrorKind) is preserved; all other errors are
    /// mapped to [`ErrorKind::Other`](std::io::ErrorKind::Other).
    pub async fn connect(url: &str) -> Result<Self, LiveQuizError> {
        tracing::debug!(url = %url, "connecting to event bus");

        let (stream, _response) = tokio_tungstenite::connect_async(url).await.map_err(|e| {
            let kind = match &e {
                tokio_tungstenite::tungstenite::Error::Io(io) => io.kind(),
                _ => std::io::ErrorKind::Other,
            };
            LiveQuizError::Io(std::io::Error::new(kind, e))
        })?;

        tracing::info!(url = %url, "event bus connection established");

        Ok(Self::from_stream(stream))
    }

    /// Wrap an already-established WebSocket stream (custom TLS, proxies, headers).
    pub fn from_stream(stream: WsStream) -> Self {
        Self {
            stream,
            closed: false,
        }
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn send(&mut self, message: String) -> Result<(), LiveQuizError> {
        if self.closed {
            return Err(LiveQuizError::TransportClosed);
        }
        self.stream
            .send(Message::Text(message.into()))
            .await
            .map_err(|e| LiveQuizError::TransportSend(e.to_string()))
    }

    async fn recv(&mut self) -> Option<Result<String, LiveQuizError>> {
        loop {
            let msg = match self.stream.next().await {
                Some(Ok(msg)) => msg,
                Some(Err(e)) => {
                    return Some(Err(LiveQuizError::TransportReceive(e.to_string())));
                }
                None => return None,
            };

            match msg {
                Message::Text(text) => return Some(Ok(text.to_string())),
                Message::Close(frame) => {
                    tracing::debug!(?frame, "received WebSocket close frame");
                    return None;
                }
                // tungstenite queues the pong reply itself.
                Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => {}
                Message::Binary(_) => {
                    tracing::warn!("received unexpected binary WebSocket frame, skipping");
                }
            }
        }
    }

    async fn close(&mut self) -> Result<(), LiveQuizError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.stream
            .close(None)
            .await
            .map_err(|e| LiveQuizError::TransportSend(e.to_string()))
    }
}

/// Opens a new [`WebSocketTransport`] to a fixed URL for every connection attempt.
#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    url: String,
    connect_timeout: Duration,
}

impl WebSocketConnector {
    /// Connector for the given `ws://` or `wss://` URL.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    /// Set the time allowed for one connection attempt.
    ///
    /// Defaults to **10 seconds**.
    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    type Transport = WebSocketTransport;

    async fn connect(&mut self) -> Result<WebSocketTransport, LiveQuizError> {
        tokio::time::timeout(self.connect_timeout, WebSocketTransport::connect(&self.url))
            .await
            .map_err(|_| LiveQuizError::Timeout)?
    }
}

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
    use tokio::net::TcpListener;

    /// Start a local WebSocket server that runs `handler` on the accepted
    /// connection and returns the address to connect to.
    async fn start_mock_bus<F, Fut>(handler: F) -> String
    where
        F: FnOnce(tokio_tungstenite::WebSocketStream<tokio::net::TcpStream>) -> Fut
            + Send
            + 'static,
        Fut: std::future::Future<Output = ()> + Send,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
            handler(ws).await;
        });

        format!("ws://{addr}")
    }

    #[test]
    fn websocket_transport_is_send() {
        fn assert_send<T: Send>() {}
        assert_send::<WebSocketTransport>();
    }

    #[tokio::test]
    async fn connect_fails_with_invalid_url() {
        let err = WebSocketTransport::connect("not-a-valid-url")
            .await
            .unwrap_err();
        assert!(matches!(err, LiveQuizError::Io(_)));
    }

    #[tokio::test]
    async fn connector_times_out_on_unroutable_host() {
        let mut connector = WebSocketConnector::new("ws://192.0.2.1:1")
            .with_connect_timeout(Duration::from_millis(50));
        let err = connector.connect().await.unwrap_err();
        assert!(matches!(err, LiveQuizError::Timeout));
    }

    #[tokio::test]
    async fn recv_yields_envelopes_and_skips_binary_frames() {
        let url = start_mock_bus(|mut ws| async move {
            ws.send(Message::Binary(vec![0xDE, 0xAD].into()))
                .await
                .unwrap();
            ws.send(Message::Text(
                r#"{"type":"session_finished","session_id":7,"payload":{}}"#.into(),
            ))
            .await
            .unwrap();
            ws.close(None).await.unwrap();
        })
        .await;

        let mut transport = WebSocketConnector::new(url).connect().await.unwrap();

        let frame = transport.recv().await.unwrap().unwrap();
        assert!(frame.contains("session_finished"));
        assert!(transport.recv().await.is_none());
    }

    #[tokio::test]
    async fn sent_frames_reach_the_bus() {
        let (seen_tx, seen_rx) = tokio::sync::oneshot::channel();
        let url = start_mock_bus(|mut ws| async move {
            if let Some(Ok(Message::Text(text))) = ws.next().await {
                let _ = seen_tx.send(text.to_string());
            }
            while let Some(Ok(_)) = ws.next().await {}
        })
        .await;

        let mut transport = WebSocketTransport::connect(&url).await.unwrap();
        transport
            .send(r#"{"type":"join_room","data":{"room":"session:7"}}"#.into())
            .await
            .unwrap();

        let seen = seen_rx.await.unwrap();
        assert!(seen.contains("session:7"));
        transport.close().await.unwrap();
    }

    #[tokio::test]
    async fn send_after_close_returns_transport_closed() {
        let url =
            start_mock_bus(|mut ws| async move { while let Some(Ok(_)) = ws.next().await {} })
                .await;

        let mut transport = WebSocketTransport::connect(&url).await.unwrap();
        transport.close().await.unwrap();
        transport.close().await.unwrap();

        let err = transport.send("oops".to_string()).await.unwrap_err();
        assert!(matches!(err, LiveQuizError::TransportClosed));
    }
}

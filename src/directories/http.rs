//! HTTP Session Directory using `reqwest`.
//!
//! Endpoints, relative to the configured base URL:
//!
//! | Operation             | Request                          |
//! |-----------------------|----------------------------------|
//! | `load_participants`   | `GET  /sessions/{id}/participants` |
//! | `load_session`        | `GET  /sessions/{id}`            |
//! | `start_session`       | `POST /sessions/{id}/start`      |
//! | `reshuffle_questions` | `POST /sessions/{id}/reshuffle`  |
//!
//! # Feature gate
//!
//! This module is only available when the `directory-http` feature is enabled.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::ACCEPT;
use reqwest::{Client, RequestBuilder, StatusCode};
use tracing::{debug, warn};

use crate::directory::{
    decode_ack, decode_participants, decode_session, DirectoryResponse, SessionDirectory,
};
use crate::error::{LiveQuizError, Result};
use crate::protocol::{Participant, Session, SessionId};

/// Default per-request timeout.
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// A [`SessionDirectory`] backed by the backend's REST API.
#[derive(Debug, Clone)]
pub struct HttpSessionDirectory {
    client: Client,
    base_url: String,
    bearer_token: Option<String>,
    timeout: Duration,
}

impl HttpSessionDirectory {
    /// Directory rooted at `base_url` (e.g. `https://quiz.example.com/api`).
    pub fn new(base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self {
            client: Client::new(),
            base_url,
            bearer_token: None,
            timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    /// Use a preconfigured client (proxies, TLS roots, connection pooling).
    #[must_use]
    pub fn with_client(mut self, client: Client) -> Self {
        self.client = client;
        self
    }

    /// Send `Authorization: Bearer <token>` with every request.
    #[must_use]
    pub fn with_bearer_token(mut self, token: impl Into<String>) -> Self {
        self.bearer_token = Some(token.into());
        self
    }

    /// Set the per-request timeout. Defaults to **10 seconds**.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, session_id: SessionId, suffix: &str) -> String {
        format!("{}/sessions/{session_id}{suffix}", self.base_url)
    }

    /// Send `request` and return the body of a successful response.
    async fn execute(&self, session_id: SessionId, request: RequestBuilder) -> Result<String> {
        let mut request = request
            .timeout(self.timeout)
            .header(ACCEPT, "application/json");
        if let Some(token) = &self.bearer_token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await.map_err(request_error)?;
        let status = response.status();
        let body = response.text().await.map_err(request_error)?;
        debug!(session_id, %status, bytes = body.len(), "session directory response");

        if status == StatusCode::NOT_FOUND {
            return Err(LiveQuizError::SessionNotFound(session_id));
        }
        if !status.is_success() {
            warn!(session_id, %status, "session directory returned error status");
            if let Ok(envelope) = serde_json::from_str::<DirectoryResponse<serde_json::Value>>(&body)
            {
                envelope.into_data(session_id)?;
            }
            return Err(LiveQuizError::DirectoryUnavailable(format!(
                "unexpected status {status}"
            )));
        }
        Ok(body)
    }
}

fn request_error(e: reqwest::Error) -> LiveQuizError {
    if e.is_timeout() {
        LiveQuizError::Timeout
    } else {
        LiveQuizError::DirectoryUnavailable(e.to_string())
    }
}

#[async_trait]
impl SessionDirectory for HttpSessionDirectory {
    async fn load_participants(&self, session_id: SessionId) -> Result<Vec<Participant>> {
        let request = self.client.get(self.url(session_id, "/participants"));
        let body = self.execute(session_id, request).await?;
        decode_participants(session_id, &body)
    }

    async fn load_session(&self, session_id: SessionId) -> Result<Session> {
        let request = self.client.get(self.url(session_id, ""));
        let body = self.execute(session_id, request).await?;
        decode_session(session_id, &body)
    }

    async fn start_session(&self, session_id: SessionId) -> Result<()> {
        let request = self.client.post(self.url(session_id, "/start"));
        let body = self.execute(session_id, request).await?;
        decode_ack(session_id, &body)
    }

    async fn reshuffle_questions(&self, session_id: SessionId) -> Result<()> {
        let request = self.client.post(self.url(session_id, "/reshuffle"));
        let body = self.execute(session_id, request).await?;
        decode_ack(session_id, &body)
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
    use crate::error_codes::ErrorCode;
    use crate::protocol::SessionStatus;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::sync::oneshot;

    /// Serve exactly one HTTP response and report the raw request head.
    async fn serve_once(status_line: &'static str, body: &'static str) -> (String, oneshot::Receiver<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (head_tx, head_rx) = oneshot::channel();

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 1024];
            loop {
                let n = socket.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                request.extend_from_slice(&buf[..n]);
                if request.windows(4).any(|w| w == b"\r\n\r\n") {
                    break;
                }
            }
            let _ = head_tx.send(String::from_utf8_lossy(&request).into_owned());

            let response = format!(
                "HTTP/1.1 {status_line}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                body.len()
            );
            socket.write_all(response.as_bytes()).await.unwrap();
            let _ = socket.shutdown().await;
        });

        (format!("http://{addr}"), head_rx)
    }

    #[tokio::test]
    async fn load_participants_sends_get_with_bearer_token() {
        let (url, head) = serve_once(
            "200 OK",
            r#"{"success":true,"data":[{"user_id":"a","display_name":"Ada","score":2}]}"#,
        )
        .await;
        let directory = HttpSessionDirectory::new(format!("{url}/")).with_bearer_token("tok");

        let participants = directory.load_participants(5).await.unwrap();
        assert_eq!(participants.len(), 1);

        let head = head.await.unwrap().to_lowercase();
        assert!(head.starts_with("get /sessions/5/participants http/1.1"));
        assert!(head.contains("authorization: bearer tok"));
    }

    #[tokio::test]
    async fn load_session_decodes_record() {
        let (url, _head) = serve_once(
            "200 OK",
            r#"{"success":true,"data":{"session":{"session_id":5,"status":"finished","total_questions":4}}}"#,
        )
        .await;
        let session = HttpSessionDirectory::new(url)
            .with_client(Client::builder().build().unwrap())
            .load_session(5)
            .await
            .unwrap();
        assert_eq!(session.status, SessionStatus::Finished);
    }

    #[tokio::test]
    async fn start_session_posts_to_start_endpoint() {
        let (url, head) = serve_once("200 OK", r#"{"success":true}"#).await;
        HttpSessionDirectory::new(url).start_session(5).await.unwrap();
        assert!(head.await.unwrap().starts_with("POST /sessions/5/start "));
    }

    #[tokio::test]
    async fn not_found_status_maps_to_session_not_found() {
        let (url, _head) = serve_once("404 Not Found", "").await;
        let err = HttpSessionDirectory::new(url).load_session(5).await.unwrap_err();
        assert!(matches!(err, LiveQuizError::SessionNotFound(5)));
    }

    #[tokio::test]
    async fn error_status_with_failure_envelope_keeps_code() {
        let (url, _head) = serve_once(
            "409 Conflict",
            r#"{"success":false,"message":"already running","code":"SESSION_ALREADY_STARTED"}"#,
        )
        .await;
        let err = HttpSessionDirectory::new(url).start_session(5).await.unwrap_err();
        match err {
            LiveQuizError::Directory { error_code, .. } => {
                assert_eq!(error_code, Some(ErrorCode::SessionAlreadyStarted));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn error_status_without_envelope_is_unavailable() {
        let (url, _head) = serve_once("503 Service Unavailable", "<html>down</html>").await;
        let err = HttpSessionDirectory::new(url)
            .reshuffle_questions(5)
            .await
            .unwrap_err();
        assert!(matches!(err, LiveQuizError::DirectoryUnavailable(_)));
    }

    #[tokio::test]
    async fn slow_directory_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (_socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let err = HttpSessionDirectory::new(format!("http://{addr}"))
            .with_timeout(Duration::from_millis(100))
            .load_participants(5)
            .await
            .unwrap_err();
        assert!(matches!(err, LiveQuizError::Timeout));
    }

    #[test]
    fn base_url_trailing_slash_is_trimmed() {
        let directory = HttpSessionDirectory::new("http://localhost:8080/api/");
        assert_eq!(directory.base_url(), "http://localhost:8080/api");
        assert_eq!(
            directory.url(3, "/start"),
            "http://localhost:8080/api/sessions/3/start"
        );
    }
}

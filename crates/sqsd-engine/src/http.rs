//! Outbound HTTP connection used by the dispatcher.
//!
//! Each connection owns its own `reqwest::Client` holding at most one idle
//! socket, so a pool of N connections keeps N sockets to the application.

use reqwest::header::HeaderMap;
use reqwest::Client;
use std::error::Error as StdError;
use std::io;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use crate::error::EngineError;
use crate::pool::ConnectionFailure;

#[derive(Debug, Clone, Copy)]
pub struct HttpSettings {
    pub connect_timeout: Duration,
    /// Applied to the whole request, including waiting for the response.
    pub inactivity_timeout: Duration,
    pub keepalive: bool,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HttpError {
    /// The peer closed the connection before a response arrived.
    #[error("Connection closed by peer: {0}")]
    ConnectionClosed(String),

    #[error("Request timed out")]
    Timeout,

    #[error("Connection error: {0}")]
    Connect(String),

    #[error("Request failed: {0}")]
    Other(String),

    #[error("Connection setup failed: {0}")]
    Setup(String),
}

impl HttpError {
    fn classify(err: reqwest::Error) -> Self {
        if closed_by_peer(&err) {
            HttpError::ConnectionClosed(err.to_string())
        } else if err.is_timeout() {
            HttpError::Timeout
        } else if err.is_connect() {
            HttpError::Connect(err.to_string())
        } else {
            HttpError::Other(err.to_string())
        }
    }
}

impl ConnectionFailure for HttpError {
    fn discards_connection(&self) -> bool {
        !matches!(self, HttpError::Setup(_))
    }
}

impl From<EngineError> for HttpError {
    fn from(err: EngineError) -> Self {
        HttpError::Setup(err.to_string())
    }
}

/// Walk the source chain looking for an early close of the socket.
fn closed_by_peer(err: &reqwest::Error) -> bool {
    let mut source: Option<&(dyn StdError + 'static)> = err.source();
    while let Some(cause) = source {
        if let Some(hyper_err) = cause.downcast_ref::<hyper::Error>() {
            if hyper_err.is_incomplete_message() {
                return true;
            }
        }
        if let Some(io_err) = cause.downcast_ref::<io::Error>() {
            if matches!(
                io_err.kind(),
                io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::BrokenPipe
                    | io::ErrorKind::UnexpectedEof
            ) {
                return true;
            }
        }
        source = cause.source();
    }
    false
}

pub struct HttpConnection {
    client: Client,
}

impl HttpConnection {
    pub fn new(settings: &HttpSettings) -> Result<Self, EngineError> {
        let client = Client::builder()
            .connect_timeout(settings.connect_timeout)
            .timeout(settings.inactivity_timeout)
            .pool_max_idle_per_host(if settings.keepalive { 1 } else { 0 })
            .http1_only()
            .build()?;
        Ok(Self { client })
    }

    /// POST `body` and return the response status. The response body is read
    /// and discarded so the socket can be reused.
    pub async fn post(&self, url: &str, headers: HeaderMap, body: String) -> Result<u16, HttpError> {
        let response = self
            .client
            .post(url)
            .headers(headers)
            .body(body)
            .send()
            .await
            .map_err(HttpError::classify)?;

        let status = response.status().as_u16();
        if let Err(e) = response.bytes().await {
            debug!(status, error = %e, "Failed to read response body");
        }
        Ok(status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_setup_errors_keep_connection() {
        assert!(!HttpError::Setup("x".into()).discards_connection());
        assert!(HttpError::Timeout.discards_connection());
        assert!(HttpError::ConnectionClosed("eof".into()).discards_connection());
    }

    #[test]
    fn test_connection_builds() {
        let settings = HttpSettings {
            connect_timeout: Duration::from_secs(1),
            inactivity_timeout: Duration::from_secs(5),
            keepalive: false,
        };
        assert!(HttpConnection::new(&settings).is_ok());
    }
}

//! Transport error types.

use thiserror::Error;

/// Failure of a single fetch attempt against the NTAS endpoint.
#[derive(Debug, Error)]
pub enum TransportError {
    /// No response within the per-attempt timeout.
    #[error("request timed out")]
    Timeout,

    /// The endpoint answered with a non-success status code.
    #[error("HTTP status {0}")]
    Status(u16),

    /// Connection, TLS or other network-level failure.
    #[error("network error: {0}")]
    Network(#[source] reqwest::Error),

    /// The body could not be read as JSON.
    #[error("invalid response body: {0}")]
    Decode(String),

    /// The configured base URL cannot be used.
    #[error("invalid endpoint URL '{0}'")]
    InvalidUrl(String),
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            TransportError::Timeout
        } else if err.is_decode() {
            TransportError::Decode(err.to_string())
        } else if let Some(status) = err.status() {
            TransportError::Status(status.as_u16())
        } else {
            TransportError::Network(err)
        }
    }
}

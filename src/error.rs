//! # Feed Error Types
//!
//! Shared error enum for the feed managers. Drivers never bubble these out of
//! the public API surface; they are recorded on the feed snapshot and handed
//! to the error callbacks instead.

use std::time::Duration;
use thiserror::Error;

/// Errors raised inside a feed driver.
#[derive(Debug, Error)]
pub enum FeedError {
    /// The endpoint string failed URL validation.
    #[error("Invalid endpoint: {0}")]
    InvalidEndpoint(#[from] url::ParseError),

    /// A target provider declined to produce an endpoint.
    #[error("Endpoint resolution failed: {0}")]
    ResolveFailed(String),

    /// WebSocket handshake or transport failure.
    #[error("WebSocket error: {0}")]
    Socket(#[from] tokio_tungstenite::tungstenite::Error),

    /// A configured header value could not be encoded.
    #[error("Invalid header value: {0}")]
    InvalidHeader(#[from] http::header::InvalidHeaderValue),

    /// HTTP request failure (event stream or polling transport).
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The server answered with a non-success status code.
    #[error("HTTP status {0}")]
    Status(u16),

    /// Payload serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    /// No matching heartbeat response arrived within the deadline.
    #[error("Heartbeat timed out after {0:?}")]
    HeartbeatTimeout(Duration),

    /// The reconnect budget was spent without reaching a healthy channel.
    #[error("Retry budget exhausted after {0} attempts")]
    RetriesExhausted(u32),
}

/// Outcome of a fire-and-forget send attempt.
///
/// A message is handed to the transport at most once and never queued; when
/// the channel is not open the payload is dropped and `NotReady` is returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// The payload was handed to the transport.
    Sent,
    /// The channel was not open; the payload was dropped.
    NotReady,
}

impl SendOutcome {
    /// True when the payload was accepted by the transport.
    pub fn is_sent(&self) -> bool {
        matches!(self, SendOutcome::Sent)
    }
}

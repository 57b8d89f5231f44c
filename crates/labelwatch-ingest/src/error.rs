//! Error types for the labeling pipeline.

use std::time::Duration;

use labelwatch_core::EventKey;
use thiserror::Error;

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while ingesting, deciding, or emitting labels.
#[derive(Error, Debug)]
pub enum Error {
    /// Error from the core types.
    #[error(transparent)]
    Core(#[from] labelwatch_core::Error),

    /// SQLite error.
    #[error("Database error: {0}")]
    Database(String),

    /// HTTP client error.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// WebSocket transport error.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error.
    #[error("JSON error: {0}")]
    Json(String),

    /// No frame arrived within the stall timeout.
    #[error("stream stalled: no events for {silent_for:?}")]
    StreamStalled {
        /// How long the stream had been silent when the stall was detected.
        silent_for: Duration,
    },

    /// The transport closed the subscription.
    #[error("stream closed by remote")]
    StreamClosed,

    /// The upstream sent an error frame.
    #[error("upstream error {error}: {message}")]
    Upstream {
        /// Error name (e.g. `FutureCursor`, `ConsumerTooSlow`).
        error: String,
        /// Optional human-readable message.
        message: String,
    },

    /// A frame could not be decoded.
    #[error("Decode error: {0}")]
    Decode(String),

    /// Commit processing exceeded its time budget.
    #[error("processing commit {key} timed out after {after:?}")]
    ProcessCommitTimeout {
        /// The event that timed out.
        key: EventKey,
        /// The timeout that was exceeded.
        after: Duration,
    },

    /// A cached lookup did not resolve in time.
    #[error("lookup timed out: {0}")]
    LookupTimeout(String),

    /// A commit task ended without a result (panicked or was cancelled).
    #[error("commit task aborted: {0}")]
    TaskAborted(String),

    /// A rate limiter could not grant a slot within its maximum delay.
    #[error("Rate limited: {0}")]
    RateLimited(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Authentication against the moderation service failed.
    #[error("Authentication error: {0}")]
    Auth(String),

    /// Unexpected HTTP status from an upstream API.
    #[error("HTTP {status} from {url}")]
    Status {
        /// Status code.
        status: u16,
        /// Request URL without query parameters.
        url: String,
    },

    /// Channel send error.
    #[error("Channel send error: {0}")]
    ChannelSend(String),
}

impl Error {
    /// Whether this error ends the current firehose session but not the process.
    pub fn is_session_error(&self) -> bool {
        self.session_reason().is_some()
    }

    /// Short reason label for a session error, used on reconnect metrics.
    pub fn session_reason(&self) -> Option<&'static str> {
        match self {
            Self::StreamStalled { .. } => Some("stall"),
            Self::StreamClosed => Some("closed"),
            Self::Upstream { .. } => Some("upstream"),
            Self::WebSocket(_) | Self::Io(_) => Some("transport"),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Json(e.to_string())
    }
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        Self::Database(e.to_string())
    }
}

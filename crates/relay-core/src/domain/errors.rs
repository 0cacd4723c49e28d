//! Errors - エラー型と分類
//!
//! Every failure that can end a unit of work maps onto an [`ErrorKind`], so
//! outer layers can pick status codes without knowing the concrete type.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::ConfigError;

/// ErrorKind は失敗の運用分類
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    Transport,
    Timeout,
    RateLimited,
    InvalidInput,
    Unavailable,
    /// A pipeline stage chose to drop the envelope (not a failure).
    Rejected,
    NotFound,
    Configuration,
}

/// Failure of a Cognitive Processor call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProcessingError {
    #[error("processor timed out: {0}")]
    Timeout(String),

    #[error("processor rate limited: {message}")]
    RateLimited {
        message: String,
        /// Server-suggested wait, if any. Overrides the backoff curve.
        retry_after: Option<Duration>,
    },

    #[error("invalid processor input: {0}")]
    InvalidInput(String),

    #[error("processor unavailable: {0}")]
    Unavailable(String),
}

impl ProcessingError {
    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self::RateLimited {
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::RateLimited { .. } => ErrorKind::RateLimited,
            Self::InvalidInput(_) => ErrorKind::InvalidInput,
            Self::Unavailable(_) => ErrorKind::Unavailable,
        }
    }

    /// Only rate limiting is retried locally; everything else surfaces at once.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::RateLimited { .. })
    }
}

/// Failure talking to the message transport.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("channel unavailable: {0}")]
    ChannelUnavailable(String),

    #[error("send to channel={channel} failed: {message}")]
    SendFailed { channel: String, message: String },

    #[error("receive from channel={channel} failed: {message}")]
    ReceiveFailed { channel: String, message: String },

    #[error("delivery {0} is not in flight")]
    UnknownDelivery(u64),

    #[error("malformed message body: {0}")]
    Codec(String),
}

/// Crate-level error.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Processing(#[from] ProcessingError),

    #[error("{what} not found: {id}")]
    NotFound { what: &'static str, id: String },

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The caller's own wait expired; the underlying work keeps running.
    #[error("timed out after {0:?}")]
    Timeout(Duration),
}

impl RelayError {
    pub fn not_found(what: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            what,
            id: id.to_string(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Transport(_) => ErrorKind::Transport,
            Self::Processing(e) => e.kind(),
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::Configuration(_) | Self::Config(_) => ErrorKind::Configuration,
            Self::Timeout(_) => ErrorKind::Timeout,
        }
    }
}

/// Human-readable reason plus originating kind, attached to every terminal
/// failure (dead letters, command records, pipeline notes, subscriber results).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureReason {
    pub kind: ErrorKind,
    pub message: String,
}

impl FailureReason {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

impl From<&ProcessingError> for FailureReason {
    fn from(err: &ProcessingError) -> Self {
        Self::new(err.kind(), err.to_string())
    }
}

impl From<&TransportError> for FailureReason {
    fn from(err: &TransportError) -> Self {
        Self::new(ErrorKind::Transport, err.to_string())
    }
}

impl From<&RelayError> for FailureReason {
    fn from(err: &RelayError) -> Self {
        Self::new(err.kind(), err.to_string())
    }
}

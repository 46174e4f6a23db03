use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::ServerError;

/// Broad error category used for reconnect classification and user-facing handling.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Invalid input, unsupported state, or other configuration issue.
    Config,
    /// Authentication/authorization failure (expired token, revoked session).
    Auth,
    /// Transient network or transport failure.
    Network,
    /// Rate-limited by the chat service.
    RateLimited,
    /// Serialization/deserialization failure.
    Serialization,
    /// Server refused the session for a non-auth reason (for example a deactivated account).
    Server,
    /// Internal bug or invariant break.
    Internal,
}

/// Stable error payload carried by `Connection::Disconnected` and request results.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Error)]
#[error("{category:?}:{code}: {message}")]
pub struct SessionError {
    /// High-level error category.
    pub category: ErrorCategory,
    /// Stable machine-readable error code.
    pub code: String,
    /// Human-readable message.
    pub message: String,
    /// Optional retry hint in milliseconds.
    pub retry_after_ms: Option<u64>,
}

impl SessionError {
    /// Construct a new session error.
    pub fn new(category: ErrorCategory, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            category,
            code: code.into(),
            message: message.into(),
            retry_after_ms: None,
        }
    }

    /// Attach a retry hint to the error.
    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after_ms = Some(retry_after.as_millis() as u64);
        self
    }

    /// Transient transport failure (socket drop, handshake timeout).
    pub fn transport(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Network, "transport_error", message)
    }

    /// Returned when a request is submitted while the session is not connected.
    pub fn not_connected(action: impl Into<String>) -> Self {
        let action = action.into();
        Self::new(
            ErrorCategory::Config,
            "not_connected",
            format!("cannot run '{action}' while the session is not connected"),
        )
    }

    /// Whether a disconnection caused by this error should trigger a reconnect.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.category,
            ErrorCategory::Network | ErrorCategory::RateLimited
        )
    }
}

impl From<ServerError> for SessionError {
    fn from(err: ServerError) -> Self {
        let category = match err.status_code {
            Some(status) => classify_http_status(status),
            None => ErrorCategory::Server,
        };
        Self::new(category, format!("server_error_{}", err.code), err.message)
    }
}

/// Map HTTP status codes to error categories.
pub fn classify_http_status(status: u16) -> ErrorCategory {
    match status {
        401 | 403 => ErrorCategory::Auth,
        408 | 429 => ErrorCategory::RateLimited,
        400..=499 => ErrorCategory::Config,
        500..=599 => ErrorCategory::Network,
        _ => ErrorCategory::Internal,
    }
}

//! Error taxonomy shared across the gateway.
//!
//! Configuration problems are fatal at startup, connection problems are
//! absorbed by the supervisor, and delivery problems always reach the caller
//! through a resolved ticket.

use std::fmt;
use thiserror::Error;

/// A single problem found while validating settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigIssue {
    /// The setting key the issue refers to.
    pub key: &'static str,
    /// Human-readable description.
    pub message: String,
}

impl ConfigIssue {
    pub fn new(key: &'static str, message: impl Into<String>) -> Self {
        Self {
            key,
            message: message.into(),
        }
    }
}

impl fmt::Display for ConfigIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.key, self.message)
    }
}

/// Settings are missing or malformed. Raised before any network activity.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// One or more settings failed validation.
    #[error("Mattermost configuration validation failed:\n{}", format_issues(.0))]
    Invalid(Vec<ConfigIssue>),

    /// A settings file could not be read or parsed.
    #[error("Settings file error: {0}")]
    File(String),
}

impl ConfigError {
    /// Issues carried by this error (empty for non-validation variants).
    pub fn issues(&self) -> &[ConfigIssue] {
        match self {
            Self::Invalid(issues) => issues,
            _ => &[],
        }
    }

    /// Whether any issue refers to `key`.
    pub fn mentions(&self, key: &str) -> bool {
        match self {
            Self::Invalid(issues) => issues.iter().any(|i| i.key == key),
            Self::File(_) => false,
        }
    }
}

fn format_issues(issues: &[ConfigIssue]) -> String {
    issues
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("\n")
}

/// A single call against the chat backend failed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    /// The request never completed (DNS, TCP, TLS, reset, closed socket).
    #[error("Transport error: {0}")]
    Transport(String),

    /// The request did not complete within the configured timeout.
    #[error("Request timed out")]
    Timeout,

    /// The server answered with a non-success status.
    #[error("Server returned {status}: {message}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Server-provided message (or raw body).
        message: String,
    },

    /// The response could not be decoded.
    #[error("Protocol error: {0}")]
    Protocol(String),
}

impl BackendError {
    /// Whether retrying the same request may succeed.
    ///
    /// Transport failures, timeouts, 408, 429 and 5xx are transient. Every
    /// other status (bad target, auth rejection, validation) is permanent.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transport(_) | Self::Timeout => true,
            Self::Status { status, .. } => *status == 408 || *status == 429 || *status >= 500,
            Self::Protocol(_) => false,
        }
    }

    /// Whether the server rejected our credentials.
    pub fn is_auth_rejection(&self) -> bool {
        matches!(self, Self::Status { status: 401 | 403, .. })
    }
}

/// Establishing the connection pair failed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectError {
    /// The REST or event-stream transport failed.
    #[error("Connection failed: {0}")]
    Transport(String),

    /// The server rejected the token.
    #[error("Authentication rejected: {0}")]
    Unauthorized(String),

    /// The configured team could not be found among the bot's teams.
    #[error("Team not found: {0}")]
    TeamNotFound(String),

    /// The supervisor was shut down while the caller was waiting.
    #[error("Connection supervisor shut down")]
    Shutdown,
}

impl From<BackendError> for ConnectError {
    fn from(err: BackendError) -> Self {
        if err.is_auth_rejection() {
            Self::Unauthorized(err.to_string())
        } else {
            Self::Transport(err.to_string())
        }
    }
}

/// Terminal failure of a single outbound message.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeliveryError {
    /// The backend refused the message; it was not retried.
    #[error("Delivery rejected: {reason}")]
    Rejected {
        /// Why the backend refused it.
        reason: String,
    },

    /// Every allowed attempt failed with a transient error.
    #[error("Delivery failed after {attempts} attempts: {last_error}")]
    Exhausted {
        /// Attempts made.
        attempts: u32,
        /// The error of the final attempt.
        last_error: String,
    },

    /// The gateway shut down before the message was acknowledged.
    #[error("Delivery cancelled")]
    Cancelled,
}

impl DeliveryError {
    pub fn rejected(reason: impl Into<String>) -> Self {
        Self::Rejected {
            reason: reason.into(),
        }
    }
}

/// Alias for Result with DeliveryError.
pub type DeliveryResult<T> = Result<T, DeliveryError>;

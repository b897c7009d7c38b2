//! Error types for the AMI client and the telephony services built on it

use serde::Serialize;
use std::fmt;
use thiserror::Error;

/// Result alias used throughout the crate.
pub type AmiResult<T> = Result<T, AmiError>;

/// Errors surfaced by the manager-protocol client.
///
/// Connection failures are handled by the reconnect loop; callers only see
/// them as the failure of whatever request was in flight.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum AmiError {
    /// Socket-level failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The connection dropped while the request was outstanding.
    #[error("connection lost")]
    ConnectionLost,

    /// No ready connection to send on.
    #[error("not connected")]
    NotConnected,

    /// Login rejected (or unanswered). Not retried.
    #[error("authentication failed: {message}")]
    AuthenticationFailed { message: String },

    /// No resolution within the request deadline.
    #[error("action timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    /// Malformed or unexpected wire data.
    #[error("protocol error: {message}")]
    Protocol { message: String },

    /// The exchange answered `Response: Error`; `message` is its `Message` field verbatim.
    #[error("action rejected: {message}")]
    ActionRejected { message: String },

    /// Caller input failed format validation.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// Unusable connection options.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// One or more events were dropped because the stream consumer fell behind.
    #[error("event queue full, events dropped")]
    QueueFull,
}

impl AmiError {
    pub(crate) fn protocol_error(message: impl Into<String>) -> Self {
        AmiError::Protocol {
            message: message.into(),
        }
    }

    pub(crate) fn auth_failed(message: impl Into<String>) -> Self {
        AmiError::AuthenticationFailed {
            message: message.into(),
        }
    }

    pub(crate) fn rejected(message: impl Into<String>) -> Self {
        AmiError::ActionRejected {
            message: message.into(),
        }
    }

    /// Taxonomy bucket for this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            AmiError::Io(_) | AmiError::ConnectionLost | AmiError::NotConnected => {
                ErrorKind::Connection
            }
            AmiError::AuthenticationFailed { .. } => ErrorKind::Authentication,
            AmiError::Timeout { .. } => ErrorKind::RequestTimeout,
            AmiError::Protocol { .. } | AmiError::QueueFull => ErrorKind::Protocol,
            AmiError::ActionRejected { .. } => ErrorKind::ActionRejected,
            AmiError::Validation(_) => ErrorKind::Validation,
            AmiError::InvalidConfig(_) => ErrorKind::Configuration,
        }
    }

    /// `true` for failures caused by the socket rather than the request.
    pub fn is_connection_error(&self) -> bool {
        self.kind() == ErrorKind::Connection
    }

    /// Structured `{kind, message}` object for presentation layers.
    pub fn report(&self) -> ErrorReport {
        let message = match self {
            AmiError::ActionRejected { message } => message.clone(),
            AmiError::Validation(v) => v.to_string(),
            other => other.to_string(),
        };
        ErrorReport {
            kind: self.kind(),
            message,
        }
    }
}

/// Error categories exposed to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub enum ErrorKind {
    Connection,
    Authentication,
    RequestTimeout,
    Protocol,
    ActionRejected,
    Validation,
    Configuration,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Connection => "connection",
            ErrorKind::Authentication => "authentication",
            ErrorKind::RequestTimeout => "requestTimeout",
            ErrorKind::Protocol => "protocol",
            ErrorKind::ActionRejected => "actionRejected",
            ErrorKind::Validation => "validation",
            ErrorKind::Configuration => "configuration",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Serializable error summary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorReport {
    pub kind: ErrorKind,
    pub message: String,
}

/// Why an input string was rejected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "camelCase")]
#[non_exhaustive]
pub enum ValidationErrorKind {
    Empty,
    TooLong { max: usize },
    InvalidCharacter { character: char },
    /// No dial rule matched.
    Unmatched,
    /// Matched a rule that classifies the number as not dialable.
    Blocked { rule: String },
}

/// Input rejected by format validation. Returned as a value, never panics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationError {
    pub field: &'static str,
    pub input: String,
    #[serde(flatten)]
    pub kind: ValidationErrorKind,
}

impl ValidationError {
    pub(crate) fn new(field: &'static str, input: &str, kind: ValidationErrorKind) -> Self {
        Self {
            field,
            input: input.to_string(),
            kind,
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            ValidationErrorKind::Empty => write!(f, "{} must not be empty", self.field),
            ValidationErrorKind::TooLong { max } => {
                write!(f, "{} exceeds {} characters", self.field, max)
            }
            ValidationErrorKind::InvalidCharacter { character } => write!(
                f,
                "{} contains invalid character {:?}",
                self.field, character
            ),
            ValidationErrorKind::Unmatched => {
                write!(f, "'{}' does not match any dial rule", self.input)
            }
            ValidationErrorKind::Blocked { rule } => {
                write!(f, "'{}' is blocked by dial rule '{}'", self.input, rule)
            }
        }
    }
}

impl std::error::Error for ValidationError {}

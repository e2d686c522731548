// Error taxonomy for the delivery pipeline

use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ChatError {
    /// Rejected locally before any network call
    #[error("invalid message: {0}")]
    Validation(String),

    /// Transport-level failure talking to the API
    #[error("network error: {0}")]
    Network(String),

    /// The API answered with a non-success status
    #[error("server returned {status}: {message}")]
    Server { status: u16, message: String },

    /// Payload could not be decoded
    #[error("malformed payload: {0}")]
    Parse(String),

    /// Event stream could not be (re)established
    #[error("connection error: {0}")]
    Connection(String),

    /// Offline queue is at capacity
    #[error("offline queue is full ({capacity} messages)")]
    QueueFull { capacity: usize },

    /// Local persistence failed
    #[error("storage error: {0}")]
    Storage(String),

    #[error("message not found: {0}")]
    NotFound(String),
}

impl ChatError {
    /// Stable machine-readable code surfaced to callers
    pub fn code(&self) -> &'static str {
        match self {
            ChatError::Validation(_) => "VALIDATION_ERROR",
            ChatError::Network(_) => "NETWORK_ERROR",
            ChatError::Server { .. } => "SERVER_ERROR",
            ChatError::Parse(_) => "PARSE_ERROR",
            ChatError::Connection(_) => "CONNECTION_ERROR",
            ChatError::QueueFull { .. } => "QUEUE_FULL",
            ChatError::Storage(_) => "STORAGE_ERROR",
            ChatError::NotFound(_) => "NOT_FOUND",
        }
    }

    /// Whether retrying the same request could succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            ChatError::Network(_) | ChatError::Connection(_) => true,
            ChatError::Server { status, .. } => *status >= 500 || *status == 429,
            _ => false,
        }
    }
}

impl From<serde_json::Error> for ChatError {
    fn from(e: serde_json::Error) -> Self {
        ChatError::Parse(e.to_string())
    }
}

impl From<rusqlite::Error> for ChatError {
    fn from(e: rusqlite::Error) -> Self {
        ChatError::Storage(e.to_string())
    }
}

impl From<reqwest::Error> for ChatError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            ChatError::Parse(e.to_string())
        } else if let Some(status) = e.status() {
            ChatError::Server {
                status: status.as_u16(),
                message: e.to_string(),
            }
        } else {
            ChatError::Network(e.to_string())
        }
    }
}

/// The `{message, code}` shape handed back from send and retry
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SendFailure {
    pub message: String,
    pub code: String,
}

impl From<&ChatError> for SendFailure {
    fn from(e: &ChatError) -> Self {
        SendFailure {
            message: e.to_string(),
            code: e.code().to_string(),
        }
    }
}

impl From<ChatError> for SendFailure {
    fn from(e: ChatError) -> Self {
        SendFailure::from(&e)
    }
}

impl std::fmt::Display for SendFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.message, self.code)
    }
}

impl std::error::Error for SendFailure {}

pub type Result<T> = std::result::Result<T, ChatError>;

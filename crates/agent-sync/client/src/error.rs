//! Client error types.

use agent_sync_core::{DecisionRejected, MessageRejected, SnapshotError};
use reqwest::StatusCode;
use thiserror::Error;

/// Client error type.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("WebSocket error: {0}")]
    WebSocket(String),

    #[error("connection error: {0}")]
    Connection(String),

    #[error("invalid URL: {0}")]
    InvalidUrl(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("URL parse error: {0}")]
    UrlParse(#[from] url::ParseError),

    #[error("http {status}: {body}")]
    Http { status: StatusCode, body: String },

    #[error("request failed: {0}")]
    Request(String),

    #[error("timeout error: {0}")]
    Timeout(String),

    #[error("decode error: {0}")]
    Decode(String),

    #[error("invalid snapshot: {0}")]
    Snapshot(#[from] SnapshotError),

    #[error("not connected")]
    NotConnected,

    #[error("config error: {0}")]
    Config(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ClientError {
    /// Transport failures, timeouts and server errors are worth retrying.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::WebSocket(_) | Self::Connection(_) | Self::Request(_) | Self::Timeout(_) => true,
            Self::Http { status, .. } => status.is_server_error(),
            _ => false,
        }
    }
}

/// Why an action was refused before any request was made.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Precondition {
    #[error(transparent)]
    Message(#[from] MessageRejected),

    #[error(transparent)]
    Decision(#[from] DecisionRejected),
}

/// User action failure.
#[derive(Debug, Error)]
pub enum ActionError {
    #[error("precondition failed: {0}")]
    Precondition(#[from] Precondition),

    #[error("action failed: {0}")]
    Failed(#[from] ClientError),
}

impl From<MessageRejected> for ActionError {
    fn from(value: MessageRejected) -> Self {
        Self::Precondition(value.into())
    }
}

impl From<DecisionRejected> for ActionError {
    fn from(value: DecisionRejected) -> Self {
        Self::Precondition(value.into())
    }
}

/// Client result type.
pub type Result<T> = std::result::Result<T, ClientError>;

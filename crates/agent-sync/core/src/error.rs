//! Core error types.

use thiserror::Error;

use crate::decision::DecisionPhase;

/// Failure to turn a wire payload into a typed snapshot or frame.
#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("decode error: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("protocol error: {0}")]
    Protocol(String),
}

/// A decision was submitted while the workflow was not waiting for one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("decision rejected: phase is {}", .phase.as_str())]
pub struct DecisionRejected {
    pub phase: DecisionPhase,
}

/// A free-form message could not be sent in the current view state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum MessageRejected {
    #[error("message is empty")]
    Empty,

    #[error("a request is already processing")]
    Processing,

    #[error("a decision is pending")]
    DecisionPending,

    #[error("not connected")]
    NotConnected,
}

/// Core result type.
pub type Result<T> = std::result::Result<T, SnapshotError>;

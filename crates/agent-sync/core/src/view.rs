//! Read-only projection handed to consumers.

use serde::{Deserialize, Serialize};

use crate::snapshot::PipelineFields;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisplayRole {
    User,
    Agent,
    System,
}

impl DisplayRole {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Agent => "agent",
            Self::System => "system",
        }
    }
}

/// One transcript row as shown to the user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisplayMessage {
    pub id: String,
    pub content: String,
    pub sender: String,
    /// ISO-8601 UTC with millisecond precision.
    pub timestamp: String,
    pub role: DisplayRole,
}

/// Connection status as seen by the view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Connecting,
    Connected,
    #[default]
    Disconnected,
    Offline,
}

impl ConnectionState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::Offline => "offline",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ViewState {
    pub transcript: Vec<DisplayMessage>,
    pub last_message_id: Option<String>,
    pub is_processing: bool,
    pub needs_decision: bool,
    pub is_processing_decision: bool,
    pub current_agent: Option<String>,
    pub connection_state: ConnectionState,
    pub state_version: u64,
    pub pipeline: PipelineFields,
}

impl ViewState {
    /// Whether a free-form message may be sent right now.
    #[must_use]
    pub fn can_send_message(&self) -> bool {
        !self.is_processing
            && !self.needs_decision
            && self.connection_state == ConnectionState::Connected
    }

    #[must_use]
    pub fn last_message(&self) -> Option<&DisplayMessage> {
        self.transcript.last()
    }

    #[must_use]
    pub fn message_count(&self) -> usize {
        self.transcript.len()
    }
}

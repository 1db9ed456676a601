//! Length-based transcript reconciliation.
//!
//! The backend transcript is append-only, so a longer snapshot carries new
//! entries at its tail and an equal-length snapshot can only have edited its
//! final entry. Shorter snapshots are stale and never shrink the local view.

use std::collections::HashSet;

use tracing::{debug, warn};

use crate::clock::{Clock, format_timestamp};
use crate::snapshot::{BackendMessage, BackendRole};
use crate::view::{DisplayMessage, DisplayRole};

/// What a reconciliation pass did to the transcript.
#[derive(Debug, Clone, PartialEq, Eq)]
#[must_use]
pub enum TranscriptChange {
    Appended { count: usize, last_id: String },
    LastEdited { id: String },
    Unchanged,
    ShorterSnapshot { current: usize, incoming: usize },
}

impl TranscriptChange {
    #[must_use]
    pub fn is_modified(&self) -> bool {
        matches!(self, Self::Appended { .. } | Self::LastEdited { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reconciled {
    pub transcript: Vec<DisplayMessage>,
    pub change: TranscriptChange,
}

/// Convert one backend entry into a fresh display row.
pub fn display_message(message: &BackendMessage, clock: &dyn Clock) -> DisplayMessage {
    let role = display_role(message.role);
    DisplayMessage {
        id: clock.new_id(),
        content: message.content.clone(),
        sender: display_sender(&message.sender, role),
        timestamp: format_timestamp(clock.now()),
        role,
    }
}

fn display_role(role: BackendRole) -> DisplayRole {
    match role {
        BackendRole::Human => DisplayRole::User,
        BackendRole::Assistant => DisplayRole::Agent,
    }
}

fn display_sender(sender: &str, role: DisplayRole) -> String {
    if !sender.trim().is_empty() {
        return sender.to_string();
    }
    match role {
        DisplayRole::User => "User".to_string(),
        _ => "Assistant".to_string(),
    }
}

/// Build a locally originated row (optimistic user entry or system notice).
pub fn local_message(
    content: impl Into<String>,
    sender: impl Into<String>,
    role: DisplayRole,
    clock: &dyn Clock,
) -> DisplayMessage {
    DisplayMessage {
        id: clock.new_id(),
        content: content.into(),
        sender: sender.into(),
        timestamp: format_timestamp(clock.now()),
        role,
    }
}

/// Merge an incoming backend transcript into the current display transcript.
pub fn reconcile(
    current: &[DisplayMessage],
    incoming: &[BackendMessage],
    clock: &dyn Clock,
) -> Reconciled {
    let mut transcript = current.to_vec();

    if incoming.len() > current.len() {
        let tail = &incoming[current.len()..];
        transcript.extend(tail.iter().map(|message| display_message(message, clock)));
        let last_id = transcript
            .last()
            .map(|message| message.id.clone())
            .unwrap_or_default();
        debug!(count = tail.len(), last_id = %last_id, "appended transcript entries");
        return Reconciled {
            transcript,
            change: TranscriptChange::Appended {
                count: tail.len(),
                last_id,
            },
        };
    }

    if incoming.len() < current.len() {
        warn!(
            current = current.len(),
            incoming = incoming.len(),
            "ignoring shorter backend transcript"
        );
        return Reconciled {
            transcript,
            change: TranscriptChange::ShorterSnapshot {
                current: current.len(),
                incoming: incoming.len(),
            },
        };
    }

    let change = match (transcript.last_mut(), incoming.last()) {
        (Some(local), Some(remote)) if local.content != remote.content => {
            let role = display_role(remote.role);
            local.content.clone_from(&remote.content);
            local.sender = display_sender(&remote.sender, role);
            local.role = role;
            debug!(id = %local.id, "last transcript entry edited in place");
            TranscriptChange::LastEdited {
                id: local.id.clone(),
            }
        }
        _ => TranscriptChange::Unchanged,
    };
    Reconciled { transcript, change }
}

/// Drop entries repeating an earlier `(content, sender, role)` triple.
///
/// Returns the number of entries removed.
pub fn deduplicate(transcript: &mut Vec<DisplayMessage>) -> usize {
    let before = transcript.len();
    let mut seen = HashSet::new();
    transcript.retain(|message| {
        seen.insert((
            message.content.clone(),
            message.sender.clone(),
            message.role,
        ))
    });
    let removed = before - transcript.len();
    if removed > 0 {
        debug!(removed, "removed duplicate transcript entries");
    }
    removed
}

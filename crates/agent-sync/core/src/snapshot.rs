//! Backend state snapshot wire contract.
//!
//! A snapshot is the complete pipeline state the backend pushes after each
//! agent step. The transcript part is append-only on the server side; the
//! decision flag is authoritative for whether the workflow is paused.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::error::{Result, SnapshotError};

/// Sender value the backend uses while waiting on a human choice.
pub const HUMAN_CHOICE_SENDER: &str = "human_choice";
/// Sender value the backend uses while waiting on a human review.
pub const HUMAN_REVIEW_SENDER: &str = "human_review";
/// Agents whose completion ends the workflow run.
pub const FINAL_COMPLETION_AGENTS: [&str; 2] = ["report_agent", "quality_review_agent"];

/// Message author as reported by the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum BackendRole {
    Human,
    #[default]
    Assistant,
}

impl BackendRole {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Human => "human",
            Self::Assistant => "assistant",
        }
    }
}

impl From<String> for BackendRole {
    fn from(value: String) -> Self {
        if value.trim().eq_ignore_ascii_case("human") {
            Self::Human
        } else {
            Self::Assistant
        }
    }
}

impl From<BackendRole> for String {
    fn from(value: BackendRole) -> Self {
        value.as_str().to_string()
    }
}

/// One transcript entry inside a snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendMessage {
    #[serde(default, deserialize_with = "lenient_string")]
    pub content: String,
    #[serde(rename = "type", alias = "role", default)]
    pub role: BackendRole,
    #[serde(default, deserialize_with = "lenient_string")]
    pub sender: String,
}

impl BackendMessage {
    pub fn new(content: impl Into<String>, role: BackendRole, sender: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            role,
            sender: sender.into(),
        }
    }

    pub fn human(content: impl Into<String>) -> Self {
        Self::new(content, BackendRole::Human, "User")
    }

    pub fn assistant(content: impl Into<String>, sender: impl Into<String>) -> Self {
        Self::new(content, BackendRole::Assistant, sender)
    }
}

/// Pipeline stage fields carried for display only.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PipelineFields {
    #[serde(default, deserialize_with = "lenient_string")]
    pub hypothesis: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub process: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub process_decision: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub visualization_state: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub searcher_state: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub code_state: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub report_section: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub quality_review: String,
    #[serde(default, deserialize_with = "lenient_bool")]
    pub needs_revision: bool,
    /// Set by the backend when its background run failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Complete backend state at one point in time.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BackendStateSnapshot {
    #[serde(default)]
    pub messages: Vec<BackendMessage>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub sender: String,
    #[serde(default)]
    pub needs_decision: bool,
    #[serde(flatten)]
    pub pipeline: PipelineFields,
}

impl BackendStateSnapshot {
    /// True when the sender is one of the decision sentinels.
    #[must_use]
    pub fn is_decision_sender(&self) -> bool {
        is_decision_sender(&self.sender)
    }

    /// Sender trimmed, or `None` when empty.
    #[must_use]
    pub fn active_sender(&self) -> Option<&str> {
        let trimmed = self.sender.trim();
        (!trimmed.is_empty()).then_some(trimmed)
    }
}

#[must_use]
pub fn is_decision_sender(sender: &str) -> bool {
    matches!(sender.trim(), HUMAN_CHOICE_SENDER | HUMAN_REVIEW_SENDER)
}

#[must_use]
pub fn is_final_completion_agent(sender: &str) -> bool {
    FINAL_COMPLETION_AGENTS.contains(&sender.trim())
}

/// Parse a JSON text payload into a snapshot.
pub fn parse_snapshot(text: &str) -> Result<BackendStateSnapshot> {
    let value: Value = serde_json::from_str(text)?;
    parse_snapshot_value(value)
}

/// Validate and decode an already parsed JSON payload.
///
/// Some producers wrap the state as a JSON-encoded string; that form is
/// unwrapped once.
pub fn parse_snapshot_value(value: Value) -> Result<BackendStateSnapshot> {
    let value = match value {
        Value::String(text) => serde_json::from_str::<Value>(&text)?,
        other => other,
    };
    if !value.is_object() {
        return Err(SnapshotError::Protocol(
            "expected JSON object state snapshot".to_string(),
        ));
    }
    if let Some(messages) = value.get("messages")
        && !messages.is_array()
        && !messages.is_null()
    {
        return Err(SnapshotError::Protocol(
            "invalid snapshot messages: expected array".to_string(),
        ));
    }
    if let Some(flag) = value.get("needs_decision")
        && !flag.is_boolean()
        && !flag.is_null()
    {
        return Err(SnapshotError::Protocol(
            "invalid snapshot needs_decision: expected boolean".to_string(),
        ));
    }
    let value = strip_nulls(value);
    serde_json::from_value(value)
        .map_err(|error| SnapshotError::Protocol(format!("invalid snapshot payload: {error}")))
}

fn strip_nulls(value: Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.into_iter()
                .filter(|(key, value)| !(value.is_null() && key.as_str() != "error"))
                .collect(),
        ),
        other => other,
    }
}

fn lenient_string<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(match value {
        Value::Null => String::new(),
        Value::String(text) => text,
        Value::Bool(flag) => flag.to_string(),
        Value::Number(number) => number.to_string(),
        other => other.to_string(),
    })
}

fn lenient_bool<'de, D>(deserializer: D) -> std::result::Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(match value {
        Value::Bool(flag) => flag,
        Value::String(text) => matches!(text.trim().to_ascii_lowercase().as_str(), "true" | "1"),
        Value::Number(number) => number.as_i64().is_some_and(|n| n != 0),
        _ => false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_backend_state_with_wire_field_names() -> Result<()> {
        let snapshot = parse_snapshot(
            r#"{
                "messages": [
                    {"content": "hi", "type": "human", "sender": "User"},
                    {"content": "Pick one", "type": "assistant", "sender": "human_choice"}
                ],
                "needs_decision": true,
                "sender": "human_choice",
                "hypothesis": "h1",
                "needs_revision": false
            }"#,
        )?;

        assert_eq!(snapshot.messages.len(), 2);
        assert_eq!(snapshot.messages[0].role, BackendRole::Human);
        assert_eq!(snapshot.messages[1].role, BackendRole::Assistant);
        assert!(snapshot.needs_decision);
        assert!(snapshot.is_decision_sender());
        assert_eq!(snapshot.pipeline.hypothesis, "h1");
        Ok(())
    }

    #[test]
    fn missing_fields_default_to_empty_state() -> Result<()> {
        let snapshot = parse_snapshot("{}")?;
        assert!(snapshot.messages.is_empty());
        assert!(!snapshot.needs_decision);
        assert_eq!(snapshot.active_sender(), None);
        Ok(())
    }

    #[test]
    fn role_alias_and_null_sender_are_accepted() -> Result<()> {
        let snapshot = parse_snapshot_value(json!({
            "messages": [{"content": "hello", "role": "human", "sender": null}],
            "sender": null,
            "needs_decision": null,
            "process": 3
        }))?;
        assert_eq!(snapshot.messages[0].role, BackendRole::Human);
        assert_eq!(snapshot.messages[0].sender, "");
        assert_eq!(snapshot.pipeline.process, "3");
        Ok(())
    }

    #[test]
    fn string_encoded_state_is_unwrapped_once() -> Result<()> {
        let inner = json!({"messages": [], "needs_decision": true, "sender": "human_review"});
        let snapshot = parse_snapshot_value(Value::String(inner.to_string()))?;
        assert!(snapshot.needs_decision);
        assert!(snapshot.is_decision_sender());
        Ok(())
    }

    #[test]
    fn backend_error_field_is_preserved() -> Result<()> {
        let snapshot = parse_snapshot(r#"{"messages": [], "error": "agent crashed"}"#)?;
        assert_eq!(snapshot.pipeline.error.as_deref(), Some("agent crashed"));
        Ok(())
    }

    #[test]
    fn rejects_malformed_shapes() {
        let cases = [
            ("not json", "decode error"),
            ("[1, 2]", "expected JSON object"),
            (r#"{"messages": "nope"}"#, "invalid snapshot messages"),
            (r#"{"needs_decision": "yes"}"#, "invalid snapshot needs_decision"),
        ];

        for (input, fragment) in cases {
            let result = parse_snapshot(input);
            match result {
                Ok(snapshot) => panic!("expected error for {input}, got {snapshot:?}"),
                Err(error) => assert!(
                    error.to_string().contains(fragment),
                    "expected '{fragment}' in '{error}'"
                ),
            }
        }
    }

    #[test]
    fn sentinel_and_completion_senders_are_classified() {
        assert!(is_decision_sender("human_choice"));
        assert!(is_decision_sender(" human_review "));
        assert!(!is_decision_sender("hypothesis_agent"));
        assert!(is_final_completion_agent("report_agent"));
        assert!(!is_final_completion_agent("hypothesis_agent"));
    }
}

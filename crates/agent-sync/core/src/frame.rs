//! Push frame envelope decoding.
//!
//! Socket frames are JSON objects of the form
//! `{"id", "type", "data", "timestamp", "source"}`; only `type` is required.

use serde_json::{Value, json};

use crate::error::{Result, SnapshotError};
use crate::snapshot::{BackendStateSnapshot, parse_snapshot_value};

/// Typed push frame.
#[derive(Debug, Clone, PartialEq)]
pub enum PushFrame {
    ConnectionEstablished { client_id: Option<String> },
    StateUpdate(BackendStateSnapshot),
    AgentStatus(Value),
    SystemMetrics(Value),
    UserMessageReceived,
    DecisionReceived,
    AnalysisStarted,
    AnalysisCompleted,
    AnalysisError { message: Option<String> },
    Ping,
    Pong,
    Unknown { kind: String, data: Value },
}

impl PushFrame {
    /// Wire discriminator for this frame.
    #[must_use]
    pub fn kind(&self) -> &str {
        match self {
            Self::ConnectionEstablished { .. } => "connection_established",
            Self::StateUpdate(_) => "state_update",
            Self::AgentStatus(_) => "agent_status",
            Self::SystemMetrics(_) => "system_metrics",
            Self::UserMessageReceived => "user_message_received",
            Self::DecisionReceived => "decision_received",
            Self::AnalysisStarted => "analysis_started",
            Self::AnalysisCompleted => "analysis_completed",
            Self::AnalysisError { .. } => "analysis_error",
            Self::Ping => "ping",
            Self::Pong => "pong",
            Self::Unknown { kind, .. } => kind,
        }
    }

    /// Frames the event pump forwards to display subscribers.
    #[must_use]
    pub fn is_informational(&self) -> bool {
        !matches!(
            self,
            Self::StateUpdate(_) | Self::Ping | Self::Pong | Self::ConnectionEstablished { .. }
        )
    }
}

/// Decode one socket text frame.
///
/// Returns `Ok(None)` for an empty object, which some servers use as a
/// keepalive.
pub fn parse_push_frame(text: &str) -> Result<Option<PushFrame>> {
    let value: Value = serde_json::from_str(text)?;
    let object = value
        .as_object()
        .ok_or_else(|| SnapshotError::Protocol("expected JSON object push frame".to_string()))?;
    if object.is_empty() {
        return Ok(None);
    }

    let kind = object
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| SnapshotError::Protocol("missing push frame type".to_string()))?;
    let data = object.get("data").cloned().unwrap_or(Value::Null);

    let frame = match kind {
        "connection_established" | "connected" => PushFrame::ConnectionEstablished {
            client_id: data
                .get("clientId")
                .or_else(|| object.get("clientId"))
                .and_then(Value::as_str)
                .map(str::to_string),
        },
        "state_update" => {
            if data.is_null() {
                return Err(SnapshotError::Protocol(
                    "state_update frame without data".to_string(),
                ));
            }
            PushFrame::StateUpdate(parse_snapshot_value(data)?)
        }
        "agent_status" => PushFrame::AgentStatus(data),
        "system_metrics" => PushFrame::SystemMetrics(data),
        "user_message_received" => PushFrame::UserMessageReceived,
        "decision_received" => PushFrame::DecisionReceived,
        "analysis_started" => PushFrame::AnalysisStarted,
        "analysis_completed" => PushFrame::AnalysisCompleted,
        "analysis_error" => PushFrame::AnalysisError {
            message: data
                .get("message")
                .and_then(Value::as_str)
                .map(str::to_string),
        },
        "ping" => PushFrame::Ping,
        "pong" => PushFrame::Pong,
        other => PushFrame::Unknown {
            kind: other.to_string(),
            data,
        },
    };
    Ok(Some(frame))
}

/// Handshake frame sent right after the socket opens.
#[must_use]
pub fn init_frame(client_id: &str) -> String {
    json!({ "type": "init", "clientId": client_id }).to_string()
}

/// Heartbeat frame.
#[must_use]
pub fn ping_frame(timestamp_ms: i64) -> String {
    json!({ "type": "ping", "timestamp": timestamp_ms }).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_update_accepts_object_and_string_payloads() -> Result<()> {
        let object = parse_push_frame(
            r#"{"id":"1","type":"state_update","data":{"messages":[],"needs_decision":true},"timestamp":"t","source":"backend"}"#,
        )?;
        let string = parse_push_frame(
            r#"{"type":"state_update","data":"{\"messages\":[],\"needs_decision\":true}"}"#,
        )?;

        for frame in [object, string] {
            match frame {
                Some(PushFrame::StateUpdate(snapshot)) => assert!(snapshot.needs_decision),
                other => panic!("expected state update, got {other:?}"),
            }
        }
        Ok(())
    }

    #[test]
    fn lifecycle_and_ack_frames_are_typed() -> Result<()> {
        let cases = [
            (r#"{"type":"analysis_started"}"#, "analysis_started"),
            (r#"{"type":"analysis_completed","data":{}}"#, "analysis_completed"),
            (r#"{"type":"decision_received"}"#, "decision_received"),
            (r#"{"type":"user_message_received"}"#, "user_message_received"),
            (r#"{"type":"pong"}"#, "pong"),
            (r#"{"type":"chart_data","data":[1]}"#, "chart_data"),
        ];
        for (input, kind) in cases {
            let frame = parse_push_frame(input)?;
            assert_eq!(frame.as_ref().map(PushFrame::kind), Some(kind), "{input}");
        }
        Ok(())
    }

    #[test]
    fn analysis_error_carries_message() -> Result<()> {
        let frame = parse_push_frame(r#"{"type":"analysis_error","data":{"message":"boom"}}"#)?;
        assert_eq!(
            frame,
            Some(PushFrame::AnalysisError {
                message: Some("boom".to_string())
            })
        );
        Ok(())
    }

    #[test]
    fn connection_established_reads_client_id() -> Result<()> {
        let frame =
            parse_push_frame(r#"{"type":"connection_established","data":{"clientId":"c-1"}}"#)?;
        assert_eq!(
            frame,
            Some(PushFrame::ConnectionEstablished {
                client_id: Some("c-1".to_string())
            })
        );
        Ok(())
    }

    #[test]
    fn empty_object_is_ignored() -> Result<()> {
        assert_eq!(parse_push_frame("{}")?, None);
        Ok(())
    }

    #[test]
    fn malformed_frames_are_rejected() {
        struct Case {
            name: &'static str,
            input: &'static str,
            expected_error_fragment: &'static str,
        }

        let cases = [
            Case {
                name: "not json",
                input: "nope",
                expected_error_fragment: "decode error",
            },
            Case {
                name: "array envelope",
                input: r#"["EVENT"]"#,
                expected_error_fragment: "expected JSON object push frame",
            },
            Case {
                name: "missing type",
                input: r#"{"data":{}}"#,
                expected_error_fragment: "missing push frame type",
            },
            Case {
                name: "state update without data",
                input: r#"{"type":"state_update"}"#,
                expected_error_fragment: "state_update frame without data",
            },
            Case {
                name: "state update with array data",
                input: r#"{"type":"state_update","data":[1,2]}"#,
                expected_error_fragment: "expected JSON object state snapshot",
            },
        ];

        for case in cases {
            match parse_push_frame(case.input) {
                Ok(frame) => panic!("{}: expected error, got {frame:?}", case.name),
                Err(error) => assert!(
                    error.to_string().contains(case.expected_error_fragment),
                    "{}: expected '{}' in '{}'",
                    case.name,
                    case.expected_error_fragment,
                    error
                ),
            }
        }
    }

    #[test]
    fn outbound_frames_match_wire_shape() -> Result<()> {
        let init: Value = serde_json::from_str(&init_frame("client-abc"))?;
        assert_eq!(init, json!({"type": "init", "clientId": "client-abc"}));
        let ping: Value = serde_json::from_str(&ping_frame(42))?;
        assert_eq!(ping, json!({"type": "ping", "timestamp": 42}));
        Ok(())
    }
}

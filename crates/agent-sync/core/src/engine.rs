//! Snapshot application engine.
//!
//! Owns the view state and composes the staleness guard, transcript
//! reconciler, decision machine and activity rules. All mutation of the view
//! goes through this type.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::decision::{Decision, DecisionMachine, DecisionPhase, DecisionTransition};
use crate::error::{DecisionRejected, MessageRejected};
use crate::snapshot::{BackendStateSnapshot, is_decision_sender, is_final_completion_agent};
use crate::transcript::{TranscriptChange, deduplicate, local_message, reconcile};
use crate::view::{ConnectionState, DisplayRole, ViewState};

pub const DEFAULT_MIN_SNAPSHOT_INTERVAL: Duration = Duration::from_millis(50);
pub const USER_SENDER: &str = "User";
pub const SYSTEM_SENDER: &str = "System";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Snapshots arriving closer than this to the previous accepted one are dropped.
    pub min_snapshot_interval: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            min_snapshot_interval: DEFAULT_MIN_SNAPSHOT_INTERVAL,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
#[must_use]
pub enum SnapshotOutcome {
    Applied {
        state_version: u64,
        transcript: TranscriptChange,
        decision: DecisionTransition,
    },
    TooSoon {
        elapsed_ms: i64,
    },
    Duplicate,
}

impl SnapshotOutcome {
    #[must_use]
    pub fn is_applied(&self) -> bool {
        matches!(self, Self::Applied { .. })
    }
}

pub struct SyncEngine {
    clock: Arc<dyn Clock>,
    config: EngineConfig,
    view: ViewState,
    decision: DecisionMachine,
    last_accepted_at_ms: Option<i64>,
    last_snapshot: Option<BackendStateSnapshot>,
}

impl std::fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine")
            .field("config", &self.config)
            .field("view", &self.view)
            .field("decision", &self.decision)
            .field("last_accepted_at_ms", &self.last_accepted_at_ms)
            .finish_non_exhaustive()
    }
}

impl SyncEngine {
    pub fn new(clock: Arc<dyn Clock>, config: EngineConfig) -> Self {
        Self {
            clock,
            config,
            view: ViewState::default(),
            decision: DecisionMachine::default(),
            last_accepted_at_ms: None,
            last_snapshot: None,
        }
    }

    #[must_use]
    pub fn view(&self) -> &ViewState {
        &self.view
    }

    #[must_use]
    pub fn decision_phase(&self) -> DecisionPhase {
        self.decision.phase()
    }

    /// Apply a pushed snapshot, subject to the staleness guard.
    pub fn apply_snapshot(&mut self, snapshot: &BackendStateSnapshot) -> SnapshotOutcome {
        let now_ms = self.clock.now_millis();
        if let Some(last) = self.last_accepted_at_ms {
            let elapsed_ms = now_ms.saturating_sub(last);
            let window_ms =
                i64::try_from(self.config.min_snapshot_interval.as_millis()).unwrap_or(i64::MAX);
            if elapsed_ms < 0 {
                warn!(elapsed_ms, "clock moved backwards; resetting staleness window");
                self.last_accepted_at_ms = None;
            } else if elapsed_ms < window_ms {
                debug!(elapsed_ms, window_ms, "dropping snapshot inside staleness window");
                return SnapshotOutcome::TooSoon { elapsed_ms };
            }
        }
        if self.last_snapshot.as_ref() == Some(snapshot) {
            debug!("dropping duplicate snapshot");
            return SnapshotOutcome::Duplicate;
        }
        self.accept(snapshot, now_ms)
    }

    /// Apply a snapshot fetched on demand, bypassing the staleness guard.
    pub fn apply_fetched_snapshot(&mut self, snapshot: &BackendStateSnapshot) -> SnapshotOutcome {
        if self.last_snapshot.as_ref() == Some(snapshot) {
            return SnapshotOutcome::Duplicate;
        }
        let now_ms = self.clock.now_millis();
        self.accept(snapshot, now_ms)
    }

    fn accept(&mut self, snapshot: &BackendStateSnapshot, now_ms: i64) -> SnapshotOutcome {
        self.view.state_version = self.view.state_version.saturating_add(1);
        self.last_accepted_at_ms = Some(now_ms);

        let reconciled = reconcile(&self.view.transcript, &snapshot.messages, self.clock.as_ref());
        self.view.transcript = reconciled.transcript;
        if let TranscriptChange::Appended { last_id, .. } = &reconciled.change {
            self.view.last_message_id = Some(last_id.clone());
        }

        let decision = self
            .decision
            .reconcile(snapshot.needs_decision, &snapshot.sender);
        self.sync_decision_flags();
        if decision.clears_processing() {
            self.view.is_processing = false;
        }
        self.apply_activity_rules(snapshot);
        self.view.pipeline = snapshot.pipeline.clone();
        self.last_snapshot = Some(snapshot.clone());

        debug!(
            state_version = self.view.state_version,
            messages = self.view.transcript.len(),
            phase = self.decision.phase().as_str(),
            "snapshot applied"
        );
        SnapshotOutcome::Applied {
            state_version: self.view.state_version,
            transcript: reconciled.change,
            decision,
        }
    }

    fn apply_activity_rules(&mut self, snapshot: &BackendStateSnapshot) {
        if let Some(sender) = snapshot.active_sender() {
            self.view.current_agent = Some(sender.to_string());
        }
        let submitting = self.decision.phase() == DecisionPhase::Submitting;
        if self.view.needs_decision {
            self.view.is_processing = false;
        } else if is_decision_sender(&snapshot.sender) && !submitting {
            self.view.is_processing = false;
        } else if is_final_completion_agent(&snapshot.sender) {
            info!(sender = %snapshot.sender, "workflow completed");
            self.view.is_processing = false;
        }
    }

    fn sync_decision_flags(&mut self) {
        self.view.needs_decision = self.decision.needs_decision();
        self.view.is_processing_decision = self.decision.is_processing_decision();
    }

    /// Validate and record an optimistic user message.
    pub fn begin_message(&mut self, text: &str) -> Result<String, MessageRejected> {
        let text = text.trim();
        let rejection = if text.is_empty() {
            Some(MessageRejected::Empty)
        } else if self.view.is_processing {
            Some(MessageRejected::Processing)
        } else if self.view.needs_decision {
            Some(MessageRejected::DecisionPending)
        } else if self.view.connection_state != ConnectionState::Connected {
            Some(MessageRejected::NotConnected)
        } else {
            None
        };
        if let Some(rejection) = rejection {
            warn!(reason = %rejection, "message rejected");
            return Err(rejection);
        }
        let id = self.push_local(text, USER_SENDER, DisplayRole::User);
        self.view.is_processing = true;
        Ok(id)
    }

    /// Record a failed message send.
    pub fn fail_message(&mut self, detail: &str) {
        self.view.is_processing = false;
        self.push_system_message(format!("錯誤: 發送消息失敗 ({detail})"));
    }

    /// Take the decision lock and record the optimistic choice entry.
    pub fn begin_decision(&mut self, decision: Decision) -> Result<(), DecisionRejected> {
        self.decision.begin_submit()?;
        self.sync_decision_flags();
        self.view.is_processing = true;
        self.push_local(decision.transcript_text(), USER_SENDER, DisplayRole::User);
        info!(code = decision.code(), "decision submitted");
        Ok(())
    }

    /// Roll back a failed decision submission.
    pub fn fail_decision(&mut self, detail: &str) -> bool {
        if !self.decision.fail_submit() {
            return false;
        }
        self.sync_decision_flags();
        self.view.is_processing = false;
        self.view.state_version = self.view.state_version.saturating_add(1);
        self.push_system_message(format!("錯誤: 發送決策失敗 ({detail})"));
        true
    }

    pub fn push_system_message(&mut self, content: impl Into<String>) -> String {
        self.push_local(content, SYSTEM_SENDER, DisplayRole::System)
    }

    fn push_local(
        &mut self,
        content: impl Into<String>,
        sender: &str,
        role: DisplayRole,
    ) -> String {
        let message = local_message(content, sender, role, self.clock.as_ref());
        let id = message.id.clone();
        self.view.transcript.push(message);
        self.view.last_message_id = Some(id.clone());
        id
    }

    pub fn set_processing(&mut self, processing: bool) {
        self.view.is_processing = processing;
    }

    pub fn set_connection_state(&mut self, state: ConnectionState) {
        if self.view.connection_state != state {
            debug!(
                from = self.view.connection_state.as_str(),
                to = state.as_str(),
                "connection state changed"
            );
            self.view.connection_state = state;
        }
    }

    /// Collapse repeated transcript entries.
    pub fn deduplicate(&mut self) -> usize {
        let removed = deduplicate(&mut self.view.transcript);
        if removed > 0 {
            self.view.last_message_id = self.view.transcript.last().map(|m| m.id.clone());
        }
        removed
    }

    /// Reset to the empty state, ready for another initialization.
    pub fn clear(&mut self) {
        self.view = ViewState::default();
        self.decision.reset();
        self.last_accepted_at_ms = None;
        self.last_snapshot = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::{BackendMessage, BackendRole};
    use crate::testing::ManualClock;

    fn engine() -> (Arc<ManualClock>, SyncEngine) {
        let clock = Arc::new(ManualClock::epoch());
        let engine = SyncEngine::new(clock.clone(), EngineConfig::default());
        (clock, engine)
    }

    fn snapshot(
        messages: &[(&str, BackendRole, &str)],
        needs_decision: bool,
        sender: &str,
    ) -> BackendStateSnapshot {
        BackendStateSnapshot {
            messages: messages
                .iter()
                .map(|(content, role, sender)| BackendMessage::new(*content, *role, *sender))
                .collect(),
            needs_decision,
            sender: sender.to_string(),
            ..BackendStateSnapshot::default()
        }
    }

    #[test]
    fn snapshots_inside_window_are_dropped() {
        let (clock, mut engine) = engine();
        let first = snapshot(&[("a", BackendRole::Human, "User")], false, "x");
        assert!(engine.apply_snapshot(&first).is_applied());

        clock.advance_millis(20);
        let second = snapshot(
            &[("a", BackendRole::Human, "User"), ("b", BackendRole::Assistant, "x")],
            false,
            "x",
        );
        assert_eq!(
            engine.apply_snapshot(&second),
            SnapshotOutcome::TooSoon { elapsed_ms: 20 }
        );
        assert_eq!(engine.view().state_version, 1);
        assert_eq!(engine.view().transcript.len(), 1);

        clock.advance_millis(40);
        assert!(engine.apply_snapshot(&second).is_applied());
        assert_eq!(engine.view().state_version, 2);
    }

    #[test]
    fn backwards_clock_step_does_not_stall_snapshots() {
        let (clock, mut engine) = engine();
        let first = snapshot(&[("a", BackendRole::Human, "User")], false, "x");
        assert!(engine.apply_snapshot(&first).is_applied());

        clock.advance_millis(-60_000);
        let second = snapshot(
            &[("a", BackendRole::Human, "User"), ("b", BackendRole::Assistant, "x")],
            false,
            "x",
        );
        assert!(engine.apply_snapshot(&second).is_applied());
        assert_eq!(engine.view().state_version, 2);

        // The window restarts from the stepped-back reading.
        clock.advance_millis(10);
        let third = snapshot(
            &[
                ("a", BackendRole::Human, "User"),
                ("b", BackendRole::Assistant, "x"),
                ("c", BackendRole::Assistant, "x"),
            ],
            false,
            "x",
        );
        assert_eq!(
            engine.apply_snapshot(&third),
            SnapshotOutcome::TooSoon { elapsed_ms: 10 }
        );
    }

    #[test]
    fn redelivered_snapshot_is_idempotent() {
        let (clock, mut engine) = engine();
        let state = snapshot(&[("a", BackendRole::Human, "User")], false, "x");
        assert!(engine.apply_snapshot(&state).is_applied());
        let before = engine.view().clone();

        clock.advance_millis(500);
        assert_eq!(engine.apply_snapshot(&state), SnapshotOutcome::Duplicate);
        assert_eq!(engine.view(), &before);
    }

    #[test]
    fn decision_roundtrip_follows_lock() -> Result<(), DecisionRejected> {
        let (clock, mut engine) = engine();
        let paused = snapshot(
            &[("Pick one", BackendRole::Assistant, "human_choice")],
            true,
            "human_choice",
        );
        let _ = engine.apply_snapshot(&paused);
        assert!(engine.view().needs_decision);
        assert!(!engine.view().is_processing);

        engine.begin_decision(Decision::ContinueResearch)?;
        assert!(engine.view().is_processing_decision);
        assert!(!engine.view().needs_decision);
        assert!(engine.view().is_processing);
        assert_eq!(
            engine.view().last_message().map(|m| m.content.as_str()),
            Some("已選擇: 繼續研究")
        );

        clock.advance_millis(100);
        let stale = snapshot(
            &[
                ("Pick one", BackendRole::Assistant, "human_choice"),
                ("late", BackendRole::Assistant, "human_choice"),
            ],
            true,
            "human_choice",
        );
        let version = engine.view().state_version;
        let _ = engine.apply_snapshot(&stale);
        assert_eq!(engine.decision_phase(), DecisionPhase::Submitting);
        assert!(engine.view().is_processing);
        assert_eq!(engine.view().state_version, version + 1);

        clock.advance_millis(100);
        let resumed = snapshot(
            &[
                ("Pick one", BackendRole::Assistant, "human_choice"),
                ("late", BackendRole::Assistant, "human_choice"),
                ("2", BackendRole::Human, "User"),
            ],
            false,
            "hypothesis_agent",
        );
        let _ = engine.apply_snapshot(&resumed);
        assert_eq!(engine.decision_phase(), DecisionPhase::Idle);
        assert!(!engine.view().is_processing_decision);
        assert_eq!(engine.view().current_agent.as_deref(), Some("hypothesis_agent"));
        Ok(())
    }

    #[test]
    fn failed_decision_rolls_back_and_bumps_version() -> Result<(), DecisionRejected> {
        let (_clock, mut engine) = engine();
        let _ = engine.apply_snapshot(&snapshot(&[], true, "human_review"));
        engine.begin_decision(Decision::RegenerateHypothesis)?;
        let version = engine.view().state_version;

        assert!(engine.fail_decision("timeout"));
        let view = engine.view();
        assert!(view.needs_decision);
        assert!(!view.is_processing_decision);
        assert!(!view.is_processing);
        assert_eq!(view.state_version, version + 1);
        assert_eq!(
            view.last_message().map(|m| (m.role, m.content.as_str())),
            Some((DisplayRole::System, "錯誤: 發送決策失敗 (timeout)"))
        );
        assert!(!engine.fail_decision("again"));
        Ok(())
    }

    #[test]
    fn decision_outside_awaiting_is_rejected_without_side_effects() {
        let (_clock, mut engine) = engine();
        let before = engine.view().clone();
        assert!(engine.begin_decision(Decision::ContinueResearch).is_err());
        assert_eq!(engine.view(), &before);
    }

    #[test]
    fn final_agent_clears_processing() {
        let (_clock, mut engine) = engine();
        engine.set_connection_state(ConnectionState::Connected);
        assert!(engine.begin_message("hello").is_ok());
        assert!(engine.view().is_processing);

        let done = snapshot(
            &[("hello", BackendRole::Human, "User"), ("report", BackendRole::Assistant, "report_agent")],
            false,
            "report_agent",
        );
        let _ = engine.apply_snapshot(&done);
        assert!(!engine.view().is_processing);
        assert_eq!(engine.view().transcript.len(), 2);
    }

    #[test]
    fn message_preconditions() {
        let (_clock, mut engine) = engine();
        assert_eq!(engine.begin_message("hi"), Err(MessageRejected::NotConnected));
        engine.set_connection_state(ConnectionState::Connected);
        assert_eq!(engine.begin_message("   "), Err(MessageRejected::Empty));
        assert!(engine.begin_message("hi").is_ok());
        assert_eq!(engine.begin_message("again"), Err(MessageRejected::Processing));

        engine.fail_message("boom");
        assert!(!engine.view().is_processing);
        assert_eq!(engine.view().transcript.len(), 2);
        assert_eq!(engine.view().transcript[1].role, DisplayRole::System);
    }

    #[test]
    fn clear_resets_view_and_guard() {
        let (_clock, mut engine) = engine();
        let state = snapshot(&[("a", BackendRole::Human, "User")], true, "human_choice");
        let _ = engine.apply_snapshot(&state);
        engine.clear();
        assert_eq!(engine.view(), &ViewState::default());
        assert_eq!(engine.decision_phase(), DecisionPhase::Idle);
        assert!(engine.apply_snapshot(&state).is_applied());
    }
}

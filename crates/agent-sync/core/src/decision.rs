//! Decision coordination between server pushes and local submissions.
//!
//! A submitted decision holds a logical lock (`Submitting`) that only a
//! snapshot reporting `needs_decision == false` releases. Late pushes still
//! carrying the pending flag are ignored while the lock is held.

use tracing::{debug, info, warn};

use crate::error::DecisionRejected;
use crate::snapshot::is_decision_sender;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DecisionPhase {
    #[default]
    Idle,
    AwaitingUser,
    Submitting,
    ConflictRecovery,
}

impl DecisionPhase {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::AwaitingUser => "awaiting_user",
            Self::Submitting => "submitting",
            Self::ConflictRecovery => "conflict_recovery",
        }
    }
}

/// A discrete user choice that unblocks a paused workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    RegenerateHypothesis,
    ContinueResearch,
}

impl Decision {
    /// Code posted as `process_decision`.
    #[must_use]
    pub fn code(self) -> &'static str {
        match self {
            Self::RegenerateHypothesis => "1",
            Self::ContinueResearch => "2",
        }
    }

    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::RegenerateHypothesis => "重新生成假設",
            Self::ContinueResearch => "繼續研究",
        }
    }

    /// Text of the optimistic transcript entry.
    #[must_use]
    pub fn transcript_text(self) -> String {
        format!("已選擇: {}", self.label())
    }

    #[must_use]
    pub fn from_code(code: &str) -> Option<Self> {
        match code.trim() {
            "1" => Some(Self::RegenerateHypothesis),
            "2" => Some(Self::ContinueResearch),
            _ => None,
        }
    }
}

/// Result of feeding one snapshot's decision fields to the machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub enum DecisionTransition {
    /// Idle workflow paused for input.
    Paused,
    /// Submission acknowledged by the server; lock released.
    Released,
    /// Decision sentinel forced the paused state.
    Forced,
    /// Pending flag ignored while a submission holds the lock.
    StaleWhileSubmitting,
    /// Snapshot agrees with the local flag.
    Unchanged,
    /// Local flag adopted from the snapshot.
    Adopted { needs_decision: bool },
}

impl DecisionTransition {
    #[must_use]
    pub fn changed(self) -> bool {
        matches!(
            self,
            Self::Paused | Self::Released | Self::Forced | Self::Adopted { .. }
        )
    }

    /// Whether the transition must clear the processing indicator.
    #[must_use]
    pub fn clears_processing(self) -> bool {
        matches!(
            self,
            Self::Paused
                | Self::Forced
                | Self::Adopted {
                    needs_decision: true
                }
        )
    }
}

#[derive(Debug, Clone, Default)]
pub struct DecisionMachine {
    phase: DecisionPhase,
}

impl DecisionMachine {
    #[must_use]
    pub fn phase(&self) -> DecisionPhase {
        self.phase
    }

    #[must_use]
    pub fn needs_decision(&self) -> bool {
        self.phase == DecisionPhase::AwaitingUser
    }

    #[must_use]
    pub fn is_processing_decision(&self) -> bool {
        self.phase == DecisionPhase::Submitting
    }

    /// Apply the server's view of the decision flag, first matching rule wins.
    pub fn reconcile(&mut self, needs_decision: bool, sender: &str) -> DecisionTransition {
        let phase = self.phase;
        let transition = if needs_decision && phase == DecisionPhase::Idle {
            self.phase = DecisionPhase::AwaitingUser;
            DecisionTransition::Paused
        } else if !needs_decision && phase == DecisionPhase::Submitting {
            self.phase = DecisionPhase::Idle;
            DecisionTransition::Released
        } else if is_decision_sender(sender)
            && needs_decision
            && phase != DecisionPhase::Submitting
        {
            self.phase = DecisionPhase::AwaitingUser;
            if phase == DecisionPhase::AwaitingUser {
                DecisionTransition::Unchanged
            } else {
                DecisionTransition::Forced
            }
        } else if needs_decision == self.needs_decision() {
            DecisionTransition::Unchanged
        } else if phase == DecisionPhase::Submitting {
            DecisionTransition::StaleWhileSubmitting
        } else {
            self.phase = if needs_decision {
                DecisionPhase::AwaitingUser
            } else {
                DecisionPhase::Idle
            };
            DecisionTransition::Adopted { needs_decision }
        };

        match transition {
            DecisionTransition::StaleWhileSubmitting => {
                debug!(sender, "ignoring pending decision flag while submitting");
            }
            DecisionTransition::Unchanged => {}
            other => info!(
                from = phase.as_str(),
                to = self.phase.as_str(),
                sender,
                transition = ?other,
                "decision phase changed"
            ),
        }
        transition
    }

    /// Take the submission lock.
    pub fn begin_submit(&mut self) -> Result<(), DecisionRejected> {
        if self.phase != DecisionPhase::AwaitingUser {
            warn!(phase = self.phase.as_str(), "decision rejected");
            return Err(DecisionRejected { phase: self.phase });
        }
        self.phase = DecisionPhase::Submitting;
        Ok(())
    }

    /// Roll a failed submission back to the paused state.
    ///
    /// Returns false when no submission was in flight.
    pub fn fail_submit(&mut self) -> bool {
        if self.phase != DecisionPhase::Submitting {
            return false;
        }
        self.phase = DecisionPhase::ConflictRecovery;
        debug!(phase = self.phase.as_str(), "recovering from failed decision");
        self.phase = DecisionPhase::AwaitingUser;
        true
    }

    pub fn reset(&mut self) {
        self.phase = DecisionPhase::Idle;
    }
}

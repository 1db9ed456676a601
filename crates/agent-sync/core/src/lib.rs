//! Pure reconciliation core for the agent sync client.
//!
//! Nothing in this crate performs I/O:
//! - backend snapshot and push frame decoding
//! - length-based transcript reconciliation
//! - decision lock state machine
//! - `SyncEngine`, which owns the view and applies snapshots to it

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used, clippy::panic))]

pub mod clock;
pub mod decision;
pub mod engine;
pub mod error;
pub mod frame;
pub mod snapshot;
#[cfg(any(test, feature = "test-support"))]
pub mod testing;
pub mod transcript;
pub mod view;

pub use clock::{Clock, SystemClock, format_timestamp};
pub use decision::{Decision, DecisionMachine, DecisionPhase, DecisionTransition};
pub use engine::{EngineConfig, SnapshotOutcome, SyncEngine};
pub use error::{DecisionRejected, MessageRejected, Result, SnapshotError};
pub use frame::{PushFrame, parse_push_frame};
pub use snapshot::{
    BackendMessage, BackendRole, BackendStateSnapshot, PipelineFields, parse_snapshot,
    parse_snapshot_value,
};
pub use transcript::TranscriptChange;
pub use view::{ConnectionState, DisplayMessage, DisplayRole, ViewState};

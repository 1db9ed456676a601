//! Client side of the agent sync engine.
//!
//! `SyncOrchestrator` is the entry point: it loads `/api/state`, keeps a push
//! channel (socket, event stream or polling) alive with bounded reconnects,
//! feeds every snapshot through the core `SyncEngine`, and exposes the
//! message and decision actions with optimistic updates and rollback.

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used, clippy::panic))]

pub mod backoff;
pub mod channel;
pub mod config;
pub mod error;
pub mod gateway;
pub mod http;
pub mod notify;
pub mod orchestrator;

pub use backoff::{BackoffPolicy, ReconnectStep, ReconnectTracker};
pub use channel::{
    ChannelEvent, ChannelState, EventStreamTransport, PollingTransport, PushChannel,
    PushTransport, SessionEnd, SessionSink, SocketTransport,
};
pub use config::{SyncConfig, TransportKind};
pub use error::{ActionError, ClientError, Precondition, Result};
pub use gateway::{ActionGateway, RetrySettings, SharedEngine};
pub use http::{BackendApi, HttpBackendApi, SendMessageAck, SendMessageRequest};
pub use notify::{Notification, NotificationKind, NotificationSink, TracingNotifier};
pub use orchestrator::{InitOutcome, SyncOrchestrator, SyncOrchestratorBuilder};

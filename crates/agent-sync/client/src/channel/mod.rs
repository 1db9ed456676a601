//! Push channel management.
//!
//! A `PushChannel` supervises one `PushTransport` at a time. Each transport
//! session reports what it receives through a `SessionSink`; when a session
//! ends the supervisor either stops (intentional close), waits out the
//! backoff delay and opens a new session, or gives up and goes offline.

mod event_stream;
mod polling;
mod socket;

pub use event_stream::{EventStreamTransport, SseEvent, SseParser};
pub use polling::PollingTransport;
pub use socket::SocketTransport;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use agent_sync_core::{BackendStateSnapshot, PushFrame};
use async_trait::async_trait;
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::backoff::{BackoffPolicy, ReconnectStep, ReconnectTracker};
use crate::error::Result;

/// Channel lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChannelState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Offline,
}

impl ChannelState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::Offline => "offline",
        }
    }
}

/// Event delivered to the channel owner.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    Opened,
    Snapshot(BackendStateSnapshot),
    Frame(PushFrame),
    Closed(String),
    Error(String),
    Offline { attempts: u32 },
}

/// How a transport session ended without a transport error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEnd {
    /// Closed on purpose by the server; no reconnect.
    Normal,
    /// Lost; the supervisor schedules a reconnect.
    Dropped(String),
}

/// Write side handed to a transport for one session.
#[derive(Debug, Clone)]
pub struct SessionSink {
    events: mpsc::UnboundedSender<ChannelEvent>,
    state: Arc<watch::Sender<ChannelState>>,
    opened: Arc<AtomicBool>,
}

impl SessionSink {
    fn new(
        events: mpsc::UnboundedSender<ChannelEvent>,
        state: Arc<watch::Sender<ChannelState>>,
    ) -> Self {
        Self {
            events,
            state,
            opened: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Mark the session live. Only the first call per session emits `Opened`.
    pub fn opened(&self) {
        if self.opened.swap(true, Ordering::SeqCst) {
            return;
        }
        self.state.send_replace(ChannelState::Connected);
        self.emit(ChannelEvent::Opened);
    }

    #[must_use]
    pub fn was_opened(&self) -> bool {
        self.opened.load(Ordering::SeqCst)
    }

    pub fn snapshot(&self, snapshot: BackendStateSnapshot) {
        self.emit(ChannelEvent::Snapshot(snapshot));
    }

    pub fn error(&self, detail: impl Into<String>) {
        self.emit(ChannelEvent::Error(detail.into()));
    }

    /// Route a decoded socket frame.
    pub fn dispatch(&self, frame: PushFrame) {
        match frame {
            PushFrame::StateUpdate(snapshot) => self.snapshot(snapshot),
            PushFrame::ConnectionEstablished { client_id } => {
                debug!(client_id = ?client_id, "push connection confirmed");
                self.opened();
            }
            PushFrame::Ping | PushFrame::Pong => debug!("push heartbeat"),
            other => self.emit(ChannelEvent::Frame(other)),
        }
    }

    /// Sink wired to a fresh receiver, for driving one transport session directly.
    #[cfg(test)]
    pub(crate) fn detached() -> (Self, mpsc::UnboundedReceiver<ChannelEvent>) {
        let (events, receiver) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(ChannelState::Disconnected);
        (Self::new(events, Arc::new(state)), receiver)
    }

    fn emit(&self, event: ChannelEvent) {
        if self.events.send(event).is_err() {
            debug!("channel event receiver dropped");
        }
    }
}

/// One way of receiving pushed snapshots.
#[async_trait]
pub trait PushTransport: Send + Sync {
    fn name(&self) -> &'static str;

    /// Run a single session until it ends.
    ///
    /// Call `sink.opened()` once the session is live.
    async fn run_session(&self, sink: &SessionSink) -> Result<SessionEnd>;
}

/// Supervised push connection with reconnect backoff.
pub struct PushChannel {
    transport: Arc<dyn PushTransport>,
    policy: BackoffPolicy,
    state: Arc<watch::Sender<ChannelState>>,
    events: mpsc::UnboundedSender<ChannelEvent>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl PushChannel {
    pub fn new(
        transport: Arc<dyn PushTransport>,
        policy: BackoffPolicy,
    ) -> (Self, mpsc::UnboundedReceiver<ChannelEvent>) {
        let (events, receiver) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(ChannelState::Disconnected);
        (
            Self {
                transport,
                policy,
                state: Arc::new(state),
                events,
                task: Mutex::new(None),
            },
            receiver,
        )
    }

    #[must_use]
    pub fn state(&self) -> ChannelState {
        *self.state.borrow()
    }

    #[must_use]
    pub fn subscribe_state(&self) -> watch::Receiver<ChannelState> {
        self.state.subscribe()
    }

    #[must_use]
    pub fn transport_name(&self) -> &'static str {
        self.transport.name()
    }

    /// Start the supervisor unless one is already running.
    pub async fn connect(&self) {
        let mut task = self.task.lock().await;
        if task.as_ref().is_some_and(|handle| !handle.is_finished()) {
            debug!(transport = self.transport.name(), "push channel already running");
            return;
        }
        info!(transport = self.transport.name(), "push channel connecting");
        self.state.send_replace(ChannelState::Connecting);
        *task = Some(tokio::spawn(supervise(
            Arc::clone(&self.transport),
            self.policy,
            Arc::clone(&self.state),
            self.events.clone(),
        )));
    }

    /// Stop the supervisor and any pending reconnect timer.
    pub async fn disconnect(&self) {
        if let Some(handle) = self.task.lock().await.take() {
            handle.abort();
            let _ = handle.await;
            info!(transport = self.transport.name(), "push channel disconnected");
        }
        self.state.send_replace(ChannelState::Disconnected);
    }

    /// Manual retry with a fresh attempt counter.
    pub async fn reconnect(&self) {
        self.disconnect().await;
        self.connect().await;
    }
}

impl Drop for PushChannel {
    fn drop(&mut self) {
        if let Ok(mut task) = self.task.try_lock()
            && let Some(handle) = task.take()
        {
            handle.abort();
        }
    }
}

async fn supervise(
    transport: Arc<dyn PushTransport>,
    policy: BackoffPolicy,
    state: Arc<watch::Sender<ChannelState>>,
    events: mpsc::UnboundedSender<ChannelEvent>,
) {
    let mut tracker = ReconnectTracker::new(policy);
    loop {
        state.send_replace(ChannelState::Connecting);
        let sink = SessionSink::new(events.clone(), Arc::clone(&state));
        let result = transport.run_session(&sink).await;
        if sink.was_opened() {
            tracker.record_open();
        }

        let reason = match result {
            Ok(SessionEnd::Normal) => {
                info!(transport = transport.name(), "push session closed normally");
                state.send_replace(ChannelState::Disconnected);
                sink.emit(ChannelEvent::Closed("closed normally".to_string()));
                return;
            }
            Ok(SessionEnd::Dropped(reason)) => reason,
            Err(error) => {
                let detail = error.to_string();
                sink.error(detail.clone());
                detail
            }
        };

        if events.is_closed() {
            state.send_replace(ChannelState::Disconnected);
            return;
        }

        match tracker.record_failure() {
            ReconnectStep::Retry { attempt, delay } => {
                warn!(
                    transport = transport.name(),
                    attempt,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    reason = %reason,
                    "push session lost; reconnecting"
                );
                state.send_replace(ChannelState::Reconnecting);
                sink.emit(ChannelEvent::Closed(reason));
                tokio::time::sleep(delay).await;
            }
            ReconnectStep::GiveUp { attempts } => {
                warn!(
                    transport = transport.name(),
                    attempts,
                    reason = %reason,
                    "push channel giving up; offline"
                );
                state.send_replace(ChannelState::Offline);
                sink.emit(ChannelEvent::Closed(reason));
                sink.emit(ChannelEvent::Offline { attempts });
                return;
            }
        }
    }
}

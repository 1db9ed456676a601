//! Sync orchestrator: owns the engine, the push channel and the background
//! tasks, and exposes the read-only view plus the user actions.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use agent_sync_core::{
    BackendStateSnapshot, Clock, ConnectionState, Decision, PushFrame, SnapshotOutcome,
    SyncEngine, SystemClock, ViewState,
};
use tokio::sync::{Mutex, broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, interval_at};
use tracing::{debug, info, warn};

use crate::channel::{
    ChannelEvent, ChannelState, EventStreamTransport, PollingTransport, PushChannel,
    PushTransport, SocketTransport,
};
use crate::config::{SyncConfig, TransportKind};
use crate::error::{ActionError, Result};
use crate::gateway::{ActionGateway, RetrySettings, SharedEngine};
use crate::http::{BackendApi, HttpBackendApi, SendMessageAck};
use crate::notify::{Notification, NotificationSink, TracingNotifier};

const FRAME_BUFFER: usize = 64;

/// Result of `SyncOrchestrator::initialize`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitOutcome {
    Online,
    Offline,
}

pub struct SyncOrchestratorBuilder {
    config: SyncConfig,
    api: Option<Arc<dyn BackendApi>>,
    transport: Option<Arc<dyn PushTransport>>,
    clock: Option<Arc<dyn Clock>>,
    notifier: Option<Arc<dyn NotificationSink>>,
}

impl SyncOrchestratorBuilder {
    #[must_use]
    pub fn api(mut self, api: Arc<dyn BackendApi>) -> Self {
        self.api = Some(api);
        self
    }

    #[must_use]
    pub fn transport(mut self, transport: Arc<dyn PushTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    #[must_use]
    pub fn notifier(mut self, notifier: Arc<dyn NotificationSink>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn build(self) -> Result<SyncOrchestrator> {
        let config = self.config.validated()?;
        let api: Arc<dyn BackendApi> = match self.api {
            Some(api) => api,
            None => Arc::new(HttpBackendApi::new(&config)?),
        };
        let transport: Arc<dyn PushTransport> = match self.transport {
            Some(transport) => transport,
            None => default_transport(&config, Arc::clone(&api))?,
        };
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let notifier = self
            .notifier
            .unwrap_or_else(|| Arc::new(TracingNotifier));

        let engine = SharedEngine::new(SyncEngine::new(clock, config.engine_config()));
        let (channel, events) = PushChannel::new(transport, config.backoff_policy());
        let gateway = ActionGateway::new(
            Arc::clone(&api),
            engine.clone(),
            Arc::clone(&notifier),
            RetrySettings {
                attempts: config.message_retry_attempts.max(1),
                base_delay: config.message_retry_base(),
                batch_pause: config.batch_pause(),
            },
        );
        let (frames, _) = broadcast::channel(FRAME_BUFFER);

        Ok(SyncOrchestrator {
            config,
            api,
            engine,
            gateway,
            channel: Arc::new(channel),
            events: Arc::new(Mutex::new(events)),
            frames,
            notifier,
            connection_lost: Arc::new(AtomicBool::new(false)),
            tasks: Mutex::new(Vec::new()),
        })
    }
}

fn default_transport(
    config: &SyncConfig,
    api: Arc<dyn BackendApi>,
) -> Result<Arc<dyn PushTransport>> {
    let push_url = config.resolved_push_url();
    let transport: Arc<dyn PushTransport> = match config.transport {
        TransportKind::Socket => Arc::new(SocketTransport::new(
            &push_url,
            config.connect_timeout(),
            config.heartbeat_interval(),
        )?),
        TransportKind::EventStream => Arc::new(EventStreamTransport::new(
            &push_url,
            config.connect_timeout(),
        )?),
        TransportKind::Polling => Arc::new(PollingTransport::new(api, config.poll_interval())),
    };
    Ok(transport)
}

pub struct SyncOrchestrator {
    config: SyncConfig,
    api: Arc<dyn BackendApi>,
    engine: SharedEngine,
    gateway: ActionGateway,
    channel: Arc<PushChannel>,
    events: Arc<Mutex<mpsc::UnboundedReceiver<ChannelEvent>>>,
    frames: broadcast::Sender<PushFrame>,
    notifier: Arc<dyn NotificationSink>,
    connection_lost: Arc<AtomicBool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SyncOrchestrator {
    #[must_use]
    pub fn builder(config: SyncConfig) -> SyncOrchestratorBuilder {
        SyncOrchestratorBuilder {
            config,
            api: None,
            transport: None,
            clock: None,
            notifier: None,
        }
    }

    /// Orchestrator with the HTTP API and the configured push transport.
    pub fn new(config: SyncConfig) -> Result<Self> {
        Self::builder(config).build()
    }

    #[must_use]
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    #[must_use]
    pub fn view(&self) -> ViewState {
        self.engine.view()
    }

    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<ViewState> {
        self.engine.subscribe()
    }

    /// Wait up to `limit` for the push channel to bring the view online.
    pub async fn wait_until_connected(&self, limit: Duration) -> bool {
        let mut views = self.subscribe();
        let connected =
            views.wait_for(|view| view.connection_state == ConnectionState::Connected);
        matches!(tokio::time::timeout(limit, connected).await, Ok(Ok(_)))
    }

    /// Non-snapshot push frames, for widgets outside the transcript.
    #[must_use]
    pub fn subscribe_frames(&self) -> broadcast::Receiver<PushFrame> {
        self.frames.subscribe()
    }

    #[must_use]
    pub fn channel_state(&self) -> ChannelState {
        self.channel.state()
    }

    /// Load the initial state and start live sync.
    ///
    /// When the backend cannot be reached the view enters offline mode and
    /// no push connection is attempted.
    pub async fn initialize(&self) -> InitOutcome {
        self.engine
            .update(|engine| engine.set_connection_state(ConnectionState::Connecting))
            .await;

        match self.api.fetch_state().await {
            Ok(snapshot) => {
                let outcome = self
                    .engine
                    .update(|engine| engine.apply_fetched_snapshot(&snapshot))
                    .await;
                debug!(outcome = ?outcome, "initial state applied");
                self.start().await;
                info!(transport = self.channel.transport_name(), "sync initialized");
                InitOutcome::Online
            }
            Err(error) => {
                warn!(error = %error, "backend unavailable; entering offline mode");
                let text = offline_mode_text(&self.config.base_url);
                self.engine
                    .update(|engine| {
                        engine.set_connection_state(ConnectionState::Offline);
                        engine.push_system_message(text)
                    })
                    .await;
                self.notifier.notify(Notification::warning(
                    "離線模式",
                    format!("無法連接到後端服務: {error}"),
                ));
                InitOutcome::Offline
            }
        }
    }

    /// Manual retry, e.g. after offline mode or when the network returns.
    pub async fn reconnect(&self) {
        info!("manual reconnect requested");
        self.engine
            .update(|engine| engine.set_connection_state(ConnectionState::Connecting))
            .await;
        self.start_tasks().await;
        self.channel.reconnect().await;
    }

    /// Fetch `/api/state` and apply it like a pushed snapshot.
    pub async fn refresh_state(&self) -> Result<SnapshotOutcome> {
        let snapshot = self.api.fetch_state().await?;
        Ok(self
            .engine
            .update(|engine| engine.apply_snapshot(&snapshot))
            .await)
    }

    /// Stop all sync activity and clear the view. Safe to call repeatedly.
    pub async fn destroy(&self) {
        self.channel.disconnect().await;
        let tasks = std::mem::take(&mut *self.tasks.lock().await);
        for task in tasks {
            task.abort();
            let _ = task.await;
        }
        self.connection_lost.store(false, Ordering::SeqCst);
        self.engine.update(SyncEngine::clear).await;
        info!("sync destroyed");
    }

    pub async fn send_message(&self, text: &str) -> std::result::Result<SendMessageAck, ActionError> {
        self.gateway.send_message(text).await
    }

    pub async fn send_message_with_retry(
        &self,
        text: &str,
        max_attempts: u32,
    ) -> std::result::Result<SendMessageAck, ActionError> {
        self.gateway.send_message_with_retry(text, max_attempts).await
    }

    pub async fn send_batch(&self, messages: &[String]) -> Vec<bool> {
        self.gateway.send_batch(messages).await
    }

    pub async fn send_decision(
        &self,
        decision: Decision,
    ) -> std::result::Result<SendMessageAck, ActionError> {
        self.gateway.send_decision(decision).await
    }

    /// Apply a snapshot obtained outside the push channel.
    pub async fn apply_snapshot(&self, snapshot: &BackendStateSnapshot) -> SnapshotOutcome {
        self.engine
            .update(|engine| engine.apply_snapshot(snapshot))
            .await
    }

    async fn start(&self) {
        self.start_tasks().await;
        self.channel.connect().await;
    }

    async fn start_tasks(&self) {
        let mut tasks = self.tasks.lock().await;
        tasks.retain(|task| !task.is_finished());
        if !tasks.is_empty() {
            return;
        }

        let pump = EventPump {
            engine: self.engine.clone(),
            channel: Arc::clone(&self.channel),
            frames: self.frames.clone(),
            notifier: Arc::clone(&self.notifier),
            connection_lost: Arc::clone(&self.connection_lost),
        };
        let events = Arc::clone(&self.events);
        tasks.push(tokio::spawn(async move {
            let mut events = events.lock().await;
            while let Some(event) = events.recv().await {
                pump.handle(event).await;
            }
        }));

        if let Some(period) = self.config.dedup_interval() {
            let engine = self.engine.clone();
            tasks.push(tokio::spawn(async move {
                let mut ticker = interval_at(Instant::now() + period, period);
                loop {
                    ticker.tick().await;
                    let removed = engine.update(SyncEngine::deduplicate).await;
                    if removed > 0 {
                        info!(removed, "deduplicated transcript");
                    }
                }
            }));
        }
    }
}

impl Drop for SyncOrchestrator {
    fn drop(&mut self) {
        if let Ok(mut tasks) = self.tasks.try_lock() {
            for task in tasks.drain(..) {
                task.abort();
            }
        }
    }
}

struct EventPump {
    engine: SharedEngine,
    channel: Arc<PushChannel>,
    frames: broadcast::Sender<PushFrame>,
    notifier: Arc<dyn NotificationSink>,
    connection_lost: Arc<AtomicBool>,
}

impl EventPump {
    async fn handle(&self, event: ChannelEvent) {
        match event {
            ChannelEvent::Opened => {
                self.engine
                    .update(|engine| engine.set_connection_state(ConnectionState::Connected))
                    .await;
                if self.connection_lost.swap(false, Ordering::SeqCst) {
                    self.notifier
                        .notify(Notification::success("連接已恢復", "即時連接已重新建立"));
                }
            }
            ChannelEvent::Snapshot(snapshot) => {
                let outcome = self
                    .engine
                    .update(|engine| engine.apply_snapshot(&snapshot))
                    .await;
                debug!(outcome = ?outcome, "push snapshot handled");
            }
            ChannelEvent::Frame(frame) => {
                self.apply_frame(&frame).await;
                if self.frames.send(frame).is_err() {
                    debug!("no frame subscribers");
                }
            }
            ChannelEvent::Closed(reason) => {
                debug!(reason = %reason, "push session closed");
                self.connection_lost.store(true, Ordering::SeqCst);
                let state = match self.channel.state() {
                    ChannelState::Connecting | ChannelState::Reconnecting => {
                        ConnectionState::Connecting
                    }
                    ChannelState::Connected => ConnectionState::Connected,
                    ChannelState::Disconnected => ConnectionState::Disconnected,
                    ChannelState::Offline => ConnectionState::Offline,
                };
                self.engine
                    .update(|engine| engine.set_connection_state(state))
                    .await;
            }
            ChannelEvent::Error(detail) => {
                debug!(detail = %detail, "push transport error");
            }
            ChannelEvent::Offline { attempts } => {
                let text = format!(
                    "⚠️ 與後端的即時連接已中斷，已重試 {attempts} 次。請檢查網路連接後手動重新連接。"
                );
                self.engine
                    .update(|engine| {
                        engine.set_connection_state(ConnectionState::Offline);
                        engine.push_system_message(text)
                    })
                    .await;
                self.notifier.notify(Notification::warning(
                    "連接中斷",
                    format!("重新連接 {attempts} 次失敗，已進入離線模式"),
                ));
            }
        }
    }

    async fn apply_frame(&self, frame: &PushFrame) {
        match frame {
            PushFrame::AnalysisStarted => {
                self.engine
                    .update(|engine| engine.set_processing(true))
                    .await;
            }
            PushFrame::AnalysisCompleted => {
                self.engine
                    .update(|engine| engine.set_processing(false))
                    .await;
            }
            PushFrame::AnalysisError { message } => {
                let message = message.clone();
                self.engine
                    .update(|engine| {
                        engine.set_processing(false);
                        if let Some(message) = message {
                            engine.push_system_message(format!("錯誤: {message}"));
                        }
                    })
                    .await;
            }
            PushFrame::UserMessageReceived | PushFrame::DecisionReceived => {
                debug!(kind = frame.kind(), "backend acknowledged delivery");
            }
            other => debug!(kind = other.kind(), "informational push frame"),
        }
    }
}

fn offline_mode_text(base_url: &str) -> String {
    format!(
        "⚠️ 無法連接到後端服務。您仍可以輸入消息，但需要等待後端服務恢復後才能獲得回應。\n\n請檢查：\n1. 後端服務是否運行在 {base_url}\n2. 網路連接是否正常\n3. 後端服務是否正確配置"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offline_text_names_configured_backend() {
        let text = offline_mode_text("http://10.0.0.2:5001");
        assert!(text.contains("http://10.0.0.2:5001"));
        assert!(text.contains("網路連接"));
    }

    #[test]
    fn builder_rejects_invalid_config() {
        let result = SyncOrchestrator::new(SyncConfig::new("not a url"));
        assert!(result.is_err());
    }

    #[test]
    fn builder_selects_transport_from_config() -> Result<()> {
        for (kind, expected) in [
            (TransportKind::Socket, "socket"),
            (TransportKind::EventStream, "event_stream"),
            (TransportKind::Polling, "polling"),
        ] {
            let config = SyncConfig {
                transport: kind,
                ..SyncConfig::default()
            };
            let orchestrator = SyncOrchestrator::new(config)?;
            assert_eq!(orchestrator.channel.transport_name(), expected);
        }
        Ok(())
    }
}

//! User actions: free-form messages and workflow decisions.
//!
//! Every action mutates the view optimistically under the engine lock, then
//! releases the lock before the request goes out. The response only decides
//! whether the optimistic state is rolled back.

use std::sync::Arc;
use std::time::Duration;

use agent_sync_core::{Decision, SyncEngine, ViewState};
use tokio::sync::{Mutex, watch};
use tracing::{error, info, warn};

use crate::backoff::action_retry_delay;
use crate::error::{ActionError, ClientError};
use crate::http::{BackendApi, SendMessageAck, SendMessageRequest};
use crate::notify::{Notification, NotificationSink};

/// Engine plus the watch channel its view is published on.
#[derive(Clone)]
pub struct SharedEngine {
    engine: Arc<Mutex<SyncEngine>>,
    view: Arc<watch::Sender<ViewState>>,
}

impl SharedEngine {
    pub fn new(engine: SyncEngine) -> Self {
        let (view, _) = watch::channel(engine.view().clone());
        Self {
            engine: Arc::new(Mutex::new(engine)),
            view: Arc::new(view),
        }
    }

    /// Run `apply` under the engine lock and publish the resulting view.
    pub async fn update<R>(&self, apply: impl FnOnce(&mut SyncEngine) -> R) -> R {
        let mut engine = self.engine.lock().await;
        let result = apply(&mut engine);
        let next = engine.view();
        self.view.send_if_modified(|current| {
            if *current == *next {
                false
            } else {
                *current = next.clone();
                true
            }
        });
        result
    }

    #[must_use]
    pub fn view(&self) -> ViewState {
        self.view.borrow().clone()
    }

    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<ViewState> {
        self.view.subscribe()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetrySettings {
    pub attempts: u32,
    pub base_delay: Duration,
    pub batch_pause: Duration,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            attempts: 3,
            base_delay: Duration::from_secs(1),
            batch_pause: Duration::from_secs(1),
        }
    }
}

#[derive(Clone)]
pub struct ActionGateway {
    api: Arc<dyn BackendApi>,
    engine: SharedEngine,
    notifier: Arc<dyn NotificationSink>,
    retry: RetrySettings,
}

impl ActionGateway {
    pub fn new(
        api: Arc<dyn BackendApi>,
        engine: SharedEngine,
        notifier: Arc<dyn NotificationSink>,
        retry: RetrySettings,
    ) -> Self {
        Self {
            api,
            engine,
            notifier,
            retry,
        }
    }

    /// Send one free-form message.
    pub async fn send_message(&self, text: &str) -> Result<SendMessageAck, ActionError> {
        self.send_message_with_retry(text, 1).await
    }

    /// Send one message, retrying transient failures with exponential delay.
    ///
    /// Only one optimistic entry is added regardless of the attempt count.
    pub async fn send_message_with_retry(
        &self,
        text: &str,
        max_attempts: u32,
    ) -> Result<SendMessageAck, ActionError> {
        let text = text.trim().to_string();
        self.engine
            .update(|engine| engine.begin_message(&text))
            .await?;

        let request = SendMessageRequest::message(text);
        let attempts = max_attempts.max(1);
        let mut attempt = 0;
        let failure = loop {
            match self.api.send_message(&request).await {
                Ok(ack) => {
                    log_ack(&ack);
                    return Ok(ack);
                }
                Err(error) => {
                    attempt += 1;
                    if attempt >= attempts || !error.is_transient() {
                        break error;
                    }
                    let delay = action_retry_delay(self.retry.base_delay, attempt - 1);
                    warn!(
                        attempt,
                        attempts,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        error = %error,
                        "send_message failed; retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        };

        error!(error = %failure, "send_message failed");
        let detail = failure.to_string();
        self.engine
            .update(|engine| engine.fail_message(&detail))
            .await;
        self.notifier
            .notify(Notification::error("發送失敗", detail));
        Err(ActionError::Failed(failure))
    }

    /// Send each message with the configured retry count, pausing between them.
    pub async fn send_batch(&self, messages: &[String]) -> Vec<bool> {
        let mut results = Vec::with_capacity(messages.len());
        for (index, message) in messages.iter().enumerate() {
            let sent = self
                .send_message_with_retry(message, self.retry.attempts)
                .await
                .is_ok();
            results.push(sent);
            if index + 1 < messages.len() {
                tokio::time::sleep(self.retry.batch_pause).await;
            }
        }
        results
    }

    /// Submit a workflow decision.
    ///
    /// The decision lock is taken before the request is issued, so concurrent
    /// calls result in exactly one request.
    pub async fn send_decision(&self, decision: Decision) -> Result<SendMessageAck, ActionError> {
        self.engine
            .update(|engine| engine.begin_decision(decision))
            .await?;

        match self
            .api
            .send_message(&SendMessageRequest::decision(decision.code()))
            .await
        {
            Ok(ack) => {
                info!(code = decision.code(), "decision accepted; awaiting backend state");
                log_ack(&ack);
                Ok(ack)
            }
            Err(failure) => Err(self.rollback_decision(failure).await),
        }
    }

    async fn rollback_decision(&self, failure: ClientError) -> ActionError {
        error!(error = %failure, "send_decision failed; restoring pending decision");
        let detail = failure.to_string();
        self.engine
            .update(|engine| engine.fail_decision(&detail))
            .await;
        self.notifier
            .notify(Notification::error("決策發送失敗", detail));
        ActionError::Failed(failure)
    }
}

fn log_ack(ack: &SendMessageAck) {
    if ack.is_processing() {
        info!(status = %ack.status, "backend acknowledged request");
    } else {
        warn!(status = %ack.status, message = ?ack.message, "unexpected acknowledgement status");
    }
}

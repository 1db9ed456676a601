//! Interval polling of `/api/state`, used when no push endpoint is available.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use super::{PushTransport, SessionEnd, SessionSink};
use crate::error::Result;
use crate::http::BackendApi;

pub struct PollingTransport {
    api: Arc<dyn BackendApi>,
    interval: Duration,
}

impl PollingTransport {
    pub fn new(api: Arc<dyn BackendApi>, interval: Duration) -> Self {
        Self {
            api,
            interval: interval.max(Duration::from_millis(1)),
        }
    }
}

#[async_trait]
impl PushTransport for PollingTransport {
    fn name(&self) -> &'static str {
        "polling"
    }

    /// Polls until a fetch fails; the failure ends the session.
    async fn run_session(&self, sink: &SessionSink) -> Result<SessionEnd> {
        loop {
            let snapshot = self.api.fetch_state().await?;
            sink.opened();
            debug!(messages = snapshot.messages.len(), "polled backend state");
            sink.snapshot(snapshot);
            tokio::time::sleep(self.interval).await;
        }
    }
}

//! WebSocket push transport.

use std::time::Duration;

use agent_sync_core::frame::{init_frame, ping_frame};
use agent_sync_core::parse_push_frame;
use async_trait::async_trait;
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use tokio::time::{Instant, interval_at, timeout};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tracing::{debug, warn};
use url::Url;
use uuid::Uuid;

use super::{PushTransport, SessionEnd, SessionSink};
use crate::error::{ClientError, Result};

#[derive(Debug, Clone)]
pub struct SocketTransport {
    url: Url,
    client_id: String,
    connect_timeout: Duration,
    heartbeat_interval: Duration,
}

impl SocketTransport {
    pub fn new(url: &str, connect_timeout: Duration, heartbeat_interval: Duration) -> Result<Self> {
        let parsed_url = Url::parse(url)?;
        if parsed_url.scheme() != "ws" && parsed_url.scheme() != "wss" {
            return Err(ClientError::InvalidUrl(format!(
                "URL must use ws:// or wss:// scheme, got: {}",
                parsed_url.scheme()
            )));
        }
        Ok(Self {
            url: parsed_url,
            client_id: format!("client-{}", Uuid::new_v4()),
            connect_timeout,
            heartbeat_interval,
        })
    }

    #[must_use]
    pub fn url(&self) -> &str {
        self.url.as_str()
    }

    #[must_use]
    pub fn client_id(&self) -> &str {
        &self.client_id
    }
}

#[async_trait]
impl PushTransport for SocketTransport {
    fn name(&self) -> &'static str {
        "socket"
    }

    async fn run_session(&self, sink: &SessionSink) -> Result<SessionEnd> {
        let (stream, _response) = timeout(self.connect_timeout, connect_async(self.url.as_str()))
            .await
            .map_err(|_| {
                ClientError::Timeout(format!(
                    "connection timeout after {:?}",
                    self.connect_timeout
                ))
            })?
            .map_err(|error| ClientError::WebSocket(error.to_string()))?;

        let (mut writer, mut reader) = stream.split();
        writer
            .send(Message::Text(init_frame(&self.client_id).into()))
            .await
            .map_err(|error| ClientError::WebSocket(error.to_string()))?;
        sink.opened();

        let mut heartbeat = interval_at(
            Instant::now() + self.heartbeat_interval,
            self.heartbeat_interval,
        );

        loop {
            tokio::select! {
                frame = reader.next() => match frame {
                    Some(Ok(Message::Text(text))) => match parse_push_frame(text.as_str()) {
                        Ok(Some(frame)) => {
                            debug!(url = %self.url, kind = frame.kind(), "push frame");
                            sink.dispatch(frame);
                        }
                        Ok(None) => {}
                        Err(error) => {
                            warn!("dropping malformed push frame from {}: {}", self.url, error);
                        }
                    },
                    Some(Ok(Message::Close(close))) => {
                        return Ok(match close {
                            Some(close) if close.code == CloseCode::Normal => SessionEnd::Normal,
                            Some(close) => SessionEnd::Dropped(format!(
                                "closed with code {}: {}",
                                u16::from(close.code),
                                close.reason
                            )),
                            None => SessionEnd::Dropped("closed without status".to_string()),
                        });
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        debug!("received ping from {} ({} bytes)", self.url, payload.len());
                    }
                    Some(Ok(Message::Pong(_) | Message::Binary(_) | Message::Frame(_))) => {}
                    Some(Err(error)) => {
                        warn!("websocket read error on {}: {}", self.url, error);
                        return Ok(SessionEnd::Dropped(error.to_string()));
                    }
                    None => return Ok(SessionEnd::Dropped("stream ended".to_string())),
                },
                _ = heartbeat.tick() => {
                    writer
                        .send(Message::Text(ping_frame(Utc::now().timestamp_millis()).into()))
                        .await
                        .map_err(|error| ClientError::WebSocket(error.to_string()))?;
                }
            }
        }
    }
}

//! Server-sent events push transport.

use std::time::Duration;

use agent_sync_core::parse_snapshot;
use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::header::ACCEPT;
use tracing::{debug, warn};

use super::{PushTransport, SessionEnd, SessionSink};
use crate::error::{ClientError, Result};
use crate::http::{format_http_error, map_request_error, request_id};

/// One dispatched server-sent event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    pub event: String,
    pub data: String,
    pub id: Option<String>,
}

/// Incremental `text/event-stream` line parser.
#[derive(Debug, Default)]
pub struct SseParser {
    event: String,
    data: String,
    id: Option<String>,
    has_data: bool,
}

impl SseParser {
    /// Feed one line without its terminator; a blank line dispatches.
    pub fn push_line(&mut self, line: &str) -> Option<SseEvent> {
        if line.is_empty() {
            return self.dispatch();
        }
        if line.starts_with(':') {
            return None;
        }
        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "event" => self.event = value.trim().to_string(),
            "data" => {
                if self.has_data {
                    self.data.push('\n');
                }
                self.data.push_str(value);
                self.has_data = true;
            }
            "id" => self.id = Some(value.trim().to_string()),
            _ => {}
        }
        None
    }

    fn dispatch(&mut self) -> Option<SseEvent> {
        let event = std::mem::take(&mut self.event);
        let data = std::mem::take(&mut self.data);
        let id = self.id.take();
        let has_data = std::mem::replace(&mut self.has_data, false);
        if !has_data && event.is_empty() {
            return None;
        }
        Some(SseEvent {
            event: if event.is_empty() {
                "message".to_string()
            } else {
                event
            },
            data,
            id,
        })
    }
}

#[derive(Debug, Clone)]
pub struct EventStreamTransport {
    url: String,
    http: reqwest::Client,
}

impl EventStreamTransport {
    pub fn new(url: &str, connect_timeout: Duration) -> Result<Self> {
        let parsed = url::Url::parse(url)?;
        if parsed.scheme() != "http" && parsed.scheme() != "https" {
            return Err(ClientError::InvalidUrl(format!(
                "URL must use http:// or https:// scheme, got: {}",
                parsed.scheme()
            )));
        }
        let http = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .build()
            .map_err(|error| ClientError::Internal(format!("building stream client: {error}")))?;
        Ok(Self {
            url: url.trim_end_matches('/').to_string(),
            http,
        })
    }

    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl PushTransport for EventStreamTransport {
    fn name(&self) -> &'static str {
        "event_stream"
    }

    async fn run_session(&self, sink: &SessionSink) -> Result<SessionEnd> {
        let response = self
            .http
            .get(self.url.as_str())
            .header(ACCEPT, "text/event-stream")
            .header("x-request-id", request_id())
            .send()
            .await
            .map_err(map_request_error)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.bytes().await.unwrap_or_default();
            return Err(format_http_error(status, &body));
        }
        sink.opened();

        let mut parser = SseParser::default();
        let mut bytes_stream = response.bytes_stream();
        let mut line_buffer = Vec::new();
        while let Some(chunk_result) = bytes_stream.next().await {
            let chunk = match chunk_result {
                Ok(chunk) => chunk,
                Err(error) => {
                    warn!("event stream read error on {}: {}", self.url, error);
                    return Ok(SessionEnd::Dropped(error.to_string()));
                }
            };

            line_buffer.extend_from_slice(&chunk);
            while let Some(newline_index) = line_buffer.iter().position(|byte| *byte == b'\n') {
                let mut line = line_buffer.drain(..=newline_index).collect::<Vec<_>>();
                line.pop();
                if matches!(line.last(), Some(b'\r')) {
                    line.pop();
                }
                let line = String::from_utf8_lossy(&line);
                if let Some(event) = parser.push_line(&line) {
                    handle_event(sink, &event);
                }
            }
        }

        Ok(SessionEnd::Dropped("event stream ended".to_string()))
    }
}

fn handle_event(sink: &SessionSink, event: &SseEvent) {
    match event.event.as_str() {
        "state_update" => match parse_snapshot(&event.data) {
            Ok(snapshot) => sink.snapshot(snapshot),
            Err(error) => warn!("dropping malformed state_update event: {}", error),
        },
        "connection_established" | "connected" => {
            debug!("event stream connection confirmed");
            sink.opened();
        }
        other => debug!(event = other, "ignoring event stream event"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ChannelEvent;
    use reqwest::StatusCode;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    const WAIT: Duration = Duration::from_secs(5);

    /// Answers one request with `response`, returning the stream URL and the raw request.
    async fn respond_once(response: &'static str) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let url = format!("http://{}/stream", listener.local_addr().expect("addr"));
        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.expect("accept");
            let mut request = Vec::new();
            let mut buffer = [0_u8; 4096];
            while !request.windows(4).any(|window| window == b"\r\n\r\n") {
                let read = stream.read(&mut buffer).await.expect("read request");
                if read == 0 {
                    break;
                }
                request.extend_from_slice(&buffer[..read]);
            }
            stream.write_all(response.as_bytes()).await.expect("write");
            stream.shutdown().await.expect("shutdown");
            String::from_utf8_lossy(&request).into_owned()
        });
        (url, server)
    }

    fn feed(parser: &mut SseParser, text: &str) -> Vec<SseEvent> {
        text.split('\n')
            .filter_map(|line| parser.push_line(line.trim_end_matches('\r')))
            .collect()
    }

    #[test]
    fn named_events_dispatch_on_blank_line() {
        let mut parser = SseParser::default();
        let events = feed(
            &mut parser,
            "event: state_update\ndata: {\"messages\":[]}\n\n: keepalive\n\nevent: connected\ndata:\n\n",
        );
        assert_eq!(
            events,
            vec![
                SseEvent {
                    event: "state_update".to_string(),
                    data: "{\"messages\":[]}".to_string(),
                    id: None,
                },
                SseEvent {
                    event: "connected".to_string(),
                    data: String::new(),
                    id: None,
                },
            ]
        );
    }

    #[test]
    fn multi_line_data_is_joined_with_newline() {
        let mut parser = SseParser::default();
        let events = feed(
            &mut parser,
            "id: 7\nevent: state_update\ndata: {\"messages\":\ndata: []}\n\n",
        );
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "{\"messages\":\n[]}");
        assert_eq!(events[0].id.as_deref(), Some("7"));
        assert!(parse_snapshot(&events[0].data).is_ok());
    }

    #[test]
    fn unnamed_events_default_to_message_and_crlf_is_tolerated() {
        let mut parser = SseParser::default();
        let events = feed(&mut parser, "data: hello\r\n\r\n\r\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event, "message");
        assert_eq!(events[0].data, "hello");
    }

    #[test]
    fn rejects_websocket_urls() {
        let result = EventStreamTransport::new("ws://127.0.0.1:5001/stream", Duration::from_secs(1));
        assert!(matches!(result, Err(ClientError::InvalidUrl(_))));
    }

    #[tokio::test]
    async fn session_forwards_state_updates_until_the_stream_ends() -> Result<()> {
        let (url, server) = respond_once(concat!(
            "HTTP/1.1 200 OK\r\n",
            "Content-Type: text/event-stream\r\n",
            "Connection: close\r\n\r\n",
            ": keepalive\n\n",
            "event: state_update\n",
            "data: {\"messages\":[],\"sender\":\"hypothesis_agent\"}\n\n",
            "event: state_update\n",
            "data: not json\n\n",
            "event: agent_status\n",
            "data: {}\n\n",
        ))
        .await;

        let transport = EventStreamTransport::new(&url, WAIT)?;
        let (sink, mut events) = SessionSink::detached();
        let end = tokio::time::timeout(WAIT, transport.run_session(&sink))
            .await
            .expect("session finished")?;
        let request = server.await.expect("server");

        assert_eq!(end, SessionEnd::Dropped("event stream ended".to_string()));
        assert!(request.starts_with("GET /stream"));
        assert!(request.to_ascii_lowercase().contains("accept: text/event-stream"));

        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            seen.push(event);
        }
        assert_eq!(seen.len(), 2, "{seen:?}");
        assert_eq!(seen[0], ChannelEvent::Opened);
        match &seen[1] {
            ChannelEvent::Snapshot(snapshot) => assert_eq!(snapshot.sender, "hypothesis_agent"),
            other => panic!("expected a snapshot, got {other:?}"),
        }
        Ok(())
    }

    #[tokio::test]
    async fn error_status_fails_the_session_before_opening() -> Result<()> {
        let (url, server) = respond_once(concat!(
            "HTTP/1.1 500 Internal Server Error\r\n",
            "Content-Length: 4\r\n",
            "Connection: close\r\n\r\n",
            "boom",
        ))
        .await;

        let transport = EventStreamTransport::new(&url, WAIT)?;
        let (sink, mut events) = SessionSink::detached();
        let result = tokio::time::timeout(WAIT, transport.run_session(&sink))
            .await
            .expect("session finished");
        server.await.expect("server");

        match result {
            Err(ClientError::Http { status, body }) => {
                assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
                assert_eq!(body, "boom");
            }
            other => panic!("expected an HTTP error, got {other:?}"),
        }
        assert!(!sink.was_opened());
        assert!(events.try_recv().is_err());
        Ok(())
    }
}

//! Client configuration.
//!
//! Resolved from environment variables or parsed from TOML. Every field has a
//! default so a partial document is valid.

use std::time::Duration;

use agent_sync_core::EngineConfig;
use serde::{Deserialize, Serialize};

use crate::backoff::{
    BackoffPolicy, DEFAULT_MAX_RECONNECT_ATTEMPTS, DEFAULT_RECONNECT_BASE_MS,
    DEFAULT_RECONNECT_MAX_MS,
};
use crate::error::{ClientError, Result};

pub const DEFAULT_BASE_URL: &str = "http://127.0.0.1:5001";
pub const ENV_BASE_URL: &str = "AGENT_SYNC_BASE_URL";
pub const ENV_PUSH_URL: &str = "AGENT_SYNC_PUSH_URL";
pub const ENV_TRANSPORT: &str = "AGENT_SYNC_TRANSPORT";

pub const STATE_PATH: &str = "/api/state";
pub const SEND_MESSAGE_PATH: &str = "/api/send_message";
pub const STREAM_PATH: &str = "/stream";

/// Push transport selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    Socket,
    #[default]
    EventStream,
    Polling,
}

impl TransportKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Socket => "socket",
            Self::EventStream => "event_stream",
            Self::Polling => "polling",
        }
    }

    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "socket" | "websocket" | "ws" => Some(Self::Socket),
            "event_stream" | "event-stream" | "sse" | "eventsource" | "stream" => {
                Some(Self::EventStream)
            }
            "polling" | "poll" => Some(Self::Polling),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub base_url: String,
    /// Explicit push endpoint; derived from `base_url` when absent.
    pub push_url: Option<String>,
    pub transport: TransportKind,
    pub state_timeout_ms: u64,
    pub action_timeout_ms: u64,
    pub connect_timeout_ms: u64,
    pub poll_interval_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub reconnect_base_ms: u64,
    pub reconnect_max_ms: u64,
    pub max_reconnect_attempts: u32,
    pub min_snapshot_interval_ms: u64,
    /// `None` disables the periodic transcript dedup sweep.
    pub dedup_interval_ms: Option<u64>,
    pub message_retry_attempts: u32,
    pub message_retry_base_ms: u64,
    pub batch_pause_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            push_url: None,
            transport: TransportKind::default(),
            state_timeout_ms: 5_000,
            action_timeout_ms: 30_000,
            connect_timeout_ms: 10_000,
            poll_interval_ms: 3_000,
            heartbeat_interval_ms: 30_000,
            reconnect_base_ms: DEFAULT_RECONNECT_BASE_MS,
            reconnect_max_ms: DEFAULT_RECONNECT_MAX_MS,
            max_reconnect_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
            min_snapshot_interval_ms: 50,
            dedup_interval_ms: Some(30_000),
            message_retry_attempts: 3,
            message_retry_base_ms: 1_000,
            batch_pause_ms: 1_000,
        }
    }
}

impl SyncConfig {
    #[must_use]
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            ..Self::default()
        }
    }

    /// Defaults overridden by `AGENT_SYNC_*` environment variables.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        if let Some(base_url) = env_non_empty(ENV_BASE_URL) {
            config.base_url = base_url;
        }
        if let Some(push_url) = env_non_empty(ENV_PUSH_URL) {
            config.push_url = Some(push_url);
        }
        if let Some(raw) = env_non_empty(ENV_TRANSPORT) {
            config.transport = TransportKind::parse(&raw).ok_or_else(|| {
                ClientError::Config(format!("unknown transport `{raw}` in {ENV_TRANSPORT}"))
            })?;
        }
        config.validated()
    }

    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(raw).map_err(|error| ClientError::Config(error.to_string()))?;
        config.validated()
    }

    /// Normalize URLs and reject unusable values.
    pub fn validated(mut self) -> Result<Self> {
        self.base_url = normalize_base_url(&self.base_url)?;
        if let Some(push_url) = self.push_url.take() {
            self.push_url = Some(normalize_push_url(&push_url)?);
        }
        if self.poll_interval_ms == 0 {
            return Err(ClientError::Config(
                "poll_interval_ms must be greater than zero".to_string(),
            ));
        }
        if self.max_reconnect_attempts == 0 {
            return Err(ClientError::Config(
                "max_reconnect_attempts must be greater than zero".to_string(),
            ));
        }
        Ok(self)
    }

    /// Push endpoint for the configured transport.
    #[must_use]
    pub fn resolved_push_url(&self) -> String {
        if let Some(push_url) = &self.push_url {
            return push_url.clone();
        }
        match self.transport {
            TransportKind::Socket => {
                let base = if let Some(rest) = self.base_url.strip_prefix("https://") {
                    format!("wss://{rest}")
                } else if let Some(rest) = self.base_url.strip_prefix("http://") {
                    format!("ws://{rest}")
                } else {
                    self.base_url.clone()
                };
                format!("{base}{STREAM_PATH}")
            }
            TransportKind::EventStream => format!("{}{STREAM_PATH}", self.base_url),
            TransportKind::Polling => format!("{}{STATE_PATH}", self.base_url),
        }
    }

    #[must_use]
    pub fn backoff_policy(&self) -> BackoffPolicy {
        BackoffPolicy {
            base_ms: self.reconnect_base_ms,
            max_ms: self.reconnect_max_ms,
            max_attempts: self.max_reconnect_attempts,
        }
    }

    #[must_use]
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            min_snapshot_interval: Duration::from_millis(self.min_snapshot_interval_ms),
        }
    }

    #[must_use]
    pub fn state_timeout(&self) -> Duration {
        Duration::from_millis(self.state_timeout_ms.max(1))
    }

    #[must_use]
    pub fn action_timeout(&self) -> Duration {
        Duration::from_millis(self.action_timeout_ms.max(1))
    }

    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms.max(1))
    }

    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    #[must_use]
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms.max(1))
    }

    #[must_use]
    pub fn dedup_interval(&self) -> Option<Duration> {
        self.dedup_interval_ms
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
    }

    #[must_use]
    pub fn message_retry_base(&self) -> Duration {
        Duration::from_millis(self.message_retry_base_ms)
    }

    #[must_use]
    pub fn batch_pause(&self) -> Duration {
        Duration::from_millis(self.batch_pause_ms)
    }
}

pub fn normalize_base_url(raw: &str) -> Result<String> {
    let trimmed = raw.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        return Err(ClientError::InvalidUrl("base URL is empty".to_string()));
    }
    if !(trimmed.starts_with("http://") || trimmed.starts_with("https://")) {
        return Err(ClientError::InvalidUrl(format!(
            "base URL must use http:// or https://, got: {trimmed}"
        )));
    }
    let parsed = url::Url::parse(trimmed)?;
    if parsed.host_str().is_none_or(str::is_empty) {
        return Err(ClientError::InvalidUrl(format!(
            "base URL has no host: {trimmed}"
        )));
    }
    Ok(trimmed.to_string())
}

fn normalize_push_url(raw: &str) -> Result<String> {
    let trimmed = raw.trim().trim_end_matches('/');
    let parsed = url::Url::parse(trimmed)?;
    match parsed.scheme() {
        "http" | "https" | "ws" | "wss" => Ok(trimmed.to_string()),
        other => Err(ClientError::InvalidUrl(format!(
            "push URL must use http(s) or ws(s), got: {other}"
        ))),
    }
}

fn env_non_empty(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Mutex, OnceLock};

    static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();

    fn with_env<T>(vars: &[(&str, Option<&str>)], test: impl FnOnce() -> T) -> T {
        let lock = ENV_LOCK.get_or_init(|| Mutex::new(()));
        let _guard = lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

        let previous: Vec<(String, Option<String>)> = vars
            .iter()
            .map(|(key, _)| ((*key).to_string(), std::env::var(key).ok()))
            .collect();
        for (key, value) in vars {
            match value {
                Some(value) => unsafe { std::env::set_var(key, value) },
                None => unsafe { std::env::remove_var(key) },
            }
        }

        let result = test();

        for (key, value) in previous {
            match value {
                Some(value) => unsafe { std::env::set_var(&key, value) },
                None => unsafe { std::env::remove_var(&key) },
            }
        }
        result
    }

    #[test]
    fn defaults_resolve_local_backend() {
        with_env(
            &[(ENV_BASE_URL, None), (ENV_PUSH_URL, None), (ENV_TRANSPORT, None)],
            || {
                let config = SyncConfig::from_env().expect("default config");
                assert_eq!(config.base_url, DEFAULT_BASE_URL);
                assert_eq!(config.transport, TransportKind::EventStream);
                assert_eq!(config.resolved_push_url(), "http://127.0.0.1:5001/stream");
                assert_eq!(config.state_timeout(), Duration::from_secs(5));
                assert_eq!(config.action_timeout(), Duration::from_secs(30));
                assert_eq!(config.dedup_interval(), Some(Duration::from_secs(30)));
            },
        );
    }

    #[test]
    fn env_overrides_base_url_and_transport() {
        with_env(
            &[
                (ENV_BASE_URL, Some(" https://research.example.com/ ")),
                (ENV_PUSH_URL, None),
                (ENV_TRANSPORT, Some("WebSocket")),
            ],
            || {
                let config = SyncConfig::from_env().expect("env config");
                assert_eq!(config.base_url, "https://research.example.com");
                assert_eq!(config.transport, TransportKind::Socket);
                assert_eq!(
                    config.resolved_push_url(),
                    "wss://research.example.com/stream"
                );
            },
        );
    }

    #[test]
    fn unknown_transport_is_a_config_error() {
        with_env(
            &[(ENV_BASE_URL, None), (ENV_PUSH_URL, None), (ENV_TRANSPORT, Some("carrier-pigeon"))],
            || {
                let error = SyncConfig::from_env().expect_err("expected config error");
                assert!(matches!(error, ClientError::Config(_)));
            },
        );
    }

    #[test]
    fn toml_document_overrides_defaults() {
        let config = SyncConfig::from_toml_str(
            r#"
                base_url = "http://10.0.0.5:5001/"
                transport = "polling"
                poll_interval_ms = 750
                dedup_interval_ms = 0
            "#,
        )
        .expect("toml config");
        assert_eq!(config.base_url, "http://10.0.0.5:5001");
        assert_eq!(config.poll_interval(), Duration::from_millis(750));
        assert_eq!(config.resolved_push_url(), "http://10.0.0.5:5001/api/state");
        assert_eq!(config.dedup_interval(), None);
        assert_eq!(config.max_reconnect_attempts, 5);
    }

    #[test]
    fn invalid_urls_are_rejected() {
        for raw in ["", "   ", "localhost:5001", "ftp://example.com", "http://"] {
            assert!(normalize_base_url(raw).is_err(), "{raw:?}");
        }
        let error = SyncConfig::from_toml_str(r#"push_url = "ftp://example.com/stream""#)
            .expect_err("expected push url error");
        assert!(matches!(error, ClientError::InvalidUrl(_)));
    }

    #[test]
    fn explicit_push_url_wins() {
        let config = SyncConfig {
            push_url: Some("ws://push.example.com/ws".to_string()),
            transport: TransportKind::Socket,
            ..SyncConfig::default()
        };
        assert_eq!(config.resolved_push_url(), "ws://push.example.com/ws");
    }
}

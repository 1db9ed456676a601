//! HTTP access to the backend API.

use std::time::Duration;

use agent_sync_core::{BackendStateSnapshot, parse_snapshot_value};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

use crate::config::{SEND_MESSAGE_PATH, STATE_PATH, SyncConfig, normalize_base_url};
use crate::error::{ClientError, Result};

/// Body of `POST /api/send_message`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendMessageRequest {
    pub message: String,
    pub process_decision: String,
}

impl SendMessageRequest {
    pub fn message(text: impl Into<String>) -> Self {
        Self {
            message: text.into(),
            process_decision: String::new(),
        }
    }

    pub fn decision(code: impl Into<String>) -> Self {
        Self {
            message: String::new(),
            process_decision: code.into(),
        }
    }
}

/// Acknowledgement returned by `POST /api/send_message`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendMessageAck {
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub message: Option<String>,
}

impl SendMessageAck {
    #[must_use]
    pub fn is_processing(&self) -> bool {
        self.status == "processing"
    }
}

/// Request/response side of the backend.
#[async_trait]
pub trait BackendApi: Send + Sync {
    async fn fetch_state(&self) -> Result<BackendStateSnapshot>;

    async fn send_message(&self, request: &SendMessageRequest) -> Result<SendMessageAck>;
}

#[derive(Debug, Clone)]
pub struct HttpBackendApi {
    base_url: String,
    state_timeout: Duration,
    action_timeout: Duration,
    http: reqwest::Client,
}

impl HttpBackendApi {
    pub fn new(config: &SyncConfig) -> Result<Self> {
        Ok(Self {
            base_url: normalize_base_url(&config.base_url)?,
            state_timeout: config.state_timeout(),
            action_timeout: config.action_timeout(),
            http: reqwest::Client::new(),
        })
    }

    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    #[must_use]
    pub fn endpoint(&self, path: &str) -> Option<String> {
        endpoint(&self.base_url, path)
    }

    pub async fn get_json<T>(&self, path: &str, timeout: Duration) -> Result<T>
    where
        T: for<'de> Deserialize<'de>,
    {
        let url = self
            .endpoint(path)
            .ok_or_else(|| ClientError::InvalidUrl(format!("invalid path: {path:?}")))?;
        let response = self
            .http
            .get(url.as_str())
            .header("x-request-id", request_id())
            .timeout(timeout)
            .send()
            .await
            .map_err(map_request_error)?;
        decode_json_response(response).await
    }

    pub async fn post_json<Req, Res>(&self, path: &str, payload: &Req, timeout: Duration) -> Result<Res>
    where
        Req: Serialize + ?Sized,
        Res: for<'de> Deserialize<'de>,
    {
        let url = self
            .endpoint(path)
            .ok_or_else(|| ClientError::InvalidUrl(format!("invalid path: {path:?}")))?;
        let response = self
            .http
            .post(url.as_str())
            .header("x-request-id", request_id())
            .timeout(timeout)
            .json(payload)
            .send()
            .await
            .map_err(map_request_error)?;
        decode_json_response(response).await
    }
}

#[async_trait]
impl BackendApi for HttpBackendApi {
    async fn fetch_state(&self) -> Result<BackendStateSnapshot> {
        let value: Value = self.get_json(STATE_PATH, self.state_timeout).await?;
        Ok(parse_snapshot_value(value)?)
    }

    async fn send_message(&self, request: &SendMessageRequest) -> Result<SendMessageAck> {
        debug!(
            has_message = !request.message.is_empty(),
            process_decision = %request.process_decision,
            "posting send_message"
        );
        self.post_json(SEND_MESSAGE_PATH, request, self.action_timeout)
            .await
    }
}

#[must_use]
pub fn endpoint(base_url: &str, path: &str) -> Option<String> {
    let trimmed = path.trim();
    if trimmed.is_empty() {
        return None;
    }
    if trimmed.starts_with('/') {
        Some(format!("{base_url}{trimmed}"))
    } else {
        Some(format!("{base_url}/{trimmed}"))
    }
}

pub(crate) fn request_id() -> String {
    format!("req_{}", Uuid::new_v4().simple())
}

pub(crate) fn map_request_error(error: reqwest::Error) -> ClientError {
    if error.is_timeout() {
        ClientError::Timeout(error.to_string())
    } else if error.is_connect() {
        ClientError::Connection(error.to_string())
    } else {
        ClientError::Request(error.to_string())
    }
}

pub fn format_http_error(status: StatusCode, body: &[u8]) -> ClientError {
    let body = String::from_utf8_lossy(body).trim().to_string();
    let body = if body.is_empty() {
        "<empty>".to_string()
    } else {
        body
    };
    ClientError::Http { status, body }
}

async fn decode_json_response<T>(response: reqwest::Response) -> Result<T>
where
    T: for<'de> Deserialize<'de>,
{
    let status = response.status();
    let bytes = response.bytes().await.map_err(map_request_error)?;

    if !status.is_success() {
        return Err(format_http_error(status, &bytes));
    }

    serde_json::from_slice::<T>(&bytes).map_err(|error| ClientError::Decode(error.to_string()))
}

use crate::config::normalize_base_url;
use crate::error::{ClientError, Result};
use async_trait::async_trait;
use reqwest::StatusCode;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

pub const LOGIN_PATH: &str = "/api/auth/login";
pub const CHAT_PATH: &str = "/api/agent/chat";

/// Login and chat operations a session depends on.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    /// Exchange credentials for a bearer token.
    async fn login(&self, username: &str, password: &str) -> Result<String>;
    /// Send one chat turn and return the raw reply body.
    async fn chat(&self, token: Option<&str>, text: &str) -> Result<Value>;
}

/// HTTP client for the login and agent chat endpoints.
#[derive(Debug, Clone)]
pub struct AgentApiClient {
    base_url: String,
    timeout: Duration,
    http: reqwest::Client,
}

#[derive(Debug, Serialize)]
struct LoginRequest<'a> {
    username: &'a str,
    password: &'a str,
}

#[derive(Debug, Deserialize)]
struct LoginResponse {
    #[serde(default)]
    token: Option<String>,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    text: &'a str,
}

impl AgentApiClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let base_url = normalize_base_url(base_url)?;
        Ok(Self {
            base_url,
            timeout: timeout.max(Duration::from_millis(250)),
            http: reqwest::Client::new(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    #[must_use]
    pub fn endpoint(&self, path: &str) -> String {
        let trimmed = path.trim();
        if trimmed.starts_with('/') {
            format!("{}{}", self.base_url, trimmed)
        } else {
            format!("{}/{}", self.base_url, trimmed)
        }
    }

    /// Exchange credentials for a bearer token.
    ///
    /// Any non-success status maps to [`ClientError::InvalidCredentials`].
    pub async fn login(&self, username: &str, password: &str) -> Result<String> {
        let response = self
            .http
            .post(self.endpoint(LOGIN_PATH))
            .header("x-request-id", request_id())
            .timeout(self.timeout)
            .json(&LoginRequest { username, password })
            .send()
            .await
            .map_err(|error| ClientError::Request(error.to_string()))?;

        let status = response.status();
        let bytes = read_body(response).await?;
        if !status.is_success() {
            warn!(%status, "login rejected");
            return Err(ClientError::InvalidCredentials);
        }

        let body: LoginResponse = serde_json::from_slice(&bytes)
            .map_err(|error| ClientError::Decode(error.to_string()))?;
        body.token
            .map(|token| token.trim().to_string())
            .filter(|token| !token.is_empty())
            .ok_or_else(|| ClientError::Decode("login response carried no token".to_string()))
    }

    /// Send one chat turn and return the raw reply body.
    ///
    /// Bodies that are not JSON come back as a JSON string.
    pub async fn chat(&self, token: Option<&str>, text: &str) -> Result<Value> {
        let mut request = self
            .http
            .post(self.endpoint(CHAT_PATH))
            .header("x-request-id", request_id())
            .timeout(self.timeout)
            .json(&ChatRequest { text });
        if let Some(token) = token.map(str::trim).filter(|token| !token.is_empty()) {
            request = request.header(AUTHORIZATION, format!("Bearer {token}"));
        }

        let response = request
            .send()
            .await
            .map_err(|error| ClientError::Request(error.to_string()))?;
        let status = response.status();
        let is_json = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .is_some_and(|value| value.contains("json"));
        let bytes = read_body(response).await?;

        if !status.is_success() {
            return Err(format_http_error(status, &bytes));
        }

        match serde_json::from_slice::<Value>(&bytes) {
            Ok(value) => Ok(value),
            Err(error) if is_json => Err(ClientError::Decode(error.to_string())),
            Err(_) => {
                debug!(bytes = bytes.len(), "chat reply is plain text");
                Ok(Value::String(String::from_utf8_lossy(&bytes).into_owned()))
            }
        }
    }
}

#[async_trait]
impl ChatBackend for AgentApiClient {
    async fn login(&self, username: &str, password: &str) -> Result<String> {
        AgentApiClient::login(self, username, password).await
    }

    async fn chat(&self, token: Option<&str>, text: &str) -> Result<Value> {
        AgentApiClient::chat(self, token, text).await
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

async fn read_body(response: reqwest::Response) -> Result<Vec<u8>> {
    response
        .bytes()
        .await
        .map(|bytes| bytes.to_vec())
        .map_err(|error| ClientError::Request(error.to_string()))
}

fn request_id() -> String {
    format!("req_{}", Uuid::new_v4().simple())
}

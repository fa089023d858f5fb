use crate::api::AgentApiClient;
use crate::connection::{ConnectionConfig, DEFAULT_HANDSHAKE_TIMEOUT};
use crate::error::{ClientError, Result};
use crate::protocol::DEFAULT_SOCKET_PATH;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_API_BASE_URL: &str = "http://localhost:8787";
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 60_000;

pub const ENV_API_BASE_URL: &str = "AGENT_CHAT_API_BASE_URL";
pub const ENV_WS_URL: &str = "AGENT_CHAT_WS_URL";
pub const ENV_WS_PATH: &str = "AGENT_CHAT_WS_PATH";
pub const ENV_HANDSHAKE_TIMEOUT_MS: &str = "AGENT_CHAT_HANDSHAKE_TIMEOUT_MS";
pub const ENV_TOKEN_DIR: &str = "AGENT_CHAT_TOKEN_DIR";

/// Endpoints and timeouts for one client session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    pub api_base_url: String,
    /// Realtime origin; defaults to the API base URL.
    pub ws_url: String,
    pub ws_path: String,
    pub request_timeout: Duration,
    pub connection: ConnectionConfig,
    /// Directory holding the persisted token, when overridden.
    pub token_dir: Option<PathBuf>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
            ws_url: DEFAULT_API_BASE_URL.to_string(),
            ws_path: DEFAULT_SOCKET_PATH.to_string(),
            request_timeout: Duration::from_millis(DEFAULT_REQUEST_TIMEOUT_MS),
            connection: ConnectionConfig::default(),
            token_dir: None,
        }
    }
}

impl ClientConfig {
    /// Resolve configuration from `AGENT_CHAT_*` variables over the defaults.
    pub fn from_env() -> Result<Self> {
        let api_base_url = normalize_base_url(
            &env_non_empty(ENV_API_BASE_URL).unwrap_or_else(|| DEFAULT_API_BASE_URL.to_string()),
        )?;
        let ws_url = match env_non_empty(ENV_WS_URL) {
            Some(ws_url) => normalize_base_url(&ws_url)?,
            None => api_base_url.clone(),
        };
        let ws_path = env_non_empty(ENV_WS_PATH).unwrap_or_else(|| DEFAULT_SOCKET_PATH.to_string());

        let mut connection = ConnectionConfig::default();
        if let Some(raw) = env_non_empty(ENV_HANDSHAKE_TIMEOUT_MS) {
            let millis = raw.parse::<u64>().map_err(|_| {
                ClientError::InvalidConfig(format!(
                    "{ENV_HANDSHAKE_TIMEOUT_MS} must be a number of milliseconds, got: {raw}"
                ))
            })?;
            connection.handshake_timeout = Duration::from_millis(millis.max(1));
        }

        Ok(Self {
            api_base_url,
            ws_url,
            ws_path,
            request_timeout: Duration::from_millis(DEFAULT_REQUEST_TIMEOUT_MS),
            connection,
            token_dir: env_non_empty(ENV_TOKEN_DIR).map(PathBuf::from),
        })
    }

    /// HTTP client for the login and chat endpoints.
    pub fn api_client(&self) -> Result<AgentApiClient> {
        AgentApiClient::new(&self.api_base_url, self.request_timeout)
    }

    #[must_use]
    pub fn handshake_timeout(&self) -> Duration {
        self.connection.handshake_timeout
    }

    /// Point both the API and the realtime channel at one origin.
    #[must_use]
    pub fn with_base_url(base_url: &str) -> Self {
        let base_url = base_url.trim().trim_end_matches('/').to_string();
        Self {
            api_base_url: base_url.clone(),
            ws_url: base_url,
            ..Self::default()
        }
    }
}

/// Trim and validate an `http(s)://host` base URL, dropping trailing slashes.
pub fn normalize_base_url(raw: &str) -> Result<String> {
    let trimmed = raw.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        return Err(ClientError::InvalidConfig("base url must not be empty".to_string()));
    }
    let Some((scheme, remainder)) = trimmed.split_once("://") else {
        return Err(ClientError::InvalidConfig(format!(
            "base url must use http:// or https://, got: {trimmed}"
        )));
    };
    if !matches!(scheme, "http" | "https") {
        return Err(ClientError::InvalidConfig(format!(
            "base url must use http:// or https://, got: {trimmed}"
        )));
    }
    if remainder.trim().is_empty() || remainder.starts_with('/') {
        return Err(ClientError::InvalidConfig(format!(
            "base url must include a host, got: {trimmed}"
        )));
    }
    Ok(trimmed.to_string())
}

fn env_non_empty(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

//! Authenticated HTTP access to the orchestrator.
//!
//! [`OrchestratorClient::connect`] performs the one-time credential exchange and
//! every later call goes through [`OrchestratorClient::request`]. The client
//! never retries: poll, heartbeat and report paths each choose their own policy.
//!
//! - [`protocol`]: request/response bodies and endpoint paths
//! - [`api`]: typed calls for each endpoint the agent uses
//! - [`redaction`]: scrubbing of credentials from log text

pub mod api;
pub mod protocol;
pub mod redaction;

use std::sync::atomic::{AtomicU64, Ordering};

use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Method, Url};
use serde::Serialize;

use crate::config::OrchestratorConfig;
use crate::error::{AgentError, Result};
use protocol::{LoginRequest, LOGIN_PATH};
use redaction::{printable_payload, TOKEN_HIDDEN};

const JSON_MIME: &str = "application/json";

/// Body of an outgoing request.
#[derive(Debug, Clone, Default)]
pub enum Payload {
    #[default]
    Empty,
    /// Serialized JSON, sent with `Content-Type: application/json`.
    Json(String),
    /// Raw bytes sent with the declared content type.
    Raw { bytes: Vec<u8>, content_type: String },
}

impl Payload {
    pub fn json<T: Serialize>(value: &T) -> Result<Self> {
        Ok(Payload::Json(serde_json::to_string(value)?))
    }

    fn content_type(&self) -> &str {
        match self {
            Payload::Raw { content_type, .. } => content_type,
            _ => JSON_MIME,
        }
    }

    fn as_bytes(&self) -> &[u8] {
        match self {
            Payload::Empty => &[],
            Payload::Json(text) => text.as_bytes(),
            Payload::Raw { bytes, .. } => bytes,
        }
    }
}

/// Status code and body of a successful (< 400) response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiResponse {
    pub status: u16,
    pub body: String,
}

pub struct OrchestratorClient {
    http: reqwest::Client,
    base_url: Url,
    token: Option<String>,
    counter: AtomicU64,
}

impl std::fmt::Debug for OrchestratorClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrchestratorClient")
            .field("base_url", &self.base_url.as_str())
            .field("token", &self.token.as_ref().map(|_| TOKEN_HIDDEN))
            .finish()
    }
}

impl OrchestratorClient {
    /// Builds a client and logs in. A failed login is fatal to startup.
    pub async fn connect(config: &OrchestratorConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()?;
        let base_url = Url::parse(&format!("http://{}:{}/", config.host, config.api_port))
            .map_err(|e| AgentError::Url(e.to_string()))?;

        let mut client = Self {
            http,
            base_url,
            token: None,
            counter: AtomicU64::new(0),
        };

        let login = Payload::json(&LoginRequest {
            username: &config.username,
            password: &config.password,
            domain: &config.domain,
        })?;
        let url = client.url_for(LOGIN_PATH)?;
        let response = client.send(Method::PUT, url, login, true).await?;
        client.token = Some(response.body.trim().replace('"', ""));

        tracing::info!(host = %config.host, port = config.api_port, user = %config.username, "Logged in to orchestrator");
        Ok(client)
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Resolves an absolute API path such as `/API/Execution/Status`.
    pub fn url_for(&self, path: &str) -> Result<Url> {
        self.base_url
            .join(path.trim_start_matches('/'))
            .map_err(|e| AgentError::Url(format!("{}: {}", path, e)))
    }

    /// Builds a URL from individually percent-escaped path segments.
    pub fn url_from_segments(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| AgentError::Config(format!("{} cannot be a base URL", self.base_url)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    /// Sends one request. Any status >= 400 is returned as
    /// [`AgentError::Status`].
    pub async fn request(&self, method: Method, path: &str, payload: Payload) -> Result<ApiResponse> {
        let url = self.url_for(path)?;
        self.send(method, url, payload, false).await
    }

    pub async fn request_url(&self, method: Method, url: Url, payload: Payload) -> Result<ApiResponse> {
        self.send(method, url, payload, false).await
    }

    fn headers(&self, payload: &Payload) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static(JSON_MIME));
        headers.insert(
            CONTENT_TYPE,
            HeaderValue::from_str(payload.content_type())
                .map_err(|e| AgentError::Config(format!("invalid content type: {e}")))?,
        );
        if let Some(token) = &self.token {
            // The login token is sent under the Basic scheme; the orchestrator expects exactly this.
            let value = HeaderValue::from_str(&format!("Basic {}", token))
                .map_err(|e| AgentError::Config(format!("invalid token: {e}")))?;
            headers.insert(AUTHORIZATION, value);
        }
        Ok(headers)
    }

    async fn send(
        &self,
        method: Method,
        url: Url,
        payload: Payload,
        hide_result: bool,
    ) -> Result<ApiResponse> {
        let request_id = self.counter.fetch_add(1, Ordering::Relaxed);
        let headers = self.headers(&payload)?;

        let logged_headers: Vec<(String, String)> = headers
            .iter()
            .map(|(name, value)| {
                let shown = if *name == AUTHORIZATION {
                    TOKEN_HIDDEN.to_string()
                } else {
                    value.to_str().unwrap_or_default().to_string()
                };
                (name.to_string(), shown)
            })
            .collect();
        tracing::debug!(
            request_id,
            method = %method,
            url = %url,
            headers = ?logged_headers,
            body = %printable_payload(payload.as_bytes()),
            "Request"
        );

        let mut builder = self.http.request(method, url).headers(headers);
        builder = match payload {
            Payload::Empty => builder,
            Payload::Json(text) => builder.body(text),
            Payload::Raw { bytes, .. } => builder.body(bytes),
        };

        let response = builder.send().await?;
        let status = response.status().as_u16();
        let bytes = response.bytes().await?;

        if hide_result {
            tracing::debug!(request_id, status, "Result: (hidden)");
        } else {
            tracing::debug!(request_id, status, body = %printable_payload(&bytes), "Result");
        }

        let body = String::from_utf8_lossy(&bytes).into_owned();
        if status >= 400 {
            return Err(AgentError::Status { status, body });
        }
        Ok(ApiResponse { status, body })
    }
}

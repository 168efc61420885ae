// ABOUTME: HTTP automation variant - drives a remote browser-automation service.
// ABOUTME: Implements Automation and SessionProbe over a small JSON protocol.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{
    Automation, AutomationFactory, AutomationSession, RawPost, RefreshedSession, SearchOptions,
    SessionProbe, SessionValidation,
};
use crate::error::AutomationError;

/// Connection settings for the remote automation service.
#[derive(Debug, Clone)]
pub struct HttpAutomationConfig {
    /// Base URL, e.g. `http://automation:8080`.
    pub base_url: String,

    /// Bearer token for the service.
    pub api_key: Option<String>,

    /// Per-request timeout.
    pub timeout: Duration,
}

impl HttpAutomationConfig {
    /// Create a config for the given base URL.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: None,
            timeout: Duration::from_secs(90),
        }
    }

    /// Load from AUTOMATION_URL and optional AUTOMATION_API_KEY.
    pub fn from_env() -> Result<Self, AutomationError> {
        let base_url = std::env::var("AUTOMATION_URL").map_err(|_| AutomationError::Api {
            status: 0,
            message: "AUTOMATION_URL environment variable not set".to_string(),
        })?;
        let mut config = Self::new(base_url);
        config.api_key = std::env::var("AUTOMATION_API_KEY").ok();
        Ok(config)
    }

    /// Set the bearer token.
    pub fn api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    /// Factory producing one HTTP-backed instance per worker slot.
    pub fn factory(&self) -> AutomationFactory {
        let config = self.clone();
        Arc::new(move || Box::new(HttpAutomation::new(config.clone())) as Box<dyn Automation>)
    }
}

#[derive(Debug, Serialize)]
struct SearchRequest<'a> {
    session_id: &'a str,
    account_id: &'a str,
    credentials: String,
    user_agent: &'a str,
    keywords: &'a [String],
    options: &'a SearchOptions,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    posts: Vec<RawPost>,
}

#[derive(Debug, Serialize)]
struct ValidateRequest<'a> {
    credentials: String,
    user_agent: &'a str,
}

#[derive(Debug, Serialize)]
struct RefreshRequest<'a> {
    session_id: &'a str,
    credentials: String,
    user_agent: &'a str,
}

#[derive(Debug, Deserialize)]
struct SessionResponse {
    #[serde(default)]
    valid: Option<bool>,
    #[serde(default)]
    credentials: Option<String>,
    #[serde(default)]
    expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

/// Client for the remote automation service.
#[derive(Debug, Clone)]
pub struct HttpAutomation {
    config: HttpAutomationConfig,
    http: reqwest::Client,
    shut_down: bool,
}

impl HttpAutomation {
    /// Create a client for the given service.
    pub fn new(config: HttpAutomationConfig) -> Self {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .unwrap_or_default();
        Self {
            config,
            http,
            shut_down: false,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url, path)
    }

    async fn post<B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<reqwest::Response, AutomationError> {
        let mut request = self
            .http
            .post(self.url(path))
            .header("Content-Type", "application/json")
            .json(body);
        if let Some(key) = &self.config.api_key {
            request = request.header("Authorization", format!("Bearer {}", key));
        }

        let response = request.send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let text = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<ErrorBody>(&text)
            .ok()
            .and_then(|b| b.message.or(b.error))
            .unwrap_or(text);
        Err(classify_status(status.as_u16(), message))
    }
}

/// Map a non-success status from the service onto the error taxonomy.
fn classify_status(status: u16, message: String) -> AutomationError {
    match status {
        401 | 403 => AutomationError::SessionInvalid(message),
        429 => AutomationError::Blocked(message),
        500..=599 => AutomationError::Transient(format!("service error {}: {}", status, message)),
        _ => AutomationError::Api { status, message },
    }
}

#[async_trait]
impl Automation for HttpAutomation {
    async fn initialize(&mut self) -> Result<(), AutomationError> {
        let response = self.http.get(self.url("/health")).send().await?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(classify_status(status.as_u16(), text));
        }
        self.shut_down = false;
        Ok(())
    }

    async fn search(
        &mut self,
        session: &AutomationSession,
        keywords: &[String],
        options: &SearchOptions,
    ) -> Result<Vec<RawPost>, AutomationError> {
        if self.shut_down {
            return Err(AutomationError::ShutDown);
        }

        let body = SearchRequest {
            session_id: &session.session_id,
            account_id: &session.account_id,
            credentials: String::from_utf8_lossy(&session.credentials).into_owned(),
            user_agent: &session.user_agent,
            keywords,
            options,
        };

        let response: SearchResponse = self.post("/search", &body).await?.json().await?;
        Ok(response.posts)
    }

    async fn shutdown(&mut self) -> Result<(), AutomationError> {
        self.shut_down = true;
        Ok(())
    }
}

#[async_trait]
impl SessionProbe for HttpAutomation {
    async fn validate(
        &self,
        credentials: &[u8],
        user_agent: &str,
    ) -> Result<SessionValidation, AutomationError> {
        let body = ValidateRequest {
            credentials: String::from_utf8_lossy(credentials).into_owned(),
            user_agent,
        };
        let response: SessionResponse = self.post("/sessions/validate", &body).await?.json().await?;

        if response.valid == Some(false) {
            return Err(AutomationError::SessionInvalid(
                response
                    .message
                    .unwrap_or_else(|| "session rejected".to_string()),
            ));
        }
        Ok(SessionValidation {
            expires_at: response.expires_at,
        })
    }

    async fn refresh(
        &self,
        session: &AutomationSession,
    ) -> Result<RefreshedSession, AutomationError> {
        let body = RefreshRequest {
            session_id: &session.session_id,
            credentials: String::from_utf8_lossy(&session.credentials).into_owned(),
            user_agent: &session.user_agent,
        };
        let response: SessionResponse = self.post("/sessions/refresh", &body).await?.json().await?;

        if response.valid == Some(false) {
            return Err(AutomationError::SessionInvalid(
                response
                    .message
                    .unwrap_or_else(|| "refresh rejected".to_string()),
            ));
        }
        Ok(RefreshedSession {
            credentials: response.credentials.map(String::into_bytes),
            expires_at: response.expires_at,
        })
    }
}

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

use crate::credentials::SessionCredential;
use crate::models::{UsageData, UsageSection};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

const USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

/// The broad class of a fetch failure, which decides how the poll loop reacts.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    Network,
    Auth,
    RateLimit,
    Other,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum FetchError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Rate limited by the usage service")]
    RateLimited { retry_after: Option<Duration> },

    #[error("Unexpected response: {0}")]
    Upstream(String),

    #[error("Fetch cancelled")]
    Cancelled,
}

impl FetchError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            FetchError::Network(_) => ErrorKind::Network,
            FetchError::Auth(_) => ErrorKind::Auth,
            FetchError::RateLimited { .. } => ErrorKind::RateLimit,
            FetchError::Upstream(_) | FetchError::Cancelled => ErrorKind::Other,
        }
    }

    pub fn no_credentials() -> Self {
        FetchError::Auth("No session key stored".to_string())
    }
}

/// Anything that can produce a usage snapshot for a credential.
pub trait UsageSource: Send {
    fn fetch(&self, credential: &SessionCredential) -> Result<UsageData, FetchError>;
}

/// Fetches usage from the claude.ai web API with the browser session cookie.
pub struct ClaudeWebSource {
    agent: ureq::Agent,
    base_url: String,
}

impl ClaudeWebSource {
    pub fn new(base_url: &str) -> Result<Self, FetchError> {
        let tls = Arc::new(
            native_tls::TlsConnector::new().map_err(|e| FetchError::Network(e.to_string()))?,
        );
        let agent = ureq::AgentBuilder::new()
            .timeout(REQUEST_TIMEOUT)
            .tls_connector(tls)
            .build();
        Ok(Self {
            agent,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn get(&self, path: &str, credential: &SessionCredential) -> Result<ureq::Response, FetchError> {
        let url = format!("{}{path}", self.base_url);
        let referer = format!("{}/chats", self.base_url);
        let result = self
            .agent
            .get(&url)
            .set("Cookie", &credential.cookie_header())
            .set("User-Agent", USER_AGENT)
            .set("Accept", "application/json")
            .set("Accept-Language", "en-US,en;q=0.9")
            .set("Referer", &referer)
            .call();

        match result {
            Ok(resp) => Ok(resp),
            Err(ureq::Error::Status(code, resp)) => {
                let retry_after = resp.header("retry-after").and_then(parse_retry_after);
                let body = resp.into_string().unwrap_or_default();
                Err(classify_status(code, &body, retry_after))
            }
            Err(ureq::Error::Transport(t)) => Err(FetchError::Network(t.to_string())),
        }
    }
}

impl UsageSource for ClaudeWebSource {
    fn fetch(&self, credential: &SessionCredential) -> Result<UsageData, FetchError> {
        let orgs = self.get("/api/organizations", credential)?;
        let orgs: Vec<Organization> = orgs
            .into_json()
            .map_err(|e| FetchError::Upstream(format!("organizations: {e}")))?;
        let org = orgs
            .first()
            .ok_or_else(|| FetchError::Upstream("account has no organizations".to_string()))?;
        debug!("Fetching usage for organization {}", org.uuid);

        let usage = self.get(&format!("/api/organizations/{}/usage", org.uuid), credential)?;
        let body = usage
            .into_string()
            .map_err(|e| FetchError::Network(e.to_string()))?;
        parse_usage(&body, Utc::now())
    }
}

#[derive(Debug, Deserialize)]
struct Organization {
    uuid: String,
}

#[derive(Debug, Default, Deserialize)]
struct UsageResponse {
    five_hour: Option<UsageWindowResponse>,
    seven_day: Option<UsageWindowResponse>,
}

#[derive(Debug, Deserialize)]
struct UsageWindowResponse {
    #[serde(default)]
    utilization: Option<f64>,
    #[serde(default)]
    resets_at: Option<String>,
}

impl UsageWindowResponse {
    fn into_section(self) -> UsageSection {
        let resets_at = self.resets_at.as_deref().and_then(parse_timestamp);
        UsageSection::new(self.utilization.unwrap_or(0.0), resets_at)
    }
}

/// Parse the usage endpoint body. A window missing from the body reads as 0%.
pub fn parse_usage(body: &str, fetched_at: DateTime<Utc>) -> Result<UsageData, FetchError> {
    let response: UsageResponse = serde_json::from_str(body)
        .map_err(|e| FetchError::Upstream(format!("usage body: {e}")))?;
    Ok(UsageData {
        session: response
            .five_hour
            .map(UsageWindowResponse::into_section)
            .unwrap_or_default(),
        weekly: response
            .seven_day
            .map(UsageWindowResponse::into_section)
            .unwrap_or_default(),
        fetched_at: Some(fetched_at),
    })
}

fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

/// Map a non-success HTTP status onto the retry classes.
pub fn classify_status(status: u16, body: &str, retry_after: Option<Duration>) -> FetchError {
    match status {
        401 => FetchError::Auth(extract_error_message(body, status)),
        429 => FetchError::RateLimited { retry_after },
        500..=599 => FetchError::Network(extract_error_message(body, status)),
        _ => FetchError::Upstream(extract_error_message(body, status)),
    }
}

fn parse_retry_after(value: &str) -> Option<Duration> {
    value.trim().parse::<u64>().ok().map(Duration::from_secs)
}

fn extract_error_message(body: &str, status: u16) -> String {
    if let Ok(json) = serde_json::from_str::<serde_json::Value>(body) {
        if let Some(msg) = json.get("error").and_then(|e| e.get("message")).and_then(|m| m.as_str())
        {
            return format!("HTTP {status}: {msg}");
        }
    }
    let truncated: String = body.chars().take(200).collect();
    format!("HTTP {status}: {truncated}")
}

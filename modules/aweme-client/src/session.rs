use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use aweme_common::SessionId;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, COOKIE};
use tracing::{debug, info};
use url::Url;

use crate::clock::Clock;
use crate::error::{FetchError, Result};
use crate::pacing::{Pace, PacingGovernor, PacingState};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

/// Failures below the HTTP layer. Each maps onto a retry class.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("timed out: {0}")]
    Timeout(String),
    #[error("connection pool exhausted: {0}")]
    PoolExhausted(String),
    #[error("{0}")]
    Other(String),
}

/// An authenticated HTTP transport bound to one account.
#[async_trait]
pub trait SessionPort: Send + Sync {
    async fn get(&self, url: &Url) -> std::result::Result<RawResponse, TransportError>;
}

// ---------------------------------------------------------------------------
// reqwest-backed session
// ---------------------------------------------------------------------------

const BROWSER_HEADERS: &[(&str, &str)] = &[
    ("authority", "www.douyin.com"),
    ("sec-ch-ua", "\"Not_A Brand\";v=\"8\", \"Chromium\";v=\"120\""),
    ("accept", "application/json, text/plain, */*"),
    ("dnt", "1"),
    ("sec-ch-ua-mobile", "?0"),
    ("sec-ch-ua-platform", "\"macOS\""),
    ("sec-fetch-site", "same-origin"),
    ("sec-fetch-mode", "cors"),
    ("sec-fetch-dest", "empty"),
    ("referer", "https://www.douyin.com/user"),
    ("accept-language", "en-US,en;q=0.9,zh-CN;q=0.8,zh;q=0.7"),
];

pub struct HttpSession {
    client: reqwest::Client,
}

impl HttpSession {
    pub fn new(user_agent: &str, cookies: &BTreeMap<String, String>) -> Result<Self> {
        let mut headers = HeaderMap::new();
        for (name, value) in BROWSER_HEADERS {
            headers.insert(
                HeaderName::from_static(*name),
                HeaderValue::from_static(*value),
            );
        }
        if !cookies.is_empty() {
            let jar = cookies
                .iter()
                .map(|(k, v)| format!("{k}={v}"))
                .collect::<Vec<_>>()
                .join("; ");
            let value = HeaderValue::from_str(&jar)
                .map_err(|e| FetchError::Config(format!("cookie header: {e}")))?;
            headers.insert(COOKIE, value);
        }

        let client = reqwest::Client::builder()
            .user_agent(user_agent)
            .default_headers(headers)
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|e| FetchError::Config(format!("http client: {e}")))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl SessionPort for HttpSession {
    async fn get(&self, url: &Url) -> std::result::Result<RawResponse, TransportError> {
        let resp = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(classify_reqwest)?;
        let status = resp.status().as_u16();
        let body = resp.bytes().await.map_err(classify_reqwest)?;
        Ok(RawResponse {
            status,
            body: body.to_vec(),
        })
    }
}

pub fn classify_reqwest(err: reqwest::Error) -> TransportError {
    let msg = err.to_string();
    if err.is_connect() {
        TransportError::Connect(msg)
    } else if err.is_timeout() {
        TransportError::Timeout(msg)
    } else if is_exhaustion(&msg) {
        TransportError::PoolExhausted(msg)
    } else {
        TransportError::Other(msg)
    }
}

fn is_exhaustion(msg: &str) -> bool {
    msg.contains("Too many open files") || msg.contains("pool")
}

/// Cookie file layout: `{"main": {name: value}, "alt": {...}}`. A missing file
/// yields anonymous sessions.
pub fn load_cookies(path: &Path) -> Result<HashMap<SessionId, BTreeMap<String, String>>> {
    if !path.exists() {
        return Ok(HashMap::new());
    }
    let content = std::fs::read_to_string(path)
        .map_err(|e| FetchError::Config(format!("{}: {e}", path.display())))?;
    serde_json::from_str(&content)
        .map_err(|e| FetchError::Config(format!("{}: {e}", path.display())))
}

// ---------------------------------------------------------------------------
// Session: account identity + transport + pacing state
// ---------------------------------------------------------------------------

/// One logged-in account. Owned by a single caller; requests on a session
/// are strictly sequential so its visit counter stays ordered.
pub struct Session {
    id: SessionId,
    port: Arc<dyn SessionPort>,
    governor: PacingGovernor,
}

impl Session {
    pub fn new(id: SessionId, port: Arc<dyn SessionPort>, governor: PacingGovernor) -> Self {
        Self { id, port, governor }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn pacing(&self) -> &PacingState {
        self.governor.state()
    }

    pub(crate) fn port(&self) -> &dyn SessionPort {
        self.port.as_ref()
    }

    /// Block until this session may issue its next request.
    pub async fn pace(&mut self, clock: &dyn Clock) -> Pace {
        let pace = self.governor.schedule(clock.now());
        let count = self.governor.state().visit_count;
        match pace {
            Pace::Fresh => debug!(session = %self.id, "pacing: first visit"),
            Pace::Wait { wait } => info!(
                session = %self.id,
                wait_secs = wait.as_secs_f64(),
                count,
                "pacing: sleeping"
            ),
            Pace::Immediate { behind } => debug!(
                session = %self.id,
                behind_secs = behind.as_secs_f64(),
                count,
                "pacing: no sleep needed"
            ),
            Pace::IdleReset { idle } => info!(
                session = %self.id,
                idle_secs = idle.as_secs_f64(),
                "pacing: idle for over an hour, visit count reset"
            ),
        }
        clock.sleep(pace.wait()).await;
        self.governor.complete(clock.now());
        pace
    }
}

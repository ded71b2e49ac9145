use std::fmt;
use std::sync::Arc;

use serde_json::{Map, Value};
use tracing::{debug, info};
use url::Url;

use crate::clock::Clock;
use crate::error::{FetchError, Result};
use crate::retry::{FailureClass, RetryPolicy};
use crate::session::{RawResponse, Session, TransportError};
use crate::signing::{SigningPort, SIGNATURE_PARAM};

/// Executes one logical GET: pace the session, sign the query, then retry
/// until a 200 with a body comes back or the failure is fatal.
pub struct RetryingTransport {
    signer: Arc<dyn SigningPort>,
    clock: Arc<dyn Clock>,
    policy: RetryPolicy,
}

/// Outcome of a single attempt that did not produce a usable response.
#[derive(Debug)]
enum AttemptError {
    Transport(TransportError),
    Status(u16),
    Rejected(u16),
    Unexpected { status: u16, len: usize },
}

impl fmt::Display for AttemptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttemptError::Transport(e) => write!(f, "{e}"),
            AttemptError::Status(status) => write!(f, "HTTP {status}"),
            AttemptError::Rejected(status) => write!(f, "HTTP {status} (session rejected)"),
            AttemptError::Unexpected { status, len } => {
                write!(f, "HTTP {status} with {len} bytes")
            }
        }
    }
}

fn classify(err: &AttemptError) -> FailureClass {
    match err {
        AttemptError::Transport(TransportError::Connect(_))
        | AttemptError::Transport(TransportError::Timeout(_)) => FailureClass::Connectivity,
        AttemptError::Transport(TransportError::PoolExhausted(_)) => FailureClass::Exhaustion,
        AttemptError::Transport(TransportError::Other(_)) | AttemptError::Status(_) => {
            FailureClass::Transient
        }
        AttemptError::Rejected(_) | AttemptError::Unexpected { .. } => FailureClass::Fatal,
    }
}

fn accept(resp: RawResponse) -> std::result::Result<RawResponse, AttemptError> {
    match resp.status {
        200 if !resp.body.is_empty() => Ok(resp),
        401 | 403 => Err(AttemptError::Rejected(resp.status)),
        s if (200..300).contains(&s) => Err(AttemptError::Unexpected {
            status: s,
            len: resp.body.len(),
        }),
        s => Err(AttemptError::Status(s)),
    }
}

impl RetryingTransport {
    pub fn new(signer: Arc<dyn SigningPort>, clock: Arc<dyn Clock>, policy: RetryPolicy) -> Self {
        Self {
            signer,
            clock,
            policy,
        }
    }

    pub fn clock(&self) -> &dyn Clock {
        self.clock.as_ref()
    }

    /// Merge `params` into the URL's query (replacing same-named keys), drop
    /// any stale signature, and append a fresh one.
    pub async fn sign_url(&self, url: &str, params: &[(String, String)]) -> Result<Url> {
        let mut url = Url::parse(url)?;

        let mut pairs: Vec<(String, String)> = url
            .query_pairs()
            .into_owned()
            .filter(|(k, _)| k != SIGNATURE_PARAM)
            .collect();
        for (key, value) in params.iter().filter(|(k, _)| k != SIGNATURE_PARAM) {
            match pairs.iter_mut().find(|(k, _)| k == key) {
                Some(slot) => slot.1 = value.clone(),
                None => pairs.push((key.clone(), value.clone())),
            }
        }
        url.query_pairs_mut().clear().extend_pairs(pairs.iter());

        let query = url.query().unwrap_or_default().to_string();
        let token = self.signer.sign(&query).await?;
        url.query_pairs_mut().append_pair(SIGNATURE_PARAM, &token);
        Ok(url)
    }

    pub async fn get(
        &self,
        session: &mut Session,
        url: &str,
        params: &[(String, String)],
    ) -> Result<RawResponse> {
        session.pace(self.clock.as_ref()).await;
        let target = self.sign_url(url, params).await?;
        info!(session = %session.id(), url = %target.path(), "fetching");

        let port = session.port();
        let target_ref = &target;
        let outcome = self
            .policy
            .run(self.clock.as_ref(), target.path(), classify, move || async move {
                let resp = port.get(target_ref).await.map_err(AttemptError::Transport)?;
                accept(resp)
            })
            .await;

        match outcome {
            Ok(resp) => {
                debug!(bytes = resp.body.len(), "fetched");
                Ok(resp)
            }
            Err(failure) if failure.exhausted => Err(FetchError::RetriesExhausted {
                url: target.to_string(),
                attempts: failure.attempts,
                last: failure.error.to_string(),
            }),
            Err(failure) => Err(match failure.error {
                AttemptError::Rejected(status) => FetchError::SessionInvalid {
                    session: session.id(),
                    status,
                    url: target.to_string(),
                },
                AttemptError::Unexpected { status, len } => FetchError::Unexpected {
                    url: target.to_string(),
                    status,
                    len,
                },
                other => FetchError::RetriesExhausted {
                    url: target.to_string(),
                    attempts: failure.attempts,
                    last: other.to_string(),
                },
            }),
        }
    }

    pub async fn get_json(
        &self,
        session: &mut Session,
        url: &str,
        params: &[(String, String)],
    ) -> Result<Value> {
        let resp = self.get(session, url, params).await?;
        serde_json::from_slice(&resp.body).map_err(|e| FetchError::Json {
            url: url.to_string(),
            message: e.to_string(),
        })
    }

    /// GET a JSON API endpoint whose envelope must report `status_code == 0`.
    pub async fn get_envelope(
        &self,
        session: &mut Session,
        url: &str,
        params: &[(String, String)],
    ) -> Result<Map<String, Value>> {
        let value = self.get_json(session, url, params).await?;
        check_envelope(url, value)
    }
}

pub(crate) fn check_envelope(url: &str, value: Value) -> Result<Map<String, Value>> {
    let Value::Object(body) = value else {
        return Err(FetchError::Envelope {
            url: url.to_string(),
            detail: "response is not a JSON object".into(),
        });
    };
    match body.get("status_code").and_then(Value::as_i64) {
        Some(0) => Ok(body),
        Some(code) => Err(FetchError::Envelope {
            url: url.to_string(),
            detail: format!(
                "status_code {code}: {}",
                body.get("status_msg").and_then(Value::as_str).unwrap_or("")
            ),
        }),
        None => Err(FetchError::Envelope {
            url: url.to_string(),
            detail: "missing status_code".into(),
        }),
    }
}

/// Build an owned parameter list from literals.
pub fn params(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

// Test doubles for the client ports.
//
// - ManualClock (Clock): virtual time, sleeps advance it and are recorded
// - FixedSigner (SigningPort): constant token, records every signed query
// - ScriptedSession (SessionPort): URL-substring routes → queued responses

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;
use url::Url;

use aweme_common::SessionId;

use crate::clock::Clock;
use crate::error::Result;
use crate::pacing::{PacingGovernor, PacingProfile};
use crate::session::{RawResponse, Session, SessionPort, TransportError};
use crate::signing::{ensure_unsigned, SigningPort};

// ---------------------------------------------------------------------------
// ManualClock
// ---------------------------------------------------------------------------

pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
    sleeps: Mutex<Vec<Duration>>,
}

impl ManualClock {
    pub fn at(now: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(now),
            sleeps: Mutex::new(Vec::new()),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap();
        *now += chrono::TimeDelta::from_std(by).unwrap();
    }

    pub fn set(&self, to: DateTime<Utc>) {
        *self.now.lock().unwrap() = to;
    }

    pub fn sleeps(&self) -> Vec<Duration> {
        self.sleeps.lock().unwrap().clone()
    }

    pub fn total_slept(&self) -> Duration {
        self.sleeps().iter().sum()
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::at(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap())
    }
}

#[async_trait]
impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }

    async fn sleep(&self, duration: Duration) {
        if duration.is_zero() {
            return;
        }
        self.sleeps.lock().unwrap().push(duration);
        self.advance(duration);
    }
}

// ---------------------------------------------------------------------------
// FixedSigner
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct FixedSigner {
    signed: Mutex<Vec<String>>,
}

impl FixedSigner {
    pub const TOKEN: &'static str = "SIGNED";

    pub fn new() -> Self {
        Self::default()
    }

    pub fn signed(&self) -> Vec<String> {
        self.signed.lock().unwrap().clone()
    }
}

#[async_trait]
impl SigningPort for FixedSigner {
    async fn sign(&self, query: &str) -> Result<String> {
        ensure_unsigned(query)?;
        self.signed.lock().unwrap().push(query.to_string());
        Ok(Self::TOKEN.to_string())
    }
}

// ---------------------------------------------------------------------------
// ScriptedSession
// ---------------------------------------------------------------------------

type Reply = std::result::Result<RawResponse, TransportError>;

struct Route {
    needle: String,
    replies: VecDeque<Reply>,
    /// Replay the last reply once the queue drains.
    sticky: bool,
}

/// Replies are looked up by the first route whose needle occurs in the
/// requested URL and which still has replies queued. Unmatched requests get
/// a 404. Builder pattern: `.on_json()`, `.on_status()`, `.on_error()`.
#[derive(Default)]
pub struct ScriptedSession {
    routes: Mutex<Vec<Route>>,
    requests: Mutex<Vec<Url>>,
}

impl ScriptedSession {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(self, needle: &str, reply: Reply, sticky: bool) -> Self {
        {
            let mut routes = self.routes.lock().unwrap();
            match routes
                .iter_mut()
                .find(|r| r.needle == needle && r.sticky == sticky)
            {
                Some(route) => route.replies.push_back(reply),
                None => routes.push(Route {
                    needle: needle.to_string(),
                    replies: VecDeque::from([reply]),
                    sticky,
                }),
            }
        }
        self
    }

    pub fn on_json(self, needle: &str, body: Value) -> Self {
        self.on_status(needle, 200, body.to_string().as_bytes())
    }

    pub fn on_status(self, needle: &str, status: u16, body: &[u8]) -> Self {
        let reply = Ok(RawResponse {
            status,
            body: body.to_vec(),
        });
        self.push(needle, reply, false)
    }

    pub fn on_error(self, needle: &str, error: TransportError) -> Self {
        self.push(needle, Err(error), false)
    }

    /// Answer every matching request with the same status and body.
    pub fn always(self, needle: &str, status: u16, body: &[u8]) -> Self {
        let reply = Ok(RawResponse {
            status,
            body: body.to_vec(),
        });
        self.push(needle, reply, true)
    }

    pub fn requests(&self) -> Vec<Url> {
        self.requests.lock().unwrap().clone()
    }

    pub fn into_session(self, id: SessionId) -> (Session, Arc<ScriptedSession>) {
        let port = Arc::new(self);
        let governor = PacingGovernor::seeded(PacingProfile::classic(), 42);
        (Session::new(id, port.clone(), governor), port)
    }
}

#[async_trait]
impl SessionPort for ScriptedSession {
    async fn get(&self, url: &Url) -> Reply {
        self.requests.lock().unwrap().push(url.clone());
        let target = url.as_str();
        let mut routes = self.routes.lock().unwrap();
        for route in routes.iter_mut() {
            if !target.contains(&route.needle) {
                continue;
            }
            if route.sticky {
                if let Some(reply) = route.replies.back() {
                    return reply.clone();
                }
            } else if let Some(reply) = route.replies.pop_front() {
                return reply;
            }
        }
        Ok(RawResponse {
            status: 404,
            body: Vec::new(),
        })
    }
}

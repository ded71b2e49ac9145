//! Cursor-paginated listings.
//!
//! Each walk issues one request per page through the retrying transport and
//! validates the envelope and ordering before handing items back. Walks are
//! resumable: callers pull pages one at a time and may stop early.

use aweme_common::{lenient_u64, RawItem, Source, UserRef};
use serde_json::{Map, Value};
use tracing::debug;

use crate::endpoints::{following_params, post_list_params, FOLLOWING_URL, POST_LIST_URL};
use crate::error::{FetchError, Result};
use crate::session::Session;
use crate::transport::RetryingTransport;

fn envelope_err(url: &str, detail: impl Into<String>) -> FetchError {
    FetchError::Envelope {
        url: url.to_string(),
        detail: detail.into(),
    }
}

fn take_flag(body: &mut Map<String, Value>, url: &str, key: &str) -> Result<bool> {
    match body.remove(key) {
        Some(Value::Bool(b)) => Ok(b),
        Some(Value::Number(n)) => Ok(n.as_i64().unwrap_or(0) != 0),
        _ => Err(envelope_err(url, format!("missing {key}"))),
    }
}

fn take_cursor(body: &mut Map<String, Value>, url: &str, key: &str) -> Result<u64> {
    body.remove(key)
        .as_ref()
        .and_then(lenient_u64)
        .ok_or_else(|| envelope_err(url, format!("missing {key}")))
}

fn take_list(body: &mut Map<String, Value>, url: &str, key: &str) -> Result<Vec<Value>> {
    match body.remove(key) {
        Some(Value::Array(list)) => Ok(list),
        Some(Value::Null) => Ok(Vec::new()),
        _ => Err(envelope_err(url, format!("missing {key}"))),
    }
}

/// Guards a cursor that must never increase across a walk.
#[derive(Debug)]
struct Cursor {
    name: &'static str,
    value: Option<u64>,
}

impl Cursor {
    fn new(name: &'static str) -> Self {
        Self { name, value: None }
    }

    /// Returns whether the cursor moved.
    fn advance(&mut self, next: u64) -> Result<bool> {
        match self.value {
            Some(prev) if next > prev => Err(FetchError::CursorRegression {
                what: self.name,
                previous: prev.to_string(),
                current: next.to_string(),
            }),
            Some(prev) if next == prev => Ok(false),
            _ => {
                self.value = Some(next);
                Ok(true)
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Posts
// ---------------------------------------------------------------------------

/// Walks a user's post listing, newest first. Pinned posts come at the top
/// of the first page; everything after is strictly chronological.
pub struct PostWalk {
    params: Vec<(String, String)>,
    cursor: Cursor,
    done: bool,
    pages: u32,
    last_time: Option<i64>,
    last_id: Option<u64>,
}

impl PostWalk {
    pub fn new(user: &UserRef) -> Self {
        Self {
            params: post_list_params(user),
            cursor: Cursor::new("max_cursor"),
            done: false,
            pages: 0,
            last_time: None,
            last_id: None,
        }
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Fetch the next page. `Ok(None)` once the listing is exhausted.
    pub async fn next_page(
        &mut self,
        transport: &RetryingTransport,
        session: &mut Session,
    ) -> Result<Option<Vec<RawItem>>> {
        if self.done {
            return Ok(None);
        }
        let mut params = self.params.clone();
        if let Some(cursor) = self.cursor.value {
            params.push(("max_cursor".to_string(), cursor.to_string()));
        }
        let body = transport
            .get_envelope(session, POST_LIST_URL, &params)
            .await?;
        self.absorb(body).map(Some)
    }

    fn absorb(&mut self, mut body: Map<String, Value>) -> Result<Vec<RawItem>> {
        let has_more = take_flag(&mut body, POST_LIST_URL, "has_more")?;
        let next_cursor = take_cursor(&mut body, POST_LIST_URL, "max_cursor")?;
        let list = take_list(&mut body, POST_LIST_URL, "aweme_list")?;

        let mut items = Vec::with_capacity(list.len());
        for entry in list {
            let Value::Object(obj) = entry else {
                return Err(envelope_err(POST_LIST_URL, "aweme_list entry is not an object"));
            };
            let item = RawItem::new(Source::Timeline, obj)
                .map_err(|e| envelope_err(POST_LIST_URL, e.to_string()))?;
            self.check_order(&item)?;
            items.push(item);
        }

        self.pages += 1;
        let moved = self.cursor.advance(next_cursor)?;
        if !has_more {
            self.done = true;
        } else if !moved {
            return Err(envelope_err(
                POST_LIST_URL,
                format!("max_cursor stalled at {next_cursor} with has_more set"),
            ));
        }
        debug!(
            page = self.pages,
            items = items.len(),
            has_more,
            cursor = next_cursor,
            "post page"
        );
        Ok(items)
    }

    fn check_order(&mut self, item: &RawItem) -> Result<()> {
        if item.is_pinned() {
            if self.last_id.is_some() {
                return Err(FetchError::CursorRegression {
                    what: "pinned post after chronological run",
                    previous: self.last_id.map(|id| id.to_string()).unwrap_or_default(),
                    current: item.id.to_string(),
                });
            }
            return Ok(());
        }

        let time = item.create_time().ok_or_else(|| {
            envelope_err(POST_LIST_URL, format!("post {} has no create_time", item.id))
        })?;
        if let Some(prev) = self.last_time.filter(|prev| time > *prev) {
            return Err(FetchError::CursorRegression {
                what: "create_time",
                previous: prev.to_string(),
                current: time.to_string(),
            });
        }
        if let Some(prev) = self.last_id.filter(|prev| item.id > *prev) {
            return Err(FetchError::CursorRegression {
                what: "aweme_id",
                previous: prev.to_string(),
                current: item.id.to_string(),
            });
        }
        self.last_time = Some(time);
        self.last_id = Some(item.id);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Following list
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct FollowingEntry {
    pub uid: u64,
    pub sec_uid: String,
    pub nickname: String,
    pub unique_id: Option<String>,
}

impl FollowingEntry {
    fn from_json(obj: &Map<String, Value>) -> Result<Self> {
        let text = |key: &str| {
            obj.get(key)
                .and_then(Value::as_str)
                .map(str::to_string)
                .filter(|s| !s.is_empty())
        };
        let uid = obj
            .get("uid")
            .and_then(lenient_u64)
            .ok_or_else(|| envelope_err(FOLLOWING_URL, "following entry without uid"))?;
        let sec_uid = text("sec_uid")
            .ok_or_else(|| envelope_err(FOLLOWING_URL, format!("user {uid} has no sec_uid")))?;
        let short_id = text("short_id").filter(|s| s != "0");
        Ok(Self {
            uid,
            sec_uid,
            nickname: text("nickname").unwrap_or_default(),
            unique_id: text("unique_id").or(short_id),
        })
    }

    pub fn homepage(&self) -> String {
        format!("https://www.douyin.com/user/{}", self.sec_uid)
    }
}

/// Walks the accounts a user follows, newest follow first.
pub struct FollowingWalk {
    params: Vec<(String, String)>,
    cursor: Cursor,
    done: bool,
}

impl FollowingWalk {
    pub fn new(user: &UserRef) -> Self {
        Self {
            params: following_params(user),
            cursor: Cursor::new("min_time"),
            done: false,
        }
    }

    pub async fn next_page(
        &mut self,
        transport: &RetryingTransport,
        session: &mut Session,
    ) -> Result<Option<Vec<FollowingEntry>>> {
        if self.done {
            return Ok(None);
        }
        let mut params = self.params.clone();
        if let Some(cursor) = self.cursor.value {
            params.retain(|(k, _)| k != "max_time");
            params.push(("max_time".to_string(), cursor.to_string()));
        }
        let body = transport
            .get_envelope(session, FOLLOWING_URL, &params)
            .await?;
        self.absorb(body).map(Some)
    }

    /// Drain the whole list.
    pub async fn collect(
        mut self,
        transport: &RetryingTransport,
        session: &mut Session,
    ) -> Result<Vec<FollowingEntry>> {
        let mut all = Vec::new();
        while let Some(page) = self.next_page(transport, session).await? {
            all.extend(page);
        }
        Ok(all)
    }

    fn absorb(&mut self, mut body: Map<String, Value>) -> Result<Vec<FollowingEntry>> {
        let has_more = take_flag(&mut body, FOLLOWING_URL, "has_more")?;
        let list = take_list(&mut body, FOLLOWING_URL, "followings")?;
        let entries = list
            .iter()
            .map(|v| match v {
                Value::Object(obj) => FollowingEntry::from_json(obj),
                _ => Err(envelope_err(FOLLOWING_URL, "following entry is not an object")),
            })
            .collect::<Result<Vec<_>>>()?;

        if has_more {
            let next = take_cursor(&mut body, FOLLOWING_URL, "min_time")?;
            if !self.cursor.advance(next)? {
                return Err(envelope_err(
                    FOLLOWING_URL,
                    format!("min_time stalled at {next} with has_more set"),
                ));
            }
        } else {
            self.done = true;
        }
        Ok(entries)
    }
}

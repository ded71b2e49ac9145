use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Flat, ordered field name → value mapping. Shared shape for parsed
/// payloads, canonical records and persisted rows.
pub type FieldMap = BTreeMap<String, Value>;

/// Which logged-in account a request goes out on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionId {
    Main,
    Alt,
}

impl SessionId {
    /// Followed accounts are browsed on the main account; everyone else on
    /// the alternate one so the main account's history stays plausible.
    pub fn for_following(following: bool) -> Self {
        if following {
            SessionId::Main
        } else {
            SessionId::Alt
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SessionId::Main => "main",
            SessionId::Alt => "alt",
        }
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The endpoint an item was read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    /// The paginated per-user post listing.
    Timeline,
    /// The single-post detail endpoint.
    Page,
}

impl Source {
    pub fn as_str(&self) -> &'static str {
        match self {
            Source::Timeline => "timeline",
            Source::Page => "page",
        }
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{origin} item has no usable aweme_id")]
pub struct MissingItemId {
    pub origin: Source,
}

/// One post exactly as an endpoint returned it. Never mutated after
/// construction; parsing works on a copy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawItem {
    pub id: u64,
    pub source: Source,
    pub body: Map<String, Value>,
}

impl RawItem {
    pub fn new(source: Source, body: Map<String, Value>) -> Result<Self, MissingItemId> {
        let id = body
            .get("aweme_id")
            .and_then(lenient_u64)
            .ok_or(MissingItemId { origin: source })?;
        Ok(Self { id, source, body })
    }

    pub fn author_id(&self) -> Option<u64> {
        self.body.get("author_user_id").and_then(lenient_u64)
    }

    /// Pinned posts are listed ahead of the chronological run.
    pub fn is_pinned(&self) -> bool {
        match self.body.get("is_top") {
            Some(Value::Bool(b)) => *b,
            Some(v) => v.as_i64().unwrap_or(0) != 0,
            None => false,
        }
    }

    pub fn create_time(&self) -> Option<i64> {
        self.body.get("create_time").and_then(Value::as_i64)
    }

    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        self.create_time()
            .and_then(|ts| Utc.timestamp_opt(ts, 0).single())
    }

    pub fn has_images(&self) -> bool {
        matches!(self.body.get("images"), Some(Value::Array(list)) if !list.is_empty())
    }

    pub fn blog_url(&self) -> String {
        blog_url(self.id, self.has_images())
    }
}

pub fn blog_url(id: u64, has_images: bool) -> String {
    if has_images {
        format!("https://www.douyin.com/note/{id}")
    } else {
        format!("https://www.douyin.com/video/{id}")
    }
}

/// The platform serializes 64-bit ids as strings in some places and numbers
/// in others.
pub fn lenient_u64(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Null, empty string, empty array and empty object. Zero and `false` are
/// meaningful values, not blanks.
pub fn is_blank(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        Value::Array(a) => a.is_empty(),
        Value::Object(o) => o.is_empty(),
        Value::Bool(_) | Value::Number(_) => false,
    }
}

/// A user as given on the command line or in a following list: numeric uid,
/// `sec_uid`, or a profile URL ending in the `sec_uid`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum UserRef {
    Uid(u64),
    SecUid(String),
}

impl UserRef {
    /// Query parameters that identify this user to the web API.
    pub fn query_params(&self) -> Vec<(String, String)> {
        match self {
            UserRef::Uid(uid) => vec![("user_id".to_string(), uid.to_string())],
            UserRef::SecUid(sec) => vec![("sec_user_id".to_string(), sec.clone())],
        }
    }
}

impl FromStr for UserRef {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err("empty user reference".to_string());
        }
        if let Ok(uid) = s.parse::<u64>() {
            return Ok(UserRef::Uid(uid));
        }
        let without_query = s.split('?').next().unwrap_or(s);
        let sec = without_query
            .trim_end_matches('/')
            .rsplit('/')
            .next()
            .unwrap_or(without_query);
        if sec.is_empty() {
            return Err(format!("cannot find a user id in {s}"));
        }
        Ok(UserRef::SecUid(sec.to_string()))
    }
}

impl fmt::Display for UserRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UserRef::Uid(uid) => write!(f, "{uid}"),
            UserRef::SecUid(sec) => f.write_str(sec),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn body(v: Value) -> Map<String, Value> {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn raw_item_reads_string_ids() {
        let item = RawItem::new(
            Source::Timeline,
            body(json!({"aweme_id": "7301", "author_user_id": 42, "is_top": 1})),
        )
        .unwrap();
        assert_eq!(item.id, 7301);
        assert_eq!(item.author_id(), Some(42));
        assert!(item.is_pinned());
    }

    #[test]
    fn raw_item_without_id_is_rejected() {
        let err = RawItem::new(Source::Page, body(json!({"desc": "x"}))).unwrap_err();
        assert_eq!(err.origin, Source::Page);
    }

    #[test]
    fn blog_url_depends_on_images() {
        let note = RawItem::new(
            Source::Page,
            body(json!({"aweme_id": 9, "images": [{"uri": "a"}]})),
        )
        .unwrap();
        assert_eq!(note.blog_url(), "https://www.douyin.com/note/9");

        let video = RawItem::new(Source::Page, body(json!({"aweme_id": 9, "images": null}))).unwrap();
        assert_eq!(video.blog_url(), "https://www.douyin.com/video/9");
    }

    #[test]
    fn blank_values() {
        assert!(is_blank(&json!(null)));
        assert!(is_blank(&json!("")));
        assert!(is_blank(&json!([])));
        assert!(is_blank(&json!({})));
        assert!(!is_blank(&json!(0)));
        assert!(!is_blank(&json!(false)));
        assert!(!is_blank(&json!("x")));
    }

    #[test]
    fn user_ref_parsing() {
        assert_eq!("12345".parse::<UserRef>().unwrap(), UserRef::Uid(12345));
        assert_eq!(
            "https://www.douyin.com/user/MS4wLjABAAAA?from=share"
                .parse::<UserRef>()
                .unwrap(),
            UserRef::SecUid("MS4wLjABAAAA".to_string())
        );
        assert!("  ".parse::<UserRef>().is_err());
    }

    #[test]
    fn session_for_following() {
        assert_eq!(SessionId::for_following(true), SessionId::Main);
        assert_eq!(SessionId::for_following(false), SessionId::Alt);
    }
}

//! Typed decoding of upstream payloads into flat field maps.
//!
//! Each decoder consumes the keys it understands through serde structs and
//! collects the leftovers via `#[serde(flatten)]`, nested blocks included.
//! Leftovers on the ignore list are dropped; everything else is carried into
//! the record as-is (nested ones under a dotted key such as `video.foo`) and
//! left for the upsert step to quarantine.

mod post;
mod user;

pub use post::{decode_post, POST_IGNORED_KEYS};
pub use user::{decode_user, homepage, USER_IGNORED_KEYS};

use aweme_common::{is_blank, lenient_u64, FieldMap};
use serde::{Deserialize, Deserializer};
use serde_json::{Map, Value};

use crate::error::{ArchiveError, Result};

pub(crate) fn lenient_id<'de, D>(deserializer: D) -> std::result::Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    lenient_u64(&value)
        .ok_or_else(|| serde::de::Error::custom(format!("expected an integer id, got {value}")))
}

pub(crate) fn lenient_opt_id<'de, D>(deserializer: D) -> std::result::Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(v) => lenient_u64(&v)
            .map(Some)
            .ok_or_else(|| serde::de::Error::custom(format!("expected an integer id, got {v}"))),
    }
}

pub(crate) fn lenient_opt_f64<'de, D>(deserializer: D) -> std::result::Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => Ok(n.as_f64()),
        Some(Value::String(s)) => s
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| serde::de::Error::custom(format!("expected a number, got {s:?}"))),
        Some(v) => Err(serde::de::Error::custom(format!("expected a number, got {v}"))),
    }
}

/// Leftovers of a nested block, minus the ignored keys, qualified with the
/// block's path.
pub(crate) fn nested(prefix: &str, rest: Map<String, Value>, ignored: &[&str]) -> Map<String, Value> {
    rest.into_iter()
        .filter(|(key, _)| !ignored.contains(&key.as_str()))
        .map(|(key, value)| (format!("{prefix}.{key}"), value))
        .collect()
}

/// Accumulates output fields and refuses silent overwrites.
pub(crate) struct FieldSink {
    entity: &'static str,
    id: u64,
    fields: FieldMap,
}

impl FieldSink {
    pub(crate) fn new(entity: &'static str, id: u64) -> Self {
        Self {
            entity,
            id,
            fields: FieldMap::new(),
        }
    }

    pub(crate) fn set(&mut self, field: &str, value: impl Into<Value>) {
        self.fields.insert(field.to_string(), value.into());
    }

    pub(crate) fn set_opt<V: Into<Value>>(&mut self, field: &str, value: Option<V>) {
        if let Some(v) = value {
            self.set(field, v);
        }
    }

    /// Merge a block of fields; a key that already holds a different value
    /// is drift.
    pub(crate) fn merge(&mut self, origin: &str, block: Map<String, Value>) -> Result<()> {
        for (key, value) in block {
            match self.fields.get(&key) {
                Some(existing) if *existing != value => {
                    return Err(ArchiveError::drift(
                        self.entity,
                        self.id,
                        key,
                        format!("{origin} carries {value}, already have {existing}"),
                    ));
                }
                Some(_) => {}
                None => {
                    self.fields.insert(key, value);
                }
            }
        }
        Ok(())
    }

    /// Drop null, empty strings, empty lists and empty objects.
    pub(crate) fn finish(self) -> FieldMap {
        self.fields
            .into_iter()
            .filter(|(_, v)| !is_blank(v))
            .collect()
    }
}

/// Remove ignored keys from the leftovers.
pub(crate) fn strip_ignored(rest: &mut Map<String, Value>, ignored: &[&str]) {
    for key in ignored {
        rest.remove(*key);
    }
}

use aweme_common::FieldMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Flat, normalized view of one entity. Recomputed from cached payloads on
/// demand and never stored as the source of truth.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalRecord {
    pub id: u64,
    pub fields: FieldMap,
}

impl CanonicalRecord {
    pub fn new(id: u64, fields: FieldMap) -> Self {
        Self { id, fields }
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    pub fn str_field(&self, field: &str) -> Option<&str> {
        self.fields.get(field).and_then(Value::as_str)
    }

    pub fn i64_field(&self, field: &str) -> Option<i64> {
        self.fields.get(field).and_then(Value::as_i64)
    }

    pub fn is_video(&self) -> bool {
        self.fields
            .get("is_video")
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    pub fn content_hash(&self) -> Option<&str> {
        self.str_field("content_hash").filter(|h| !h.is_empty())
    }

    /// A video whose transcode has not settled: no hash or no size yet.
    pub fn is_unfinished_video(&self) -> bool {
        self.is_video() && (self.content_hash().is_none() || self.i64_field("content_size").is_none())
    }
}

/// What the entity store holds for one id: known columns plus any fields the
/// schema did not recognize.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedEntity {
    pub id: u64,
    pub fields: FieldMap,
    pub unknown_fields: Option<FieldMap>,
}

impl PersistedEntity {
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    pub fn str_field(&self, field: &str) -> Option<&str> {
        self.fields.get(field).and_then(Value::as_str)
    }

    pub fn i64_field(&self, field: &str) -> Option<i64> {
        self.fields.get(field).and_then(Value::as_i64)
    }

    pub fn bool_field(&self, field: &str) -> Option<bool> {
        self.fields.get(field).and_then(Value::as_bool)
    }

    pub fn str_list(&self, field: &str) -> Vec<String> {
        match self.fields.get(field) {
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect(),
            _ => Vec::new(),
        }
    }
}

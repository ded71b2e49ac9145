use std::collections::BTreeSet;
use std::sync::Arc;

use aweme_common::{is_blank, FieldMap};
use chrono::DateTime;
use serde_json::Value;
use tracing::{info, warn};

use crate::error::{ArchiveError, Result};
use crate::record::{CanonicalRecord, PersistedEntity};
use crate::schema::EntitySchema;
use crate::store::EntityStore;

const UNKNOWN_FIELDS: &str = "unknown_fields";

#[derive(Debug, Clone, PartialEq)]
pub struct FieldChange {
    pub field: String,
    /// Previous value; `None` when the field was not set before.
    pub old: Option<Value>,
    /// New value; `None` when the field disappeared.
    pub new: Option<Value>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct UpsertDiff {
    pub changes: Vec<FieldChange>,
}

impl UpsertDiff {
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn fields(&self) -> Vec<&str> {
        self.changes.iter().map(|c| c.field.as_str()).collect()
    }

    pub fn get(&self, field: &str) -> Option<&FieldChange> {
        self.changes.iter().find(|c| c.field == field)
    }
}

#[derive(Debug, Clone)]
pub struct UpsertOutcome {
    pub entity: PersistedEntity,
    pub diff: UpsertDiff,
    pub inserted: bool,
    /// Names of fields moved into the unknown-fields bag.
    pub quarantined: Vec<String>,
}

/// Validates canonical records against a schema and writes them by id.
pub struct UpsertEngine {
    schema: EntitySchema,
    store: Arc<dyn EntityStore>,
}

impl UpsertEngine {
    pub fn new(schema: EntitySchema, store: Arc<dyn EntityStore>) -> Self {
        Self { schema, store }
    }

    pub fn schema(&self) -> &EntitySchema {
        &self.schema
    }

    pub async fn get(&self, id: u64) -> Result<Option<PersistedEntity>> {
        self.store.get_by_id(id).await
    }

    pub async fn upsert(&self, record: CanonicalRecord) -> Result<UpsertOutcome> {
        let entity = self.schema.entity;
        let CanonicalRecord { id, fields } = record;

        let (mut known, unknown) = self.partition(id, fields)?;
        let quarantined: Vec<String> = unknown.keys().cloned().collect();
        if !quarantined.is_empty() {
            warn!(entity, id, fields = ?quarantined, "unknown fields quarantined");
        }

        for (field, value) in &known {
            if is_blank(value) && !self.schema.is_volatile(field) {
                return Err(ArchiveError::BlankValue {
                    entity,
                    id,
                    field: field.clone(),
                });
            }
        }

        let prior = self.store.get_by_id(id).await?;

        for fallback in &self.schema.fallbacks {
            if known.contains_key(fallback.field) {
                continue;
            }
            let value = prior
                .as_ref()
                .and_then(|p| p.get(fallback.field).cloned())
                .or_else(|| fallback.derive(&known));
            if let Some(value) = value {
                known.insert(fallback.field.to_string(), value);
            }
        }

        for field in &self.schema.required {
            if !known.contains_key(*field) {
                return Err(ArchiveError::BlankValue {
                    entity,
                    id,
                    field: field.to_string(),
                });
            }
        }

        if let Some(prior) = &prior {
            self.check_monotonic(id, prior, &known)?;
        }

        let unknown_fields = (!unknown.is_empty()).then_some(unknown);
        let next = PersistedEntity {
            id,
            fields: known,
            unknown_fields,
        };

        let diff = match &prior {
            Some(prior) => self.diff(prior, &next),
            None => UpsertDiff::default(),
        };
        for change in &diff.changes {
            if let Some(new) = &change.new {
                info!(entity, id, "+{}: {}", change.field, new);
            }
            if let Some(old) = &change.old {
                info!(entity, id, "-{}: {}", change.field, old);
            }
        }

        let inserted = prior.is_none();
        if inserted {
            self.store.insert(&next).await?;
        } else {
            self.store.replace(id, &next).await?;
        }

        Ok(UpsertOutcome {
            entity: next,
            diff,
            inserted,
            quarantined,
        })
    }

    fn partition(&self, id: u64, fields: FieldMap) -> Result<(FieldMap, FieldMap)> {
        let mut known = FieldMap::new();
        let mut unknown = FieldMap::new();
        for (field, value) in fields {
            if field == UNKNOWN_FIELDS {
                return Err(ArchiveError::drift(
                    self.schema.entity,
                    id,
                    field,
                    "reserved name in payload",
                ));
            }
            if field == "id" {
                if value.as_u64() != Some(id) {
                    return Err(ArchiveError::drift(self.schema.entity, id, field, value.to_string()));
                }
                continue;
            }
            if self.schema.is_known(&field) {
                known.insert(field, value);
            } else {
                unknown.insert(field, value);
            }
        }
        Ok((known, unknown))
    }

    fn check_monotonic(&self, id: u64, prior: &PersistedEntity, next: &FieldMap) -> Result<()> {
        for field in &self.schema.monotonic {
            let (Some(old), Some(new)) = (prior.get(field), next.get(field)) else {
                continue;
            };
            let parse = |v: &Value| {
                instant(v).ok_or_else(|| {
                    ArchiveError::drift(self.schema.entity, id, field.clone(), format!("not a time: {v}"))
                })
            };
            if parse(new)? < parse(old)? {
                return Err(ArchiveError::Monotonicity {
                    entity: self.schema.entity,
                    id,
                    field: field.clone(),
                    previous: old.to_string(),
                    current: new.to_string(),
                });
            }
        }
        Ok(())
    }

    fn diff(&self, prior: &PersistedEntity, next: &PersistedEntity) -> UpsertDiff {
        let keys: BTreeSet<&String> = prior.fields.keys().chain(next.fields.keys()).collect();
        let mut changes: Vec<FieldChange> = keys
            .into_iter()
            .filter(|k| !self.schema.is_volatile(k) && !self.schema.is_monotonic(k))
            .filter_map(|k| {
                let (old, new) = (prior.fields.get(k), next.fields.get(k));
                (old != new).then(|| FieldChange {
                    field: k.clone(),
                    old: old.cloned(),
                    new: new.cloned(),
                })
            })
            .collect();

        if prior.unknown_fields != next.unknown_fields {
            let bag = |b: &Option<FieldMap>| {
                b.as_ref()
                    .map(|m| Value::Object(m.clone().into_iter().collect()))
            };
            changes.push(FieldChange {
                field: UNKNOWN_FIELDS.to_string(),
                old: bag(&prior.unknown_fields),
                new: bag(&next.unknown_fields),
            });
        }
        UpsertDiff { changes }
    }
}

/// Microseconds since the epoch, from an RFC 3339 string or a unix number.
fn instant(value: &Value) -> Option<i64> {
    match value {
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|t| t.timestamp_micros()),
        Value::Number(n) => n.as_i64().map(|secs| secs.saturating_mul(1_000_000)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryEntityStore;
    use serde_json::json;

    fn fields(v: Value) -> FieldMap {
        v.as_object().cloned().unwrap().into_iter().collect()
    }

    fn post(extra: Value) -> CanonicalRecord {
        let mut f = fields(json!({
            "user_id": 42,
            "nickname": "_cat_",
            "create_time": 1_700_000_000,
            "blog_url": "https://www.douyin.com/video/1",
            "desc": "hello",
            "digg_count": 10,
            "updated_at": "2024-01-01T00:00:00.000000Z",
        }));
        f.extend(fields(extra));
        CanonicalRecord::new(1, f)
    }

    fn engine() -> (UpsertEngine, Arc<MemoryEntityStore>) {
        let store = Arc::new(MemoryEntityStore::new());
        (UpsertEngine::new(EntitySchema::posts(), store.clone()), store)
    }

    #[tokio::test]
    async fn first_upsert_inserts_with_fallback_username() {
        let (engine, store) = engine();
        let out = engine.upsert(post(json!({}))).await.unwrap();
        assert!(out.inserted);
        assert!(out.diff.is_empty());
        assert_eq!(out.entity.str_field("username"), Some("cat"));
        assert_eq!(store.snapshot().len(), 1);
    }

    #[tokio::test]
    async fn volatile_change_yields_empty_diff() {
        let (engine, _) = engine();
        engine.upsert(post(json!({}))).await.unwrap();
        let out = engine
            .upsert(post(json!({"digg_count": 11, "updated_at": "2024-01-02T00:00:00Z"})))
            .await
            .unwrap();
        assert!(!out.inserted);
        assert!(out.diff.is_empty(), "{:?}", out.diff);
        assert_eq!(out.entity.i64_field("digg_count"), Some(11));
    }

    #[tokio::test]
    async fn changed_field_is_reported_with_previous_value() {
        let (engine, _) = engine();
        engine.upsert(post(json!({}))).await.unwrap();
        let out = engine.upsert(post(json!({"desc": "edited"}))).await.unwrap();
        assert_eq!(
            out.diff.changes,
            vec![FieldChange {
                field: "desc".into(),
                old: Some(json!("hello")),
                new: Some(json!("edited")),
            }]
        );
    }

    #[tokio::test]
    async fn removed_field_is_reported() {
        let (engine, _) = engine();
        engine.upsert(post(json!({"region": "CN"}))).await.unwrap();
        let out = engine.upsert(post(json!({}))).await.unwrap();
        let change = out.diff.get("region").unwrap();
        assert_eq!(change.new, None);
        assert_eq!(change.old, Some(json!("CN")));
    }

    #[tokio::test]
    async fn unknown_field_is_quarantined() {
        let (engine, _) = engine();
        let out = engine.upsert(post(json!({"foo": 1}))).await.unwrap();
        assert_eq!(out.quarantined, vec!["foo".to_string()]);
        assert_eq!(out.entity.unknown_fields, Some(fields(json!({"foo": 1}))));
        assert!(out.entity.get("foo").is_none());
    }

    #[tokio::test]
    async fn updated_at_regression_is_fatal() {
        let (engine, _) = engine();
        engine
            .upsert(post(json!({"updated_at": "2024-06-01T00:00:00Z"})))
            .await
            .unwrap();
        let err = engine.upsert(post(json!({}))).await.unwrap_err();
        assert!(matches!(err, ArchiveError::Monotonicity { ref field, .. } if field == "updated_at"));
    }

    #[tokio::test]
    async fn blank_value_is_fatal() {
        let (engine, _) = engine();
        let err = engine.upsert(post(json!({"desc": ""}))).await.unwrap_err();
        assert!(matches!(err, ArchiveError::BlankValue { ref field, .. } if field == "desc"));
    }

    #[tokio::test]
    async fn zero_and_false_are_not_blank() {
        let (engine, _) = engine();
        let out = engine
            .upsert(post(json!({"is_story": false, "duration": 0})))
            .await
            .unwrap();
        assert_eq!(out.entity.bool_field("is_story"), Some(false));
    }

    #[tokio::test]
    async fn prior_username_wins_over_derived() {
        let (engine, _) = engine();
        engine.upsert(post(json!({"username": "Kitty"}))).await.unwrap();
        let out = engine.upsert(post(json!({}))).await.unwrap();
        assert_eq!(out.entity.str_field("username"), Some("Kitty"));
        assert!(out.diff.is_empty());
    }

    #[tokio::test]
    async fn missing_required_field_is_fatal() {
        let (engine, _) = engine();
        let mut record = post(json!({}));
        record.fields.remove("blog_url");
        let err = engine.upsert(record).await.unwrap_err();
        assert!(matches!(err, ArchiveError::BlankValue { ref field, .. } if field == "blog_url"));
    }

    #[tokio::test]
    async fn reserved_unknown_fields_key_is_drift() {
        let (engine, _) = engine();
        let err = engine
            .upsert(post(json!({"unknown_fields": {"x": 1}})))
            .await
            .unwrap_err();
        assert!(matches!(err, ArchiveError::SchemaDrift { .. }));
    }
}

//! Integration tests for the Postgres stores.
//! Requires a Postgres instance. Set DATABASE_TEST_URL or these tests are skipped.

use aweme_archive::testing::{raw, video_post};
use aweme_archive::{
    migrate, CacheRecord, CacheStore, EntityStore, PersistedEntity, PgCacheStore, PgEntityStore,
    PgSubscriptionStore, Subscription, SubscriptionStore,
};
use aweme_common::{FieldMap, Source};
use chrono::{Duration, DurationRound, Utc};
use serde_json::json;
use sqlx::PgPool;

/// Get a migrated test database pool, or skip if no test DB is available.
async fn test_pool() -> Option<PgPool> {
    let url = std::env::var("DATABASE_TEST_URL").ok()?;
    let pool = PgPool::connect(&url).await.ok()?;
    migrate(&pool).await.ok()?;

    // Clean slate for each test
    sqlx::query("TRUNCATE posts, users, post_cache, subscriptions")
        .execute(&pool)
        .await
        .ok()?;

    Some(pool)
}

fn now() -> chrono::DateTime<Utc> {
    // Postgres keeps microseconds
    Utc::now().duration_trunc(Duration::microseconds(1)).unwrap()
}

#[tokio::test]
async fn entity_insert_replace_roundtrip() {
    let Some(pool) = test_pool().await else {
        return;
    };
    let store = PgEntityStore::posts(pool);
    let mut fields = FieldMap::new();
    fields.insert("desc".into(), json!("hello"));
    let mut entity = PersistedEntity {
        id: 7301,
        fields,
        unknown_fields: None,
    };

    store.insert(&entity).await.unwrap();
    assert!(store.insert(&entity).await.is_err());

    entity.fields.insert("desc".into(), json!("edited"));
    entity.unknown_fields = Some(FieldMap::from([("foo".to_string(), json!(1))]));
    store.replace(7301, &entity).await.unwrap();

    assert_eq!(store.get_by_id(7301).await.unwrap(), Some(entity));
    assert!(store.replace(1, &PersistedEntity { id: 1, fields: FieldMap::new(), unknown_fields: None }).await.is_err());
}

#[tokio::test]
async fn cache_put_overwrites_by_id() {
    let Some(pool) = test_pool().await else {
        return;
    };
    let store = PgCacheStore::new(pool);
    let t0 = now();

    let mut record = CacheRecord::new(raw(Source::Timeline, video_post(9, None)), t0).unwrap();
    store.put(&record).await.unwrap();
    record
        .absorb(raw(Source::Page, video_post(9, Some("abc"))), t0 + Duration::seconds(1))
        .unwrap();
    store.put(&record).await.unwrap();

    assert_eq!(store.get(9).await.unwrap(), Some(record.clone()));
    assert_eq!(store.for_user(42).await.unwrap(), vec![record]);
}

#[tokio::test]
async fn due_subscriptions() {
    let Some(pool) = test_pool().await else {
        return;
    };
    let store = PgSubscriptionStore::new(pool);
    let t0 = now();

    let fresh = Subscription::new(1, "a", true);
    let mut later = Subscription::new(2, "b", false);
    later.next_fetch_at = Some(t0 + Duration::hours(3));
    let mut cached = Subscription::new(3, "c", false);
    cached.fetch_enabled = None;
    cached.cached_at = Some(t0);
    for s in [&fresh, &later, &cached] {
        store.put(s).await.unwrap();
    }

    let due: Vec<u64> = store.due(t0).await.unwrap().iter().map(|s| s.user_id).collect();
    assert_eq!(due, vec![1]);
    assert_eq!(store.get(2).await.unwrap(), Some(later));
}

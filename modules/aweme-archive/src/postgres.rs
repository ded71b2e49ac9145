//! Postgres implementations of the storage ports.

use async_trait::async_trait;
use aweme_common::{FieldMap, RawItem, Source};
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use sqlx::types::Json;
use sqlx::PgPool;

use crate::cache::{CacheRecord, CacheStore};
use crate::error::{ArchiveError, Result};
use crate::record::PersistedEntity;
use crate::store::EntityStore;
use crate::subscription::{Subscription, SubscriptionStore};

/// Apply the bundled migrations.
pub async fn migrate(pool: &PgPool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .map_err(|e| ArchiveError::Other(e.into()))
}

fn db_id(id: u64) -> Result<i64> {
    i64::try_from(id).map_err(|_| ArchiveError::Other(anyhow::anyhow!("id {id} exceeds BIGINT")))
}

fn app_id(id: i64) -> Result<u64> {
    u64::try_from(id).map_err(|_| ArchiveError::Other(anyhow::anyhow!("negative id {id} in database")))
}

#[derive(sqlx::FromRow)]
struct EntityRow {
    id: i64,
    fields: Json<FieldMap>,
    unknown_fields: Option<Json<FieldMap>>,
}

impl EntityRow {
    fn into_entity(self) -> Result<PersistedEntity> {
        Ok(PersistedEntity {
            id: app_id(self.id)?,
            fields: self.fields.0,
            unknown_fields: self.unknown_fields.map(|j| j.0),
        })
    }
}

/// Entity rows in one of the fixed tables created by the migrations.
pub struct PgEntityStore {
    pool: PgPool,
    table: &'static str,
}

impl PgEntityStore {
    pub fn posts(pool: PgPool) -> Self {
        Self { pool, table: "posts" }
    }

    pub fn users(pool: PgPool) -> Self {
        Self { pool, table: "users" }
    }
}

#[async_trait]
impl EntityStore for PgEntityStore {
    async fn get_by_id(&self, id: u64) -> Result<Option<PersistedEntity>> {
        let row = sqlx::query_as::<_, EntityRow>(&format!(
            "SELECT id, fields, unknown_fields FROM {} WHERE id = $1",
            self.table
        ))
        .bind(db_id(id)?)
        .fetch_optional(&self.pool)
        .await?;
        row.map(EntityRow::into_entity).transpose()
    }

    async fn insert(&self, entity: &PersistedEntity) -> Result<()> {
        sqlx::query(&format!(
            "INSERT INTO {} (id, fields, unknown_fields) VALUES ($1, $2, $3)",
            self.table
        ))
        .bind(db_id(entity.id)?)
        .bind(Json(&entity.fields))
        .bind(entity.unknown_fields.as_ref().map(Json))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn replace(&self, id: u64, entity: &PersistedEntity) -> Result<()> {
        let result = sqlx::query(&format!(
            "UPDATE {} SET fields = $2, unknown_fields = $3, written_at = now() WHERE id = $1",
            self.table
        ))
        .bind(db_id(id)?)
        .bind(Json(&entity.fields))
        .bind(entity.unknown_fields.as_ref().map(Json))
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(ArchiveError::Other(anyhow::anyhow!(
                "cannot replace missing {} row {id}",
                self.table
            )));
        }
        Ok(())
    }
}

#[derive(sqlx::FromRow)]
struct CacheRow {
    id: i64,
    user_id: i64,
    blog_url: String,
    from_timeline: Option<Json<Map<String, Value>>>,
    from_page: Option<Json<Map<String, Value>>>,
    added_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl CacheRow {
    fn into_record(self) -> Result<CacheRecord> {
        let id = app_id(self.id)?;
        let item = |source, body: Option<Json<Map<String, Value>>>| {
            body.map(|Json(body)| RawItem { id, source, body })
        };
        Ok(CacheRecord {
            id,
            user_id: app_id(self.user_id)?,
            blog_url: self.blog_url,
            from_timeline: item(Source::Timeline, self.from_timeline),
            from_page: item(Source::Page, self.from_page),
            added_at: self.added_at,
            updated_at: self.updated_at,
        })
    }
}

pub struct PgCacheStore {
    pool: PgPool,
}

impl PgCacheStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CacheStore for PgCacheStore {
    async fn get(&self, id: u64) -> Result<Option<CacheRecord>> {
        let row = sqlx::query_as::<_, CacheRow>("SELECT * FROM post_cache WHERE id = $1")
            .bind(db_id(id)?)
            .fetch_optional(&self.pool)
            .await?;
        row.map(CacheRow::into_record).transpose()
    }

    async fn put(&self, record: &CacheRecord) -> Result<()> {
        sqlx::query(
            "INSERT INTO post_cache (id, user_id, blog_url, from_timeline, from_page, added_at, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7)
             ON CONFLICT (id)
             DO UPDATE SET user_id = EXCLUDED.user_id,
                          blog_url = EXCLUDED.blog_url,
                          from_timeline = EXCLUDED.from_timeline,
                          from_page = EXCLUDED.from_page,
                          updated_at = EXCLUDED.updated_at",
        )
        .bind(db_id(record.id)?)
        .bind(db_id(record.user_id)?)
        .bind(&record.blog_url)
        .bind(record.from_timeline.as_ref().map(|i| Json(&i.body)))
        .bind(record.from_page.as_ref().map(|i| Json(&i.body)))
        .bind(record.added_at)
        .bind(record.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn for_user(&self, user_id: u64) -> Result<Vec<CacheRecord>> {
        let rows = sqlx::query_as::<_, CacheRow>(
            "SELECT * FROM post_cache WHERE user_id = $1 ORDER BY id DESC",
        )
        .bind(db_id(user_id)?)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(CacheRow::into_record).collect()
    }
}

#[derive(sqlx::FromRow)]
struct SubscriptionRow {
    user_id: i64,
    username: String,
    following: bool,
    fetch_enabled: Option<bool>,
    fetched_at: Option<DateTime<Utc>>,
    first_fetched_at: Option<DateTime<Utc>>,
    cached_at: Option<DateTime<Utc>>,
    post_at: Option<DateTime<Utc>>,
    post_cycle_hours: Option<i64>,
    next_fetch_at: Option<DateTime<Utc>>,
}

impl SubscriptionRow {
    fn into_subscription(self) -> Result<Subscription> {
        Ok(Subscription {
            user_id: app_id(self.user_id)?,
            username: self.username,
            following: self.following,
            fetch_enabled: self.fetch_enabled,
            fetched_at: self.fetched_at,
            first_fetched_at: self.first_fetched_at,
            cached_at: self.cached_at,
            post_at: self.post_at,
            post_cycle_hours: self.post_cycle_hours,
            next_fetch_at: self.next_fetch_at,
        })
    }
}

pub struct PgSubscriptionStore {
    pool: PgPool,
}

impl PgSubscriptionStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SubscriptionStore for PgSubscriptionStore {
    async fn get(&self, user_id: u64) -> Result<Option<Subscription>> {
        let row = sqlx::query_as::<_, SubscriptionRow>(
            "SELECT * FROM subscriptions WHERE user_id = $1",
        )
        .bind(db_id(user_id)?)
        .fetch_optional(&self.pool)
        .await?;
        row.map(SubscriptionRow::into_subscription).transpose()
    }

    async fn put(&self, s: &Subscription) -> Result<()> {
        sqlx::query(
            "INSERT INTO subscriptions (user_id, username, following, fetch_enabled, fetched_at,
                                        first_fetched_at, cached_at, post_at, post_cycle_hours, next_fetch_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
             ON CONFLICT (user_id)
             DO UPDATE SET username = EXCLUDED.username,
                          following = EXCLUDED.following,
                          fetch_enabled = EXCLUDED.fetch_enabled,
                          fetched_at = EXCLUDED.fetched_at,
                          first_fetched_at = EXCLUDED.first_fetched_at,
                          cached_at = EXCLUDED.cached_at,
                          post_at = EXCLUDED.post_at,
                          post_cycle_hours = EXCLUDED.post_cycle_hours,
                          next_fetch_at = EXCLUDED.next_fetch_at",
        )
        .bind(db_id(s.user_id)?)
        .bind(&s.username)
        .bind(s.following)
        .bind(s.fetch_enabled)
        .bind(s.fetched_at)
        .bind(s.first_fetched_at)
        .bind(s.cached_at)
        .bind(s.post_at)
        .bind(s.post_cycle_hours)
        .bind(s.next_fetch_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn due(&self, now: DateTime<Utc>) -> Result<Vec<Subscription>> {
        let rows = sqlx::query_as::<_, SubscriptionRow>(
            "SELECT * FROM subscriptions
             WHERE (fetch_enabled IS TRUE OR (fetch_enabled IS NULL AND cached_at IS NULL))
               AND (next_fetch_at IS NULL OR next_fetch_at <= $1)
             ORDER BY next_fetch_at NULLS FIRST, user_id",
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(SubscriptionRow::into_subscription).collect()
    }
}

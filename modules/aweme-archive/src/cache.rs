use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use aweme_common::{lenient_u64, RawItem, Source};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{ArchiveError, Result};
use crate::reconcile::Reconciler;

/// Everything we have seen of one post, one slot per source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheRecord {
    pub id: u64,
    pub user_id: u64,
    pub blog_url: String,
    pub from_timeline: Option<RawItem>,
    pub from_page: Option<RawItem>,
    pub added_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

fn author_of(item: &RawItem) -> Result<u64> {
    item.author_id()
        .or_else(|| {
            item.body
                .get("author")
                .and_then(|a| a.get("uid"))
                .and_then(lenient_u64)
        })
        .ok_or_else(|| ArchiveError::drift("post", item.id, "author_user_id", "missing"))
}

impl CacheRecord {
    pub fn new(item: RawItem, now: DateTime<Utc>) -> Result<Self> {
        let mut record = Self {
            id: item.id,
            user_id: author_of(&item)?,
            blog_url: item.blog_url(),
            from_timeline: None,
            from_page: None,
            added_at: now,
            updated_at: now,
        };
        record.slot(item);
        Ok(record)
    }

    /// Replace the slot for the item's source.
    pub fn absorb(&mut self, item: RawItem, now: DateTime<Utc>) -> Result<()> {
        if item.id != self.id {
            return Err(ArchiveError::drift(
                "post",
                self.id,
                "aweme_id",
                format!("cannot absorb item {}", item.id),
            ));
        }
        let author = author_of(&item)?;
        if author != self.user_id {
            return Err(ArchiveError::drift(
                "post",
                self.id,
                "author_user_id",
                format!("{author}, cached as {}", self.user_id),
            ));
        }
        self.blog_url = item.blog_url();
        self.slot(item);
        self.updated_at = now;
        Ok(())
    }

    pub fn get(&self, source: Source) -> Option<&RawItem> {
        match source {
            Source::Timeline => self.from_timeline.as_ref(),
            Source::Page => self.from_page.as_ref(),
        }
    }

    fn slot(&mut self, item: RawItem) {
        match item.source {
            Source::Timeline => self.from_timeline = Some(item),
            Source::Page => self.from_page = Some(item),
        }
    }
}

/// Persistence for cache records.
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get(&self, id: u64) -> Result<Option<CacheRecord>>;

    /// Insert or overwrite by id.
    async fn put(&self, record: &CacheRecord) -> Result<()>;

    async fn for_user(&self, user_id: u64) -> Result<Vec<CacheRecord>>;
}

/// Merge `item` into its cache record and persist it. A record whose two
/// sources disagree is never written.
pub async fn add(
    store: &dyn CacheStore,
    reconciler: &Reconciler,
    item: RawItem,
    now: DateTime<Utc>,
) -> Result<CacheRecord> {
    let record = match store.get(item.id).await? {
        Some(mut record) => {
            record.absorb(item, now)?;
            record
        }
        None => CacheRecord::new(item, now)?,
    };
    reconciler.check(&record)?;
    store.put(&record).await?;
    debug!(
        post = record.id,
        timeline = record.from_timeline.is_some(),
        page = record.from_page.is_some(),
        "cached"
    );
    Ok(record)
}

#[derive(Default)]
pub struct MemoryCacheStore {
    records: Mutex<HashMap<u64, CacheRecord>>,
}

impl MemoryCacheStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.lock().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<u64, CacheRecord>>> {
        self.records
            .lock()
            .map_err(|_| ArchiveError::Other(anyhow::anyhow!("cache store lock poisoned")))
    }
}

#[async_trait]
impl CacheStore for MemoryCacheStore {
    async fn get(&self, id: u64) -> Result<Option<CacheRecord>> {
        Ok(self.lock()?.get(&id).cloned())
    }

    async fn put(&self, record: &CacheRecord) -> Result<()> {
        self.lock()?.insert(record.id, record.clone());
        Ok(())
    }

    async fn for_user(&self, user_id: u64) -> Result<Vec<CacheRecord>> {
        let mut records: Vec<_> = self
            .lock()?
            .values()
            .filter(|r| r.user_id == user_id)
            .cloned()
            .collect();
        records.sort_by_key(|r| std::cmp::Reverse(r.id));
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{raw, video_post};
    use chrono::Duration;

    #[tokio::test]
    async fn add_fills_both_slots() {
        let store = MemoryCacheStore::new();
        let reconciler = Reconciler::default();
        let t0 = Utc::now();

        add(&store, &reconciler, raw(Source::Timeline, video_post(9, Some("h"))), t0)
            .await
            .unwrap();
        let later = t0 + Duration::minutes(5);
        let record = add(&store, &reconciler, raw(Source::Page, video_post(9, Some("h"))), later)
            .await
            .unwrap();

        assert!(record.from_timeline.is_some());
        assert!(record.from_page.is_some());
        assert_eq!(record.added_at, t0);
        assert_eq!(record.updated_at, later);
        assert_eq!(record.user_id, 42);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn inconsistent_sources_are_not_written() {
        let store = MemoryCacheStore::new();
        let reconciler = Reconciler::default();
        add(&store, &reconciler, raw(Source::Timeline, video_post(9, Some("h"))), Utc::now())
            .await
            .unwrap();

        let mut page = video_post(9, Some("h"));
        page["desc"] = serde_json::json!("edited");
        let err = add(&store, &reconciler, raw(Source::Page, page), Utc::now())
            .await
            .unwrap_err();

        assert!(matches!(err, ArchiveError::Inconsistent { ref field, .. } if field == "desc"));
        let stored = store.get(9).await.unwrap().unwrap();
        assert!(stored.from_page.is_none());
    }

    #[test]
    fn author_change_is_drift() {
        let mut record = CacheRecord::new(raw(Source::Timeline, video_post(9, None)), Utc::now()).unwrap();
        let mut other = video_post(9, None);
        other["author"]["uid"] = serde_json::json!("43");
        other["author_user_id"] = serde_json::json!(43);
        assert!(record.absorb(raw(Source::Page, other), Utc::now()).is_err());
    }
}

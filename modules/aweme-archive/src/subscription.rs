use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{ArchiveError, Result};

/// Posts are counted over this window when estimating how often a user posts.
const CYCLE_WINDOW_DAYS: i64 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchMode {
    /// Walk the timeline into the cache once, without downloading media.
    CacheOnly,
    Full,
    Disabled,
}

/// Per-user harvesting bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subscription {
    pub user_id: u64,
    pub username: String,
    pub following: bool,
    /// `None` caches without downloading, `Some(false)` disables the user.
    pub fetch_enabled: Option<bool>,
    pub fetched_at: Option<DateTime<Utc>>,
    pub first_fetched_at: Option<DateTime<Utc>>,
    pub cached_at: Option<DateTime<Utc>>,
    pub post_at: Option<DateTime<Utc>>,
    pub post_cycle_hours: Option<i64>,
    pub next_fetch_at: Option<DateTime<Utc>>,
}

impl Subscription {
    pub fn new(user_id: u64, username: impl Into<String>, following: bool) -> Self {
        Self {
            user_id,
            username: username.into(),
            following,
            fetch_enabled: Some(true),
            fetched_at: None,
            first_fetched_at: None,
            cached_at: None,
            post_at: None,
            post_cycle_hours: None,
            next_fetch_at: None,
        }
    }

    pub fn mode(&self) -> FetchMode {
        match self.fetch_enabled {
            None if self.cached_at.is_some() => FetchMode::Disabled,
            None => FetchMode::CacheOnly,
            Some(true) => FetchMode::Full,
            Some(false) => FetchMode::Disabled,
        }
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.mode() != FetchMode::Disabled && self.next_fetch_at.map_or(true, |at| at <= now)
    }

    /// Posts created before this instant were already seen.
    pub fn since(&self) -> DateTime<Utc> {
        let last = match self.mode() {
            FetchMode::CacheOnly => self.cached_at,
            _ => self.fetched_at,
        };
        // the default instant is the unix epoch
        last.unwrap_or_default()
    }

    /// Directory bucket for downloads: users seen before go under `User`.
    pub fn bucket(&self) -> &'static str {
        if self.fetched_at.is_some() {
            "User"
        } else {
            "New"
        }
    }

    /// Record a finished run. `post_times` are the creation times of every
    /// known post by this user.
    pub fn record_run(&mut self, mode: FetchMode, at: DateTime<Utc>, post_times: &[DateTime<Utc>]) {
        match mode {
            FetchMode::CacheOnly => self.cached_at = Some(at),
            FetchMode::Full => {
                if self.fetched_at.is_none() {
                    self.first_fetched_at = Some(at);
                }
                self.fetched_at = Some(at);
            }
            FetchMode::Disabled => return,
        }
        self.post_at = post_times.iter().max().copied().or(self.post_at);
        let hours = post_cycle(post_times, at);
        self.post_cycle_hours = Some(hours);
        self.next_fetch_at = Some(at + Duration::minutes(hours * 30));
    }
}

/// Expected hours between posts: the window divided by the number of posts
/// in it plus one, truncated to whole hours.
pub fn post_cycle(post_times: &[DateTime<Utc>], at: DateTime<Utc>) -> i64 {
    let start = at - Duration::days(CYCLE_WINDOW_DAYS);
    let count = post_times
        .iter()
        .filter(|t| **t >= start && **t <= at)
        .count() as i64;
    CYCLE_WINDOW_DAYS * 24 / (count + 1)
}

#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    async fn get(&self, user_id: u64) -> Result<Option<Subscription>>;

    async fn put(&self, subscription: &Subscription) -> Result<()>;

    /// Subscriptions to harvest now, least recently scheduled first.
    async fn due(&self, now: DateTime<Utc>) -> Result<Vec<Subscription>>;
}

#[derive(Default)]
pub struct MemorySubscriptionStore {
    rows: Mutex<HashMap<u64, Subscription>>,
}

impl MemorySubscriptionStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<u64, Subscription>>> {
        self.rows
            .lock()
            .map_err(|_| ArchiveError::Other(anyhow::anyhow!("subscription store lock poisoned")))
    }
}

#[async_trait]
impl SubscriptionStore for MemorySubscriptionStore {
    async fn get(&self, user_id: u64) -> Result<Option<Subscription>> {
        Ok(self.lock()?.get(&user_id).cloned())
    }

    async fn put(&self, subscription: &Subscription) -> Result<()> {
        self.lock()?
            .insert(subscription.user_id, subscription.clone());
        Ok(())
    }

    async fn due(&self, now: DateTime<Utc>) -> Result<Vec<Subscription>> {
        let mut due: Vec<_> = self
            .lock()?
            .values()
            .filter(|s| s.is_due(now))
            .cloned()
            .collect();
        due.sort_by_key(|s| (s.next_fetch_at, s.user_id));
        Ok(due)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    #[test]
    fn cycle_counts_recent_posts_only() {
        let now = at("2024-05-31T00:00:00Z");
        let posts = vec![
            at("2024-05-30T00:00:00Z"),
            at("2024-05-20T00:00:00Z"),
            at("2024-05-10T00:00:00Z"),
            at("2023-01-01T00:00:00Z"),
        ];
        assert_eq!(post_cycle(&posts, now), 720 / 4);
        assert_eq!(post_cycle(&[], now), 720);
    }

    #[test]
    fn full_run_schedules_half_a_cycle_ahead() {
        let now = at("2024-05-31T00:00:00Z");
        let mut sub = Subscription::new(1, "cat", true);
        sub.record_run(FetchMode::Full, now, &[at("2024-05-30T00:00:00Z")]);

        assert_eq!(sub.first_fetched_at, Some(now));
        assert_eq!(sub.fetched_at, Some(now));
        assert_eq!(sub.post_cycle_hours, Some(360));
        assert_eq!(sub.next_fetch_at, Some(now + Duration::hours(180)));
        assert_eq!(sub.post_at, Some(at("2024-05-30T00:00:00Z")));
        assert!(!sub.is_due(now));
        assert!(sub.is_due(now + Duration::hours(180)));

        let later = now + Duration::days(10);
        sub.record_run(FetchMode::Full, later, &[]);
        assert_eq!(sub.first_fetched_at, Some(now));
        assert_eq!(sub.bucket(), "User");
    }

    #[test]
    fn cache_only_runs_once() {
        let mut sub = Subscription::new(1, "cat", false);
        sub.fetch_enabled = None;
        assert_eq!(sub.mode(), FetchMode::CacheOnly);
        assert_eq!(sub.since().timestamp(), 0);

        sub.record_run(FetchMode::CacheOnly, Utc::now(), &[]);
        assert_eq!(sub.mode(), FetchMode::Disabled);
        assert!(sub.fetched_at.is_none());
        assert_eq!(sub.bucket(), "New");
    }

    #[tokio::test]
    async fn due_skips_disabled_and_future() {
        let store = MemorySubscriptionStore::new();
        let now = Utc::now();
        let mut disabled = Subscription::new(1, "a", true);
        disabled.fetch_enabled = Some(false);
        let mut later = Subscription::new(2, "b", true);
        later.next_fetch_at = Some(now + Duration::hours(1));
        let fresh = Subscription::new(3, "c", true);
        for s in [&disabled, &later, &fresh] {
            store.put(s).await.unwrap();
        }

        let due = store.due(now).await.unwrap();
        assert_eq!(due.iter().map(|s| s.user_id).collect::<Vec<_>>(), vec![3]);
    }
}

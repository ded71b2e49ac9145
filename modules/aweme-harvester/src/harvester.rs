//! The harvesting pipeline.
//!
//! One user at a time: refresh the profile on the main session, walk the
//! post listing on the session chosen by follow state, cache every item,
//! reconcile it (fetching the detail page when the timeline copy is
//! unfinished), upsert the canonical record and finally download the media
//! of everything new. Subscription bookkeeping decides who is due and how
//! far back each walk goes.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use aweme_archive::cache::add;
use aweme_archive::{
    decode_user, CacheStore, CanonicalRecord, DownloadOutcome, EntitySchema, EntityStore,
    FetchMode, MediaDownloader, MediaJob, MediaJobPlanner, MemoryCacheStore, MemoryEntityStore,
    MemorySubscriptionStore, PersistedEntity, PgCacheStore, PgEntityStore, PgSubscriptionStore,
    Reconciled, Reconciler, Subscription, SubscriptionStore, UpsertEngine,
};
use aweme_client::endpoints::{post_detail, self_user_id, user_profile};
use aweme_client::{FetchError, FollowingEntry, FollowingWalk, PostWalk, RetryingTransport, Session};
use aweme_common::{RawItem, SchemaConfig, SessionId, UserRef};
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::PgPool;
use tracing::{debug, error, info};

use crate::stats::HarvestStats;

/// The two logged-in accounts. Each is used by one caller at a time.
pub struct Sessions {
    main: Session,
    alt: Session,
}

impl Sessions {
    pub fn new(main: Session, alt: Session) -> Self {
        Self { main, alt }
    }

    pub fn get(&self, id: SessionId) -> &Session {
        match id {
            SessionId::Main => &self.main,
            SessionId::Alt => &self.alt,
        }
    }

    pub fn get_mut(&mut self, id: SessionId) -> &mut Session {
        match id {
            SessionId::Main => &mut self.main,
            SessionId::Alt => &mut self.alt,
        }
    }

    pub fn total_visits(&self, id: SessionId) -> u64 {
        self.get(id).pacing().total_visits
    }
}

/// Storage backends, all behind their ports.
pub struct Stores {
    pub cache: Arc<dyn CacheStore>,
    pub posts: Arc<dyn EntityStore>,
    pub users: Arc<dyn EntityStore>,
    pub subscriptions: Arc<dyn SubscriptionStore>,
}

impl Stores {
    pub fn memory() -> Self {
        Self {
            cache: Arc::new(MemoryCacheStore::new()),
            posts: Arc::new(MemoryEntityStore::new()),
            users: Arc::new(MemoryEntityStore::new()),
            subscriptions: Arc::new(MemorySubscriptionStore::new()),
        }
    }

    pub fn postgres(pool: PgPool) -> Self {
        Self {
            cache: Arc::new(PgCacheStore::new(pool.clone())),
            posts: Arc::new(PgEntityStore::posts(pool.clone())),
            users: Arc::new(PgEntityStore::users(pool.clone())),
            subscriptions: Arc::new(PgSubscriptionStore::new(pool)),
        }
    }
}

/// Whether a failure means an account's cookies were rejected. Nothing
/// further can succeed on that account, so the run stops.
pub fn is_session_invalid(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        matches!(
            cause.downcast_ref::<FetchError>(),
            Some(FetchError::SessionInvalid { .. })
        )
    })
}

/// Name a newly followed account is filed under until its profile is read.
fn display_name(entry: &FollowingEntry) -> String {
    let trimmed = entry.nickname.trim_matches(&['-', '_'][..]);
    if !trimmed.is_empty() {
        return trimmed.to_string();
    }
    entry
        .unique_id
        .clone()
        .unwrap_or_else(|| entry.uid.to_string())
}

pub struct Harvester {
    transport: RetryingTransport,
    sessions: Sessions,
    cache: Arc<dyn CacheStore>,
    subscriptions: Arc<dyn SubscriptionStore>,
    reconciler: Reconciler,
    posts: UpsertEngine,
    users: UpsertEngine,
    planner: MediaJobPlanner,
    downloader: MediaDownloader,
    download_dir: PathBuf,
}

impl Harvester {
    pub fn new(
        transport: RetryingTransport,
        sessions: Sessions,
        stores: Stores,
        schema: &SchemaConfig,
        downloader: MediaDownloader,
        download_dir: impl Into<PathBuf>,
    ) -> Self {
        let post_schema =
            EntitySchema::posts().with_volatile(schema.extra_volatile_posts.iter().cloned());
        let user_schema =
            EntitySchema::users().with_volatile(schema.extra_volatile_users.iter().cloned());
        Self {
            transport,
            sessions,
            cache: stores.cache,
            subscriptions: stores.subscriptions,
            reconciler: Reconciler::for_schema(&post_schema),
            posts: UpsertEngine::new(post_schema, stores.posts),
            users: UpsertEngine::new(user_schema, stores.users),
            planner: MediaJobPlanner::local(),
            downloader,
            download_dir: download_dir.into(),
        }
    }

    pub fn with_planner(mut self, planner: MediaJobPlanner) -> Self {
        self.planner = planner;
        self
    }

    pub fn sessions(&self) -> &Sessions {
        &self.sessions
    }

    fn now(&self) -> DateTime<Utc> {
        self.transport.clock().now()
    }

    /// Harvest the given users, or every due subscription when none are
    /// given. A failure for one user is logged and the run moves on, except
    /// for a rejected session which ends the run.
    pub async fn harvest(&mut self, users: &[UserRef]) -> Result<HarvestStats> {
        let mut stats = HarvestStats::default();

        if users.is_empty() {
            let due = self.subscriptions.due(self.now()).await?;
            info!(count = due.len(), "subscriptions due");
            for sub in due {
                let user_id = sub.user_id;
                let result = self.harvest_subscription(sub, &mut stats).await;
                settle(user_id, result, &mut stats)?;
            }
        } else {
            for user in users {
                let result = self.harvest_ref(user, &mut stats).await;
                settle(user, result, &mut stats)?;
            }
        }

        stats.visits_main = self.sessions.total_visits(SessionId::Main);
        stats.visits_alt = self.sessions.total_visits(SessionId::Alt);
        Ok(stats)
    }

    async fn harvest_subscription(
        &mut self,
        mut sub: Subscription,
        stats: &mut HarvestStats,
    ) -> Result<()> {
        let target = self
            .users
            .get(sub.user_id)
            .await?
            .and_then(|u| u.str_field("sec_uid").map(|s| UserRef::SecUid(s.to_string())))
            .unwrap_or(UserRef::Uid(sub.user_id));
        let user = self.refresh_user(&target).await?;
        self.harvest_user(&mut sub, &user, stats).await
    }

    async fn harvest_ref(&mut self, target: &UserRef, stats: &mut HarvestStats) -> Result<()> {
        let user = self.refresh_user(target).await?;
        let mut sub = match self.subscriptions.get(user.id).await? {
            Some(sub) => sub,
            None => Subscription::new(
                user.id,
                user.str_field("username").unwrap_or_default(),
                user.bool_field("following").unwrap_or(false),
            ),
        };
        self.harvest_user(&mut sub, &user, stats).await
    }

    /// Fetch a profile on the main session and upsert it.
    pub async fn refresh_user(&mut self, target: &UserRef) -> Result<PersistedEntity> {
        let profile = user_profile(
            &self.transport,
            self.sessions.get_mut(SessionId::Main),
            target,
        )
        .await
        .with_context(|| format!("profile of {target}"))?;
        let record = decode_user(profile, self.now())?;
        let outcome = self.users.upsert(record).await?;
        if outcome.inserted {
            info!(user = outcome.entity.id, "new user");
        }
        Ok(outcome.entity)
    }

    async fn harvest_user(
        &mut self,
        sub: &mut Subscription,
        user: &PersistedEntity,
        stats: &mut HarvestStats,
    ) -> Result<()> {
        let mode = sub.mode();
        if mode == FetchMode::Disabled {
            debug!(user = sub.user_id, "fetching disabled");
            stats.users_skipped += 1;
            return Ok(());
        }

        let username = user
            .str_field("username")
            .unwrap_or(&sub.username)
            .to_string();
        sub.username = username.clone();
        sub.following = sub.following || user.bool_field("following").unwrap_or(false);
        let session = SessionId::for_following(sub.following);
        let since = sub.since();
        let target = match user.str_field("sec_uid") {
            Some(sec) => UserRef::SecUid(sec.to_string()),
            None => UserRef::Uid(sub.user_id),
        };
        info!(
            user = sub.user_id,
            username = username.as_str(),
            ?mode,
            %session,
            %since,
            "harvesting"
        );

        let mut walk = PostWalk::new(&target);
        let mut fresh = Vec::new();
        'pages: while let Some(page) = walk
            .next_page(&self.transport, self.sessions.get_mut(session))
            .await
            .with_context(|| format!("posts of {target}"))?
        {
            for item in page {
                if item.created_at().is_some_and(|t| t < since) {
                    if item.is_pinned() {
                        debug!(post = item.id, "old pinned post");
                        continue;
                    }
                    debug!(post = item.id, "reached posts seen before");
                    break 'pages;
                }
                stats.posts_seen += 1;
                if mode == FetchMode::CacheOnly {
                    add(self.cache.as_ref(), &self.reconciler, item, self.now()).await?;
                } else {
                    fresh.push(self.ingest(item, session, &username, stats).await?);
                }
            }
        }

        if mode == FetchMode::Full {
            let dir = self.download_dir.join(sub.bucket()).join(&username);
            let mut jobs = Vec::new();
            for post in &fresh {
                jobs.extend(self.planner.plan(post, &dir)?);
            }
            self.download(jobs, stats).await?;
        }

        let post_times = self.post_times(sub.user_id).await?;
        sub.record_run(mode, self.now(), &post_times);
        self.subscriptions.put(sub).await?;
        stats.users_harvested += 1;
        info!(
            user = sub.user_id,
            posts = fresh.len(),
            next_fetch_at = ?sub.next_fetch_at,
            "user done"
        );
        Ok(())
    }

    /// Cache, reconcile and persist one listed item.
    async fn ingest(
        &mut self,
        item: RawItem,
        session: SessionId,
        username: &str,
        stats: &mut HarvestStats,
    ) -> Result<PersistedEntity> {
        let record = add(self.cache.as_ref(), &self.reconciler, item, self.now()).await?;
        let canonical = match self.reconciler.reconcile(&record)? {
            Reconciled::Complete(canonical) => canonical,
            Reconciled::NeedsRefetch { id } => {
                info!(post = id, "timeline copy unfinished, fetching detail page");
                stats.posts_refetched += 1;
                self.refetch(id, session).await?
            }
        };
        self.persist(canonical, Some(username), stats).await
    }

    async fn refetch(&mut self, id: u64, session: SessionId) -> Result<CanonicalRecord> {
        let page = post_detail(&self.transport, self.sessions.get_mut(session), id)
            .await
            .with_context(|| format!("detail page of post {id}"))?;
        let record = add(self.cache.as_ref(), &self.reconciler, page, self.now()).await?;
        match self.reconciler.reconcile(&record)? {
            Reconciled::Complete(canonical) => Ok(canonical),
            Reconciled::NeedsRefetch { id } => bail!("post {id} is unfinished on its detail page"),
        }
    }

    async fn persist(
        &self,
        mut record: CanonicalRecord,
        username: Option<&str>,
        stats: &mut HarvestStats,
    ) -> Result<PersistedEntity> {
        if let Some(name) = username.filter(|n| !n.is_empty()) {
            record.fields.insert("username".to_string(), Value::from(name));
        }
        let outcome = self.posts.upsert(record).await?;
        if outcome.inserted {
            stats.posts_inserted += 1;
        } else if !outcome.diff.is_empty() {
            stats.posts_changed += 1;
        }
        Ok(outcome.entity)
    }

    async fn download(&self, jobs: Vec<MediaJob>, stats: &mut HarvestStats) -> Result<()> {
        if jobs.is_empty() {
            return Ok(());
        }
        for outcome in self.downloader.download_all(jobs).await? {
            match outcome {
                DownloadOutcome::Written => stats.media_written += 1,
                DownloadOutcome::Skipped => stats.media_skipped += 1,
            }
        }
        Ok(())
    }

    async fn post_times(&self, user_id: u64) -> Result<Vec<DateTime<Utc>>> {
        let cached = self.cache.for_user(user_id).await?;
        Ok(cached
            .iter()
            .filter_map(|r| {
                r.from_page
                    .as_ref()
                    .or(r.from_timeline.as_ref())
                    .and_then(RawItem::created_at)
            })
            .collect())
    }

    /// Subscribe to every account the main session follows. Returns how many
    /// subscriptions were created.
    pub async fn sync_following(&mut self) -> Result<usize> {
        let me = self_user_id(&self.transport, self.sessions.get_mut(SessionId::Main)).await?;
        let entries = FollowingWalk::new(&UserRef::Uid(me))
            .collect(&self.transport, self.sessions.get_mut(SessionId::Main))
            .await
            .context("following list")?;

        let mut added = 0;
        for entry in &entries {
            match self.subscriptions.get(entry.uid).await? {
                Some(sub) if sub.following => {}
                Some(mut sub) => {
                    sub.following = true;
                    self.subscriptions.put(&sub).await?;
                    info!(user = entry.uid, "now following");
                }
                None => {
                    let sub = Subscription::new(entry.uid, display_name(entry), true);
                    self.subscriptions.put(&sub).await?;
                    info!(user = entry.uid, homepage = %entry.homepage(), "subscribed");
                    added += 1;
                }
            }
        }
        info!(following = entries.len(), added, "following list synced");
        Ok(added)
    }

    /// Persist one post and download its media. The detail page is fetched
    /// on the main session unless a finished copy is cached and `refresh`
    /// is off.
    pub async fn fetch_post(&mut self, id: u64, refresh: bool) -> Result<PersistedEntity> {
        let mut stats = HarvestStats::default();
        let canonical = match self.cache.get(id).await? {
            Some(record) if !refresh => match self.reconciler.reconcile(&record)? {
                Reconciled::Complete(canonical) => canonical,
                Reconciled::NeedsRefetch { id } => self.refetch(id, SessionId::Main).await?,
            },
            _ => self.refetch(id, SessionId::Main).await?,
        };

        let owner_id = canonical
            .get("user_id")
            .and_then(Value::as_u64)
            .context("post without user_id")?;
        let owner = self.users.get(owner_id).await?;
        let username = owner
            .as_ref()
            .and_then(|u| u.str_field("username"))
            .map(str::to_string);
        let post = self.persist(canonical, username.as_deref(), &mut stats).await?;

        let bucket = match self.subscriptions.get(owner_id).await? {
            Some(sub) => sub.bucket(),
            None => "New",
        };
        let name = post.str_field("username").unwrap_or_default();
        let dir = self.download_dir.join(bucket).join(name);
        let jobs = self.planner.plan(&post, &dir)?;
        self.download(jobs, &mut stats).await?;
        Ok(post)
    }
}

fn settle(user: impl fmt::Display, result: Result<()>, stats: &mut HarvestStats) -> Result<()> {
    match result {
        Ok(()) => Ok(()),
        Err(e) if is_session_invalid(&e) => Err(e),
        Err(e) => {
            let detail = format!("{e:#}");
            error!(user = %user, error = detail.as_str(), "harvest failed");
            stats.users_failed += 1;
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejected_session_is_detected_through_context() {
        let err = anyhow::Error::new(FetchError::SessionInvalid {
            session: SessionId::Alt,
            status: 403,
            url: "https://www.douyin.com/".into(),
        })
        .context("posts of 42");
        assert!(is_session_invalid(&err));

        let other = anyhow::anyhow!("boom").context("posts of 42");
        assert!(!is_session_invalid(&other));
    }

    #[test]
    fn display_name_falls_back() {
        let mut entry = FollowingEntry {
            uid: 7,
            sec_uid: "MS4w".into(),
            nickname: "__cat__".into(),
            unique_id: Some("catlover".into()),
        };
        assert_eq!(display_name(&entry), "cat");
        entry.nickname = "--".into();
        assert_eq!(display_name(&entry), "catlover");
        entry.unique_id = None;
        assert_eq!(display_name(&entry), "7");
    }

    #[test]
    fn failed_user_is_counted_not_raised() {
        let mut stats = HarvestStats::default();
        settle(1, Err(anyhow::anyhow!("drift")), &mut stats).unwrap();
        assert_eq!(stats.users_failed, 1);
    }
}

//! Decoding, reconciliation and persistence of harvested posts and users.

pub mod cache;
pub mod decode;
pub mod error;
pub mod media;
pub mod postgres;
pub mod reconcile;
pub mod record;
pub mod schema;
pub mod store;
pub mod subscription;
pub mod upsert;

#[cfg(any(test, feature = "test-support"))]
pub mod testing;

pub use cache::{CacheRecord, CacheStore, MemoryCacheStore};
pub use decode::{decode_post, decode_user};
pub use error::{ArchiveError, Result};
pub use media::{
    DownloadOutcome, HttpMediaFetcher, MediaBody, MediaDownloader, MediaFetcher, MediaJob,
    MediaJobPlanner,
};
pub use postgres::{migrate, PgCacheStore, PgEntityStore, PgSubscriptionStore};
pub use reconcile::{Reconciled, Reconciler};
pub use record::{CanonicalRecord, PersistedEntity};
pub use schema::{EntitySchema, Fallback};
pub use store::{EntityStore, MemoryEntityStore};
pub use subscription::{
    post_cycle, FetchMode, MemorySubscriptionStore, Subscription, SubscriptionStore,
};
pub use upsert::{FieldChange, UpsertDiff, UpsertEngine, UpsertOutcome};

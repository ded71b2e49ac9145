//! Media jobs: planning from persisted posts and bounded parallel download.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use aweme_client::{classify_reqwest, Clock, FailureClass, RetryPolicy, TransportError};
use aweme_common::DownloadConfig;
use chrono::{FixedOffset, Local, NaiveDateTime, TimeZone};
use futures::stream::{self, StreamExt};
use md5::{Digest, Md5};
use tracing::{debug, error, info};

use crate::error::{ArchiveError, Result};
use crate::record::PersistedEntity;

/// One file to fetch, with what we expect it to be.
#[derive(Debug, Clone, PartialEq)]
pub struct MediaJob {
    pub url: String,
    pub target_dir: PathBuf,
    pub filename: String,
    pub expected_size: Option<u64>,
    pub expected_hash: Option<String>,
    /// Descriptive metadata for an external tagger.
    pub tags: BTreeMap<String, String>,
}

impl MediaJob {
    pub fn path(&self) -> PathBuf {
        self.target_dir.join(&self.filename)
    }
}

/// Turns a persisted post into its media jobs. Dates in filenames and tags
/// use the local timezone unless an offset is pinned.
#[derive(Debug, Clone, Default)]
pub struct MediaJobPlanner {
    offset: Option<FixedOffset>,
}

impl MediaJobPlanner {
    pub fn local() -> Self {
        Self { offset: None }
    }

    pub fn with_offset(offset: FixedOffset) -> Self {
        Self {
            offset: Some(offset),
        }
    }

    fn local_time(&self, ts: i64) -> Option<NaiveDateTime> {
        match self.offset {
            Some(offset) => offset.timestamp_opt(ts, 0).single().map(|t| t.naive_local()),
            None => Local.timestamp_opt(ts, 0).single().map(|t| t.naive_local()),
        }
    }

    pub fn plan(&self, post: &PersistedEntity, dir: &Path) -> Result<Vec<MediaJob>> {
        let id = post.id;
        let fail = |detail: String| ArchiveError::MediaPlan { id, detail };

        let created = post
            .i64_field("create_time")
            .and_then(|ts| self.local_time(ts))
            .ok_or_else(|| fail("no usable create_time".into()))?;
        let username = post
            .str_field("username")
            .ok_or_else(|| fail("no username".into()))?;
        let prefix = format!("{}_{username}_{id}", created.format("%y-%m-%d"));

        let is_video = post.bool_field("is_video").unwrap_or(false);
        let video_url = post.str_field("video_url").filter(|u| !u.is_empty());
        let img_ids = post.str_list("img_ids");
        let img_urls = post.str_list("img_urls");
        if is_video != video_url.is_some() || is_video != img_urls.is_empty() {
            return Err(fail(format!(
                "is_video={is_video} with video_url={} and {} images",
                video_url.is_some(),
                img_urls.len()
            )));
        }

        let tagger = Tagger {
            post,
            created,
            images: img_ids.len(),
        };

        if let Some(url) = video_url {
            let hash = post
                .str_field("content_hash")
                .filter(|h| !h.is_empty())
                .ok_or_else(|| fail("video without content_hash".into()))?;
            return Ok(vec![MediaJob {
                url: url.to_string(),
                target_dir: dir.to_path_buf(),
                filename: format!("{prefix}.mp4"),
                expected_size: post.i64_field("content_size").and_then(|s| u64::try_from(s).ok()),
                expected_hash: Some(hash.to_string()),
                tags: tagger.tags(0, url),
            }]);
        }

        if img_ids.len() != img_urls.len() {
            return Err(fail(format!(
                "{} image ids for {} urls",
                img_ids.len(),
                img_urls.len()
            )));
        }
        img_ids
            .iter()
            .zip(&img_urls)
            .enumerate()
            .map(|(i, (img_id, url))| {
                if !url.contains(img_id.as_str()) {
                    return Err(fail(format!("image {img_id} not in {url}")));
                }
                let n = i + 1;
                Ok(MediaJob {
                    url: url.clone(),
                    target_dir: dir.to_path_buf(),
                    filename: format!("{prefix}_{n}.webp"),
                    expected_size: None,
                    expected_hash: None,
                    tags: tagger.tags(n, url),
                })
            })
            .collect()
    }
}

struct Tagger<'a> {
    post: &'a PersistedEntity,
    created: NaiveDateTime,
    images: usize,
}

impl Tagger<'_> {
    /// `n` is the 1-based image number, 0 for a video.
    fn tags(&self, n: usize, url: &str) -> BTreeMap<String, String> {
        let series = match (self.images, n) {
            (_, 0) | (1, _) => String::new(),
            (count, n) if count > 9 => format!("{n:02}"),
            (_, n) => n.to_string(),
        };
        let stamp = self.created + chrono::Duration::microseconds(n as i64);
        let date = stamp.format("%Y:%m:%d %H:%M:%S%.6f").to_string();
        let date = date.trim_end_matches('0').trim_end_matches('.').to_string();

        let field = |k: &str| self.post.str_field(k).unwrap_or_default().trim().to_string();
        let number = |k: &str| {
            self.post
                .get(k)
                .map(|v| v.to_string())
                .unwrap_or_default()
        };
        [
            ("ImageUniqueID", self.post.id.to_string()),
            ("ImageSupplierID", number("user_id")),
            ("ImageSupplierName", "Aweme".to_string()),
            ("ImageCreatorName", field("username")),
            ("BlogTitle", field("desc")),
            ("BlogURL", field("blog_url")),
            ("DateCreated", date),
            ("SeriesNumber", series),
            ("URLUrl", url.to_string()),
        ]
        .into_iter()
        .filter(|(_, v)| !v.is_empty())
        .map(|(k, v)| (k.to_string(), v))
        .collect()
    }
}

// ---------------------------------------------------------------------------
// Download
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaBody {
    pub status: u16,
    pub content_length: Option<u64>,
    pub bytes: Vec<u8>,
}

/// Plain GET for media URLs. Media CDNs need no session or signing.
#[async_trait]
pub trait MediaFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> std::result::Result<MediaBody, TransportError>;
}

pub struct HttpMediaFetcher {
    client: reqwest::Client,
}

impl HttpMediaFetcher {
    pub fn new(user_agent: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(user_agent)
            .timeout(Duration::from_secs(120))
            .build()
            .map_err(|e| ArchiveError::Other(e.into()))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl MediaFetcher for HttpMediaFetcher {
    async fn fetch(&self, url: &str) -> std::result::Result<MediaBody, TransportError> {
        let resp = self.client.get(url).send().await.map_err(classify_reqwest)?;
        let status = resp.status().as_u16();
        let content_length = resp.content_length();
        let bytes = resp.bytes().await.map_err(classify_reqwest)?;
        Ok(MediaBody {
            status,
            content_length,
            bytes: bytes.to_vec(),
        })
    }
}

#[derive(Debug, thiserror::Error)]
enum AttemptError {
    #[error(transparent)]
    Transport(TransportError),
    #[error("status {0}")]
    Status(u16),
    #[error("empty body")]
    Empty,
    #[error("Content-Length {expected}, received {received} bytes")]
    Truncated { expected: u64, received: u64 },
}

impl AttemptError {
    fn class(&self) -> FailureClass {
        match self {
            AttemptError::Transport(TransportError::PoolExhausted(_)) => FailureClass::Exhaustion,
            AttemptError::Transport(_) => FailureClass::Connectivity,
            AttemptError::Status(_) | AttemptError::Empty | AttemptError::Truncated { .. } => {
                FailureClass::Transient
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadOutcome {
    Written,
    /// The target already existed.
    Skipped,
}

pub struct MediaDownloader {
    fetcher: Arc<dyn MediaFetcher>,
    clock: Arc<dyn Clock>,
    policy: RetryPolicy,
    concurrency: usize,
}

impl MediaDownloader {
    pub fn new(fetcher: Arc<dyn MediaFetcher>, clock: Arc<dyn Clock>) -> Self {
        Self::from_config(fetcher, clock, &DownloadConfig::default())
    }

    pub fn from_config(
        fetcher: Arc<dyn MediaFetcher>,
        clock: Arc<dyn Clock>,
        config: &DownloadConfig,
    ) -> Self {
        Self {
            fetcher,
            clock,
            policy: RetryPolicy::media_from_config(config),
            concurrency: config.concurrency.max(1),
        }
    }

    pub async fn download(&self, job: &MediaJob) -> Result<DownloadOutcome> {
        let path = job.path();
        if tokio::fs::try_exists(&path).await? {
            info!(path = %path.display(), "already exists, skipping");
            return Ok(DownloadOutcome::Skipped);
        }
        tokio::fs::create_dir_all(&job.target_dir).await?;
        debug!(path = %path.display(), "downloading");

        let body = self
            .policy
            .run(
                self.clock.as_ref(),
                &job.url,
                AttemptError::class,
                || self.attempt(&job.url),
            )
            .await
            .map_err(|failure| ArchiveError::Download {
                url: job.url.clone(),
                detail: format!("{} after {} attempts", failure.error, failure.attempts),
            })?;

        let size = body.len() as u64;
        let hash = format!("{:x}", Md5::digest(&body));
        let size_ok = job.expected_size.map_or(true, |s| s == size);
        let hash_ok = job.expected_hash.as_deref().map_or(true, |h| h == hash);
        if !size_ok || !hash_ok {
            error!(
                path = %path.display(),
                expected_size = ?job.expected_size,
                expected_hash = ?job.expected_hash,
                size,
                hash = %hash,
                "downloaded media does not match expectations"
            );
        }

        tokio::fs::write(&path, &body).await?;
        Ok(DownloadOutcome::Written)
    }

    async fn attempt(&self, url: &str) -> std::result::Result<Vec<u8>, AttemptError> {
        let body = self.fetcher.fetch(url).await.map_err(AttemptError::Transport)?;
        if body.status != 200 {
            return Err(AttemptError::Status(body.status));
        }
        if body.bytes.is_empty() {
            return Err(AttemptError::Empty);
        }
        let received = body.bytes.len() as u64;
        if let Some(expected) = body.content_length.filter(|l| *l != received) {
            return Err(AttemptError::Truncated { expected, received });
        }
        Ok(body.bytes)
    }

    /// Download every job with bounded parallelism. All jobs run to
    /// completion; the first failure is returned afterwards.
    pub async fn download_all(&self, jobs: Vec<MediaJob>) -> Result<Vec<DownloadOutcome>> {
        let total = jobs.len();
        let results: Vec<Result<DownloadOutcome>> = stream::iter(jobs)
            .map(|job| async move { self.download(&job).await })
            .buffered(self.concurrency)
            .collect()
            .await;

        let written = results
            .iter()
            .filter(|r| matches!(r, Ok(DownloadOutcome::Written)))
            .count();
        info!(total, written, "media batch finished");
        results.into_iter().collect()
    }
}

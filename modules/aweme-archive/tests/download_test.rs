use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use aweme_archive::testing::ScriptedMediaFetcher;
use aweme_archive::{ArchiveError, DownloadOutcome, MediaBody, MediaDownloader, MediaJob};
use aweme_client::testing::ManualClock;
use aweme_client::TransportError;

fn job(dir: &Path, url: &str, name: &str) -> MediaJob {
    MediaJob {
        url: url.to_string(),
        target_dir: dir.to_path_buf(),
        filename: name.to_string(),
        expected_size: None,
        expected_hash: None,
        tags: BTreeMap::new(),
    }
}

#[tokio::test]
async fn writes_file_and_skips_existing() {
    let dir = tempfile::tempdir().unwrap();
    let target = dir.path().join("User").join("cat");
    let fetcher = Arc::new(ScriptedMediaFetcher::new().serve("https://cdn/a.webp", b"AAAA"));
    let downloader = MediaDownloader::new(fetcher.clone(), Arc::new(ManualClock::default()));
    let j = job(&target, "https://cdn/a.webp", "a.webp");

    assert_eq!(downloader.download(&j).await.unwrap(), DownloadOutcome::Written);
    assert_eq!(std::fs::read(target.join("a.webp")).unwrap(), b"AAAA");

    assert_eq!(downloader.download(&j).await.unwrap(), DownloadOutcome::Skipped);
    assert_eq!(fetcher.count("https://cdn/a.webp"), 1);
}

#[tokio::test]
async fn truncated_body_is_retried() {
    let dir = tempfile::tempdir().unwrap();
    let url = "https://cdn/v.mp4";
    let fetcher = Arc::new(
        ScriptedMediaFetcher::new()
            .reply(
                url,
                MediaBody {
                    status: 200,
                    content_length: Some(10),
                    bytes: b"short".to_vec(),
                },
            )
            .serve(url, b"0123456789"),
    );
    let clock = Arc::new(ManualClock::default());
    let downloader = MediaDownloader::new(fetcher.clone(), clock.clone());

    let mut j = job(dir.path(), url, "v.mp4");
    j.expected_size = Some(10);
    j.expected_hash = Some("781e5e245d69b566979b86e28d23f2c7".to_string());
    assert_eq!(downloader.download(&j).await.unwrap(), DownloadOutcome::Written);

    assert_eq!(fetcher.count(url), 2);
    assert_eq!(clock.sleeps(), vec![Duration::from_secs(15)]);
}

#[tokio::test]
async fn network_errors_cool_down_longer() {
    let dir = tempfile::tempdir().unwrap();
    let url = "https://cdn/b.webp";
    let fetcher = Arc::new(
        ScriptedMediaFetcher::new()
            .fail(url, TransportError::Connect("reset".into()))
            .serve(url, b"B"),
    );
    let clock = Arc::new(ManualClock::default());
    let downloader = MediaDownloader::new(fetcher, clock.clone());

    downloader.download(&job(dir.path(), url, "b.webp")).await.unwrap();
    assert_eq!(clock.sleeps(), vec![Duration::from_secs(60)]);
}

#[tokio::test]
async fn gives_up_after_ten_attempts() {
    let dir = tempfile::tempdir().unwrap();
    let url = "https://cdn/missing.webp";
    let fetcher = Arc::new(ScriptedMediaFetcher::new());
    let clock = Arc::new(ManualClock::default());
    let downloader = MediaDownloader::new(fetcher.clone(), clock.clone());

    let err = downloader
        .download(&job(dir.path(), url, "missing.webp"))
        .await
        .unwrap_err();

    assert!(matches!(err, ArchiveError::Download { .. }));
    assert_eq!(fetcher.count(url), 10);
    assert_eq!(clock.sleeps().len(), 9);
    assert!(!dir.path().join("missing.webp").exists());
}

#[tokio::test]
async fn hash_mismatch_is_logged_but_written() {
    let dir = tempfile::tempdir().unwrap();
    let url = "https://cdn/c.mp4";
    let fetcher = Arc::new(ScriptedMediaFetcher::new().serve(url, b"CCC"));
    let downloader = MediaDownloader::new(fetcher, Arc::new(ManualClock::default()));

    let mut j = job(dir.path(), url, "c.mp4");
    j.expected_hash = Some("not-the-hash".into());
    assert_eq!(downloader.download(&j).await.unwrap(), DownloadOutcome::Written);
    assert!(dir.path().join("c.mp4").exists());
}

#[tokio::test]
async fn batch_reports_first_failure_after_finishing_the_rest() {
    let dir = tempfile::tempdir().unwrap();
    let fetcher = Arc::new(
        ScriptedMediaFetcher::new()
            .serve("https://cdn/1.webp", b"1")
            .serve("https://cdn/3.webp", b"3"),
    );
    let downloader = MediaDownloader::new(fetcher, Arc::new(ManualClock::default()));
    let jobs = vec![
        job(dir.path(), "https://cdn/1.webp", "1.webp"),
        job(dir.path(), "https://cdn/2.webp", "2.webp"),
        job(dir.path(), "https://cdn/3.webp", "3.webp"),
    ];

    assert!(downloader.download_all(jobs).await.is_err());
    assert!(dir.path().join("1.webp").exists());
    assert!(dir.path().join("3.webp").exists());
    assert!(!dir.path().join("2.webp").exists());
}

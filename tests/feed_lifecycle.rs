//! End-to-end lifecycle tests against the public API: configuration
//! reconciliation, retention pruning, and document generation, all on a
//! real (temp-dir backed) database and file tree. No external tools are
//! involved; extractor-facing paths are covered by unit tests.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{TimeZone, Utc};
use tempfile::TempDir;
use url::Url;

use anypod::config::{FeedConfig, FeedsFile};
use anypod::db::types::{Download, DownloadStatus, SourceType};
use anypod::db::{self, DownloadStore, FeedStore};
use anypod::ffmpeg::Ffprobe;
use anypod::fsutil::FileManager;
use anypod::path::PathManager;
use anypod::pipeline::Pruner;
use anypod::reconciler::StateReconciler;
use anypod::rss::RssFeedGenerator;
use anypod::ytdlp::YtdlpRunner;

struct Harness {
    _dir: TempDir,
    feeds: FeedStore,
    downloads: DownloadStore,
    files: FileManager,
    pruner: Arc<Pruner>,
    reconciler: StateReconciler,
    rss: RssFeedGenerator,
}

async fn harness() -> Harness {
    let dir = TempDir::new().unwrap();
    let db_url = format!(
        "sqlite://{}?mode=rwc",
        dir.path().join("anypod.db").display()
    );
    let pool = db::open_pool(&db_url).await.unwrap();
    let feeds = FeedStore::new(pool.clone());
    let downloads = DownloadStore::new(pool);
    let files = FileManager::new(PathManager::new(
        dir.path().to_path_buf(),
        Url::parse("http://localhost:8024").unwrap(),
    ));
    let ytdlp = Arc::new(YtdlpRunner::new(
        "/nonexistent/yt-dlp",
        Ffprobe::new("/nonexistent/ffprobe"),
    ));
    let pruner = Arc::new(Pruner::new(
        feeds.clone(),
        downloads.clone(),
        files.clone(),
    ));
    let reconciler = StateReconciler::new(
        feeds.clone(),
        downloads.clone(),
        Arc::clone(&pruner),
        ytdlp,
    );
    let rss = RssFeedGenerator::new(downloads.clone(), files.clone());
    Harness {
        _dir: dir,
        feeds,
        downloads,
        files,
        pruner,
        reconciler,
        rss,
    }
}

fn load_config(yaml: &str) -> BTreeMap<String, FeedConfig> {
    let parsed: FeedsFile = serde_yaml::from_str(yaml).unwrap();
    parsed.feeds
}

fn downloaded_row(feed_id: &str, id: &str, day: u32) -> Download {
    let now = Utc::now();
    Download {
        feed_id: feed_id.to_string(),
        id: id.to_string(),
        source_url: format!("https://www.youtube.com/watch?v={id}"),
        title: format!("episode {id}"),
        description: Some("an episode".to_string()),
        published: Utc.with_ymd_and_hms(2024, 6, day, 12, 0, 0).unwrap(),
        duration: 600,
        ext: "mp4".to_string(),
        mime_type: "video/mp4".to_string(),
        filesize: 1024,
        status: DownloadStatus::Downloaded,
        retries: 0,
        last_error: None,
        discovered_at: now,
        updated_at: now,
        downloaded_at: None,
        playlist_index: None,
        download_logs: None,
        remote_thumbnail_url: None,
        thumbnail_ext: None,
        transcript_ext: None,
        transcript_lang: None,
        transcript_source: None,
    }
}

#[tokio::test]
async fn config_to_feed_to_document() {
    let h = harness().await;
    let configs = load_config(
        r#"
feeds:
  bbb:
    url: "https://www.youtube.com/@BlenderFoundation"
    schedule: "0 * * * *"
    metadata:
      title: "Blender Open Movies"
      explicit: false
"#,
    );

    let ready = h.reconciler.reconcile_startup_state(&configs).await.unwrap();
    assert_eq!(ready, vec!["bbb"]);

    let feed = h.feeds.get_feed_by_id("bbb").await.unwrap();
    assert_eq!(feed.source_type, SourceType::Channel);
    assert_eq!(
        feed.resolved_url.as_deref(),
        Some("https://www.youtube.com/@BlenderFoundation/videos")
    );

    // two delivered episodes appear in the generated document, newest first
    for (id, day) in [("older", 1), ("newer", 15)] {
        h.downloads
            .upsert_download(&downloaded_row("bbb", id, day))
            .await
            .unwrap();
    }
    let feed = h.feeds.get_feed_by_id("bbb").await.unwrap();
    assert_eq!(feed.total_downloads, 2);

    h.rss.update_feed("bbb", &feed).await.unwrap();
    let xml = h.rss.get_feed_xml("bbb").await.unwrap();
    let channel = rss::Channel::read_from(&xml[..]).unwrap();
    assert_eq!(channel.title(), "Blender Open Movies");
    let guids: Vec<&str> = channel
        .items()
        .iter()
        .map(|item| item.guid().unwrap().value())
        .collect();
    assert_eq!(guids, vec!["newer", "older"]);
    assert_eq!(
        channel.items()[0].enclosure().unwrap().url(),
        "http://localhost:8024/media/bbb/newer.mp4"
    );
    assert_eq!(channel.itunes_ext().unwrap().explicit(), Some("false"));
}

#[tokio::test]
async fn retention_prune_archives_and_cleans_disk() {
    let h = harness().await;
    let configs = load_config(
        r#"
feeds:
  show:
    url: "https://www.youtube.com/@SomeShow"
    schedule: "@hourly"
    keep_last: 1
"#,
    );
    h.reconciler.reconcile_startup_state(&configs).await.unwrap();

    let feed_dir = h.files.ensure_feed_dirs("show").await.unwrap();
    for (id, day) in [("d1", 1), ("d2", 2), ("d3", 3)] {
        h.downloads
            .upsert_download(&downloaded_row("show", id, day))
            .await
            .unwrap();
        tokio::fs::write(feed_dir.join(format!("{id}.mp4")), b"media")
            .await
            .unwrap();
    }

    let result = h
        .pruner
        .prune_feed_downloads("show", Some(1), None)
        .await
        .unwrap();
    assert_eq!(result.archived_count, 2);
    assert_eq!(result.files_deleted_count, 2);

    assert!(feed_dir.join("d3.mp4").exists());
    assert!(!feed_dir.join("d1.mp4").exists());
    assert!(!feed_dir.join("d2.mp4").exists());
    assert_eq!(
        h.feeds.get_feed_by_id("show").await.unwrap().total_downloads,
        1
    );

    // the pruned items stay out of the document
    let feed = h.feeds.get_feed_by_id("show").await.unwrap();
    h.rss.update_feed("show", &feed).await.unwrap();
    let xml = h.rss.get_feed_xml("show").await.unwrap();
    let channel = rss::Channel::read_from(&xml[..]).unwrap();
    assert_eq!(channel.items().len(), 1);
}

#[tokio::test]
async fn feed_removal_and_readdition_do_not_resurrect_downloads() {
    let h = harness().await;
    let yaml = r#"
feeds:
  gone:
    url: "https://www.youtube.com/@Channel"
    schedule: "@daily"
"#;
    h.reconciler
        .reconcile_startup_state(&load_config(yaml))
        .await
        .unwrap();
    h.downloads
        .upsert_download(&downloaded_row("gone", "v1", 1))
        .await
        .unwrap();

    // removed from config: archived and disabled
    h.reconciler
        .reconcile_startup_state(&BTreeMap::new())
        .await
        .unwrap();
    assert!(!h.feeds.get_feed_by_id("gone").await.unwrap().is_enabled);
    assert_eq!(
        h.downloads.get_download_by_id("gone", "v1").await.unwrap().status,
        DownloadStatus::Archived
    );

    // re-added with the same retention policy: the old download stays
    // archived and the feed comes back enabled
    let ready = h
        .reconciler
        .reconcile_startup_state(&load_config(yaml))
        .await
        .unwrap();
    assert_eq!(ready, vec!["gone"]);
    assert!(h.feeds.get_feed_by_id("gone").await.unwrap().is_enabled);
    assert_eq!(
        h.downloads.get_download_by_id("gone", "v1").await.unwrap().status,
        DownloadStatus::Archived
    );
}

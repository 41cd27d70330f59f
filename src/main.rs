use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use anypod::config::{AppSettings, FeedsFile};
use anypod::db::{self, AppStateStore, DownloadStore, FeedStore};
use anypod::ffmpeg::{Ffmpeg, Ffprobe};
use anypod::fsutil::FileManager;
use anypod::image::ImageDownloader;
use anypod::path::PathManager;
use anypod::pipeline::{DataCoordinator, Downloader, Enqueuer, Pruner};
use anypod::reconciler::StateReconciler;
use anypod::rss::RssFeedGenerator;
use anypod::schedule::{FeedGate, FeedScheduler, ManualFeedRunner, ManualSubmissionService};
use anypod::server::{build_router, ServerState};
use anypod::transcript::TranscriptDownloader;
use anypod::ytdlp::YtdlpRunner;

/// Turn yt-dlp-supported sources into locally hosted podcast feeds.
#[derive(Debug, Parser)]
#[command(name = "anypod", version, about)]
struct Cli {
    /// Path to the feeds YAML file (overrides CONFIG_FILE)
    #[arg(long)]
    config: Option<std::path::PathBuf>,

    /// Root directory for media and generated documents (overrides BASE_DATA_DIR)
    #[arg(long)]
    data_dir: Option<std::path::PathBuf>,

    /// HTTP listen address
    #[arg(long)]
    bind: Option<SocketAddr>,

    /// Log filter, e.g. "info" or "anypod=debug"
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level)),
        )
        .init();

    let mut settings = AppSettings::from_env()?;
    if let Some(config) = cli.config {
        settings.config_file = config;
    }
    if let Some(data_dir) = cli.data_dir {
        settings.data_dir = data_dir;
    }
    if let Some(bind) = cli.bind {
        settings.bind_addr = bind;
    }

    info!(
        config_file = %settings.config_file.display(),
        data_dir = %settings.data_dir.display(),
        base_url = %settings.base_url,
        "starting anypod"
    );

    // config load failures are fatal; everything downstream depends on it
    let feeds_file = FeedsFile::load(&settings.config_file)
        .with_context(|| format!("loading {}", settings.config_file.display()))?;

    tokio::fs::create_dir_all(&settings.data_dir)
        .await
        .with_context(|| format!("creating {}", settings.data_dir.display()))?;
    let pool = db::open_pool(&settings.database_url)
        .await
        .context("opening database")?;

    let feeds = FeedStore::new(pool.clone());
    let downloads = DownloadStore::new(pool.clone());
    let app_state = AppStateStore::new(pool);

    let paths = PathManager::new(settings.data_dir.clone(), settings.base_url.clone());
    let files = FileManager::new(paths);
    match files.sweep_incomplete().await {
        Ok(0) => {}
        Ok(removed) => info!(removed, "swept stale incomplete files"),
        Err(e) => warn!(%e, "incomplete sweep failed"),
    }

    let ffprobe = Ffprobe::new(&settings.ffprobe_path);
    let ffmpeg = Ffmpeg::new(&settings.ffmpeg_path);
    let ytdlp = Arc::new(YtdlpRunner::new(&settings.ytdlp_path, ffprobe.clone()));

    let images = Arc::new(ImageDownloader::new(
        files.clone(),
        ffprobe,
        ffmpeg,
        ytdlp.as_ref().clone(),
    )?);
    let transcripts = Arc::new(TranscriptDownloader::new(
        ytdlp.as_ref().clone(),
        files.clone(),
    ));

    let enqueuer = Arc::new(Enqueuer::new(
        feeds.clone(),
        downloads.clone(),
        Arc::clone(&ytdlp),
    ));
    let downloader = Arc::new(Downloader::new(
        feeds.clone(),
        downloads.clone(),
        files.clone(),
        Arc::clone(&ytdlp),
        Arc::clone(&images),
        transcripts,
        Arc::clone(&enqueuer),
    ));
    let pruner = Arc::new(Pruner::new(
        feeds.clone(),
        downloads.clone(),
        files.clone(),
    ));
    let rss = Arc::new(RssFeedGenerator::new(downloads.clone(), files.clone()));
    let coordinator = Arc::new(DataCoordinator::new(
        feeds.clone(),
        Arc::clone(&enqueuer),
        downloader,
        Arc::clone(&pruner),
        Arc::clone(&rss),
        images,
        settings.cookies_path.clone(),
    ));

    let reconciler = StateReconciler::new(
        feeds.clone(),
        downloads.clone(),
        Arc::clone(&pruner),
        Arc::clone(&ytdlp),
    );
    let ready = reconciler
        .reconcile_startup_state(&feeds_file.feeds)
        .await
        .context("reconciling startup state")?;

    // pre-render documents for feeds that already have content
    for feed_id in &ready {
        if let Ok(feed) = feeds.get_feed_by_id(feed_id).await {
            if feed.total_downloads > 0 {
                if let Err(e) = rss.update_feed(feed_id, &feed).await {
                    warn!(feed_id = %feed_id, %e, "initial rss render failed");
                }
            }
        }
    }

    let gate = FeedGate::new(settings.max_concurrent_feeds);
    let scheduler = FeedScheduler::new(Arc::clone(&coordinator), Arc::clone(&gate))
        .await
        .context("creating scheduler")?;
    let scheduled_feeds: Vec<_> = ready
        .iter()
        .filter_map(|id| {
            feeds_file
                .feeds
                .get(id)
                .map(|config| (id.clone(), config.clone()))
        })
        .collect();
    scheduler
        .start(scheduled_feeds, Arc::clone(&ytdlp), app_state)
        .await
        .context("starting scheduler")?;

    let manual_runner = Arc::new(ManualFeedRunner::new(
        Arc::clone(&coordinator),
        Arc::clone(&gate),
    ));
    let submissions = Arc::new(ManualSubmissionService::new(
        feeds.clone(),
        downloads.clone(),
        Arc::clone(&ytdlp),
    ));

    let state = Arc::new(ServerState {
        feeds,
        downloads,
        files,
        rss,
        enqueuer,
        manual_runner,
        submissions,
        feed_configs: feeds_file.feeds.clone(),
        cookies_path: settings.cookies_path.clone(),
    });
    let router = build_router(state);

    let listener = tokio::net::TcpListener::bind(settings.bind_addr)
        .await
        .with_context(|| format!("binding {}", settings.bind_addr))?;
    info!(bind_addr = %settings.bind_addr, "http server listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("http server failed")?;

    info!("shutdown requested; draining in-flight feed runs");
    scheduler.stop(true).await;
    info!("goodbye");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(%e, "failed to listen for ctrl-c");
        }
    };

    #[cfg(unix)]
    {
        let mut sigterm =
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(signal) => signal,
                Err(e) => {
                    warn!(%e, "failed to listen for sigterm");
                    ctrl_c.await;
                    return;
                }
            };
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }

    #[cfg(not(unix))]
    ctrl_c.await;
}

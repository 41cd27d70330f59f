pub mod config;
pub mod constants;
pub mod cron;
pub mod db;
pub mod error;
pub mod ffmpeg;
pub mod fsutil;
pub mod image;
pub mod path;
pub mod pipeline;
pub mod reconciler;
pub mod rss;
pub mod schedule;
pub mod server;
pub mod transcript;
pub mod ytdlp;

// Re-export commonly used types
pub use config::{AppSettings, FeedConfig, FeedsFile};
pub use pipeline::{DataCoordinator, ProcessingResults};
pub use reconciler::StateReconciler;

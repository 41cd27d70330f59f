//! RSS document generation
//!
//! Builds one RSS 2.0 + iTunes + Podcasting 2.0 document per feed from its
//! downloaded items, caches the bytes for direct serving, and persists
//! them to `{feed_id}/feed.xml` so the HTTP layer can serve a plain file.

pub mod podcast_ext;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::Utc;
use rss::extension::itunes::{
    ITunesCategoryBuilder, ITunesChannelExtensionBuilder, ITunesItemExtensionBuilder,
    ITunesOwnerBuilder,
};
use rss::{
    ChannelBuilder, EnclosureBuilder, GuidBuilder, ImageBuilder, ItemBuilder,
};
use tokio::sync::RwLock;
use tracing::info;

use crate::constants::feed::{RSS_GENERATOR, RSS_TTL_MINUTES};
use crate::db::types::{Download, DownloadStatus, Feed, PodcastType};
use crate::db::DownloadStore;
use crate::error::RssGenerationError;
use crate::fsutil::FileManager;
use crate::ytdlp::handlers::mime_from_ext;
use podcast_ext::{
    insert_podcast_extension, itunes_explicit, transcript_extension, PODCAST_NS,
};

pub struct RssFeedGenerator {
    downloads: DownloadStore,
    files: FileManager,
    cache: RwLock<HashMap<String, Arc<Vec<u8>>>>,
}

impl RssFeedGenerator {
    pub fn new(downloads: DownloadStore, files: FileManager) -> Self {
        Self {
            downloads,
            files,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Rebuild the feed's document from its downloaded items.
    pub async fn update_feed(&self, feed_id: &str, feed: &Feed) -> Result<(), RssGenerationError> {
        let mut items = self
            .downloads
            .get_downloads_by_status(DownloadStatus::Downloaded, Some(feed_id), None, -1, 0)
            .await
            .map_err(|source| RssGenerationError::Database {
                feed_id: feed_id.to_string(),
                source,
            })?;
        sort_for_feed(&mut items, feed.podcast_type);

        let xml = self.render(feed, &items)?;

        let path = self
            .files
            .paths()
            .feed_xml_path(feed_id)
            .map_err(|e| RssGenerationError::Build {
                feed_id: feed_id.to_string(),
                reason: e.to_string(),
            })?;
        self.files
            .atomic_write(&path, xml.as_bytes())
            .await
            .map_err(|source| RssGenerationError::Write {
                feed_id: feed_id.to_string(),
                source,
            })?;

        self.cache
            .write()
            .await
            .insert(feed_id.to_string(), Arc::new(xml.into_bytes()));
        info!(feed_id, item_count = items.len(), "rss document regenerated");
        Ok(())
    }

    /// Cached document bytes, if this feed has been generated this run.
    pub async fn get_feed_xml(&self, feed_id: &str) -> Option<Arc<Vec<u8>>> {
        self.cache.read().await.get(feed_id).cloned()
    }

    /// Drop a removed feed's cached document.
    pub async fn evict(&self, feed_id: &str) {
        self.cache.write().await.remove(feed_id);
    }

    fn render(&self, feed: &Feed, items: &[Download]) -> Result<String, RssGenerationError> {
        let paths = self.files.paths();
        let explicit = itunes_explicit(feed.explicit);

        let image_url = feed
            .image_ext
            .as_deref()
            .map(|ext| paths.feed_image_url(&feed.id, ext))
            .or_else(|| feed.remote_image_url.clone());

        let mut itunes_channel = ITunesChannelExtensionBuilder::default();
        itunes_channel.explicit(Some(explicit));
        if let Some(author) = &feed.author {
            itunes_channel.author(Some(author.clone()));
        }
        if let Some(subtitle) = &feed.subtitle {
            itunes_channel.subtitle(Some(subtitle.clone()));
        }
        if let Some(description) = &feed.description {
            itunes_channel.summary(Some(description.clone()));
        }
        if let Some(category) = &feed.category {
            itunes_channel
                .categories(vec![ITunesCategoryBuilder::default().text(category).build()]);
        }
        if let Some(image_url) = &image_url {
            itunes_channel.image(Some(image_url.clone()));
        }
        itunes_channel.owner(Some(
            ITunesOwnerBuilder::default()
                .name(feed.author.clone())
                .email(Some(feed.author_email.clone()))
                .build(),
        ));

        let rss_items: Vec<rss::Item> = items
            .iter()
            .map(|download| self.render_item(feed, download))
            .collect();

        let mut namespaces = BTreeMap::new();
        namespaces.insert("podcast".to_string(), PODCAST_NS.to_string());

        let mut channel = ChannelBuilder::default();
        channel
            .title(feed.display_title().to_string())
            .link(
                feed.source_url
                    .clone()
                    .unwrap_or_else(|| paths.feed_url(&feed.id)),
            )
            .description(
                feed.description
                    .clone()
                    .unwrap_or_else(|| format!("Podcast feed for {}", feed.display_title())),
            )
            .generator(Some(RSS_GENERATOR.to_string()))
            .ttl(Some(RSS_TTL_MINUTES.to_string()))
            .last_build_date(Some(Utc::now().to_rfc2822()))
            .namespaces(namespaces)
            .itunes_ext(Some(itunes_channel.build()))
            .items(rss_items);
        if let Some(language) = &feed.language {
            channel.language(Some(language.clone()));
        }
        if let Some(image_url) = &image_url {
            channel.image(Some(
                ImageBuilder::default()
                    .url(image_url.clone())
                    .title(feed.display_title().to_string())
                    .link(
                        feed.source_url
                            .clone()
                            .unwrap_or_else(|| paths.feed_url(&feed.id)),
                    )
                    .build(),
            ));
        }
        if let Some(published) = items.first().map(|d| d.published) {
            channel.pub_date(Some(published.to_rfc2822()));
        }

        let channel = channel.build();
        Ok(format!(
            "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n{channel}"
        ))
    }

    fn render_item(&self, feed: &Feed, download: &Download) -> rss::Item {
        let paths = self.files.paths();
        let enclosure_url = paths.media_url(&feed.id, &download.id, &download.ext);

        let mut itunes_item = ITunesItemExtensionBuilder::default();
        itunes_item
            .duration(Some(download.duration.to_string()))
            .explicit(Some(itunes_explicit(feed.explicit)));
        if let Some(thumbnail_ext) = &download.thumbnail_ext {
            itunes_item.image(Some(paths.media_url(&feed.id, &download.id, thumbnail_ext)));
        }
        if let Some(index) = download.playlist_index {
            if feed.podcast_type == PodcastType::Serial {
                itunes_item.episode(Some(index.to_string()));
            }
        }

        let mut item = ItemBuilder::default();
        item.guid(Some(
            GuidBuilder::default()
                .value(download.id.clone())
                .permalink(false)
                .build(),
        ))
        .title(Some(download.title.clone()))
        .link(Some(download.source_url.clone()))
        .pub_date(Some(download.published.to_rfc2822()))
        .enclosure(Some(
            EnclosureBuilder::default()
                .url(enclosure_url)
                .length(download.filesize.to_string())
                .mime_type(download.mime_type.clone())
                .build(),
        ))
        .itunes_ext(Some(itunes_item.build()));
        if let Some(description) = &download.description {
            item.description(Some(description.clone()));
        }

        if download.has_transcript() {
            if let Some(transcript_ext) = &download.transcript_ext {
                let url = paths.media_url(&feed.id, &download.id, transcript_ext);
                let mut extensions = rss::extension::ExtensionMap::default();
                insert_podcast_extension(
                    &mut extensions,
                    "transcript",
                    transcript_extension(
                        &url,
                        mime_from_ext(transcript_ext),
                        download.transcript_lang.as_deref(),
                        None,
                    ),
                );
                item.extensions(extensions);
            }
        }

        item.build()
    }
}

/// Newest first; serial feeds break publication ties with the playlist
/// position so episode order survives same-day uploads.
fn sort_for_feed(items: &mut [Download], podcast_type: PodcastType) {
    items.sort_by(|a, b| match podcast_type {
        PodcastType::Episodic => b.published.cmp(&a.published).then(b.id.cmp(&a.id)),
        PodcastType::Serial => b
            .published
            .cmp(&a.published)
            .then(b.playlist_index.cmp(&a.playlist_index))
            .then(b.id.cmp(&a.id)),
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::download_store::tests::sample_download;
    use crate::db::test_pool;
    use crate::db::types::tests::test_feed;
    use crate::db::FeedStore;
    use crate::path::PathManager;
    use chrono::TimeZone;
    use tempfile::TempDir;
    use url::Url;

    async fn generator(dir: &TempDir) -> (RssFeedGenerator, DownloadStore, FeedStore) {
        let pool = test_pool().await;
        let downloads = DownloadStore::new(pool.clone());
        let feeds = FeedStore::new(pool);
        let files = FileManager::new(PathManager::new(
            dir.path().to_path_buf(),
            Url::parse("http://example.com").unwrap(),
        ));
        (
            RssFeedGenerator::new(downloads.clone(), files),
            downloads,
            feeds,
        )
    }

    fn parse(xml: &[u8]) -> rss::Channel {
        rss::Channel::read_from(xml).expect("valid rss")
    }

    #[tokio::test]
    async fn generates_a_document_with_one_item_per_downloaded_row() {
        let dir = TempDir::new().unwrap();
        let (generator, downloads, feeds) = generator(&dir).await;
        let mut feed = test_feed("bbb");
        feed.title = Some("Big Buck Bunny".to_string());
        feeds.upsert_feed(&feed).await.unwrap();

        let mut downloaded = sample_download("bbb", "aqz-KE-bpKQ");
        downloaded.status = DownloadStatus::Downloaded;
        downloaded.filesize = 12345;
        downloads.upsert_download(&downloaded).await.unwrap();
        let mut queued = sample_download("bbb", "queued-item");
        queued.status = DownloadStatus::Queued;
        downloads.upsert_download(&queued).await.unwrap();

        generator.update_feed("bbb", &feed).await.unwrap();

        let xml = generator.get_feed_xml("bbb").await.unwrap();
        let channel = parse(&xml);
        assert_eq!(channel.title(), "Big Buck Bunny");
        assert_eq!(channel.items().len(), 1);

        let item = &channel.items()[0];
        let enclosure = item.enclosure().unwrap();
        assert_eq!(
            enclosure.url(),
            "http://example.com/media/bbb/aqz-KE-bpKQ.mp4"
        );
        assert_eq!(enclosure.length(), "12345");
        assert_eq!(enclosure.mime_type(), "video/mp4");
        assert_eq!(
            channel.itunes_ext().unwrap().explicit(),
            Some("false")
        );

        // the document is also on disk for static serving
        assert!(dir.path().join("bbb").join("feed.xml").exists());
    }

    #[tokio::test]
    async fn explicit_feeds_say_true() {
        let dir = TempDir::new().unwrap();
        let (generator, _, feeds) = generator(&dir).await;
        let mut feed = test_feed("x");
        feed.explicit = true;
        feeds.upsert_feed(&feed).await.unwrap();

        generator.update_feed("x", &feed).await.unwrap();
        let xml = generator.get_feed_xml("x").await.unwrap();
        let channel = parse(&xml);
        assert_eq!(channel.itunes_ext().unwrap().explicit(), Some("true"));
    }

    #[tokio::test]
    async fn transcripts_emit_podcast_namespace_tags() {
        let dir = TempDir::new().unwrap();
        let (generator, downloads, feeds) = generator(&dir).await;
        let feed = test_feed("f");
        feeds.upsert_feed(&feed).await.unwrap();

        let mut d = sample_download("f", "v1");
        d.status = DownloadStatus::Downloaded;
        d.transcript_ext = Some("vtt".to_string());
        d.transcript_lang = Some("en".to_string());
        d.transcript_source = Some(crate::db::types::TranscriptSource::Creator);
        downloads.upsert_download(&d).await.unwrap();

        generator.update_feed("f", &feed).await.unwrap();
        let xml = String::from_utf8(generator.get_feed_xml("f").await.unwrap().to_vec()).unwrap();
        assert!(xml.contains("xmlns:podcast=\"https://podcastindex.org/namespace/1.0\""));
        assert!(xml.contains("podcast:transcript"));
        assert!(xml.contains("url=\"http://example.com/media/f/v1.vtt\""));
        assert!(xml.contains("type=\"text/vtt\""));
    }

    #[tokio::test]
    async fn items_are_newest_first() {
        let dir = TempDir::new().unwrap();
        let (generator, downloads, feeds) = generator(&dir).await;
        let feed = test_feed("f");
        feeds.upsert_feed(&feed).await.unwrap();

        for (id, day) in [("old", 1), ("new", 20), ("mid", 10)] {
            let mut d = sample_download("f", id);
            d.status = DownloadStatus::Downloaded;
            d.published = Utc.with_ymd_and_hms(2024, 6, day, 0, 0, 0).unwrap();
            downloads.upsert_download(&d).await.unwrap();
        }

        generator.update_feed("f", &feed).await.unwrap();
        let xml = generator.get_feed_xml("f").await.unwrap();
        let channel = parse(&xml);
        let ids: Vec<&str> = channel
            .items()
            .iter()
            .map(|i| i.guid().unwrap().value())
            .collect();
        assert_eq!(ids, vec!["new", "mid", "old"]);
    }
}

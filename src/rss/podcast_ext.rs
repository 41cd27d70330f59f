//! Podcasting 2.0 and iTunes extension helpers
//!
//! The rss crate covers RSS 2.0 and the iTunes extension natively; the
//! `podcast:` namespace elements are assembled here as generic extensions.

use std::collections::BTreeMap;

use rss::extension::{Extension, ExtensionBuilder};

pub const ITUNES_NS: &str = "http://www.itunes.com/dtds/podcast-1.0.dtd";
pub const PODCAST_NS: &str = "https://podcastindex.org/namespace/1.0";

/// Modern explicit flag: the strings `"true"` / `"false"`, not the legacy
/// yes/no/clean values.
pub fn itunes_explicit(explicit: bool) -> String {
    if explicit { "true" } else { "false" }.to_string()
}

/// `<podcast:transcript url type [language] [rel]/>`
pub fn transcript_extension(
    url: &str,
    mime_type: &str,
    language: Option<&str>,
    rel: Option<&str>,
) -> Extension {
    let mut attrs = BTreeMap::new();
    attrs.insert("url".to_string(), url.to_string());
    attrs.insert("type".to_string(), mime_type.to_string());
    if let Some(language) = language {
        attrs.insert("language".to_string(), language.to_string());
    }
    if let Some(rel) = rel {
        attrs.insert("rel".to_string(), rel.to_string());
    }

    ExtensionBuilder::default()
        .name("podcast:transcript")
        .attrs(attrs)
        .build()
}

/// Attach a `podcast:` namespace extension to an item's extension map.
pub fn insert_podcast_extension(
    extensions: &mut rss::extension::ExtensionMap,
    element: &str,
    extension: Extension,
) {
    extensions
        .entry("podcast".to_string())
        .or_default()
        .entry(element.to_string())
        .or_default()
        .push(extension);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_uses_modern_values() {
        assert_eq!(itunes_explicit(true), "true");
        assert_eq!(itunes_explicit(false), "false");
    }

    #[test]
    fn transcript_extension_carries_attributes() {
        let ext = transcript_extension(
            "http://example.com/media/f/v.vtt",
            "text/vtt",
            Some("en"),
            None,
        );
        assert_eq!(ext.name(), "podcast:transcript");
        assert_eq!(
            ext.attrs().get("url").map(String::as_str),
            Some("http://example.com/media/f/v.vtt")
        );
        assert_eq!(ext.attrs().get("type").map(String::as_str), Some("text/vtt"));
        assert_eq!(ext.attrs().get("language").map(String::as_str), Some("en"));
        assert!(!ext.attrs().contains_key("rel"));
    }
}

use async_trait::async_trait;
use reqwest::Url;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use crate::{
    error::{Error, Result},
    language::Language,
    models::{episode::Episode, show::Show},
    sources::ShowSource,
};

#[derive(Debug, Clone, Deserialize)]
struct ShowDocument {
    title: String,
    #[serde(default)]
    language: Language,
    #[serde(default)]
    dubbed: bool,
    #[serde(default)]
    episodes: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct EpisodeDocument {
    #[serde(default)]
    embeds: Vec<String>,
}

/// Shows published as JSON documents.
///
/// A show URL (ending in `.json`) returns
/// `{"title": .., "language": "en", "dubbed": false, "episodes": [url, ..]}` and
/// each episode URL returns `{"embeds": [url, ..]}`. Relative URLs are resolved
/// against the document they appear in.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonFeed;

impl JsonFeed {
    async fn document(show: &Show, ct: &CancellationToken) -> Result<ShowDocument> {
        show.request().json(ct).await
    }
}

fn resolve_all(base: &Url, links: &[String]) -> Result<Vec<Url>> {
    links
        .iter()
        .map(|link| base.join(link).map_err(|_| Error::InvalidUrl(link.clone())))
        .collect()
}

#[async_trait]
impl ShowSource for JsonFeed {
    fn name(&self) -> &'static str {
        "JsonFeed"
    }

    fn can_handle(&self, url: &Url) -> bool {
        matches!(url.scheme(), "http" | "https")
            && url.path().to_ascii_lowercase().ends_with(".json")
    }

    async fn title(&self, show: &Show, ct: &CancellationToken) -> Result<String> {
        Ok(Self::document(show, ct).await?.title)
    }

    async fn is_dub(&self, show: &Show, ct: &CancellationToken) -> Result<bool> {
        Ok(Self::document(show, ct).await?.dubbed)
    }

    async fn language(&self, show: &Show, ct: &CancellationToken) -> Result<Language> {
        Ok(Self::document(show, ct).await?.language)
    }

    #[instrument(skip_all, fields(show = %show.url()))]
    async fn episodes(&self, show: &Show, ct: &CancellationToken) -> Result<Vec<Url>> {
        let doc = Self::document(show, ct).await?;
        let episodes = resolve_all(show.url(), &doc.episodes)?;
        debug!("Feed lists {} episodes", episodes.len());
        Ok(episodes)
    }

    async fn raw_streams(&self, episode: &Episode, ct: &CancellationToken) -> Result<Vec<String>> {
        let doc: EpisodeDocument = episode.request().json(ct).await?;
        Ok(resolve_all(episode.url(), &doc.embeds)?
            .into_iter()
            .map(String::from)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handles_json_documents_only() {
        for (url, expected) in [
            ("https://feeds.test/shows/frieren.json", true),
            ("http://127.0.0.1:8080/a/B.JSON", true),
            ("https://feeds.test/shows/frieren", false),
            ("ftp://feeds.test/frieren.json", false),
        ] {
            assert_eq!(JsonFeed.can_handle(&Url::parse(url).unwrap()), expected, "{url}");
        }
    }

    #[test]
    fn resolves_relative_links() {
        let base = Url::parse("https://feeds.test/shows/frieren.json").unwrap();
        let links =
            resolve_all(&base, &["ep/1.json".into(), "https://other.test/2".into()]).unwrap();
        assert_eq!(links[0].as_str(), "https://feeds.test/shows/ep/1.json");
        assert_eq!(links[1].as_str(), "https://other.test/2");
    }

    #[test]
    fn document_defaults() {
        let doc: ShowDocument = serde_json::from_str(r#"{"title": "Frieren"}"#).unwrap();
        assert_eq!(doc.language, Language::En);
        assert!(!doc.dubbed);
        assert!(doc.episodes.is_empty());
    }
}

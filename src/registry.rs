use std::sync::Arc;

use reqwest::{Client, Url};

use crate::{
    error::{Error, Result},
    providers::{StreamProvider, Vidstreaming},
    sources::{JsonFeed, ShowSource},
};

/// Everything needed to build or rebuild entities: the HTTP client, the stream
/// providers and the show sources, each in dispatch order.
///
/// Type tags map to the provider or source that reconstructs persisted records.
#[derive(Debug, Clone)]
pub struct Registry {
    client: Client,
    providers: Vec<Arc<dyn StreamProvider>>,
    sources: Vec<Arc<dyn ShowSource>>,
}

impl Registry {
    #[must_use]
    pub const fn new(client: Client) -> Self {
        Self {
            client,
            providers: Vec::new(),
            sources: Vec::new(),
        }
    }

    /// Registry with every built-in provider and source
    #[must_use]
    pub fn with_defaults(client: Client, vidstreaming: Vidstreaming) -> Self {
        Self::new(client)
            .with_provider(vidstreaming)
            .with_source(JsonFeed)
    }

    #[must_use]
    pub fn with_provider(mut self, provider: impl StreamProvider + 'static) -> Self {
        self.providers.push(Arc::new(provider));
        self
    }

    #[must_use]
    pub fn with_source(mut self, source: impl ShowSource + 'static) -> Self {
        self.sources.push(Arc::new(source));
        self
    }

    #[must_use]
    pub const fn client(&self) -> &Client {
        &self.client
    }

    /// First provider claiming `url`
    #[must_use]
    pub fn provider_for(&self, url: &Url) -> Option<&Arc<dyn StreamProvider>> {
        self.providers.iter().find(|p| p.can_handle(url))
    }

    /// # Errors
    /// [`Error::UnknownType`] when no provider carries `tag`
    pub fn provider(&self, tag: &str) -> Result<&Arc<dyn StreamProvider>> {
        self.providers
            .iter()
            .find(|p| p.name() == tag)
            .ok_or_else(|| Error::UnknownType(tag.to_string()))
    }

    #[must_use]
    pub fn source_for(&self, url: &Url) -> Option<&Arc<dyn ShowSource>> {
        self.sources.iter().find(|s| s.can_handle(url))
    }

    /// # Errors
    /// [`Error::UnknownType`] when no source carries `tag`
    pub fn source(&self, tag: &str) -> Result<&Arc<dyn ShowSource>> {
        self.sources
            .iter()
            .find(|s| s.name() == tag)
            .ok_or_else(|| Error::UnknownType(tag.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dispatches_by_url_and_tag() {
        let registry = Registry::with_defaults(Client::new(), Vidstreaming::default());

        let embed = Url::parse("https://vidstreaming.io/streaming.php?id=9").unwrap();
        assert_eq!(registry.provider_for(&embed).unwrap().name(), "Vidstreaming");
        assert!(registry.provider_for(&Url::parse("http://unknown-host/x").unwrap()).is_none());

        let feed = Url::parse("https://feeds.test/frieren.json").unwrap();
        assert_eq!(registry.source_for(&feed).unwrap().name(), "JsonFeed");

        assert!(registry.provider("Vidstreaming").is_ok());
        assert!(matches!(
            registry.provider("Mp4Upload"),
            Err(Error::UnknownType(t)) if t == "Mp4Upload"
        ));
        assert!(matches!(registry.source("Nope"), Err(Error::UnknownType(_))));
    }
}

use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use reqwest::Url;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use crate::{
    error::Result,
    models::stream::Stream,
    providers::{StreamProvider, get_successful_links},
    request::Request,
    util::parse_js_object,
};

static SETUP_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)playerInstance\.setup\((.+?)\);").unwrap());

const PLAYER_DATA: &str = "player_data";

/// Extracts the JW player configuration embedded in the page.
/// Returns an empty object when there is none.
#[must_use]
pub fn extract_player_data(text: &str) -> Map<String, Value> {
    SETUP_REGEX
        .captures(text)
        .and_then(|c| c.get(1))
        .and_then(|m| parse_js_object(m.as_str()))
        .unwrap_or_default()
}

#[derive(Debug, Clone)]
pub struct Vidstreaming {
    hosts: Vec<String>,
}

impl Default for Vidstreaming {
    fn default() -> Self {
        Self {
            hosts: vec!["vidstreaming.io".to_string()],
        }
    }
}

impl Vidstreaming {
    /// Claims `extra` hosts on top of the default one
    #[must_use]
    pub fn with_hosts(extra: impl IntoIterator<Item = String>) -> Self {
        let mut provider = Self::default();
        provider.hosts.extend(extra);
        provider
    }

    async fn player_data(
        &self,
        stream: &Stream,
        ct: &CancellationToken,
    ) -> Result<Map<String, Value>> {
        stream
            .attr(PLAYER_DATA, || async {
                let data = extract_player_data(&stream.request().text(ct).await?);
                if data.is_empty() {
                    debug!("Couldn't find player data {stream:?}");
                }
                Ok(data)
            })
            .await
    }
}

#[async_trait]
impl StreamProvider for Vidstreaming {
    fn name(&self) -> &'static str {
        "Vidstreaming"
    }

    fn hosts(&self) -> &[String] {
        &self.hosts
    }

    fn extra_attributes(&self) -> &'static [&'static str] {
        &[PLAYER_DATA]
    }

    async fn external(&self, _stream: &Stream, _ct: &CancellationToken) -> Result<bool> {
        Ok(true)
    }

    #[instrument(skip_all, fields(stream = %stream.url()))]
    async fn links(&self, stream: &Stream, ct: &CancellationToken) -> Result<Vec<String>> {
        let data = self.player_data(stream, ct).await?;
        let Some(raw_sources) = data.get("sources").and_then(Value::as_array) else {
            return Ok(Vec::new());
        };

        let sources = raw_sources
            .iter()
            .filter_map(|source| source.get("file").and_then(Value::as_str))
            .filter_map(|file| stream.request().url().join(file).ok())
            .collect::<Vec<Url>>();
        debug!("Found sources {sources:?}");

        get_successful_links(stream.request().client(), sources, ct).await
    }

    async fn poster(&self, stream: &Stream, ct: &CancellationToken) -> Result<Option<String>> {
        let data = self.player_data(stream, ct).await?;
        let Some(image) = data.get("image").and_then(Value::as_str) else {
            return Ok(None);
        };

        let Ok(link) = stream.request().url().join(image) else {
            return Ok(None);
        };
        let req = Request::new(stream.request().client().clone(), link);
        let head = req.head(ct).await?;
        Ok(head.success.then(|| req.url().to_string()))
    }
}

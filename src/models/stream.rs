use std::{fmt, future::Future, sync::Arc};

use async_trait::async_trait;
use chrono::TimeDelta;
use reqwest::Url;
use serde::{Serialize, de::DeserializeOwned};
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    codec::{self, Persistable, Record, URL_KEY},
    entity::{EntityState, Expiring, HOUR},
    error::{Error, Result},
    memo::Memo,
    providers::StreamProvider,
    ranking::Candidate,
    registry::Registry,
    request::Request,
};

pub const ATTRIBUTES: &[&str] = &["external", "links", "poster"];
const VOLATILE: &[&str] = &["links"];
pub const TIME_TO_LIVE: TimeDelta = HOUR;

/// One playable candidate of an episode, backed by the provider that claimed its URL
pub struct Stream {
    state: EntityState,
    request: Request,
    provider: Arc<dyn StreamProvider>,
    working: Memo<bool>,
}

impl fmt::Debug for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} Stream: {}", self.provider.name(), self.request.url())
    }
}

fn attribute_names(provider: &dyn StreamProvider) -> impl Iterator<Item = &'static str> {
    ATTRIBUTES
        .iter()
        .chain(provider.extra_attributes())
        .copied()
}

impl Stream {
    #[must_use]
    pub fn new(provider: Arc<dyn StreamProvider>, request: Request) -> Self {
        Self {
            state: EntityState::new(TIME_TO_LIVE, attribute_names(provider.as_ref()), VOLATILE),
            request,
            provider,
            working: Memo::new(),
        }
    }

    /// Hands `url` to the first provider claiming it. Unparseable or unclaimed
    /// links yield `None`.
    #[must_use]
    pub fn for_url(registry: &Registry, url: &str) -> Option<Self> {
        let Ok(url) = Url::parse(url) else {
            debug!("Ignoring unparseable embed {url:?}");
            return None;
        };
        let Some(provider) = registry.provider_for(&url) else {
            debug!("No provider for {url}");
            return None;
        };

        Some(Self::new(
            provider.clone(),
            Request::new(registry.client().clone(), url),
        ))
    }

    /// # Errors
    /// Unknown type tag, missing or invalid URL
    pub fn from_state(registry: &Registry, record: &Record) -> Result<Self> {
        let provider = registry.provider(codec::type_tag(record)?)?.clone();
        let request = Request::parse(
            registry.client().clone(),
            codec::required_str(record, URL_KEY)?,
        )?;

        Ok(Self {
            state: EntityState::restore(
                TIME_TO_LIVE,
                attribute_names(provider.as_ref()),
                VOLATILE,
                record,
            ),
            request,
            provider,
            working: Memo::new(),
        })
    }

    #[must_use]
    pub fn priority(&self) -> i32 {
        self.provider.priority()
    }

    #[must_use]
    pub fn provider(&self) -> &Arc<dyn StreamProvider> {
        &self.provider
    }

    #[must_use]
    pub const fn request(&self) -> &Request {
        &self.request
    }

    #[must_use]
    pub const fn url(&self) -> &Url {
        self.request.url()
    }

    /// Memoized access to any declared attribute, including provider-private ones
    ///
    /// # Errors
    /// Whatever `init` fails with
    pub async fn attr<T, F, Fut>(&self, name: &str, init: F) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.state.get_or_try_init(name, init).await
    }

    /// # Errors
    /// Provider failures and cancellation
    pub async fn external(&self, ct: &CancellationToken) -> Result<bool> {
        self.attr("external", || self.provider.external(self, ct)).await
    }

    /// # Errors
    /// Provider failures and cancellation
    pub async fn links(&self, ct: &CancellationToken) -> Result<Vec<String>> {
        self.attr("links", || self.provider.links(self, ct)).await
    }

    /// # Errors
    /// Provider failures and cancellation
    pub async fn poster(&self, ct: &CancellationToken) -> Result<Option<String>> {
        self.attr("poster", || self.provider.poster(self, ct)).await
    }

    /// Whether the stream yields at least one link.
    ///
    /// Provider failures are logged and remembered as "not working". A
    /// cancelled check also reports `false` but isn't remembered.
    pub async fn working(&self, ct: &CancellationToken) -> bool {
        self.working
            .get_or_try_init(|| async {
                match self.links(ct).await {
                    Ok(links) => Ok(!links.is_empty()),
                    Err(Error::Cancelled) => Err(Error::Cancelled),
                    Err(e) => {
                        warn!("{self:?} Couldn't fetch links: {e}");
                        Ok(false)
                    }
                }
            })
            .await
            .unwrap_or(false)
    }

    /// Working and allowed to be handed out
    pub async fn working_external(&self, ct: &CancellationToken) -> bool {
        match self.external(ct).await {
            Ok(true) => self.working(ct).await,
            Ok(false) => false,
            Err(Error::Cancelled) => false,
            Err(e) => {
                warn!("{self:?} Couldn't check whether it is external: {e}");
                false
            }
        }
    }

    /// Streams that were fetched but yielded neither links nor a poster aren't
    /// worth keeping, unless their provider asks for it
    #[must_use]
    pub fn persist_worthy(&self) -> bool {
        let has_links = self
            .state
            .peek::<Vec<String>>("links")
            .is_none_or(|links| !links.is_empty());
        let has_poster = !self.state.is_resolved("poster")
            || self.state.peek::<Option<String>>("poster").flatten().is_some();

        self.provider.persist() || has_links || has_poster
    }

    pub async fn to_dict(&self, ct: &CancellationToken) -> Value {
        let (links, poster) = tokio::join!(self.links(ct), self.poster(ct));
        let links = links.unwrap_or_else(|e| {
            warn!("{self:?} has no links: {e}");
            Vec::new()
        });

        json!({
            "type": self.provider.name(),
            "url": self.url().as_str(),
            "links": links,
            "poster": poster.ok().flatten(),
            "updated": self.state.last_update().to_rfc3339(),
        })
    }
}

#[async_trait]
impl Expiring for Stream {
    fn entity_state(&self) -> &EntityState {
        &self.state
    }

    async fn revalidate(&self) {
        self.state.expire_volatile().await;
        self.working.invalidate().await;
        self.request.forget().await;
        self.touch();
    }
}

impl Persistable for Stream {
    fn type_tag(&self) -> &'static str {
        self.provider.name()
    }

    fn url(&self) -> &str {
        self.request.url().as_str()
    }
}

#[async_trait]
impl Candidate for Stream {
    fn priority(&self) -> i32 {
        Self::priority(self)
    }

    async fn usable(&self, ct: &CancellationToken) -> bool {
        self.working_external(ct).await
    }
}

use std::{cmp::Reverse, fmt, future::Future, sync::Arc};

use async_trait::async_trait;
use chrono::TimeDelta;
use futures_util::future::join_all;
use reqwest::Url;
use serde::{Serialize, de::DeserializeOwned};
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    codec::{self, Persistable, Record, URL_KEY},
    entity::{EntityState, Expiring},
    error::{Error, Result},
    memo::Memo,
    race::select_first,
    ranking::select_working,
    registry::Registry,
    request::Request,
    sources::ShowSource,
};

use super::stream::Stream;

pub const ATTRIBUTES: &[&str] = &["raw_streams", "poster"];
/// Every attribute of an episode gets re-checked once it expires
const VOLATILE: &[&str] = ATTRIBUTES;
pub const TIME_TO_LIVE: TimeDelta = TimeDelta::hours(6);

const STREAMS_KEY: &str = "streams";
const SELECTED_KEY: &str = "stream";

/// An episode page. Owns its stream candidates and remembers which of them works.
pub struct Episode {
    state: EntityState,
    request: Request,
    source: Arc<dyn ShowSource>,
    registry: Arc<Registry>,
    streams: Memo<Vec<Arc<Stream>>>,
    selected: Memo<Option<Arc<Stream>>>,
}

impl fmt::Debug for Episode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} Ep.: {}", self.source.name(), self.request.url())
    }
}

impl Episode {
    #[must_use]
    pub fn new(registry: Arc<Registry>, source: Arc<dyn ShowSource>, url: Url) -> Self {
        Self {
            state: EntityState::new(TIME_TO_LIVE, ATTRIBUTES.iter().copied(), VOLATILE),
            request: Request::new(registry.client().clone(), url),
            source,
            registry,
            streams: Memo::new(),
            selected: Memo::new(),
        }
    }

    /// Rebuilds a persisted episode. Candidates that fail to rebuild are dropped.
    ///
    /// # Errors
    /// Mismatching type tag, missing or invalid URL
    pub fn from_state(
        registry: Arc<Registry>,
        source: Arc<dyn ShowSource>,
        record: &Record,
    ) -> Result<Self> {
        let tag = codec::type_tag(record)?;
        if tag != source.name() {
            return Err(Error::UnknownType(tag.to_string()));
        }
        let request = Request::parse(
            registry.client().clone(),
            codec::required_str(record, URL_KEY)?,
        )?;
        let state =
            EntityState::restore(TIME_TO_LIVE, ATTRIBUTES.iter().copied(), VOLATILE, record);

        // Candidates are only as fresh as the embed list they came from
        let (streams, selected) = if state.is_resolved("raw_streams") {
            restore_streams(&registry, record)
        } else {
            (Memo::new(), Memo::new())
        };

        Ok(Self {
            state,
            request,
            source,
            registry,
            streams,
            selected,
        })
    }

    #[must_use]
    pub const fn request(&self) -> &Request {
        &self.request
    }

    #[must_use]
    pub const fn url(&self) -> &Url {
        self.request.url()
    }

    #[must_use]
    pub const fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    async fn attr<T, F, Fut>(&self, name: &str, init: F) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.state.get_or_try_init(name, init).await
    }

    /// Embed links as found on the episode page
    ///
    /// # Errors
    /// Source failures and cancellation
    pub async fn raw_streams(&self, ct: &CancellationToken) -> Result<Vec<String>> {
        self.attr("raw_streams", || self.source.raw_streams(self, ct))
            .await
    }

    /// Stream candidates, highest priority first. Embeds no provider claims are dropped.
    ///
    /// # Errors
    /// See [`Episode::raw_streams`]
    pub async fn streams(&self, ct: &CancellationToken) -> Result<Vec<Arc<Stream>>> {
        let (streams, computed) = self
            .streams
            .get_or_try_compute(|| async {
                let links = self.raw_streams(ct).await?;
                let mut streams = links
                    .iter()
                    .filter_map(|link| Stream::for_url(&self.registry, link))
                    .map(Arc::new)
                    .collect::<Vec<_>>();
                streams.sort_by_key(|s| Reverse(s.priority()));

                debug!(
                    "{self:?} has {} candidate(s) out of {} embeds",
                    streams.len(),
                    links.len()
                );
                Ok(streams)
            })
            .await?;

        if computed {
            self.mark_dirty();
        }
        Ok(streams)
    }

    /// The highest priority stream that works and may be handed out
    ///
    /// # Errors
    /// See [`Episode::raw_streams`]
    pub async fn stream(&self, ct: &CancellationToken) -> Result<Option<Arc<Stream>>> {
        let (selected, computed) = self
            .selected
            .get_or_try_compute(|| async {
                debug!("{self:?} Searching for working stream...");
                let streams = self.streams(ct).await?;
                let selected = select_working(ct, &streams).await;

                // A race cut short by the caller says nothing about the streams
                if ct.is_cancelled() {
                    return Err(Error::Cancelled);
                }

                match &selected {
                    Some(stream) => debug!("Found working stream: {stream:?}"),
                    None => info!("No working stream for {self:?}"),
                }
                Ok(selected)
            })
            .await?;

        if computed {
            self.mark_dirty();
        }
        Ok(selected)
    }

    /// Candidate stream by index
    ///
    /// # Errors
    /// [`Error::StreamNotFound`] outside of the candidate list
    pub async fn get(&self, index: usize, ct: &CancellationToken) -> Result<Arc<Stream>> {
        let streams = self.streams(ct).await?;
        let count = streams.len();
        streams
            .get(index)
            .cloned()
            .ok_or(Error::StreamNotFound { index, count })
    }

    /// Every link of every candidate, in candidate order. Broken candidates contribute nothing.
    ///
    /// # Errors
    /// See [`Episode::raw_streams`]
    pub async fn sources(&self, ct: &CancellationToken) -> Result<Vec<String>> {
        let streams = self.streams(ct).await?;
        let links = join_all(streams.iter().map(|stream| stream.links(ct))).await;

        Ok(links
            .into_iter()
            .zip(&streams)
            .flat_map(|(links, stream)| {
                links.unwrap_or_else(|e| {
                    debug!("{stream:?} has no links: {e}");
                    Vec::new()
                })
            })
            .collect())
    }

    /// The first poster any candidate comes up with
    ///
    /// # Errors
    /// See [`Episode::raw_streams`]
    pub async fn poster(&self, ct: &CancellationToken) -> Result<Option<String>> {
        self.attr("poster", || async {
            debug!("{self:?} searching for poster");
            let streams = self.streams(ct).await?;
            let tasks = streams.iter().cloned().map(|stream| {
                move |token: CancellationToken| async move {
                    stream.poster(&token).await.ok().flatten()
                }
            });

            let poster = select_first(ct, tasks, |p| std::future::ready(p.is_some())).await;
            if ct.is_cancelled() {
                return Err(Error::Cancelled);
            }
            Ok(poster.flatten())
        })
        .await
    }

    /// # Errors
    /// See [`Episode::raw_streams`]
    pub async fn to_dict(&self, ct: &CancellationToken) -> Result<Value> {
        let (raw_streams, stream, poster) =
            tokio::try_join!(self.raw_streams(ct), self.stream(ct), self.poster(ct))?;

        let stream = match stream {
            Some(stream) => Some(stream.to_dict(ct).await),
            None => None,
        };

        Ok(json!({
            "embeds": raw_streams,
            "stream": stream,
            "poster": poster,
            "updated": self.state.last_update().to_rfc3339(),
        }))
    }
}

/// Rebuilds the persisted candidates and the selected stream. The selected stream
/// reuses the candidate with the same provider and URL when there is one.
fn restore_streams(
    registry: &Registry,
    record: &Record,
) -> (Memo<Vec<Arc<Stream>>>, Memo<Option<Arc<Stream>>>) {
    let streams = record.get(STREAMS_KEY).map(|value| {
        codec::from_indexed(value, "stream", |r| Stream::from_state(registry, r))
            .into_values()
            .map(Arc::new)
            .collect::<Vec<_>>()
    });

    let selected = match record.get(SELECTED_KEY) {
        None => None,
        Some(Value::Null) => Some(None),
        Some(Value::Object(r)) => match Stream::from_state(registry, r) {
            Ok(stream) => {
                let known = streams.iter().flatten().find(|s| {
                    s.type_tag() == stream.type_tag() && s.url() == stream.url()
                });
                Some(Some(known.cloned().unwrap_or_else(|| Arc::new(stream))))
            }
            Err(e) => {
                warn!("Dropping persisted selected stream: {e}");
                None
            }
        },
        Some(other) => {
            warn!("Dropping persisted selected stream: unexpected {other}");
            None
        }
    };

    (
        streams.map_or_else(Memo::new, Memo::resolved),
        selected.map_or_else(Memo::new, Memo::resolved),
    )
}

#[async_trait]
impl Expiring for Episode {
    fn entity_state(&self) -> &EntityState {
        &self.state
    }

    fn is_dirty(&self) -> bool {
        self.state.is_dirty()
            || self
                .streams
                .peek()
                .is_some_and(|streams| streams.iter().any(|s| s.is_dirty()))
            || self.selected.peek().flatten().is_some_and(|s| s.is_dirty())
    }

    fn clear_dirty_cascade(&self) {
        self.clear_dirty();
        for stream in self.streams.peek().into_iter().flatten() {
            stream.clear_dirty_cascade();
        }
        if let Some(stream) = self.selected.peek().flatten() {
            stream.clear_dirty_cascade();
        }
    }

    async fn revalidate(&self) {
        self.state.expire_volatile().await;
        self.selected.invalidate().await;
        self.streams.invalidate().await;
        self.request.forget().await;
        self.touch();
    }
}

impl Persistable for Episode {
    fn type_tag(&self) -> &'static str {
        self.source.name()
    }

    fn url(&self) -> &str {
        self.request.url().as_str()
    }

    fn write_special(&self, record: &mut Record) {
        if let Some(streams) = self.streams.peek() {
            let kept = streams
                .iter()
                .filter(|s| s.persist_worthy())
                .map(|s| s.to_state())
                .enumerate();
            record.insert(STREAMS_KEY.into(), codec::indexed(kept));
        }

        if let Some(selected) = self.selected.peek() {
            let value = selected.map_or(Value::Null, |s| Value::Object(s.to_state()));
            record.insert(SELECTED_KEY.into(), value);
        }
    }
}

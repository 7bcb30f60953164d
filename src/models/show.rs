use std::{
    collections::BTreeMap,
    fmt,
    future::Future,
    sync::{Arc, LazyLock, PoisonError, RwLock},
};

use async_trait::async_trait;
use chrono::TimeDelta;
use regex::Regex;
use reqwest::Url;
use serde::{Serialize, de::DeserializeOwned};
use serde_json::{Value, json};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::{
    codec::{self, Persistable, Record, URL_KEY},
    entity::{EntityState, Expiring},
    error::{Error, Result},
    language::Language,
    memo::Memo,
    registry::Registry,
    request::Request,
    sources::ShowSource,
};

use super::episode::Episode;

pub const ATTRIBUTES: &[&str] = &["uid", "is_dub", "language", "title", "episode_count"];
const VOLATILE: &[&str] = &["episode_count"];
pub const TIME_TO_LIVE: TimeDelta = TimeDelta::minutes(30);

const EPISODES_KEY: &str = "episodes";

static UID_CLEANER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new("[^a-z0-9一-龯]+").unwrap());

/// Stable identity of a show: `{tag}-{title}-{language}` with a `_dub` suffix for
/// dubbed shows. Tag and title are lowercased and stripped of anything but
/// ASCII letters, digits and CJK ideographs.
#[must_use]
pub fn make_uid(tag: &str, title: &str, language: Language, dubbed: bool) -> String {
    let tag = UID_CLEANER.replace_all(&tag.to_lowercase(), "").into_owned();
    let title = UID_CLEANER.replace_all(&title.to_lowercase(), "").into_owned();
    let dub = if dubbed { "_dub" } else { "" };

    format!("{tag}-{title}-{}{dub}", language.code())
}

type EpisodeMap = BTreeMap<usize, Arc<Episode>>;

/// A show as listed by one source. Episodes are enumerated lazily and kept for
/// the lifetime of the show: a growing episode count only appends.
pub struct Show {
    state: EntityState,
    request: Request,
    source: Arc<dyn ShowSource>,
    registry: Arc<Registry>,
    episodes: RwLock<Option<EpisodeMap>>,
    /// Episode pages as last enumerated by the source
    listing: Memo<Vec<Url>>,
    /// Serializes episode enumeration
    syncing: Mutex<()>,
}

impl fmt::Debug for Show {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.state.peek::<String>("uid") {
            Some(uid) => f.write_str(&uid),
            None => write!(f, "{} Show: {}", self.source.name(), self.request.url()),
        }
    }
}

fn attribute_names(source: &dyn ShowSource) -> impl Iterator<Item = &'static str> {
    ATTRIBUTES.iter().chain(source.extra_attributes()).copied()
}

impl Show {
    #[must_use]
    pub fn new(registry: Arc<Registry>, source: Arc<dyn ShowSource>, url: Url) -> Self {
        Self {
            state: EntityState::new(TIME_TO_LIVE, attribute_names(source.as_ref()), VOLATILE),
            request: Request::new(registry.client().clone(), url),
            source,
            registry,
            episodes: RwLock::new(None),
            listing: Memo::new(),
            syncing: Mutex::new(()),
        }
    }

    /// Hands `url` to the first source claiming it
    ///
    /// # Errors
    /// [`Error::InvalidUrl`] or [`Error::InvalidRequest`] when no source handles the URL
    pub fn for_url(registry: Arc<Registry>, url: &str) -> Result<Self> {
        let url = Url::parse(url).map_err(|_| Error::InvalidUrl(url.to_string()))?;
        let source = registry
            .source_for(&url)
            .cloned()
            .ok_or_else(|| Error::InvalidRequest(format!("No source handles {url}")))?;

        Ok(Self::new(registry, source, url))
    }

    /// Rebuilds a persisted show. Episodes that fail to rebuild are dropped.
    ///
    /// # Errors
    /// Unknown type tag, missing or invalid URL
    pub fn from_state(registry: Arc<Registry>, record: &Record) -> Result<Self> {
        let source = registry.source(codec::type_tag(record)?)?.clone();
        let request = Request::parse(
            registry.client().clone(),
            codec::required_str(record, URL_KEY)?,
        )?;

        let episodes = record.get(EPISODES_KEY).map(|value| {
            codec::from_indexed(value, "episode", |r| {
                Episode::from_state(registry.clone(), source.clone(), r).map(Arc::new)
            })
        });

        Ok(Self {
            state: EntityState::restore(
                TIME_TO_LIVE,
                attribute_names(source.as_ref()),
                VOLATILE,
                record,
            ),
            request,
            source,
            registry,
            episodes: RwLock::new(episodes),
            listing: Memo::new(),
            syncing: Mutex::new(()),
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
    pub fn source(&self) -> &Arc<dyn ShowSource> {
        &self.source
    }

    /// Memoized access to any declared attribute, including source-private ones
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
    /// Source failures and cancellation
    pub async fn uid(&self, ct: &CancellationToken) -> Result<String> {
        self.attr("uid", || async {
            let (title, language, dubbed) =
                tokio::try_join!(self.title(ct), self.language(ct), self.is_dub(ct))?;
            Ok(make_uid(self.source.name(), &title, language, dubbed))
        })
        .await
    }

    /// # Errors
    /// Source failures and cancellation
    pub async fn title(&self, ct: &CancellationToken) -> Result<String> {
        self.attr("title", || self.source.title(self, ct)).await
    }

    /// # Errors
    /// Source failures and cancellation
    pub async fn is_dub(&self, ct: &CancellationToken) -> Result<bool> {
        self.attr("is_dub", || self.source.is_dub(self, ct)).await
    }

    /// # Errors
    /// Source failures and cancellation
    pub async fn language(&self, ct: &CancellationToken) -> Result<Language> {
        self.attr("language", || self.source.language(self, ct)).await
    }

    /// # Errors
    /// Source failures and cancellation
    pub async fn episode_count(&self, ct: &CancellationToken) -> Result<usize> {
        self.attr("episode_count", || self.source.episode_count(self, ct))
            .await
    }

    /// The source's episode enumeration. Fetched at most once until the show
    /// revalidates, so counting and gap filling share one listing.
    ///
    /// # Errors
    /// Source failures and cancellation
    pub async fn episode_listing(&self, ct: &CancellationToken) -> Result<Vec<Url>> {
        self.listing
            .get_or_try_init(|| self.source.episodes(self, ct))
            .await
    }

    fn loaded_episodes(&self) -> Option<EpisodeMap> {
        self.episodes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn store_episodes(&self, episodes: EpisodeMap) {
        *self.episodes.write().unwrap_or_else(PoisonError::into_inner) = Some(episodes);
    }

    fn build_episode(&self, url: Url) -> Arc<Episode> {
        Arc::new(Episode::new(self.registry.clone(), self.source.clone(), url))
    }

    /// Every episode by index. The source is asked to enumerate them once; later
    /// calls only fill in indices that appeared since.
    ///
    /// # Errors
    /// Source failures and cancellation
    pub async fn episodes(&self, ct: &CancellationToken) -> Result<EpisodeMap> {
        let _syncing = self.syncing.lock().await;

        let Some(mut episodes) = self.loaded_episodes() else {
            let episodes = self
                .episode_listing(ct)
                .await?
                .into_iter()
                .map(|url| self.build_episode(url))
                .enumerate()
                .collect::<EpisodeMap>();
            debug!("{self:?} enumerated {} episodes", episodes.len());

            self.store_episodes(episodes.clone());
            self.mark_dirty();
            return Ok(episodes);
        };

        let count = self.episode_count(ct).await?;
        if episodes.len() != count {
            info!("{self:?} doesn't have all episodes. updating!");

            for index in 0..count {
                if !episodes.contains_key(&index) {
                    let url = self.source.episode(self, index, ct).await?;
                    episodes.insert(index, self.build_episode(url));
                }
            }

            self.store_episodes(episodes.clone());
            self.mark_dirty();
        }

        Ok(episodes)
    }

    /// Episode by index, re-validated when stale
    ///
    /// # Errors
    /// [`Error::EpisodeNotFound`] outside of `0..episode_count`, source failures
    pub async fn get(&self, index: usize, ct: &CancellationToken) -> Result<Arc<Episode>> {
        let count = self.episode_count(ct).await?;
        if index >= count {
            return Err(Error::EpisodeNotFound { index, count });
        }

        let known = self
            .loaded_episodes()
            .and_then(|episodes| episodes.get(&index).cloned());
        let episode = match known {
            Some(episode) => episode,
            None => self
                .episodes(ct)
                .await?
                .get(&index)
                .cloned()
                .ok_or(Error::EpisodeNotFound { index, count })?,
        };

        if episode.is_stale() {
            debug!("{episode:?} is stale, revalidating");
            episode.revalidate().await;
        }
        Ok(episode)
    }

    /// # Errors
    /// Source failures and cancellation
    pub async fn to_dict(&self, ct: &CancellationToken) -> Result<Value> {
        let (uid, title, episode_count, dubbed, language) = tokio::try_join!(
            self.uid(ct),
            self.title(ct),
            self.episode_count(ct),
            self.is_dub(ct),
            self.language(ct),
        )?;

        Ok(json!({
            "uid": uid,
            "title": title,
            "episodes": episode_count,
            "dubbed": dubbed,
            "language": language,
            "updated": self.state.last_update().to_rfc3339(),
        }))
    }
}

#[async_trait]
impl Expiring for Show {
    fn entity_state(&self) -> &EntityState {
        &self.state
    }

    fn is_dirty(&self) -> bool {
        self.state.is_dirty()
            || self
                .loaded_episodes()
                .is_some_and(|episodes| episodes.values().any(|ep| ep.is_dirty()))
    }

    fn clear_dirty_cascade(&self) {
        self.clear_dirty();
        for episode in self.loaded_episodes().into_iter().flat_map(BTreeMap::into_values) {
            episode.clear_dirty_cascade();
        }
    }

    async fn revalidate(&self) {
        self.state.expire_volatile().await;
        self.listing.invalidate().await;
        self.request.forget().await;
        self.touch();
    }
}

impl Persistable for Show {
    fn type_tag(&self) -> &'static str {
        self.source.name()
    }

    fn url(&self) -> &str {
        self.request.url().as_str()
    }

    fn write_special(&self, record: &mut Record) {
        if let Some(episodes) = self.loaded_episodes() {
            let children = episodes
                .into_iter()
                .map(|(index, episode)| (index, episode.to_state()));
            record.insert(EPISODES_KEY.into(), codec::indexed(children));
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use super::*;
    use crate::models::{
        episode::tests::{FakeSource, registry_with_source},
        stream::tests::FakeProvider,
    };

    const TITLE: &str = "Sousou no Frieren";

    fn show_with(episodes: Vec<Vec<String>>) -> (Arc<FakeSource>, Show) {
        let source = Arc::new(FakeSource::new(TITLE, episodes.clone()));
        let registry = registry_with_source(
            vec![FakeProvider::new("A", "a.test")],
            FakeSource::new(TITLE, episodes),
        );
        let url = Url::parse("http://shows.test/frieren").unwrap();
        let show = Show::new(registry, source.clone(), url);
        (source, show)
    }

    fn embeds(count: usize) -> Vec<Vec<String>> {
        (0..count).map(|i| vec![format!("http://a.test/{i}")]).collect()
    }

    #[test]
    fn uid_is_normalized() {
        assert_eq!(
            make_uid("JsonFeed", "Frieren: Beyond Journey's End", Language::En, false),
            "jsonfeed-frierenbeyondjourneysend-en"
        );
        assert_eq!(
            make_uid("Fake", "進撃の巨人", Language::Ja, true),
            "fake-進撃巨人-ja_dub"
        );
        assert_eq!(
            make_uid("Fake", "One  Piece!", Language::De, false),
            make_uid("fake", "one piece", Language::De, false)
        );
    }

    #[tokio::test]
    async fn uid_from_content() {
        let (_, show) = show_with(embeds(1));
        let uid = show.uid(&CancellationToken::new()).await.unwrap();
        assert_eq!(uid, "fake-sousounofrieren-en");
        assert_eq!(format!("{show:?}"), uid);
    }

    #[tokio::test]
    async fn get_respects_episode_count() {
        let (_, show) = show_with(embeds(3));
        let ct = CancellationToken::new();

        let last = show.get(2, &ct).await.unwrap();
        assert_eq!(last.url().as_str(), "http://shows.test/ep/2");
        assert!(matches!(
            show.get(3, &ct).await,
            Err(Error::EpisodeNotFound { index: 3, count: 3 })
        ));
    }

    #[tokio::test]
    async fn enumerates_once_and_appends_new_episodes() {
        let (source, show) = show_with(embeds(2));
        let ct = CancellationToken::new();

        let first = show.episodes(&ct).await.unwrap();
        assert_eq!(first.len(), 2);
        show.episodes(&ct).await.unwrap();
        assert_eq!(show.episode_count(&ct).await.unwrap(), 2);
        assert_eq!(source.listed.load(Ordering::SeqCst), 1);

        // the source now lists a third episode
        source.announced.store(1, Ordering::SeqCst);
        show.revalidate().await;
        let second = show.episodes(&ct).await.unwrap();
        assert_eq!(second.len(), 3);
        assert!(Arc::ptr_eq(&first[&0], &second[&0]));
        assert!(Arc::ptr_eq(&first[&1], &second[&1]));
        assert_eq!(second[&2].url().as_str(), "http://shows.test/ep/2");
        assert_eq!(source.listed.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn lists_episodes_once_per_sync() {
        let (source, show) = show_with(embeds(3));
        let ct = CancellationToken::new();

        show.get(0, &ct).await.unwrap();
        show.get(2, &ct).await.unwrap();
        assert_eq!(source.listed.load(Ordering::SeqCst), 1);

        // two new episodes are filled in from a single listing
        source.announced.store(2, Ordering::SeqCst);
        show.revalidate().await;
        let last = show.get(4, &ct).await.unwrap();
        assert_eq!(last.url().as_str(), "http://shows.test/ep/4");
        assert_eq!(show.episodes(&ct).await.unwrap().len(), 5);
        assert_eq!(source.listed.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn dirty_propagates_from_stream_to_show() {
        let (_, show) = show_with(embeds(1));
        let ct = CancellationToken::new();
        let episode = show.get(0, &ct).await.unwrap();
        let stream = episode.stream(&ct).await.unwrap().unwrap();

        show.clear_dirty_cascade();
        assert!(!show.is_dirty());

        stream.mark_dirty();
        assert!(episode.is_dirty());
        assert!(show.is_dirty());

        show.clear_dirty();
        assert!(show.is_dirty(), "children stay dirty without cascading");
        assert!(stream.is_dirty());

        show.clear_dirty_cascade();
        assert!(!stream.is_dirty());
        assert!(!episode.is_dirty());
        assert!(!show.is_dirty());
    }

    #[tokio::test]
    async fn round_trip_drops_broken_episodes() {
        let (_, show) = show_with(embeds(2));
        let ct = CancellationToken::new();
        show.uid(&ct).await.unwrap();
        show.get(1, &ct).await.unwrap().stream(&ct).await.unwrap();

        let record = show.to_state();
        assert_eq!(record["cls"], "Fake");
        assert_eq!(record["uid"], "fake-sousounofrieren-en");
        assert_eq!(record["language"], "en");
        assert_eq!(record["episode_count"], 2);
        assert_eq!(record["episodes"].as_object().unwrap().len(), 2);

        let registry = show.registry.clone();
        let restored = Show::from_state(registry.clone(), &record).unwrap();
        assert!(!restored.is_dirty());
        assert_eq!(restored.to_state(), record);
        assert_eq!(
            restored.uid(&ct).await.unwrap(),
            "fake-sousounofrieren-en",
            "uid is not recomputed"
        );

        let mut broken = record.clone();
        broken["episodes"]["1"]["url"] = json!("not a url");
        let restored = Show::from_state(registry, &broken).unwrap();
        let episodes = restored.loaded_episodes().unwrap();
        assert_eq!(episodes.keys().copied().collect::<Vec<_>>(), [0]);
    }

    #[test]
    fn url_without_source_is_rejected() {
        let registry = registry_with_source(Vec::new(), FakeSource::new("x", Vec::new()));
        assert!(matches!(
            Show::for_url(registry.clone(), "http://elsewhere.test/show"),
            Err(Error::InvalidRequest(_))
        ));
        assert!(matches!(Show::for_url(registry.clone(), "not a url"), Err(Error::InvalidUrl(_))));
        assert!(Show::for_url(registry, "http://shows.test/x").is_ok());
    }

    #[tokio::test]
    async fn to_dict_projection() {
        let (_, show) = show_with(embeds(4));
        let dict = show.to_dict(&CancellationToken::new()).await.unwrap();

        assert_eq!(dict["uid"], "fake-sousounofrieren-en");
        assert_eq!(dict["title"], TITLE);
        assert_eq!(dict["episodes"], 4);
        assert_eq!(dict["dubbed"], false);
        assert_eq!(dict["language"], "en");
    }
}

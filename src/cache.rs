//! Process-wide show registry and the persistence driver.

use std::{
    collections::HashMap,
    sync::{Arc, PoisonError, RwLock},
};

use futures_util::future::join_all;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    codec::Persistable,
    entity::Expiring,
    error::Result,
    language::Language,
    models::Show,
    registry::Registry,
    store::StateStore,
};

/// Shows by uid. Entities live here until the process exits; stale ones are
/// re-validated when they are looked up again.
#[derive(Debug)]
pub struct ShowCache {
    registry: Arc<Registry>,
    store: Arc<dyn StateStore>,
    shows: RwLock<HashMap<String, Arc<Show>>>,
}

impl ShowCache {
    #[must_use]
    pub fn new(registry: Arc<Registry>, store: Arc<dyn StateStore>) -> Self {
        Self {
            registry,
            store,
            shows: RwLock::new(HashMap::new()),
        }
    }

    #[must_use]
    pub const fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.shows.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn cached(&self, uid: &str) -> Option<Arc<Show>> {
        self.shows
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(uid)
            .cloned()
    }

    /// Keeps whichever show got registered under `uid` first
    fn register(&self, uid: String, show: Arc<Show>) -> Arc<Show> {
        self.shows
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(uid)
            .or_insert(show)
            .clone()
    }

    async fn revalidated(show: Arc<Show>) -> Arc<Show> {
        if show.is_stale() {
            debug!("{show:?} is stale, revalidating");
            show.revalidate().await;
        }
        show
    }

    /// Show by uid, from memory or the store. Unreadable records count as unknown.
    ///
    /// # Errors
    /// Only client errors, like a malformed uid
    pub async fn get(&self, uid: &str) -> Result<Option<Arc<Show>>> {
        if let Some(show) = self.cached(uid) {
            return Ok(Some(Self::revalidated(show).await));
        }

        let record = match self.store.load(uid).await {
            Ok(Some(record)) => record,
            Ok(None) => return Ok(None),
            Err(e) if e.is_client_error() => return Err(e),
            Err(e) => {
                error!("Couldn't load {uid}: {e}");
                return Ok(None);
            }
        };

        match Show::from_state(self.registry.clone(), &record) {
            Ok(show) => {
                debug!("Loaded {uid} from the store");
                Ok(Some(self.register(uid.to_string(), Arc::new(show))))
            }
            Err(e) => {
                warn!("Couldn't rebuild {uid}: {e}");
                Ok(None)
            }
        }
    }

    /// Registers `show` under its uid. If a show with that uid is already known
    /// (in memory or in the store) that one is returned instead.
    ///
    /// # Errors
    /// Failures computing the uid
    pub async fn insert(&self, show: Show, ct: &CancellationToken) -> Result<Arc<Show>> {
        let uid = show.uid(ct).await?;
        if let Some(known) = self.get(&uid).await? {
            return Ok(known);
        }

        info!("New show {uid}");
        Ok(self.register(uid, Arc::new(show)))
    }

    /// The show behind `url`, dispatched to the first source that handles it
    ///
    /// # Errors
    /// No source for the URL, failures computing the uid
    pub async fn show_for_url(&self, url: &str, ct: &CancellationToken) -> Result<Arc<Show>> {
        let show = Show::for_url(self.registry.clone(), url)?;
        self.insert(show, ct).await
    }

    /// Show by title, language and dub flag. Only shows that already know their
    /// title are considered, nothing is fetched.
    ///
    /// # Errors
    /// Only client errors
    pub async fn find(
        &self,
        title: &str,
        language: Language,
        dubbed: bool,
    ) -> Result<Option<Arc<Show>>> {
        let needle = title.to_lowercase();
        let in_memory = self
            .shows
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .find(|show| {
                let state = show.entity_state();
                state.peek::<String>("title").is_some_and(|t| t.to_lowercase() == needle)
                    && state.peek::<Language>("language") == Some(language)
                    && state.peek::<bool>("is_dub") == Some(dubbed)
            })
            .cloned();
        if let Some(show) = in_memory {
            return Ok(Some(Self::revalidated(show).await));
        }

        let record = match self.store.find(title, language, dubbed).await {
            Ok(Some(record)) => record,
            Ok(None) => return Ok(None),
            Err(e) => {
                error!("Couldn't search the store for {title:?}: {e}");
                return Ok(None);
            }
        };

        let Some(uid) = record.get("uid").and_then(|uid| uid.as_str()) else {
            warn!("Stored show {title:?} has no uid");
            return Ok(None);
        };
        if let Some(show) = self.cached(uid) {
            return Ok(Some(Self::revalidated(show).await));
        }
        match Show::from_state(self.registry.clone(), &record) {
            Ok(show) => Ok(Some(self.register(uid.to_string(), Arc::new(show)))),
            Err(e) => {
                warn!("Couldn't rebuild {uid}: {e}");
                Ok(None)
            }
        }
    }

    /// Saves every dirty show. Dirty flags are only cleared for shows whose save
    /// succeeded; failures are logged. Returns the number of shows saved.
    pub async fn save_dirty(&self) -> usize {
        let dirty = self
            .shows
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|(_, show)| show.is_dirty())
            .map(|(uid, show)| (uid.clone(), show.clone()))
            .collect::<Vec<_>>();

        if dirty.is_empty() {
            return 0;
        }
        debug!("Saving {} dirty show(s)", dirty.len());

        let saves = dirty.into_iter().map(|(uid, show)| async move {
            let record = show.to_state();
            match self.store.save(&uid, &record).await {
                Ok(()) => {
                    show.clear_dirty_cascade();
                    true
                }
                Err(e) => {
                    error!("Couldn't save {uid}: {e}");
                    false
                }
            }
        });

        join_all(saves).await.into_iter().filter(|saved| *saved).count()
    }

    /// [`ShowCache::save_dirty`] in the background
    pub fn save_dirty_later(self: &Arc<Self>) -> JoinHandle<usize> {
        let cache = Arc::clone(self);
        tokio::spawn(async move { cache.save_dirty().await })
    }
}

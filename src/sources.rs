//! Show sources: sites (or feeds) that list shows, their episodes and the
//! embed links of each episode.

use std::fmt::Debug;

use async_trait::async_trait;
use reqwest::Url;
use tokio_util::sync::CancellationToken;

use crate::{
    error::{Error, Result},
    language::Language,
    models::{episode::Episode, show::Show},
};

pub mod feed;

pub use feed::JsonFeed;

#[async_trait]
pub trait ShowSource: Send + Sync + Debug {
    /// Type tag written into persisted shows, also part of every show's uid
    fn name(&self) -> &'static str;

    /// Cheap check, must not touch the network
    fn can_handle(&self, url: &Url) -> bool;

    /// Source-private show attributes persisted alongside the common ones
    fn extra_attributes(&self) -> &'static [&'static str] {
        &[]
    }

    async fn title(&self, show: &Show, ct: &CancellationToken) -> Result<String>;

    async fn is_dub(&self, show: &Show, ct: &CancellationToken) -> Result<bool>;

    async fn language(&self, show: &Show, ct: &CancellationToken) -> Result<Language>;

    /// Defaults to the length of the show's memoized listing
    async fn episode_count(&self, show: &Show, ct: &CancellationToken) -> Result<usize> {
        Ok(show.episode_listing(ct).await?.len())
    }

    /// Every episode page, in order. Called through [`Show::episode_listing`].
    async fn episodes(&self, show: &Show, ct: &CancellationToken) -> Result<Vec<Url>>;

    /// A single episode page, used to fill gaps when the episode count grows
    async fn episode(&self, show: &Show, index: usize, ct: &CancellationToken) -> Result<Url> {
        let mut episodes = show.episode_listing(ct).await?;
        let count = episodes.len();
        if index >= count {
            return Err(Error::EpisodeNotFound { index, count });
        }
        Ok(episodes.swap_remove(index))
    }

    /// Raw embed links found on an episode page
    async fn raw_streams(&self, episode: &Episode, ct: &CancellationToken) -> Result<Vec<String>>;
}

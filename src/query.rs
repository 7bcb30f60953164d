//! Request parameters to entities: which show, which episode, which stream.

use std::{collections::HashMap, sync::Arc};

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{
    cache::ShowCache,
    error::{Error, Result},
    language::Language,
    models::{Episode, Show, Stream},
};

pub type Params = HashMap<String, String>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShowQuery {
    Uid(String),
    /// Unspecified language and dub flag fall back to English and subbed
    Title {
        title: String,
        language: Option<Language>,
        dubbed: Option<bool>,
    },
}

/// Lenient boolean: `true/yes/y/on/1` and `false/no/n/off/0`, case-insensitive
#[must_use]
pub fn fuzzy_bool(value: &str) -> Option<bool> {
    match value.trim().to_lowercase().as_str() {
        "true" | "yes" | "y" | "on" | "1" => Some(true),
        "false" | "no" | "n" | "off" | "0" => Some(false),
        _ => None,
    }
}

/// Non-negative integer parameter
///
/// # Errors
/// [`Error::InvalidRequest`] when the parameter isn't an integer, or is missing
/// without a default
pub fn int_param(params: &Params, name: &str, default: Option<usize>) -> Result<usize> {
    match params.get(name) {
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| {
                Error::InvalidRequest(format!(
                    "{name} must be a non-negative integer, not {value:?}"
                ))
            }),
        None => default.ok_or_else(|| Error::InvalidRequest(format!("please specify {name}!"))),
    }
}

impl ShowQuery {
    /// # Errors
    /// [`Error::InvalidRequest`] when neither a uid nor a title is given, or a
    /// value can't be converted
    pub fn build(params: &Params) -> Result<Self> {
        if let Some(uid) = params.get("uid") {
            return Ok(Self::Uid(uid.clone()));
        }

        let Some(title) = params.get("anime").or_else(|| params.get("title")) else {
            return Err(Error::InvalidRequest(
                "Please specify the show using either its uid, or a title (anime), language and \
                 dubbed value"
                    .into(),
            ));
        };

        let language = params.get("language").map(|l| l.parse()).transpose()?;
        let dubbed = params
            .get("dubbed")
            .map(|d| {
                fuzzy_bool(d).ok_or_else(|| {
                    Error::InvalidRequest(format!("dubbed must be a boolean, not {d:?}"))
                })
            })
            .transpose()?;

        Ok(Self::Title {
            title: title.clone(),
            language,
            dubbed,
        })
    }

    /// # Errors
    /// [`Error::UidUnknown`], [`Error::ShowNotFound`] or [`Error::InvalidRequest`]
    /// for an empty uid
    pub async fn resolve(&self, cache: &ShowCache) -> Result<Arc<Show>> {
        match self {
            Self::Uid(uid) if uid.is_empty() => Err(Error::InvalidRequest("Empty uid".into())),
            Self::Uid(uid) => cache
                .get(uid)
                .await?
                .ok_or_else(|| Error::UidUnknown(uid.clone())),
            Self::Title {
                title,
                language,
                dubbed,
            } => {
                let language = language.unwrap_or_default();
                let dubbed = dubbed.unwrap_or(false);
                debug!("Looking for {title:?} ({language}, dubbed: {dubbed})");

                cache
                    .find(title, language, dubbed)
                    .await?
                    .ok_or_else(|| Error::ShowNotFound(title.clone()))
            }
        }
    }
}

/// # Errors
/// See [`ShowQuery::build`] and [`ShowQuery::resolve`]
pub async fn get_show(cache: &ShowCache, params: &Params) -> Result<Arc<Show>> {
    ShowQuery::build(params)?.resolve(cache).await
}

/// The `episode` of the requested show
///
/// # Errors
/// Invalid parameters, unknown show, [`Error::EpisodeNotFound`]
pub async fn get_episode(
    cache: &ShowCache,
    params: &Params,
    ct: &CancellationToken,
) -> Result<Arc<Episode>> {
    let index = int_param(params, "episode", None)?;
    let show = get_show(cache, params).await?;
    show.get(index, ct).await
}

/// The `stream` candidate of the requested episode
///
/// # Errors
/// See [`get_episode`], [`Error::StreamNotFound`]
pub async fn get_stream(
    cache: &ShowCache,
    params: &Params,
    ct: &CancellationToken,
) -> Result<Arc<Stream>> {
    let index = int_param(params, "stream", None)?;
    let episode = get_episode(cache, params, ct).await?;
    episode.get(index, ct).await
}

/// The `source` link of the requested episode
///
/// # Errors
/// See [`get_episode`], [`Error::SourceNotFound`]
pub async fn get_source(
    cache: &ShowCache,
    params: &Params,
    ct: &CancellationToken,
) -> Result<String> {
    let index = int_param(params, "source", None)?;
    let episode = get_episode(cache, params, ct).await?;
    let mut sources = episode.sources(ct).await?;

    let count = sources.len();
    if index >= count {
        return Err(Error::SourceNotFound { index, count });
    }
    Ok(sources.swap_remove(index))
}

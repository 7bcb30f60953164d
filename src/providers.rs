//! Stream providers: pluggable extractors turning an embed URL into playable links.

use std::fmt::Debug;

use async_trait::async_trait;
use futures_util::future::join_all;
use reqwest::{Client, Url};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{
    error::{Error, Result},
    models::stream::Stream,
    request::{Request, host_of},
};

pub mod vidstreaming;

pub use vidstreaming::Vidstreaming;

pub const DEFAULT_PRIORITY: i32 = 100;

/// Content-type prefixes accepted as playable video
pub const VIDEO_MIME_TYPES: &[&str] = &["video/"];

#[async_trait]
pub trait StreamProvider: Send + Sync + Debug {
    /// Type tag written into persisted streams
    fn name(&self) -> &'static str;

    fn priority(&self) -> i32 {
        DEFAULT_PRIORITY
    }

    /// Hosts (without `www.`) this provider extracts from
    fn hosts(&self) -> &[String] {
        &[]
    }

    /// Cheap check, must not touch the network
    fn can_handle(&self, url: &Url) -> bool {
        host_of(url).is_some_and(|host| self.hosts().iter().any(|h| h == host))
    }

    /// Keep streams of this provider even when they yielded neither links nor poster
    fn persist(&self) -> bool {
        false
    }

    /// Provider-private attributes persisted alongside the common ones
    fn extra_attributes(&self) -> &'static [&'static str] {
        &[]
    }

    /// Whether the links may be handed to clients outside this system
    async fn external(&self, stream: &Stream, ct: &CancellationToken) -> Result<bool>;

    async fn links(&self, stream: &Stream, ct: &CancellationToken) -> Result<Vec<String>>;

    async fn poster(&self, _stream: &Stream, _ct: &CancellationToken) -> Result<Option<String>> {
        Ok(None)
    }
}

/// Probes every source concurrently and keeps those answering a HEAD request
/// with a video content-type. Returns the final URLs after redirects.
///
/// # Errors
/// [`Error::Cancelled`] when `ct` fires before every probe is done
pub async fn get_successful_links(
    client: &Client,
    sources: impl IntoIterator<Item = Url>,
    ct: &CancellationToken,
) -> Result<Vec<String>> {
    let requests = sources
        .into_iter()
        .map(|url| Request::new(client.clone(), url))
        .collect::<Vec<_>>();

    let checks = requests.iter().map(|req| async move {
        let Ok(head) = req.head(ct).await else {
            return None;
        };
        if !head.success {
            debug!("{req:?} didn't make it (probably timeout)!");
            return None;
        }
        let Some(content_type) = head.content_type else {
            debug!("No content type for {req:?}");
            return None;
        };

        VIDEO_MIME_TYPES
            .iter()
            .any(|prefix| content_type.starts_with(prefix))
            .then(|| head.url.to_string())
    });

    let urls = join_all(checks).await.into_iter().flatten().collect::<Vec<_>>();
    if ct.is_cancelled() {
        return Err(Error::Cancelled);
    }

    debug!("Found {} working sources", urls.len());
    Ok(urls)
}

use std::{fmt, future::Future};

use reqwest::{Client, Url, header::CONTENT_TYPE};
use serde::de::DeserializeOwned;
use tokio::select;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use crate::{
    error::{Error, Result},
    memo::Memo,
};

/// Outcome of a HEAD probe
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Head {
    pub success: bool,
    pub content_type: Option<String>,
    /// Final URL after redirects
    pub url: Url,
}

/// A lazily evaluated request for one URL. The HEAD probe and the body are
/// fetched at most once and shared by every caller.
pub struct Request {
    client: Client,
    url: Url,
    head: Memo<Head>,
    text: Memo<String>,
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Request").field(&self.url.as_str()).finish()
    }
}

impl Request {
    #[must_use]
    pub fn new(client: Client, url: Url) -> Self {
        Self {
            client,
            url,
            head: Memo::new(),
            text: Memo::new(),
        }
    }

    /// # Errors
    /// [`Error::InvalidUrl`] when `url` doesn't parse
    pub fn parse(client: Client, url: &str) -> Result<Self> {
        let url = Url::parse(url).map_err(|_| Error::InvalidUrl(url.to_string()))?;
        Ok(Self::new(client, url))
    }

    #[must_use]
    pub const fn url(&self) -> &Url {
        &self.url
    }

    #[must_use]
    pub const fn client(&self) -> &Client {
        &self.client
    }

    /// Host of the URL without a leading `www.`
    #[must_use]
    pub fn host(&self) -> Option<&str> {
        host_of(&self.url)
    }

    /// Probes the URL with a HEAD request, following redirects.
    ///
    /// Network failures and timeouts are cached as an unsuccessful probe.
    ///
    /// # Errors
    /// [`Error::Cancelled`] when `ct` fires first. Nothing is cached in that case.
    #[instrument(skip(self, ct), fields(url = %self.url))]
    pub async fn head(&self, ct: &CancellationToken) -> Result<Head> {
        self.head
            .get_or_try_init(|| async {
                let res = cancellable(ct, self.client.head(self.url.clone()).send()).await?;
                let head = match res {
                    Ok(res) => Head {
                        success: res.status().is_success(),
                        content_type: res
                            .headers()
                            .get(CONTENT_TYPE)
                            .and_then(|v| v.to_str().ok())
                            .map(str::to_string),
                        url: res.url().clone(),
                    },
                    Err(e) => {
                        debug!("HEAD failed: {e}");
                        Head {
                            success: false,
                            content_type: None,
                            url: self.url.clone(),
                        }
                    }
                };
                Ok::<_, Error>(head)
            })
            .await
    }

    /// Cancellation counts as a failed probe
    pub async fn head_success(&self, ct: &CancellationToken) -> bool {
        self.head(ct).await.is_ok_and(|head| head.success)
    }

    /// Body of a GET request
    ///
    /// # Errors
    /// Network errors, non-success statuses and cancellation
    #[instrument(skip(self, ct), fields(url = %self.url))]
    pub async fn text(&self, ct: &CancellationToken) -> Result<String> {
        self.text
            .get_or_try_init(|| async {
                cancellable(ct, async {
                    let res = self
                        .client
                        .get(self.url.clone())
                        .send()
                        .await?
                        .error_for_status()?;
                    res.text().await
                })
                .await?
                .map_err(Error::from)
            })
            .await
    }

    /// # Errors
    /// See [`Request::text`], plus JSON decoding errors
    pub async fn json<T: DeserializeOwned>(&self, ct: &CancellationToken) -> Result<T> {
        Ok(serde_json::from_str(&self.text(ct).await?)?)
    }

    /// Forgets the cached probe and body
    pub async fn forget(&self) {
        self.head.invalidate().await;
        self.text.invalidate().await;
    }
}

#[must_use]
pub fn host_of(url: &Url) -> Option<&str> {
    url.host_str()
        .map(|host| host.strip_prefix("www.").unwrap_or(host))
}

/// Races `fut` against `ct`. Losing drops the future, which aborts the
/// underlying connection.
///
/// # Errors
/// [`Error::Cancelled`] when the token fires first
pub async fn cancellable<T>(ct: &CancellationToken, fut: impl Future<Output = T>) -> Result<T> {
    select! {
        biased;
        () = ct.cancelled() => Err(Error::Cancelled),
        value = fut => Ok(value),
    }
}

use std::sync::Arc;

use thiserror::Error;

use crate::memo::Failure;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Clone, Error)]
pub enum Error {
    #[error("Episode {index} not found (show has {count} episodes)")]
    EpisodeNotFound { index: usize, count: usize },

    #[error("Stream {index} not found (episode has {count} streams)")]
    StreamNotFound { index: usize, count: usize },

    #[error("Source {index} not found (episode has {count} sources)")]
    SourceNotFound { index: usize, count: usize },

    #[error("No show with uid {0:?}")]
    UidUnknown(String),

    #[error("No show matching {0:?}")]
    ShowNotFound(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Unknown type tag {0:?}")]
    UnknownType(String),

    #[error("Record is missing field {0:?}")]
    MissingField(&'static str),

    #[error("Attribute {0:?} is not declared on this entity")]
    UnknownAttribute(String),

    #[error("Computation was cancelled")]
    Cancelled,

    #[error("Extraction failed: {0}")]
    Extraction(String),

    #[error("Invalid URL {0:?}")]
    InvalidUrl(String),

    #[error(transparent)]
    Http(Arc<reqwest::Error>),

    #[error(transparent)]
    Codec(Arc<serde_json::Error>),

    #[error(transparent)]
    Io(Arc<std::io::Error>),
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Self::Http(Arc::new(e))
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Codec(Arc::new(e))
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Self::Io(Arc::new(e))
    }
}

/// Waiters on a failed lookup get the same error, unless the lookup was
/// cancelled: their own token may still be live.
impl Failure for Error {
    fn is_shared(&self) -> bool {
        !matches!(self, Self::Cancelled)
    }
}

impl Error {
    /// Requested index or identity outside of what exists
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::EpisodeNotFound { .. }
                | Self::StreamNotFound { .. }
                | Self::SourceNotFound { .. }
                | Self::UidUnknown(_)
                | Self::ShowNotFound(_)
        )
    }

    /// Errors that may be handed to whoever issued the request.
    /// Everything else degrades to "no result" inside the graph.
    #[must_use]
    pub const fn is_client_error(&self) -> bool {
        self.is_not_found() || matches!(self, Self::InvalidRequest(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_error_families() {
        assert!(Error::EpisodeNotFound { index: 3, count: 3 }.is_not_found());
        assert!(Error::UidUnknown("x".into()).is_client_error());
        assert!(Error::InvalidRequest("no uid".into()).is_client_error());
        assert!(!Error::InvalidRequest("no uid".into()).is_not_found());
        assert!(!Error::Cancelled.is_client_error());
        assert!(!Error::UnknownType("Foo".into()).is_client_error());
    }

    #[test]
    fn cancellation_is_never_shared() {
        assert!(!Error::Cancelled.is_shared());
        assert!(Error::Extraction("no player".into()).is_shared());

        let io = Error::from(std::io::Error::other("disk on fire"));
        assert_eq!(io.clone().to_string(), "disk on fire");
    }
}

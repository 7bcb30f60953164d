//! Persisted show records, one per uid.

use std::{
    collections::HashMap,
    fmt::Debug,
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::{
        Mutex, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
};

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, instrument, warn};

use crate::{
    codec::Record,
    error::{Error, Result},
    language::Language,
};

#[async_trait]
pub trait StateStore: Send + Sync + Debug {
    /// # Errors
    /// Storage or decoding failures. An unknown uid is `Ok(None)`.
    async fn load(&self, uid: &str) -> Result<Option<Record>>;

    /// # Errors
    /// Storage failures
    async fn save(&self, uid: &str, record: &Record) -> Result<()>;

    /// First record of a show with this title (case-insensitive), language and dub flag
    ///
    /// # Errors
    /// Storage failures
    async fn find(&self, title: &str, language: Language, dubbed: bool) -> Result<Option<Record>>;
}

/// Whether a persisted show record describes the given show
#[must_use]
pub fn matches(record: &Record, title: &str, language: Language, dubbed: bool) -> bool {
    let title_matches = record
        .get("title")
        .and_then(Value::as_str)
        .is_some_and(|t| t.to_lowercase() == title.to_lowercase());
    let language_matches = record
        .get("language")
        .and_then(Value::as_str)
        .is_some_and(|l| l == language.code());
    let dub_matches = record.get("is_dub").and_then(Value::as_bool) == Some(dubbed);

    title_matches && language_matches && dub_matches
}

/// One pretty-printed JSON file per uid
#[derive(Debug)]
pub struct JsonDirStore {
    root: PathBuf,
    writes: AtomicU64,
}

impl JsonDirStore {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            writes: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, uid: &str) -> Result<PathBuf> {
        if uid.is_empty() || uid.starts_with('.') || uid.contains(['/', '\\']) {
            return Err(Error::InvalidRequest(format!("Invalid uid {uid:?}")));
        }
        Ok(self.root.join(format!("{uid}.json")))
    }

    async fn read(path: &Path) -> Result<Option<Record>> {
        match tokio::fs::read(path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl StateStore for JsonDirStore {
    #[instrument(skip(self))]
    async fn load(&self, uid: &str) -> Result<Option<Record>> {
        Self::read(&self.path_for(uid)?).await
    }

    #[instrument(skip(self, record))]
    async fn save(&self, uid: &str, record: &Record) -> Result<()> {
        let path = self.path_for(uid)?;
        tokio::fs::create_dir_all(&self.root).await?;

        // Written next to the target so the rename never crosses file systems
        let write = self.writes.fetch_add(1, Ordering::Relaxed);
        let tmp = self
            .root
            .join(format!(".{uid}.{}-{write}.tmp", std::process::id()));

        let bytes = serde_json::to_vec_pretty(record)?;
        if let Err(e) = tokio::fs::write(&tmp, bytes).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        tokio::fs::rename(&tmp, &path).await?;

        debug!("Saved to {path:?}");
        Ok(())
    }

    async fn find(&self, title: &str, language: Language, dubbed: bool) -> Result<Option<Record>> {
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let is_record = path.extension().is_some_and(|ext| ext == "json")
                && !entry.file_name().to_string_lossy().starts_with('.');
            if !is_record {
                continue;
            }

            match Self::read(&path).await {
                Ok(Some(record)) if matches(&record, title, language, dubbed) => {
                    return Ok(Some(record));
                }
                Ok(_) => {}
                Err(e) => warn!("Skipping unreadable record {path:?}: {e}"),
            }
        }

        Ok(None)
    }
}

/// In-process store
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: Mutex<HashMap<String, Record>>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn load(&self, uid: &str) -> Result<Option<Record>> {
        let records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(records.get(uid).cloned())
    }

    async fn save(&self, uid: &str, record: &Record) -> Result<()> {
        let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        records.insert(uid.to_string(), record.clone());
        Ok(())
    }

    async fn find(&self, title: &str, language: Language, dubbed: bool) -> Result<Option<Record>> {
        let records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(records
            .values()
            .find(|record| matches(record, title, language, dubbed))
            .cloned())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn record(title: &str, language: &str, dubbed: bool) -> Record {
        json!({
            "cls": "JsonFeed",
            "url": "https://feeds.test/show.json",
            "title": title,
            "language": language,
            "is_dub": dubbed,
        })
        .as_object()
        .unwrap()
        .clone()
    }

    fn temp_root(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("stream-resolver-{name}-{}", std::process::id()))
    }

    #[test]
    fn matching_is_case_insensitive_on_title_only() {
        let r = record("Frieren", "en", false);
        assert!(matches(&r, "frieren", Language::En, false));
        assert!(!matches(&r, "Frieren", Language::De, false));
        assert!(!matches(&r, "Frieren", Language::En, true));
        assert!(!matches(&Record::new(), "Frieren", Language::En, false));
    }

    #[tokio::test]
    async fn json_dir_round_trip() {
        let root = temp_root("round-trip");
        let store = JsonDirStore::new(&root);

        assert!(store.load("jsonfeed-frieren-en").await.unwrap().is_none());
        assert!(store.find("Frieren", Language::En, false).await.unwrap().is_none());

        let r = record("Frieren", "en", false);
        store.save("jsonfeed-frieren-en", &r).await.unwrap();
        store.save("jsonfeed-frieren-en", &r).await.unwrap();
        store.save("jsonfeed-frieren-de", &record("Frieren", "de", false)).await.unwrap();

        assert_eq!(store.load("jsonfeed-frieren-en").await.unwrap(), Some(r.clone()));
        assert_eq!(store.find("FRIEREN", Language::En, false).await.unwrap(), Some(r));

        // no temp files left behind
        let mut entries = tokio::fs::read_dir(&root).await.unwrap();
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await.unwrap() {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        names.sort();
        assert_eq!(names, ["jsonfeed-frieren-de.json", "jsonfeed-frieren-en.json"]);

        tokio::fs::remove_dir_all(&root).await.unwrap();
    }

    #[tokio::test]
    async fn rejects_path_like_uids() {
        let store = JsonDirStore::new(temp_root("uids"));
        for uid in ["", "../etc/passwd", ".hidden", "a/b", "a\\b"] {
            assert!(matches!(store.load(uid).await, Err(Error::InvalidRequest(_))), "{uid}");
        }
    }

    #[tokio::test]
    async fn memory_store() {
        let store = MemoryStore::new();
        assert!(store.is_empty());

        store.save("a", &record("A", "en", true)).await.unwrap();
        assert_eq!(store.len(), 1);
        assert!(store.load("a").await.unwrap().is_some());
        assert!(store.load("b").await.unwrap().is_none());
        assert!(store.find("a", Language::En, true).await.unwrap().is_some());
        assert!(store.find("a", Language::En, false).await.unwrap().is_none());
    }
}

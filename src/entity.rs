//! Shared state of every cacheable entity: timestamps, time-to-live, the dirty
//! flag and the table of memoized attributes keyed by name.

use std::{
    future::Future,
    sync::atomic::{AtomicBool, AtomicI64, Ordering},
};

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use serde::{Serialize, de::DeserializeOwned};
use serde_json::Value;
use tracing::debug;

use crate::{
    codec::{self, CREATED_KEY, Record, UPDATED_KEY},
    error::{Error, Result},
    memo::Memo,
};

pub const MINUTE: TimeDelta = TimeDelta::minutes(1);
pub const HOUR: TimeDelta = TimeDelta::hours(1);

#[derive(Debug)]
pub struct EntityState {
    created_at: DateTime<Utc>,
    /// Milliseconds since the epoch
    last_update: AtomicI64,
    ttl: TimeDelta,
    dirty: AtomicBool,
    attributes: Vec<(&'static str, Memo<Value>)>,
    volatile: &'static [&'static str],
}

impl EntityState {
    pub fn new(
        ttl: TimeDelta,
        attribute_names: impl IntoIterator<Item = &'static str>,
        volatile: &'static [&'static str],
    ) -> Self {
        let now = Utc::now();
        Self {
            created_at: now,
            last_update: AtomicI64::new(now.timestamp_millis()),
            ttl,
            dirty: AtomicBool::new(false),
            attributes: dedup(attribute_names)
                .into_iter()
                .map(|name| (name, Memo::new()))
                .collect(),
            volatile,
        }
    }

    /// Rebuilds the state of a persisted entity.
    ///
    /// Declared attributes present in `record` start out resolved. When the
    /// record is already stale its volatile attributes are left unset so they
    /// get recomputed on next access.
    pub fn restore(
        ttl: TimeDelta,
        attribute_names: impl IntoIterator<Item = &'static str>,
        volatile: &'static [&'static str],
        record: &Record,
    ) -> Self {
        let now = Utc::now();
        let created_at = codec::timestamp(record, CREATED_KEY).unwrap_or(now);
        let last_update = codec::timestamp(record, UPDATED_KEY).unwrap_or(created_at);
        let stale = now - last_update > ttl;

        let attributes = dedup(attribute_names)
            .into_iter()
            .map(|name| {
                let skip = stale && volatile.contains(&name);
                let memo = match record.get(name) {
                    Some(value) if !skip => Memo::resolved(value.clone()),
                    _ => Memo::new(),
                };
                (name, memo)
            })
            .collect();

        if stale {
            debug!("Restored state is stale, volatile attributes {volatile:?} will be recomputed");
        }

        Self {
            created_at,
            last_update: AtomicI64::new(if stale { now } else { last_update }.timestamp_millis()),
            ttl,
            dirty: AtomicBool::new(false),
            attributes,
            volatile,
        }
    }

    #[must_use]
    pub const fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    #[must_use]
    pub fn last_update(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(self.last_update.load(Ordering::Acquire))
            .unwrap_or(self.created_at)
    }

    #[must_use]
    pub const fn time_to_live(&self) -> TimeDelta {
        self.ttl
    }

    pub fn attribute_names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.attributes.iter().map(|(name, _)| *name)
    }

    #[must_use]
    pub const fn volatile_attribute_names(&self) -> &'static [&'static str] {
        self.volatile
    }

    pub fn touch(&self) {
        self.last_update
            .store(Utc::now().timestamp_millis(), Ordering::Release);
    }

    #[cfg(test)]
    pub(crate) fn backdate(&self, by: TimeDelta) {
        self.last_update
            .fetch_sub(by.num_milliseconds(), Ordering::AcqRel);
    }

    #[must_use]
    pub fn is_stale(&self) -> bool {
        self.is_stale_at(Utc::now())
    }

    #[must_use]
    pub fn is_stale_at(&self, now: DateTime<Utc>) -> bool {
        now - self.last_update() > self.ttl
    }

    pub fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Release);
    }

    pub fn clear_dirty(&self) {
        self.dirty.store(false, Ordering::Release);
    }

    /// The entity's own flag, ignoring children
    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    fn slot(&self, name: &str) -> Result<&Memo<Value>> {
        self.attributes
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, memo)| memo)
            .ok_or_else(|| Error::UnknownAttribute(name.to_string()))
    }

    /// Memoized access to a declared attribute. A freshly computed value marks
    /// the entity dirty.
    ///
    /// # Errors
    /// [`Error::UnknownAttribute`] for undeclared names, codec errors, or
    /// whatever `init` fails with (which is not cached)
    pub async fn get_or_try_init<T, F, Fut>(&self, name: &str, init: F) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let (value, computed) = self
            .slot(name)?
            .get_or_try_compute(|| async { Ok::<_, Error>(serde_json::to_value(init().await?)?) })
            .await?;

        // Only once the value is in its slot, so a save clearing the flag has
        // seen the value
        if computed {
            self.mark_dirty();
        }
        Ok(serde_json::from_value(value)?)
    }

    #[must_use]
    pub fn peek<T: DeserializeOwned>(&self, name: &str) -> Option<T> {
        let value = self.slot(name).ok()?.peek()?;
        serde_json::from_value(value).ok()
    }

    #[must_use]
    pub fn is_resolved(&self, name: &str) -> bool {
        self.slot(name).is_ok_and(|memo| memo.peek().is_some())
    }

    /// Every attribute that currently holds a value, in declaration order
    #[must_use]
    pub fn resolved_attributes(&self) -> Vec<(&'static str, Value)> {
        self.attributes
            .iter()
            .filter_map(|(name, memo)| memo.peek().map(|value| (*name, value)))
            .collect()
    }

    pub async fn expire_volatile(&self) {
        for (name, memo) in &self.attributes {
            if self.volatile.contains(name) {
                memo.invalidate().await;
            }
        }
    }
}

fn dedup(names: impl IntoIterator<Item = &'static str>) -> Vec<&'static str> {
    let mut unique = Vec::new();
    for name in names {
        if !unique.contains(&name) {
            unique.push(name);
        }
    }
    unique
}

/// Capabilities shared by every cacheable entity.
///
/// Dirtiness propagates upwards by computation: a parent reports dirty when its
/// own flag is set or any loaded child reports dirty.
#[async_trait]
pub trait Expiring: Send + Sync {
    fn entity_state(&self) -> &EntityState;

    fn is_dirty(&self) -> bool {
        self.entity_state().is_dirty()
    }

    fn mark_dirty(&self) {
        self.entity_state().mark_dirty();
    }

    /// Clears this entity's own flag only
    fn clear_dirty(&self) {
        self.entity_state().clear_dirty();
    }

    /// Clears this entity's flag and every loaded descendant's
    fn clear_dirty_cascade(&self) {
        self.clear_dirty();
    }

    fn is_stale(&self) -> bool {
        self.entity_state().is_stale()
    }

    fn touch(&self) {
        self.entity_state().touch();
    }

    /// Drops every volatile attribute so it is recomputed on next access
    async fn revalidate(&self) {
        self.entity_state().expire_volatile().await;
        self.touch();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use serde_json::json;

    use super::*;

    const VOLATILE: &[&str] = &["count"];

    fn state() -> EntityState {
        EntityState::new(HOUR, ["title", "count", "title"], VOLATILE)
    }

    #[test]
    fn declares_attributes_once_in_order() {
        let state = state();
        assert_eq!(state.attribute_names().collect::<Vec<_>>(), ["title", "count"]);
        assert_eq!(state.volatile_attribute_names(), ["count"]);
        assert!(!state.is_dirty());
        assert!(!state.is_stale());
    }

    #[tokio::test]
    async fn resolving_an_attribute_marks_dirty() {
        let state = state();
        let calls = AtomicUsize::new(0);

        for _ in 0..3 {
            let title: String = state
                .get_or_try_init("title", || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok("Frieren".to_string())
                })
                .await
                .unwrap();
            assert_eq!(title, "Frieren");
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(state.is_dirty());
        assert_eq!(state.peek::<String>("title").as_deref(), Some("Frieren"));
    }

    #[tokio::test]
    async fn dirty_only_once_value_is_stored() {
        let state = state();
        let (tx, rx) = tokio::sync::oneshot::channel::<u32>();

        let pending = state.get_or_try_init("count", || async {
            rx.await.map_err(|_| Error::Cancelled)
        });
        let check = async {
            tokio::task::yield_now().await;
            assert!(!state.is_dirty());
            assert!(!state.is_resolved("count"));
            tx.send(28).unwrap();
        };

        let (count, ()) = tokio::join!(pending, check);
        assert_eq!(count.unwrap(), 28);
        assert!(state.is_dirty());
        assert_eq!(state.resolved_attributes(), [("count", json!(28))]);
    }

    #[tokio::test]
    async fn undeclared_attribute_is_rejected() {
        let state = state();
        let err = state
            .get_or_try_init("nope", || async { Ok(1_u8) })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::UnknownAttribute(name) if name == "nope"));
    }

    #[tokio::test]
    async fn failed_computation_keeps_entity_clean() {
        let state = state();
        let res: Result<u32> = state
            .get_or_try_init("count", || async { Err(Error::Extraction("down".into())) })
            .await;

        assert!(res.is_err());
        assert!(!state.is_resolved("count"));
        assert!(!state.is_dirty());
    }

    #[test]
    fn staleness_follows_ttl() {
        let state = EntityState::new(MINUTE, ["title"], &[]);
        let now = Utc::now();

        assert!(!state.is_stale_at(now + TimeDelta::seconds(30)));
        assert!(state.is_stale_at(now + TimeDelta::minutes(2)));
    }

    #[test]
    fn restore_skips_volatile_attributes_of_stale_records() {
        let record = json!({
            "created": "2020-01-01T00:00:00+00:00",
            "updated": "2020-01-01T00:00:00+00:00",
            "title": "Frieren",
            "count": 28,
        });
        let state =
            EntityState::restore(HOUR, ["title", "count"], VOLATILE, record.as_object().unwrap());

        assert_eq!(state.peek::<String>("title").as_deref(), Some("Frieren"));
        assert!(!state.is_resolved("count"));
        assert!(!state.is_stale());
        assert!(!state.is_dirty());
    }

    #[test]
    fn restore_keeps_everything_of_fresh_records() {
        let now = Utc::now().to_rfc3339();
        let record = json!({"created": now, "updated": now, "title": "Frieren", "count": 28});
        let state =
            EntityState::restore(HOUR, ["title", "count"], VOLATILE, record.as_object().unwrap());

        assert_eq!(state.peek::<u32>("count"), Some(28));
        assert_eq!(state.resolved_attributes().len(), 2);
    }

    #[tokio::test]
    async fn expire_volatile_drops_only_volatile() {
        let now = Utc::now().to_rfc3339();
        let record = json!({"created": now, "updated": now, "title": "Frieren", "count": 28});
        let state =
            EntityState::restore(HOUR, ["title", "count"], VOLATILE, record.as_object().unwrap());

        state.expire_volatile().await;
        assert!(state.is_resolved("title"));
        assert!(!state.is_resolved("count"));
    }
}

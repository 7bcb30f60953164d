//! Flat persisted records.
//!
//! Every entity persists as a JSON object carrying a type tag under [`TYPE_KEY`],
//! its timestamps and every resolved attribute. Composite fields (child entities)
//! are written by the entity's [`Persistable::write_special`] hook. Child
//! collections are objects keyed by index so one broken entry can be dropped
//! without losing its siblings.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use tracing::warn;

use crate::{
    entity::Expiring,
    error::{Error, Result},
};

pub type Record = Map<String, Value>;

pub const TYPE_KEY: &str = "cls";
pub const URL_KEY: &str = "url";
pub const CREATED_KEY: &str = "created";
pub const UPDATED_KEY: &str = "updated";

pub trait Persistable: Expiring {
    /// Tag used to find the reconstructor for this record
    fn type_tag(&self) -> &'static str;

    fn url(&self) -> &str;

    /// Writes composite fields the attribute table can't express
    fn write_special(&self, _record: &mut Record) {}

    fn to_state(&self) -> Record {
        let state = self.entity_state();
        let mut record = Record::new();

        record.insert(TYPE_KEY.into(), self.type_tag().into());
        record.insert(URL_KEY.into(), self.url().into());
        record.insert(CREATED_KEY.into(), state.created_at().to_rfc3339().into());
        record.insert(UPDATED_KEY.into(), state.last_update().to_rfc3339().into());
        for (name, value) in state.resolved_attributes() {
            record.insert(name.to_string(), value);
        }

        self.write_special(&mut record);
        record
    }
}

/// # Errors
/// [`Error::MissingField`] when the record has no type tag
pub fn type_tag(record: &Record) -> Result<&str> {
    required_str(record, TYPE_KEY)
}

/// # Errors
/// [`Error::MissingField`] when `key` is absent or not a string
pub fn required_str<'a>(record: &'a Record, key: &'static str) -> Result<&'a str> {
    record
        .get(key)
        .and_then(Value::as_str)
        .ok_or(Error::MissingField(key))
}

pub fn timestamp(record: &Record, key: &str) -> Option<DateTime<Utc>> {
    record
        .get(key)
        .and_then(Value::as_str)
        .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
        .map(|t| t.with_timezone(&Utc))
}

/// Writes children as `{"0": {...}, "1": {...}}`
pub fn indexed(children: impl IntoIterator<Item = (usize, Record)>) -> Value {
    Value::Object(
        children
            .into_iter()
            .map(|(index, record)| (index.to_string(), Value::Object(record)))
            .collect(),
    )
}

/// Reads an indexed child collection, dropping (and logging) every entry that
/// fails to rebuild instead of failing the whole collection
pub fn from_indexed<T>(
    value: &Value,
    what: &str,
    mut rebuild: impl FnMut(&Record) -> Result<T>,
) -> BTreeMap<usize, T> {
    let Some(entries) = value.as_object() else {
        warn!("Persisted {what} collection is not an object. Ignoring it");
        return BTreeMap::new();
    };

    let mut children = BTreeMap::new();
    for (key, entry) in entries {
        let Ok(index) = key.parse::<usize>() else {
            warn!("Dropping persisted {what} with non-numeric key {key:?}");
            continue;
        };
        let Some(record) = entry.as_object() else {
            warn!("Dropping persisted {what} {index}: not an object");
            continue;
        };

        match rebuild(record) {
            Ok(child) => {
                children.insert(index, child);
            }
            Err(e) => warn!("Dropping persisted {what} {index}: {e}"),
        }
    }

    children
}

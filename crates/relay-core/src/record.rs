//! Normalized records.
//!
//! A [`Record`] is the flat, per-entity unit of the store: its own id, its
//! typename, and a map from storage key to [`FieldValue`]. Records never nest;
//! links to other entities are [`FieldValue::Ref`]/[`FieldValue::Refs`].
//!
//! Records serialize to a single flat JSON object using reserved keys for
//! identity (`__id`, `__typename`), invalidation (`__invalidated_at`) and
//! per-field server errors (`__errors`).

use indexmap::IndexMap;
use serde::de::{Deserializer, Error as _};
use serde::ser::{SerializeMap, Serializer};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::CoreError;
use crate::id::DataId;
use crate::payload::PayloadError;
use crate::value::FieldValue;

/// Reserved key holding the record's own id.
pub const ID_KEY: &str = "__id";

/// Reserved key holding the record's concrete GraphQL typename.
pub const TYPENAME_KEY: &str = "__typename";

/// Reserved key holding the write epoch at which the record was invalidated.
pub const INVALIDATED_AT_KEY: &str = "__invalidated_at";

/// Reserved key holding per-field payload errors.
pub const ERRORS_KEY: &str = "__errors";

/// A single normalized entity.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    id: DataId,
    fields: IndexMap<String, FieldValue>,
    invalidated_at: Option<u64>,
    errors: IndexMap<String, Vec<PayloadError>>,
}

impl Record {
    /// Creates an empty record, tagging it with `typename` when known.
    pub fn new(id: DataId, typename: Option<&str>) -> Self {
        let mut fields = IndexMap::new();
        if let Some(typename) = typename {
            fields.insert(
                TYPENAME_KEY.to_string(),
                FieldValue::Scalar(Value::String(typename.to_string())),
            );
        }
        Record {
            id,
            fields,
            invalidated_at: None,
            errors: IndexMap::new(),
        }
    }

    pub fn id(&self) -> &DataId {
        &self.id
    }

    /// The concrete typename, if the record has one.
    pub fn typename(&self) -> Option<&str> {
        match self.fields.get(TYPENAME_KEY) {
            Some(FieldValue::Scalar(Value::String(t))) => Some(t),
            _ => None,
        }
    }

    pub fn set_typename(&mut self, typename: &str) {
        self.fields.insert(
            TYPENAME_KEY.to_string(),
            FieldValue::Scalar(Value::String(typename.to_string())),
        );
    }

    /// The value stored under `storage_key`; `None` means "not fetched".
    pub fn get(&self, storage_key: &str) -> Option<&FieldValue> {
        self.fields.get(storage_key)
    }

    pub fn contains(&self, storage_key: &str) -> bool {
        self.fields.contains_key(storage_key)
    }

    pub fn set(&mut self, storage_key: impl Into<String>, value: FieldValue) {
        self.fields.insert(storage_key.into(), value);
    }

    /// Writes a field, refusing to change the kind of an existing non-null
    /// value (a reference over a scalar, a scalar over a list, ...).
    pub fn try_set(&mut self, storage_key: impl Into<String>, value: FieldValue) -> Result<(), CoreError> {
        let storage_key = storage_key.into();
        if let Some(current) = self.fields.get(&storage_key) {
            check_compatible(&self.id, &storage_key, current, &value)?;
        }
        self.fields.insert(storage_key, value);
        Ok(())
    }

    pub fn set_scalar(&mut self, storage_key: impl Into<String>, value: Value) {
        self.set(storage_key, FieldValue::Scalar(value));
    }

    pub fn set_linked_record_id(&mut self, storage_key: impl Into<String>, id: DataId) {
        self.set(storage_key, FieldValue::Ref(id));
    }

    pub fn set_linked_record_ids(&mut self, storage_key: impl Into<String>, ids: Vec<Option<DataId>>) {
        self.set(storage_key, FieldValue::Refs(ids));
    }

    /// Forgets a field entirely, returning it to the "not fetched" state.
    pub fn remove(&mut self, storage_key: &str) -> Option<FieldValue> {
        self.errors.shift_remove(storage_key);
        self.fields.shift_remove(storage_key)
    }

    /// Iterates stored fields in insertion order, including `__typename`.
    pub fn fields(&self) -> impl Iterator<Item = (&str, &FieldValue)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn field_count(&self) -> usize {
        self.fields.len()
    }

    /// Every record id this record links to.
    pub fn referenced_ids(&self) -> impl Iterator<Item = &DataId> {
        self.fields.values().flat_map(FieldValue::referenced_ids)
    }

    /// Copies every field (and its errors) of `source` onto this record.
    /// The record's own id is unaffected.
    pub fn copy_fields_from(&mut self, source: &Record) {
        for (key, value) in &source.fields {
            self.fields.insert(key.clone(), value.clone());
        }
        for (key, errors) in &source.errors {
            self.errors.insert(key.clone(), errors.clone());
        }
    }

    pub fn invalidated_at(&self) -> Option<u64> {
        self.invalidated_at
    }

    pub fn set_invalidated_at(&mut self, epoch: u64) {
        self.invalidated_at = Some(epoch);
    }

    /// Server errors reported for the field at `storage_key`.
    pub fn field_errors(&self, storage_key: &str) -> Option<&[PayloadError]> {
        self.errors.get(storage_key).map(Vec::as_slice)
    }

    pub fn set_field_errors(&mut self, storage_key: impl Into<String>, errors: Vec<PayloadError>) {
        self.errors.insert(storage_key.into(), errors);
    }

    /// Merges `next` into this record field by field.
    ///
    /// Returns `Ok(None)` when `next` carries nothing new, so callers can
    /// skip marking the record as updated. Writing a field clears any stale
    /// server errors for it unless `next` reports errors of its own.
    pub fn update(&self, next: &Record) -> Result<Option<Record>, CoreError> {
        if self.id != next.id {
            return Err(CoreError::DataIdMismatch {
                expected: self.id.clone(),
                actual: next.id.clone(),
            });
        }

        let mut merged: Option<Record> = None;
        for (key, value) in &next.fields {
            if let Some(current) = self.fields.get(key) {
                check_compatible(&self.id, key, current, value)?;
                if current == value {
                    continue;
                }
            }
            merged
                .get_or_insert_with(|| self.clone())
                .fields
                .insert(key.clone(), value.clone());
        }

        for key in next.fields.keys() {
            let incoming = next.errors.get(key);
            if self.errors.get(key) == incoming {
                continue;
            }
            let target = merged.get_or_insert_with(|| self.clone());
            match incoming {
                Some(errors) => {
                    target.errors.insert(key.clone(), errors.clone());
                }
                None => {
                    target.errors.shift_remove(key);
                }
            }
        }

        if next.invalidated_at > self.invalidated_at {
            merged.get_or_insert_with(|| self.clone()).invalidated_at = next.invalidated_at;
        }

        Ok(merged)
    }

    /// Decodes a record from its flat persisted form.
    pub fn from_json(map: IndexMap<String, Value>) -> Result<Record, CoreError> {
        let mut id = None;
        let mut fields = IndexMap::new();
        let mut invalidated_at = None;
        let mut errors = IndexMap::new();

        for (key, value) in map {
            match key.as_str() {
                ID_KEY => match value {
                    Value::String(s) => id = Some(DataId::new(s)),
                    other => {
                        return Err(CoreError::MalformedRecord {
                            reason: format!("'{ID_KEY}' must be a string, got {other}"),
                        })
                    }
                },
                INVALIDATED_AT_KEY => {
                    invalidated_at = Some(value.as_u64().ok_or_else(|| {
                        CoreError::MalformedRecord {
                            reason: format!("'{INVALIDATED_AT_KEY}' must be an unsigned integer"),
                        }
                    })?);
                }
                ERRORS_KEY => {
                    errors = serde_json::from_value(value).map_err(|e| CoreError::MalformedRecord {
                        reason: format!("'{ERRORS_KEY}': {e}"),
                    })?;
                }
                _ => {
                    fields.insert(key, FieldValue::from_json(value));
                }
            }
        }

        let id = id.ok_or_else(|| CoreError::MalformedRecord {
            reason: format!("missing '{ID_KEY}'"),
        })?;
        Ok(Record {
            id,
            fields,
            invalidated_at,
            errors,
        })
    }
}

fn check_compatible(
    id: &DataId,
    storage_key: &str,
    current: &FieldValue,
    incoming: &FieldValue,
) -> Result<(), CoreError> {
    if current.is_null() || incoming.is_null() {
        return Ok(());
    }
    let same_kind = matches!(
        (current, incoming),
        (FieldValue::Scalar(_), FieldValue::Scalar(_))
            | (FieldValue::Ref(_), FieldValue::Ref(_))
            | (FieldValue::Refs(_), FieldValue::Refs(_))
    );
    if same_kind {
        Ok(())
    } else {
        Err(CoreError::StorageKeyCollision {
            id: id.clone(),
            storage_key: storage_key.to_string(),
            existing: current.kind(),
            incoming: incoming.kind(),
        })
    }
}

impl Serialize for Record {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let extra = usize::from(self.invalidated_at.is_some()) + usize::from(!self.errors.is_empty());
        let mut map = serializer.serialize_map(Some(1 + self.fields.len() + extra))?;
        map.serialize_entry(ID_KEY, &self.id)?;
        for (key, value) in &self.fields {
            map.serialize_entry(key, value)?;
        }
        if let Some(epoch) = self.invalidated_at {
            map.serialize_entry(INVALIDATED_AT_KEY, &epoch)?;
        }
        if !self.errors.is_empty() {
            map.serialize_entry(ERRORS_KEY, &self.errors)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for Record {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let map = IndexMap::<String, Value>::deserialize(deserializer)?;
        Record::from_json(map).map_err(D::Error::custom)
    }
}

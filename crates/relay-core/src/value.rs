//! Field values stored in records.
//!
//! A field holds a plain JSON scalar, a reference to another record, or an
//! ordered list of references. References serialize through reserved
//! wrapper objects (`{"__ref": id}` / `{"__refs": [...]}`) so a persisted
//! source can tell a link apart from a string that happens to equal an id.
//!
//! Scalars are leaf values: JSON without objects at any depth. Writers
//! reject anything else, which keeps the wrapper objects unambiguous when a
//! source is decoded again.

use serde::de::Deserializer;
use serde::ser::{SerializeMap, Serializer};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::id::DataId;

/// Wrapper key for a single reference.
pub const REF_KEY: &str = "__ref";

/// Wrapper key for a reference list.
pub const REFS_KEY: &str = "__refs";

/// A value stored under one storage key of a record.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    /// Any JSON value written by a scalar field, including `null` and lists.
    Scalar(Value),
    /// Link to another record.
    Ref(DataId),
    /// Links for a plural field; `None` keeps a `null` element in place.
    Refs(Vec<Option<DataId>>),
}

impl FieldValue {
    /// The explicit `null` value.
    pub fn null() -> Self {
        FieldValue::Scalar(Value::Null)
    }

    /// True for a scalar `null`.
    pub fn is_null(&self) -> bool {
        matches!(self, FieldValue::Scalar(Value::Null))
    }

    /// Short name of the value kind, used in error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            FieldValue::Scalar(Value::Null) => "null",
            FieldValue::Scalar(_) => "scalar",
            FieldValue::Ref(_) => "reference",
            FieldValue::Refs(_) => "reference list",
        }
    }

    pub fn as_scalar(&self) -> Option<&Value> {
        match self {
            FieldValue::Scalar(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_ref_id(&self) -> Option<&DataId> {
        match self {
            FieldValue::Ref(id) => Some(id),
            _ => None,
        }
    }

    pub fn as_refs(&self) -> Option<&[Option<DataId>]> {
        match self {
            FieldValue::Refs(ids) => Some(ids),
            _ => None,
        }
    }

    /// Every record id this value links to.
    pub fn referenced_ids(&self) -> impl Iterator<Item = &DataId> {
        let (single, many): (Option<&DataId>, &[Option<DataId>]) = match self {
            FieldValue::Ref(id) => (Some(id), &[]),
            FieldValue::Refs(ids) => (None, ids.as_slice()),
            FieldValue::Scalar(_) => (None, &[]),
        };
        single.into_iter().chain(many.iter().flatten())
    }

    /// Decodes a persisted value, recognising the reference wrappers.
    ///
    /// An object holding only `__ref` (a string) or only `__refs` (strings
    /// and nulls) always decodes as a reference. Other objects stay scalars,
    /// though no writer in this workspace produces them.
    pub fn from_json(value: Value) -> Self {
        if let Value::Object(map) = &value {
            if map.len() == 1 {
                if let Some(Value::String(id)) = map.get(REF_KEY) {
                    return FieldValue::Ref(DataId::new(id.clone()));
                }
                if let Some(Value::Array(items)) = map.get(REFS_KEY) {
                    let ids: Option<Vec<Option<DataId>>> = items
                        .iter()
                        .map(|item| match item {
                            Value::String(id) => Some(Some(DataId::new(id.clone()))),
                            Value::Null => Some(None),
                            _ => None,
                        })
                        .collect();
                    if let Some(ids) = ids {
                        return FieldValue::Refs(ids);
                    }
                }
            }
        }
        FieldValue::Scalar(value)
    }

    /// Encodes the value in its persisted form.
    pub fn to_json(&self) -> Value {
        match self {
            FieldValue::Scalar(v) => v.clone(),
            FieldValue::Ref(id) => serde_json::json!({ REF_KEY: id.as_str() }),
            FieldValue::Refs(ids) => {
                let items: Vec<Value> = ids
                    .iter()
                    .map(|id| match id {
                        Some(id) => Value::String(id.as_str().to_string()),
                        None => Value::Null,
                    })
                    .collect();
                serde_json::json!({ REFS_KEY: items })
            }
        }
    }
}

/// Whether `value` can be stored as a scalar: it holds no object at any
/// depth.
pub fn is_leaf_value(value: &Value) -> bool {
    match value {
        Value::Object(_) => false,
        Value::Array(items) => items.iter().all(is_leaf_value),
        _ => true,
    }
}

impl From<Value> for FieldValue {
    fn from(value: Value) -> Self {
        FieldValue::Scalar(value)
    }
}

impl Serialize for FieldValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            FieldValue::Scalar(v) => v.serialize(serializer),
            FieldValue::Ref(id) => {
                let mut map = serializer.serialize_map(Some(1))?;
                map.serialize_entry(REF_KEY, id)?;
                map.end()
            }
            FieldValue::Refs(ids) => {
                let mut map = serializer.serialize_map(Some(1))?;
                map.serialize_entry(REFS_KEY, ids)?;
                map.end()
            }
        }
    }
}

impl<'de> Deserialize<'de> for FieldValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Value::deserialize(deserializer).map(FieldValue::from_json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn reference_wrappers_roundtrip() {
        let value = FieldValue::Refs(vec![Some(DataId::new("1")), None]);
        let json = serde_json::to_value(&value).unwrap();
        assert_eq!(json, json!({"__refs": ["1", null]}));
        let back: FieldValue = serde_json::from_value(json).unwrap();
        assert_eq!(back, value);
    }

    #[test]
    fn string_equal_to_an_id_stays_scalar() {
        let value = FieldValue::Scalar(json!("1"));
        let back: FieldValue = serde_json::from_value(serde_json::to_value(&value).unwrap()).unwrap();
        assert_eq!(back, value);
        assert!(back.as_ref_id().is_none());
    }

    #[test]
    fn object_with_extra_keys_is_scalar() {
        let back = FieldValue::from_json(json!({"__ref": "1", "other": true}));
        assert_eq!(back.kind(), "scalar");
    }

    #[test]
    fn reference_shaped_objects_decode_as_references() {
        assert_eq!(FieldValue::from_json(json!({"__ref": "1"})), FieldValue::Ref(DataId::new("1")));
        assert_eq!(FieldValue::from_json(json!({"__ref": 1})).kind(), "scalar");
        assert_eq!(FieldValue::from_json(json!({"__refs": ["1", 2]})).kind(), "scalar");
    }

    #[test]
    fn leaf_values_hold_no_objects() {
        assert!(is_leaf_value(&json!("x")));
        assert!(is_leaf_value(&json!([1, [null, "a"]])));
        assert!(!is_leaf_value(&json!({"__ref": "1"})));
        assert!(!is_leaf_value(&json!([1, {"a": 2}])));
    }

    #[test]
    fn referenced_ids_skips_nulls() {
        let value = FieldValue::Refs(vec![Some(DataId::new("a")), None, Some(DataId::new("b"))]);
        let ids: Vec<&str> = value.referenced_ids().map(DataId::as_str).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert_eq!(FieldValue::null().referenced_ids().count(), 0);
    }
}

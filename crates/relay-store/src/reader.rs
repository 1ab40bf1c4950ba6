//! Selector reads.
//!
//! The reader walks a fragment's selections over any [`RecordLookup`] and
//! materializes a plain JSON value mirroring the selection shape. It never
//! writes to the source.
//!
//! "Not fetched" and "fetched as null" stay distinct: an unfetched field is
//! omitted from its parent object (and an unfetched root yields
//! `data: None`) while the snapshot's `is_missing_data` flag is raised.
//! Explicit nulls are written as `null`.
//!
//! Fragment spreads are not expanded; they produce a fragment pointer
//! (`__id`, `__fragments`, `__fragmentOwner`) that
//! [`get_singular_selector`] turns back into a selector for the spread
//! fragment.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use relay_core::record::ID_KEY;
use relay_core::selection::{FragmentSpread, InlineFragment, LinkedField, ScalarField};
use relay_core::{
    fragment_variables, DataId, FieldValue, PayloadError, ReaderFragment, Record, RequestDescriptor,
    RequiredAction, Selection, SingularReaderSelector, Variables,
};

use crate::error::ReadError;
use crate::source::{RecordLookup, RecordState};
use crate::traversal::{condition_passes, match_type_condition, TypeMatch};

pub const FRAGMENTS_KEY: &str = "__fragments";
pub const FRAGMENT_OWNER_KEY: &str = "__fragmentOwner";

/// Server errors the normalizer attached to a field that was read.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldError {
    /// Name of the fragment being read.
    pub owner: String,
    /// Response path from the fragment root, e.g. `me.name`.
    pub path: String,
    pub errors: Vec<PayloadError>,
}

/// A required field that was null.
#[derive(Debug, Clone, PartialEq)]
pub struct MissingRequiredField {
    pub owner: String,
    pub path: String,
}

/// Required-field violations of one read.
#[derive(Debug, Clone, PartialEq)]
pub enum MissingRequiredFields {
    /// Every `LOG` violation, in read order.
    Log(Vec<MissingRequiredField>),
    /// The first `THROW` violation.
    Throw(MissingRequiredField),
}

/// Result of reading a selector.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    /// `None` when the selector's root record is not in the source.
    pub data: Option<Value>,
    pub is_missing_data: bool,
    /// Every id dereferenced by the read, including ids that were missing.
    pub seen_records: BTreeSet<DataId>,
    pub field_errors: Vec<FieldError>,
    pub missing_required_fields: Option<MissingRequiredFields>,
    /// Type-membership problems that affected required fields.
    pub errors: Vec<ReadError>,
    pub selector: SingularReaderSelector,
}

impl Snapshot {
    /// The data, or the read error a strict consumer must surface.
    pub fn data_or_error(&self) -> Result<Option<&Value>, ReadError> {
        if let Some(MissingRequiredFields::Throw(field)) = &self.missing_required_fields {
            return Err(ReadError::RequiredFieldMissing {
                owner: field.owner.clone(),
                field_path: field.path.clone(),
            });
        }
        if let Some(error) = self.errors.first() {
            return Err(error.clone());
        }
        Ok(self.data.as_ref())
    }

    /// True when `other` would render the same as `self`.
    pub fn same_result(&self, other: &Snapshot) -> bool {
        self.data == other.data
            && self.is_missing_data == other.is_missing_data
            && self.field_errors == other.field_errors
            && self.missing_required_fields == other.missing_required_fields
            && self.errors == other.errors
    }
}

/// Supplemental abstract-type membership, used when the source has no
/// type record for a concrete type.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TypeMembership(HashMap<String, HashSet<String>>);

impl TypeMembership {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declares that `concrete_type` implements `abstract_type`.
    pub fn insert(&mut self, abstract_type: impl Into<String>, concrete_type: impl Into<String>) {
        self.0
            .entry(abstract_type.into())
            .or_default()
            .insert(concrete_type.into());
    }

    pub fn implements(&self, concrete_type: &str, abstract_type: &str) -> bool {
        self.0
            .get(abstract_type)
            .is_some_and(|types| types.contains(concrete_type))
    }
}

/// Reads `selector` from `source`.
pub fn read<S: RecordLookup + ?Sized>(source: &S, selector: &SingularReaderSelector) -> Snapshot {
    read_with_membership(source, selector, None)
}

/// Reads `selector`, resolving otherwise-unknown abstract type conditions
/// with `membership`.
pub fn read_with_membership<S: RecordLookup + ?Sized>(
    source: &S,
    selector: &SingularReaderSelector,
    membership: Option<&TypeMembership>,
) -> Snapshot {
    let mut reader = Reader {
        source,
        variables: &selector.variables,
        owner: &selector.owner,
        fragment_name: &selector.node.name,
        membership,
        path: Vec::new(),
        seen_records: BTreeSet::new(),
        is_missing_data: false,
        field_errors: Vec::new(),
        missing_required_fields: None,
        errors: Vec::new(),
    };
    let data = reader.read_record(&selector.data_id, &selector.node.selections);
    Snapshot {
        data,
        is_missing_data: reader.is_missing_data,
        seen_records: reader.seen_records,
        field_errors: reader.field_errors,
        missing_required_fields: reader.missing_required_fields,
        errors: reader.errors,
        selector: selector.clone(),
    }
}

/// Turns a fragment pointer produced by a read back into a selector for
/// `fragment`. Returns `None` when `item` holds no pointer to it.
pub fn get_singular_selector(
    fragment: &Arc<ReaderFragment>,
    item: &Value,
    owner: &RequestDescriptor,
) -> Option<SingularReaderSelector> {
    let object = item.as_object()?;
    let data_id = object.get(ID_KEY)?.as_str()?;
    let args = object.get(FRAGMENTS_KEY)?.as_object()?.get(&fragment.name)?;
    let variables = match args {
        Value::Object(vars) => vars.clone(),
        _ => Variables::new(),
    };
    Some(SingularReaderSelector {
        data_id: DataId::new(data_id),
        node: fragment.clone(),
        variables,
        owner: owner.clone(),
    })
}

struct Reader<'a, S: RecordLookup + ?Sized> {
    source: &'a S,
    variables: &'a Variables,
    owner: &'a RequestDescriptor,
    fragment_name: &'a str,
    membership: Option<&'a TypeMembership>,
    path: Vec<String>,
    seen_records: BTreeSet<DataId>,
    is_missing_data: bool,
    field_errors: Vec<FieldError>,
    missing_required_fields: Option<MissingRequiredFields>,
    errors: Vec<ReadError>,
}

impl<S: RecordLookup + ?Sized> Reader<'_, S> {
    /// `None` for a record that is not fetched; `Some(Null)` for a deleted
    /// record or one nulled by a required field.
    fn read_record(&mut self, id: &DataId, selections: &[Selection]) -> Option<Value> {
        self.seen_records.insert(id.clone());
        let source = self.source;
        match source.record_status(id) {
            RecordState::Nonexistent => Some(Value::Null),
            RecordState::Unknown => {
                self.is_missing_data = true;
                None
            }
            RecordState::Existent => {
                let Some(record) = source.record(id) else {
                    self.is_missing_data = true;
                    return None;
                };
                let mut data = Map::new();
                if self.traverse(selections, &record, &mut data) {
                    Some(Value::Object(data))
                } else {
                    Some(Value::Null)
                }
            }
        }
    }

    /// Reads `selections` into `data`. Returns false when a required field
    /// was null and the enclosing object must become null.
    fn traverse(&mut self, selections: &[Selection], record: &Record, data: &mut Map<String, Value>) -> bool {
        for selection in selections {
            let complete = match selection {
                Selection::ScalarField(field) => self.read_scalar(field, record, data),
                Selection::LinkedField(field) => self.read_linked(field, record, data),
                Selection::Condition(condition) => {
                    !condition_passes(condition, self.variables)
                        || self.traverse(&condition.selections, record, data)
                }
                Selection::InlineFragment(fragment) => self.read_inline_fragment(fragment, record, data),
                Selection::FragmentSpread(spread) => {
                    self.create_fragment_pointer(spread, record, data);
                    true
                }
                Selection::ClientExtension(extension) => self.traverse(&extension.selections, record, data),
                Selection::Defer(defer) => self.traverse(&defer.selections, record, data),
                Selection::Stream(stream) => self.traverse(&stream.selections, record, data),
                // Normalization-only selections.
                Selection::TypeDiscriminator(_) | Selection::ScalarHandle(_) | Selection::LinkedHandle(_) => true,
            };
            if !complete {
                return false;
            }
        }
        true
    }

    fn read_scalar(&mut self, field: &ScalarField, record: &Record, data: &mut Map<String, Value>) -> bool {
        let response_key = field.response_key();
        self.path.push(response_key.to_string());
        let value = if field.name == ID_KEY {
            Some(Value::String(record.id().to_string()))
        } else {
            let storage_key = field.storage_key(self.variables);
            self.collect_field_errors(record, &storage_key);
            match record.get(&storage_key) {
                Some(FieldValue::Scalar(value)) => Some(value.clone()),
                Some(other) => {
                    tracing::warn!(
                        record = %record.id(),
                        field = %storage_key,
                        kind = other.kind(),
                        "expected a scalar value"
                    );
                    self.is_missing_data = true;
                    None
                }
                None => {
                    self.is_missing_data = true;
                    None
                }
            }
        };
        let complete = self.check_required(field.required, value.as_ref());
        if let Some(value) = value {
            data.insert(response_key.to_string(), value);
        }
        self.path.pop();
        complete
    }

    fn read_linked(&mut self, field: &LinkedField, record: &Record, data: &mut Map<String, Value>) -> bool {
        let response_key = field.response_key();
        self.path.push(response_key.to_string());
        let storage_key = field.storage_key(self.variables);
        self.collect_field_errors(record, &storage_key);
        let value = match record.get(&storage_key) {
            None => {
                self.is_missing_data = true;
                None
            }
            Some(value) if value.is_null() => Some(Value::Null),
            Some(FieldValue::Ref(id)) if !field.plural => self.read_record(id, &field.selections),
            Some(FieldValue::Refs(ids)) if field.plural => {
                let mut items = Vec::with_capacity(ids.len());
                for (index, id) in ids.iter().enumerate() {
                    let item = match id {
                        None => Value::Null,
                        Some(id) => {
                            self.path.push(index.to_string());
                            let item = self.read_record(id, &field.selections);
                            self.path.pop();
                            // An unfetched item has no JSON spelling inside a
                            // list; the missing-data flag is already raised.
                            item.unwrap_or(Value::Null)
                        }
                    };
                    items.push(item);
                }
                Some(Value::Array(items))
            }
            Some(other) => {
                tracing::warn!(
                    record = %record.id(),
                    field = %storage_key,
                    kind = other.kind(),
                    plural = field.plural,
                    "linked field holds a value of the wrong kind"
                );
                self.is_missing_data = true;
                None
            }
        };
        let complete = self.check_required(field.required, value.as_ref());
        if let Some(value) = value {
            data.insert(response_key.to_string(), value);
        }
        self.path.pop();
        complete
    }

    fn read_inline_fragment(&mut self, fragment: &InlineFragment, record: &Record, data: &mut Map<String, Value>) -> bool {
        let typename = record.typename();
        let matches = match match_type_condition(self.source, fragment, typename) {
            TypeMatch::Matches => true,
            TypeMatch::DoesNotMatch => false,
            TypeMatch::Unknown => match (self.membership, typename) {
                (Some(membership), Some(typename)) => membership.implements(typename, &fragment.type_name),
                (None, Some(typename)) => {
                    if has_required_field(&fragment.selections) {
                        self.errors.push(ReadError::AmbiguousTypeMembership {
                            owner: self.fragment_name.to_string(),
                            typename: typename.to_string(),
                            abstract_type: fragment.type_name.clone(),
                        });
                    }
                    false
                }
                (_, None) => false,
            },
        };
        !matches || self.traverse(&fragment.selections, record, data)
    }

    fn create_fragment_pointer(&mut self, spread: &FragmentSpread, record: &Record, data: &mut Map<String, Value>) {
        let args = fragment_variables(&spread.fragment, &spread.args, self.variables, &self.owner.variables);
        let fragments = data
            .entry(FRAGMENTS_KEY)
            .or_insert_with(|| Value::Object(Map::new()));
        if let Value::Object(fragments) = fragments {
            fragments.insert(spread.fragment.name.clone(), Value::Object(args));
        }
        data.insert(ID_KEY.to_string(), Value::String(record.id().to_string()));
        data.insert(
            FRAGMENT_OWNER_KEY.to_string(),
            Value::String(self.owner.identifier.to_string()),
        );
    }

    fn collect_field_errors(&mut self, record: &Record, storage_key: &str) {
        if let Some(errors) = record.field_errors(storage_key) {
            self.field_errors.push(FieldError {
                owner: self.fragment_name.to_string(),
                path: self.path.join("."),
                errors: errors.to_vec(),
            });
        }
    }

    /// Records a violation when a required field is an explicit null.
    /// Unfetched values are reported as missing data instead.
    fn check_required(&mut self, required: Option<RequiredAction>, value: Option<&Value>) -> bool {
        let Some(action) = required else {
            return true;
        };
        if !matches!(value, Some(Value::Null)) {
            return true;
        }
        let field = MissingRequiredField {
            owner: self.fragment_name.to_string(),
            path: self.path.join("."),
        };
        match action {
            RequiredAction::None => {}
            RequiredAction::Log => {
                tracing::warn!(owner = %field.owner, path = %field.path, "required field was null");
                match &mut self.missing_required_fields {
                    Some(MissingRequiredFields::Log(fields)) => fields.push(field),
                    Some(MissingRequiredFields::Throw(_)) => {}
                    None => self.missing_required_fields = Some(MissingRequiredFields::Log(vec![field])),
                }
            }
            RequiredAction::Throw => {
                if !matches!(self.missing_required_fields, Some(MissingRequiredFields::Throw(_))) {
                    self.missing_required_fields = Some(MissingRequiredFields::Throw(field));
                }
            }
        }
        false
    }
}

/// Whether required-field handling inside `selections` (at this object
/// level) depends on them being read.
fn has_required_field(selections: &[Selection]) -> bool {
    selections.iter().any(|selection| match selection {
        Selection::ScalarField(field) => field.required.is_some(),
        Selection::LinkedField(field) => field.required.is_some(),
        Selection::Condition(c) => has_required_field(&c.selections),
        Selection::InlineFragment(f) => has_required_field(&f.selections),
        Selection::ClientExtension(e) => has_required_field(&e.selections),
        Selection::Defer(d) => has_required_field(&d.selections),
        Selection::Stream(s) => has_required_field(&s.selections),
        Selection::FragmentSpread(_)
        | Selection::TypeDiscriminator(_)
        | Selection::ScalarHandle(_)
        | Selection::LinkedHandle(_) => false,
    })
}

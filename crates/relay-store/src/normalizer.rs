//! Response normalization.
//!
//! Walks a compiled selection tree in lock-step with a tree-shaped payload
//! and writes a *delta* [`RecordSource`] holding only the records the payload
//! touches. Merging the delta into the store is a separate step.
//!
//! - Scalars are written under their storage key.
//! - Linked objects become records of their own (server id, or a client id
//!   derived from parent + storage key) and the parent stores a reference.
//! - Type-conditional selections are applied only when the payload's
//!   `__typename` satisfies them.
//! - Shape mismatches are collected as [`NormalizationError`]s; the
//!   offending subtree is skipped and siblings are still written.
//! - Handle fields produce [`HandleFieldPayload`]s and enabled
//!   `@defer`/`@stream` selections produce [`IncrementalPlaceholder`]s for the
//!   caller to process.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use smallvec::SmallVec;

use relay_core::id::{generate_client_id, generate_type_id, ROOT_ID, ROOT_TYPE};
use relay_core::payload::format_path;
use relay_core::selection::{
    Defer, FieldHandle, InlineFragment, LinkedField, ScalarField, Selection, Stream,
    TypeDiscriminator,
};
use relay_core::storage_key::argument_values;
use relay_core::{
    fragment_variables, is_leaf_value, CoreError, DataId, FieldValue, GraphQLResponse, NormalizationSelector,
    PathSegment, PayloadError, Record, Selections, Variables,
};

use crate::error::NormalizationError;
use crate::source::RecordSource;
use crate::traversal::{condition_passes, incremental_enabled, json_kind, response_id};

/// Typename given to type-membership records.
pub const TYPE_SCHEMA_TYPE: &str = "__TypeSchema";

/// Knobs for one normalization pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NormalizationOptions {
    /// Payload keys holding a server id, tried in order.
    pub id_fields: Vec<String>,
    /// Write `null` for selected fields absent from the payload instead of
    /// leaving them unfetched.
    pub treat_missing_fields_as_null: bool,
}

impl Default for NormalizationOptions {
    fn default() -> Self {
        NormalizationOptions {
            id_fields: vec!["id".to_string(), "_id".to_string()],
            treat_missing_fields_as_null: false,
        }
    }
}

/// A handle field seen during normalization, to be resolved by its handler
/// once the payload is merged.
#[derive(Debug, Clone, PartialEq)]
pub struct HandleFieldPayload {
    /// Record that owns the field.
    pub data_id: DataId,
    /// Storage key of the server field.
    pub field_key: String,
    pub handle: String,
    /// Storage key the handler writes under.
    pub handle_key: String,
    /// Resolved field arguments.
    pub args: Variables,
    /// Resolved handle arguments (e.g. `connections`).
    pub handle_args: Variables,
}

/// Work left for a later payload increment.
#[derive(Debug, Clone, PartialEq)]
pub enum IncrementalPlaceholder {
    Defer {
        label: String,
        path: Vec<PathSegment>,
        selector: NormalizationSelector,
        typename: Option<String>,
    },
    Stream {
        label: String,
        /// Path of the streamed list field itself.
        path: Vec<PathSegment>,
        parent_id: DataId,
        /// The `Stream` node's selections (the plural linked field).
        selections: Selections,
        variables: Variables,
    },
}

impl IncrementalPlaceholder {
    pub fn label(&self) -> &str {
        match self {
            IncrementalPlaceholder::Defer { label, .. } | IncrementalPlaceholder::Stream { label, .. } => label,
        }
    }

    pub fn path(&self) -> &[PathSegment] {
        match self {
            IncrementalPlaceholder::Defer { path, .. } | IncrementalPlaceholder::Stream { path, .. } => path,
        }
    }
}

/// Output of a normalization pass.
#[derive(Debug, Clone, Default)]
pub struct NormalizeResult {
    /// Delta holding every record the payload touched.
    pub source: RecordSource,
    pub field_payloads: Vec<HandleFieldPayload>,
    pub incremental_placeholders: Vec<IncrementalPlaceholder>,
    pub errors: Vec<NormalizationError>,
}

type Path = SmallVec<[PathSegment; 16]>;

struct Normalizer<'a> {
    result: NormalizeResult,
    options: &'a NormalizationOptions,
    root_variables: &'a Variables,
    payload_errors: &'a [PayloadError],
    path: Path,
    is_client_extension: bool,
}

/// Normalizes a full response rooted at `selector`.
///
/// The root record is created in the delta (typed `__Root` for the store
/// root). Fatal record invariant violations abort with an error; shape
/// problems are collected in [`NormalizeResult::errors`].
pub fn normalize(
    selector: &NormalizationSelector,
    response: &GraphQLResponse,
    options: &NormalizationOptions,
) -> Result<NormalizeResult, CoreError> {
    let typename = (selector.data_id.as_str() == ROOT_ID).then_some(ROOT_TYPE);
    normalize_at(selector, typename, &[], response, options)
}

/// Normalizes a payload fragment whose data sits at `path` in the overall
/// response, e.g. a deferred fragment.
pub fn normalize_at(
    selector: &NormalizationSelector,
    typename: Option<&str>,
    path: &[PathSegment],
    response: &GraphQLResponse,
    options: &NormalizationOptions,
) -> Result<NormalizeResult, CoreError> {
    let mut normalizer = Normalizer {
        result: NormalizeResult::default(),
        options,
        root_variables: &selector.variables,
        payload_errors: &response.errors,
        path: path.iter().cloned().collect(),
        is_client_extension: false,
    };
    normalizer
        .result
        .source
        .set(Record::new(selector.data_id.clone(), typename));

    match &response.data {
        Some(Value::Object(data)) => {
            normalizer.traverse(&selector.selections, &selector.data_id, data, &selector.variables)?;
        }
        Some(Value::Null) | None => {}
        Some(other) => normalizer.result.errors.push(NormalizationError::ExpectedObject {
            path: format_path(path),
            found: json_kind(other),
        }),
    }
    tracing::debug!(
        records = normalizer.result.source.len(),
        errors = normalizer.result.errors.len(),
        "normalized payload"
    );
    Ok(normalizer.result)
}

/// Normalizes one streamed list item.
///
/// `existing` is the parent's current reference list for the streamed field;
/// the returned delta holds the item's records plus the parent with the
/// item's id placed at `index`.
pub fn normalize_stream_item(
    placeholder: &IncrementalPlaceholder,
    item: &Value,
    index: usize,
    existing: &[Option<DataId>],
    errors: &[PayloadError],
    options: &NormalizationOptions,
) -> Result<Option<NormalizeResult>, CoreError> {
    let IncrementalPlaceholder::Stream {
        path,
        parent_id,
        selections,
        variables,
        ..
    } = placeholder
    else {
        return Ok(None);
    };
    let Some(field) = selections.iter().find_map(|s| match s {
        Selection::LinkedField(f) => Some(f),
        _ => None,
    }) else {
        return Ok(None);
    };

    let storage_key = field.storage_key(variables);
    let mut normalizer = Normalizer {
        result: NormalizeResult::default(),
        options,
        root_variables: variables,
        payload_errors: errors,
        path: path.iter().cloned().collect(),
        is_client_extension: false,
    };
    normalizer.path.push(PathSegment::Index(index));

    // Items may replace an existing slot or append one; anything further
    // out would leave a run of holes in the parent list.
    if index > existing.len() {
        normalizer.result.errors.push(NormalizationError::StreamIndexOutOfRange {
            path: format_path(&normalizer.path),
            index,
            len: existing.len(),
        });
        return Ok(Some(normalizer.result));
    }
    let mut ids: Vec<Option<DataId>> = existing.to_vec();
    if ids.len() == index {
        ids.push(None);
    }
    match item {
        Value::Object(data) => {
            let id = match normalizer.item_id(data, parent_id, &storage_key, Some(index)) {
                Some(id) => id,
                None => return Ok(Some(normalizer.result)),
            };
            let typename = field.concrete_type.as_deref().or(typename_of(data));
            normalizer.ensure_record(&id, typename);
            normalizer.traverse(&field.selections, &id, data, variables)?;
            ids[index] = Some(id);
        }
        Value::Null => ids[index] = None,
        other => {
            normalizer.result.errors.push(NormalizationError::ExpectedObject {
                path: format_path(&normalizer.path),
                found: json_kind(other),
            });
            return Ok(Some(normalizer.result));
        }
    }

    let mut parent = Record::new(parent_id.clone(), None);
    parent.try_set(storage_key, FieldValue::Refs(ids))?;
    normalizer.result.source.set(parent);
    Ok(Some(normalizer.result))
}

fn typename_of(data: &Map<String, Value>) -> Option<&str> {
    data.get("__typename").and_then(Value::as_str)
}

impl Normalizer<'_> {
    fn traverse(
        &mut self,
        selections: &[Selection],
        record_id: &DataId,
        data: &Map<String, Value>,
        variables: &Variables,
    ) -> Result<(), CoreError> {
        for selection in selections {
            match selection {
                Selection::ScalarField(field) => self.normalize_scalar(field, record_id, data, variables)?,
                Selection::LinkedField(field) => self.normalize_linked(field, record_id, data, variables)?,
                Selection::Condition(condition) => {
                    if condition_passes(condition, variables) {
                        self.traverse(&condition.selections, record_id, data, variables)?;
                    }
                }
                Selection::InlineFragment(fragment) => {
                    self.normalize_inline_fragment(fragment, record_id, data, variables)?
                }
                Selection::FragmentSpread(spread) => {
                    let fragment_vars =
                        fragment_variables(&spread.fragment, &spread.args, variables, self.root_variables);
                    self.traverse(&spread.fragment.selections, record_id, data, &fragment_vars)?;
                }
                Selection::TypeDiscriminator(discriminator) => {
                    self.normalize_type_discriminator(discriminator, record_id, data)?
                }
                Selection::ClientExtension(extension) => {
                    let outer = std::mem::replace(&mut self.is_client_extension, true);
                    let result = self.traverse(&extension.selections, record_id, data, variables);
                    self.is_client_extension = outer;
                    result?;
                }
                Selection::Defer(defer) => self.normalize_defer(defer, record_id, data, variables)?,
                Selection::Stream(stream) => self.normalize_stream(stream, record_id, data, variables)?,
                Selection::ScalarHandle(handle) | Selection::LinkedHandle(handle) => {
                    self.collect_handle(handle, record_id, variables)
                }
            }
        }
        Ok(())
    }

    fn record_typename(&self, record_id: &DataId) -> Option<String> {
        self.result
            .source
            .get(record_id)
            .and_then(Record::typename)
            .map(str::to_string)
    }

    fn ensure_record(&mut self, id: &DataId, typename: Option<&str>) {
        let source = &mut self.result.source;
        match source.get_mut(id) {
            Some(record) => {
                if record.typename().is_none() {
                    if let Some(typename) = typename {
                        record.set_typename(typename);
                    }
                }
            }
            None => source.set(Record::new(id.clone(), typename)),
        }
    }

    fn write(&mut self, record_id: &DataId, storage_key: String, value: FieldValue) -> Result<(), CoreError> {
        match self.result.source.get_mut(record_id) {
            Some(record) => record.try_set(storage_key, value),
            None => {
                let mut record = Record::new(record_id.clone(), None);
                record.try_set(storage_key, value)?;
                self.result.source.set(record);
                Ok(())
            }
        }
    }

    /// Attaches payload errors at (or, for a null value, below) the current
    /// path to the field being written.
    fn attach_errors(&mut self, record_id: &DataId, storage_key: &str, is_null: bool) {
        let path = &self.path;
        let errors: Vec<PayloadError> = self
            .payload_errors
            .iter()
            .filter(|error| match &error.path {
                Some(error_path) if is_null => error_path.starts_with(path),
                Some(error_path) => error_path.as_slice() == path.as_slice(),
                None => false,
            })
            .cloned()
            .collect();
        if errors.is_empty() {
            return;
        }
        if let Some(record) = self.result.source.get_mut(record_id) {
            record.set_field_errors(storage_key, errors);
        }
    }

    /// Handles a field absent from the payload. Returns true when the
    /// caller should stop processing the field.
    fn handle_missing(&mut self, record_id: &DataId, storage_key: &str) -> Result<bool, CoreError> {
        if self.is_client_extension {
            return Ok(true);
        }
        if self.options.treat_missing_fields_as_null {
            self.write(record_id, storage_key.to_string(), FieldValue::null())?;
        } else {
            tracing::warn!(
                path = %format_path(&self.path),
                record = %record_id,
                "payload did not contain a value for a selected field"
            );
        }
        Ok(true)
    }

    fn normalize_scalar(
        &mut self,
        field: &ScalarField,
        record_id: &DataId,
        data: &Map<String, Value>,
        variables: &Variables,
    ) -> Result<(), CoreError> {
        let response_key = field.response_key();
        let storage_key = field.storage_key(variables);
        self.path.push(PathSegment::Key(response_key.to_string()));
        let result = match data.get(response_key) {
            None => self.handle_missing(record_id, &storage_key).map(|_| ()),
            Some(value) if !is_leaf_value(value) => {
                self.result.errors.push(NormalizationError::ScalarShape {
                    path: format_path(&self.path),
                });
                Ok(())
            }
            Some(value) => {
                let is_null = value.is_null();
                self.write(record_id, storage_key.clone(), FieldValue::Scalar(value.clone()))
                    .map(|()| self.attach_errors(record_id, &storage_key, is_null))
            }
        };
        self.path.pop();
        result
    }

    fn normalize_linked(
        &mut self,
        field: &LinkedField,
        record_id: &DataId,
        data: &Map<String, Value>,
        variables: &Variables,
    ) -> Result<(), CoreError> {
        let response_key = field.response_key();
        let storage_key = field.storage_key(variables);
        self.path.push(PathSegment::Key(response_key.to_string()));
        let result = match data.get(response_key) {
            None => self.handle_missing(record_id, &storage_key).map(|_| ()),
            Some(Value::Null) => self
                .write(record_id, storage_key.clone(), FieldValue::null())
                .map(|()| self.attach_errors(record_id, &storage_key, true)),
            Some(value) if field.plural => self.normalize_plural(field, record_id, storage_key, value, variables),
            Some(value) => self.normalize_singular(field, record_id, storage_key, value, variables),
        };
        self.path.pop();
        result
    }

    fn normalize_singular(
        &mut self,
        field: &LinkedField,
        record_id: &DataId,
        storage_key: String,
        value: &Value,
        variables: &Variables,
    ) -> Result<(), CoreError> {
        let item = match value {
            Value::Object(item) => item,
            Value::Array(_) => {
                self.result.errors.push(NormalizationError::UnexpectedList {
                    path: format_path(&self.path),
                });
                return Ok(());
            }
            other => {
                self.result.errors.push(NormalizationError::ExpectedObject {
                    path: format_path(&self.path),
                    found: json_kind(other),
                });
                return Ok(());
            }
        };
        let Some(id) = self.item_id(item, record_id, &storage_key, None) else {
            return Ok(());
        };
        let typename = field.concrete_type.as_deref().or(typename_of(item));
        self.ensure_record(&id, typename);
        self.write(record_id, storage_key.clone(), FieldValue::Ref(id.clone()))?;
        self.attach_errors(record_id, &storage_key, false);
        self.traverse(&field.selections, &id, item, variables)
    }

    fn normalize_plural(
        &mut self,
        field: &LinkedField,
        record_id: &DataId,
        storage_key: String,
        value: &Value,
        variables: &Variables,
    ) -> Result<(), CoreError> {
        let Value::Array(items) = value else {
            self.result.errors.push(NormalizationError::ExpectedList {
                path: format_path(&self.path),
                found: json_kind(value),
            });
            return Ok(());
        };

        let mut ids = Vec::with_capacity(items.len());
        let mut nested = Vec::new();
        for (index, item) in items.iter().enumerate() {
            self.path.push(PathSegment::Index(index));
            match item {
                Value::Null => ids.push(None),
                Value::Object(object) => match self.item_id(object, record_id, &storage_key, Some(index)) {
                    Some(id) => {
                        let typename = field.concrete_type.as_deref().or(typename_of(object));
                        self.ensure_record(&id, typename);
                        ids.push(Some(id.clone()));
                        nested.push((index, id, object));
                    }
                    None => ids.push(None),
                },
                other => {
                    self.result.errors.push(NormalizationError::ExpectedObject {
                        path: format_path(&self.path),
                        found: json_kind(other),
                    });
                    ids.push(None);
                }
            }
            self.path.pop();
        }
        self.write(record_id, storage_key.clone(), FieldValue::Refs(ids))?;
        self.attach_errors(record_id, &storage_key, false);

        for (index, id, object) in nested {
            self.path.push(PathSegment::Index(index));
            let result = self.traverse(&field.selections, &id, object, variables);
            self.path.pop();
            result?;
        }
        Ok(())
    }

    /// Server id of a nested object, or a deterministic client id. Records a
    /// normalization error and returns `None` for an unusable id.
    fn item_id(
        &mut self,
        item: &Map<String, Value>,
        parent: &DataId,
        storage_key: &str,
        index: Option<usize>,
    ) -> Option<DataId> {
        match response_id(item, &self.options.id_fields) {
            Some(Ok(id)) => Some(id),
            Some(Err(found)) => {
                self.result.errors.push(NormalizationError::InvalidId {
                    path: format_path(&self.path),
                    found,
                });
                None
            }
            None => Some(generate_client_id(parent, storage_key, index)),
        }
    }

    fn normalize_inline_fragment(
        &mut self,
        fragment: &InlineFragment,
        record_id: &DataId,
        data: &Map<String, Value>,
        variables: &Variables,
    ) -> Result<(), CoreError> {
        let typename = self
            .record_typename(record_id)
            .or_else(|| typename_of(data).map(str::to_string));
        let Some(typename) = typename else {
            self.result.errors.push(NormalizationError::MissingTypename {
                path: format_path(&self.path),
                type_condition: fragment.type_name.clone(),
            });
            return Ok(());
        };

        let matches = match &fragment.abstract_key {
            None => typename == fragment.type_name,
            Some(abstract_key) => {
                let membership = if data.contains_key(abstract_key) {
                    Some(true)
                } else {
                    fragment
                        .possible_types
                        .as_ref()
                        .map(|types| types.iter().any(|t| *t == typename))
                };
                match membership {
                    Some(implements) => {
                        self.write_type_membership(&typename, abstract_key, implements)?;
                        implements
                    }
                    None if typename == fragment.type_name => true,
                    None => {
                        self.result.errors.push(NormalizationError::AmbiguousTypeMembership {
                            path: format_path(&self.path),
                            typename,
                            abstract_type: fragment.type_name.clone(),
                        });
                        false
                    }
                }
            }
        };
        if matches {
            self.traverse(&fragment.selections, record_id, data, variables)?;
        }
        Ok(())
    }

    fn normalize_type_discriminator(
        &mut self,
        discriminator: &TypeDiscriminator,
        record_id: &DataId,
        data: &Map<String, Value>,
    ) -> Result<(), CoreError> {
        // Only presence proves membership; absence may just mean the
        // discriminator was not selected on this path.
        if !data.contains_key(&discriminator.abstract_key) {
            return Ok(());
        }
        match self.record_typename(record_id) {
            Some(typename) => self.write_type_membership(&typename, &discriminator.abstract_key, true),
            None => Ok(()),
        }
    }

    fn write_type_membership(&mut self, typename: &str, abstract_key: &str, implements: bool) -> Result<(), CoreError> {
        let type_id = generate_type_id(typename);
        self.ensure_record(&type_id, Some(TYPE_SCHEMA_TYPE));
        self.write(&type_id, abstract_key.to_string(), FieldValue::Scalar(Value::Bool(implements)))
    }

    fn normalize_defer(
        &mut self,
        defer: &Defer,
        record_id: &DataId,
        data: &Map<String, Value>,
        variables: &Variables,
    ) -> Result<(), CoreError> {
        // A server that ignores @defer sends the fragment inline.
        let inline = !incremental_enabled(defer.if_condition.as_deref(), variables)
            || top_level_keys(&defer.selections).iter().any(|key| data.contains_key(key));
        if inline {
            return self.traverse(&defer.selections, record_id, data, variables);
        }
        let typename = self.record_typename(record_id);
        self.result.incremental_placeholders.push(IncrementalPlaceholder::Defer {
            label: defer.label.clone(),
            path: self.path.to_vec(),
            selector: NormalizationSelector {
                data_id: record_id.clone(),
                selections: defer.selections.clone(),
                variables: variables.clone(),
            },
            typename,
        });
        Ok(())
    }

    fn normalize_stream(
        &mut self,
        stream: &Stream,
        record_id: &DataId,
        data: &Map<String, Value>,
        variables: &Variables,
    ) -> Result<(), CoreError> {
        self.traverse(&stream.selections, record_id, data, variables)?;
        if !incremental_enabled(stream.if_condition.as_deref(), variables) {
            return Ok(());
        }
        for selection in stream.selections.iter() {
            if let Selection::LinkedField(field) = selection {
                let mut path = self.path.to_vec();
                path.push(PathSegment::Key(field.response_key().to_string()));
                self.result.incremental_placeholders.push(IncrementalPlaceholder::Stream {
                    label: stream.label.clone(),
                    path,
                    parent_id: record_id.clone(),
                    selections: stream.selections.clone(),
                    variables: variables.clone(),
                });
            }
        }
        Ok(())
    }

    fn collect_handle(&mut self, handle: &FieldHandle, record_id: &DataId, variables: &Variables) {
        let args = argument_values(&handle.args, variables).into_iter().collect();
        let handle_args = argument_values(&handle.handle_args, variables).into_iter().collect();
        self.result.field_payloads.push(HandleFieldPayload {
            data_id: record_id.clone(),
            field_key: handle.field_storage_key(variables),
            handle: handle.handle.clone(),
            handle_key: handle.handle_storage_key(variables),
            args,
            handle_args,
        });
    }
}

/// Response keys of the fields directly under `selections` (looking
/// through conditions and fragments).
fn top_level_keys(selections: &[Selection]) -> Vec<String> {
    let mut keys = Vec::new();
    for selection in selections {
        match selection {
            Selection::ScalarField(f) => keys.push(f.response_key().to_string()),
            Selection::LinkedField(f) => keys.push(f.response_key().to_string()),
            Selection::Condition(c) => keys.extend(top_level_keys(&c.selections)),
            Selection::InlineFragment(f) => keys.extend(top_level_keys(&f.selections)),
            Selection::FragmentSpread(s) => keys.extend(top_level_keys(&s.fragment.selections)),
            Selection::ClientExtension(_)
            | Selection::TypeDiscriminator(_)
            | Selection::Defer(_)
            | Selection::Stream(_)
            | Selection::ScalarHandle(_)
            | Selection::LinkedHandle(_) => {}
        }
    }
    keys.retain(|k| k != "__typename" && k != "id");
    keys
}

//! Imperative record updates.
//!
//! [`RecordSourceMutator`] reads through a private *sink* onto a frozen copy
//! of the store and writes only to the sink, one field at a time, so the
//! sink ends up holding exactly the changed fields and can be published like
//! any normalized delta.
//!
//! [`RecordSourceProxy`] and [`RecordProxy`] are the updater-facing API on
//! top of it. Proxies are lightweight `(source, id)` handles; several can be
//! held at once.

use std::cell::RefCell;
use std::collections::BTreeMap;

use serde_json::Value;

use relay_core::id::{generate_client_id, ROOT_ID, ROOT_TYPE};
use relay_core::storage_key::format_storage_key;
use relay_core::{is_leaf_value, DataId, FieldValue, Record, Variables};

use crate::error::StoreError;
use crate::source::{layered_status, RecordSource, RecordState};

/// Field-level copy-on-write writer over a base source.
#[derive(Debug, Default)]
pub struct RecordSourceMutator {
    base: RecordSource,
    sink: RecordSource,
    invalidated: Vec<DataId>,
    invalidate_store: bool,
}

impl RecordSourceMutator {
    /// Reads from `base`; writes go to a fresh sink.
    pub fn new(base: RecordSource) -> Self {
        RecordSourceMutator {
            base,
            sink: RecordSource::new(),
            invalidated: Vec::new(),
            invalidate_store: false,
        }
    }

    pub fn status(&self, id: &DataId) -> RecordState {
        layered_status(&self.sink, &self.base, id)
    }

    pub fn typename(&self, id: &DataId) -> Option<String> {
        let from_sink = self.sink.get(id).and_then(Record::typename);
        from_sink
            .or_else(|| self.base.get(id).and_then(Record::typename))
            .map(str::to_string)
    }

    /// Current value of a field: the sink's if written, else the base's.
    pub fn get_value(&self, id: &DataId, storage_key: &str) -> Option<FieldValue> {
        match self.sink.status(id) {
            RecordState::Nonexistent => None,
            RecordState::Existent => self
                .sink
                .get(id)
                .and_then(|record| record.get(storage_key))
                .or_else(|| self.base.get(id).and_then(|record| record.get(storage_key)))
                .cloned(),
            RecordState::Unknown => self.base.get(id).and_then(|record| record.get(storage_key)).cloned(),
        }
    }

    fn sink_record(&mut self, id: &DataId) -> Option<&mut Record> {
        if self.sink.status(id) == RecordState::Unknown {
            let typename = self.base.get(id)?.typename().map(str::to_string);
            self.sink.set(Record::new(id.clone(), typename.as_deref()));
        }
        self.sink.get_mut(id)
    }

    pub fn set_value(&mut self, id: &DataId, storage_key: &str, value: FieldValue) {
        match self.sink_record(id) {
            Some(record) => record.set(storage_key, value),
            None => tracing::warn!(record = %id, field = storage_key, "cannot write a field of a missing record"),
        }
    }

    pub fn create(&mut self, id: &DataId, typename: &str) {
        self.sink.set(Record::new(id.clone(), Some(typename)));
    }

    pub fn delete(&mut self, id: &DataId) {
        self.sink.delete(id);
    }

    /// Writes every record of a normalized delta into the sink, field by
    /// field, so later reads through the mutator see the merged state.
    pub fn publish_source(&mut self, source: &RecordSource) {
        for id in source.record_ids() {
            let Some(record) = source.get(&id) else {
                self.delete(&id);
                continue;
            };
            if self.status(&id) != RecordState::Existent {
                self.sink.set(record.clone());
                continue;
            }
            if let Some(target) = self.sink_record(&id) {
                if target.typename().is_none() {
                    if let Some(typename) = record.typename() {
                        target.set_typename(typename);
                    }
                }
                target.copy_fields_from(record);
            }
        }
    }

    /// Copies every field visible on `from` onto `to`.
    pub fn copy_fields(&mut self, from: &DataId, to: &DataId) {
        let mut fields = match self.base.get(from) {
            Some(record) if self.sink.status(from) != RecordState::Nonexistent => record.clone(),
            _ => Record::new(from.clone(), None),
        };
        if let Some(written) = self.sink.get(from) {
            fields.copy_fields_from(written);
        }
        if let Some(target) = self.sink_record(to) {
            target.copy_fields_from(&fields);
        }
    }

    pub fn invalidate(&mut self, id: &DataId) {
        if !self.invalidated.contains(id) {
            self.invalidated.push(id.clone());
        }
    }

    pub fn invalidate_store(&mut self) {
        self.invalidate_store = true;
    }

    /// The sink plus the requested invalidations.
    pub fn into_parts(self) -> MutationResult {
        MutationResult {
            sink: self.sink,
            invalidated: self.invalidated,
            invalidate_store: self.invalidate_store,
        }
    }
}

/// What an updater produced.
#[derive(Debug, Clone, Default)]
pub struct MutationResult {
    pub sink: RecordSource,
    pub invalidated: Vec<DataId>,
    pub invalidate_store: bool,
}

fn field_key(name: &str, args: Option<&Variables>) -> String {
    match args {
        Some(args) => {
            let args: BTreeMap<String, Value> = args.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
            format_storage_key(name, &args)
        }
        None => name.to_string(),
    }
}

/// Updater view over the whole store.
#[derive(Debug, Default)]
pub struct RecordSourceProxy {
    mutator: RefCell<RecordSourceMutator>,
}

impl RecordSourceProxy {
    pub fn new(base: RecordSource) -> Self {
        RecordSourceProxy {
            mutator: RefCell::new(RecordSourceMutator::new(base)),
        }
    }

    fn proxy(&self, id: DataId) -> RecordProxy<'_> {
        RecordProxy { source: self, id }
    }

    /// The record for `id`, if it exists.
    pub fn get(&self, id: &DataId) -> Option<RecordProxy<'_>> {
        match self.mutator.borrow().status(id) {
            RecordState::Existent => Some(self.proxy(id.clone())),
            _ => None,
        }
    }

    /// The root record, created when absent.
    pub fn get_root(&self) -> RecordProxy<'_> {
        let root = DataId::root();
        {
            let mut mutator = self.mutator.borrow_mut();
            if mutator.status(&root) != RecordState::Existent {
                mutator.create(&root, ROOT_TYPE);
            }
        }
        self.proxy(root)
    }

    /// The record linked from the root under `name`.
    pub fn get_root_field(&self, name: &str) -> Option<RecordProxy<'_>> {
        self.get(&DataId::new(ROOT_ID))?.get_linked_record(name, None)
    }

    /// Every record linked from the root under plural field `name`.
    pub fn get_plural_root_field(&self, name: &str) -> Option<Vec<Option<RecordProxy<'_>>>> {
        self.get(&DataId::new(ROOT_ID))?.get_linked_records(name, None)
    }

    pub fn create(&self, id: &DataId, typename: &str) -> Result<RecordProxy<'_>, StoreError> {
        let mut mutator = self.mutator.borrow_mut();
        if mutator.status(id) == RecordState::Existent {
            return Err(StoreError::RecordAlreadyExists(id.clone()));
        }
        mutator.create(id, typename);
        drop(mutator);
        Ok(self.proxy(id.clone()))
    }

    pub fn delete(&self, id: &DataId) {
        self.mutator.borrow_mut().delete(id);
    }

    /// Merges a normalized payload into this proxy's view.
    pub fn publish_source(&self, source: &RecordSource) {
        self.mutator.borrow_mut().publish_source(source);
    }

    /// Marks every record as invalid once published.
    pub fn invalidate_store(&self) {
        self.mutator.borrow_mut().invalidate_store();
    }

    pub fn into_result(self) -> MutationResult {
        self.mutator.into_inner().into_parts()
    }
}

/// Updater handle for one record.
#[derive(Debug, Clone)]
pub struct RecordProxy<'a> {
    source: &'a RecordSourceProxy,
    id: DataId,
}

impl<'a> RecordProxy<'a> {
    pub fn data_id(&self) -> &DataId {
        &self.id
    }

    pub fn typename(&self) -> Option<String> {
        self.source.mutator.borrow().typename(&self.id)
    }

    fn value(&self, name: &str, args: Option<&Variables>) -> Option<FieldValue> {
        self.source.mutator.borrow().get_value(&self.id, &field_key(name, args))
    }

    fn write(&self, name: &str, args: Option<&Variables>, value: FieldValue) -> &Self {
        self.source
            .mutator
            .borrow_mut()
            .set_value(&self.id, &field_key(name, args), value);
        self
    }

    /// A scalar field: `None` when unfetched.
    pub fn get_value(&self, name: &str, args: Option<&Variables>) -> Option<Value> {
        match self.value(name, args)? {
            FieldValue::Scalar(value) => Some(value),
            _ => None,
        }
    }

    /// Writes a scalar field. Values holding objects are not scalars and
    /// are dropped with a warning.
    pub fn set_value(&self, value: Value, name: &str, args: Option<&Variables>) -> &Self {
        if !is_leaf_value(&value) {
            tracing::warn!(record = %self.id, field = name, "set_value expects a scalar or a list of scalars");
            return self;
        }
        self.write(name, args, FieldValue::Scalar(value))
    }

    pub fn get_linked_record(&self, name: &str, args: Option<&Variables>) -> Option<RecordProxy<'a>> {
        match self.value(name, args)? {
            FieldValue::Ref(id) => self.source.get(&id),
            _ => None,
        }
    }

    pub fn get_linked_records(&self, name: &str, args: Option<&Variables>) -> Option<Vec<Option<RecordProxy<'a>>>> {
        match self.value(name, args)? {
            FieldValue::Refs(ids) => Some(
                ids.into_iter()
                    .map(|id| id.and_then(|id| self.source.get(&id)))
                    .collect(),
            ),
            _ => None,
        }
    }

    pub fn set_linked_record(&self, record: &RecordProxy<'_>, name: &str, args: Option<&Variables>) -> &Self {
        self.write(name, args, FieldValue::Ref(record.id.clone()))
    }

    pub fn set_linked_records(&self, records: &[Option<RecordProxy<'_>>], name: &str, args: Option<&Variables>) -> &Self {
        let ids = records
            .iter()
            .map(|record| record.as_ref().map(|r| r.id.clone()))
            .collect();
        self.write(name, args, FieldValue::Refs(ids))
    }

    /// The linked record under `name`, creating a client record of
    /// `typename` and linking it when there is none.
    pub fn get_or_create_linked_record(&self, name: &str, typename: &str, args: Option<&Variables>) -> RecordProxy<'a> {
        if let Some(linked) = self.get_linked_record(name, args) {
            return linked;
        }
        let storage_key = field_key(name, args);
        let client_id = generate_client_id(&self.id, &storage_key, None);
        let linked = match self.source.get(&client_id) {
            Some(existing) => existing,
            None => {
                self.source.mutator.borrow_mut().create(&client_id, typename);
                self.source.proxy(client_id)
            }
        };
        self.set_linked_record(&linked, name, args);
        linked
    }

    pub fn copy_fields_from(&self, source: &RecordProxy<'_>) {
        self.source.mutator.borrow_mut().copy_fields(&source.id, &self.id);
    }

    /// Marks this record as invalid once published.
    pub fn invalidate_record(&self) {
        self.source.mutator.borrow_mut().invalidate(&self.id);
    }
}

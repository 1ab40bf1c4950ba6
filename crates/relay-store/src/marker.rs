//! Selection-guided reachability marking for garbage collection.
//!
//! Marking follows the retained operations' selections rather than every
//! reference a record holds, so data written for a released query does not
//! stay alive just because some retained record still links to it under a
//! field nobody selects. Work is kept on an explicit stack so the collector
//! can stop after any number of steps and resume later.

use std::collections::HashSet;
use std::sync::Arc;

use relay_core::id::generate_type_id;
use relay_core::selection::{FieldHandle, LinkedField};
use relay_core::{fragment_variables, DataId, NormalizationSelector, Record, Selection, Selections, Variables};

use crate::source::RecordLookup;
use crate::traversal::{condition_passes, match_type_condition, TypeMatch};

struct MarkTask {
    id: DataId,
    selections: Selections,
    variables: Arc<Variables>,
    root_variables: Arc<Variables>,
}

/// Resumable mark phase over the record graph.
#[derive(Default)]
pub struct ReferenceMarker {
    stack: Vec<MarkTask>,
    marked: HashSet<DataId>,
}

impl ReferenceMarker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a retained selector as a marking root.
    pub fn add_root(&mut self, selector: &NormalizationSelector) {
        let variables = Arc::new(selector.variables.clone());
        self.stack.push(MarkTask {
            id: selector.data_id.clone(),
            selections: selector.selections.clone(),
            variables: variables.clone(),
            root_variables: variables,
        });
    }

    /// Visits up to `budget` records. Returns true once nothing is left.
    pub fn step<S: RecordLookup + ?Sized>(&mut self, source: &S, budget: usize) -> bool {
        for _ in 0..budget.max(1) {
            let Some(task) = self.stack.pop() else {
                return true;
            };
            self.marked.insert(task.id.clone());
            if let Some(record) = source.record(&task.id) {
                self.traverse(source, &task, &task.selections, &record, &task.variables);
            }
        }
        self.stack.is_empty()
    }

    /// Marks everything reachable in one go.
    pub fn run<S: RecordLookup + ?Sized>(&mut self, source: &S) {
        while !self.step(source, usize::MAX) {}
    }

    pub fn is_marked(&self, id: &DataId) -> bool {
        self.marked.contains(id)
    }

    pub fn into_marked(self) -> HashSet<DataId> {
        self.marked
    }

    fn traverse<S: RecordLookup + ?Sized>(
        &mut self,
        source: &S,
        task: &MarkTask,
        selections: &[Selection],
        record: &Record,
        variables: &Arc<Variables>,
    ) {
        for selection in selections {
            match selection {
                Selection::ScalarField(_) | Selection::ScalarHandle(_) => {}
                Selection::LinkedField(field) => self.push_linked(field, record, variables, task),
                Selection::LinkedHandle(handle) => self.push_handle(handle, selections, record, variables, task),
                Selection::Condition(condition) => {
                    if condition_passes(condition, variables) {
                        self.traverse(source, task, &condition.selections, record, variables);
                    }
                }
                Selection::InlineFragment(fragment) => {
                    if let (Some(_), Some(typename)) = (&fragment.abstract_key, record.typename()) {
                        self.marked.insert(generate_type_id(typename));
                    }
                    if match_type_condition(source, fragment, record.typename()) != TypeMatch::DoesNotMatch {
                        self.traverse(source, task, &fragment.selections, record, variables);
                    }
                }
                Selection::TypeDiscriminator(_) => {
                    if let Some(typename) = record.typename() {
                        self.marked.insert(generate_type_id(typename));
                    }
                }
                Selection::FragmentSpread(spread) => {
                    let inner = Arc::new(fragment_variables(
                        &spread.fragment,
                        &spread.args,
                        variables,
                        &task.root_variables,
                    ));
                    self.traverse(source, task, &spread.fragment.selections, record, &inner);
                }
                Selection::ClientExtension(extension) => {
                    self.traverse(source, task, &extension.selections, record, variables)
                }
                Selection::Defer(defer) => self.traverse(source, task, &defer.selections, record, variables),
                Selection::Stream(stream) => self.traverse(source, task, &stream.selections, record, variables),
            }
        }
    }

    fn push_ids(&mut self, record: &Record, storage_key: &str, selections: &Selections, variables: &Arc<Variables>, task: &MarkTask) {
        let Some(value) = record.get(storage_key) else {
            return;
        };
        for id in value.referenced_ids() {
            self.stack.push(MarkTask {
                id: id.clone(),
                selections: selections.clone(),
                variables: variables.clone(),
                root_variables: task.root_variables.clone(),
            });
        }
    }

    fn push_linked(&mut self, field: &LinkedField, record: &Record, variables: &Arc<Variables>, task: &MarkTask) {
        let storage_key = field.storage_key(variables);
        self.push_ids(record, &storage_key, &field.selections, variables, task);
    }

    /// A linked handle stores a client record (e.g. a connection) shaped
    /// like the server field it decorates.
    fn push_handle(
        &mut self,
        handle: &FieldHandle,
        siblings: &[Selection],
        record: &Record,
        variables: &Arc<Variables>,
        task: &MarkTask,
    ) {
        let field = siblings.iter().find_map(|s| match s {
            Selection::LinkedField(f) if f.response_key() == handle.response_key() => Some(f),
            _ => None,
        });
        if let Some(field) = field {
            let handle_key = handle.handle_storage_key(variables);
            self.push_ids(record, &handle_key, &field.selections, variables, task);
        }
    }
}

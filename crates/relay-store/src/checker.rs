//! Data availability checks.
//!
//! Walks a normalization selector without materializing anything and
//! answers one question: is every selected field fetched? Along the way it
//! collects the most recent invalidation epoch of any record in the
//! selector's closure, which the store compares against the operation's
//! last write.

use serde_json::Value;

use relay_core::record::ID_KEY;
use relay_core::selection::{InlineFragment, LinkedField};
use relay_core::{fragment_variables, DataId, FieldValue, NormalizationSelector, Record, Selection, Variables};

use crate::source::{RecordLookup, RecordState};
use crate::traversal::{condition_passes, match_type_condition, TypeMatch};

/// Outcome of a data check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckResult {
    /// Every selected field (outside client extensions) is fetched.
    pub is_available: bool,
    /// Largest record invalidation epoch seen in the closure.
    pub most_recent_invalidation: Option<u64>,
}

/// Checks `selector` against `source`.
pub fn check<S: RecordLookup + ?Sized>(source: &S, selector: &NormalizationSelector) -> CheckResult {
    let mut checker = DataChecker {
        source,
        root_variables: &selector.variables,
        is_missing: false,
        most_recent_invalidation: None,
        in_client_extension: false,
    };
    checker.check_record(&selector.data_id, &selector.selections, &selector.variables);
    CheckResult {
        is_available: !checker.is_missing,
        most_recent_invalidation: checker.most_recent_invalidation,
    }
}

struct DataChecker<'a, S: RecordLookup + ?Sized> {
    source: &'a S,
    root_variables: &'a Variables,
    is_missing: bool,
    most_recent_invalidation: Option<u64>,
    in_client_extension: bool,
}

impl<S: RecordLookup + ?Sized> DataChecker<'_, S> {
    fn mark_missing(&mut self) {
        // Client-only data is never fetched from the server.
        if !self.in_client_extension {
            self.is_missing = true;
        }
    }

    fn check_record(&mut self, id: &DataId, selections: &[Selection], variables: &Variables) {
        let source = self.source;
        match source.record_status(id) {
            RecordState::Nonexistent => {}
            RecordState::Unknown => self.mark_missing(),
            RecordState::Existent => match source.record(id) {
                Some(record) => {
                    if let Some(epoch) = record.invalidated_at() {
                        self.most_recent_invalidation = self.most_recent_invalidation.max(Some(epoch));
                    }
                    self.traverse(selections, &record, variables);
                }
                None => self.mark_missing(),
            },
        }
    }

    fn traverse(&mut self, selections: &[Selection], record: &Record, variables: &Variables) {
        for selection in selections {
            match selection {
                Selection::ScalarField(field) => {
                    if field.name != ID_KEY && !record.contains(&field.storage_key(variables)) {
                        self.mark_missing();
                    }
                }
                Selection::LinkedField(field) => self.check_linked(field, record, variables),
                Selection::Condition(condition) => {
                    if condition_passes(condition, variables) {
                        self.traverse(&condition.selections, record, variables);
                    }
                }
                Selection::InlineFragment(fragment) => self.check_inline_fragment(fragment, record, variables),
                Selection::FragmentSpread(spread) => {
                    let inner = fragment_variables(&spread.fragment, &spread.args, variables, self.root_variables);
                    self.traverse(&spread.fragment.selections, record, &inner);
                }
                Selection::ClientExtension(extension) => {
                    let outer = std::mem::replace(&mut self.in_client_extension, true);
                    self.traverse(&extension.selections, record, variables);
                    self.in_client_extension = outer;
                }
                Selection::Defer(defer) => self.traverse(&defer.selections, record, variables),
                Selection::Stream(stream) => self.traverse(&stream.selections, record, variables),
                // Handle values are derived client-side after normalization.
                Selection::TypeDiscriminator(_) | Selection::ScalarHandle(_) | Selection::LinkedHandle(_) => {}
            }
        }
    }

    fn check_linked(&mut self, field: &LinkedField, record: &Record, variables: &Variables) {
        match record.get(&field.storage_key(variables)) {
            None => self.mark_missing(),
            Some(FieldValue::Scalar(Value::Null)) => {}
            Some(FieldValue::Ref(id)) => self.check_record(id, &field.selections, variables),
            Some(FieldValue::Refs(ids)) => {
                for id in ids.iter().flatten() {
                    self.check_record(id, &field.selections, variables);
                }
            }
            Some(FieldValue::Scalar(_)) => self.mark_missing(),
        }
    }

    fn check_inline_fragment(&mut self, fragment: &InlineFragment, record: &Record, variables: &Variables) {
        match match_type_condition(self.source, fragment, record.typename()) {
            TypeMatch::Matches => self.traverse(&fragment.selections, record, variables),
            TypeMatch::DoesNotMatch => {}
            // Membership was never fetched.
            TypeMatch::Unknown => {
                if fragment.abstract_key.is_some() {
                    self.mark_missing();
                }
            }
        }
    }
}

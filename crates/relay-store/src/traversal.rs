//! Helpers shared by every selection-tree traversal.

use serde_json::Value;

use relay_core::selection::{Condition, InlineFragment};
use relay_core::{id::generate_type_id, DataId, Variables};

use crate::source::RecordLookup;

/// Whether a `Condition` lets its selections through. An undefined or
/// non-boolean variable never passes.
pub fn condition_passes(condition: &Condition, variables: &Variables) -> bool {
    match variables.get(&condition.condition).and_then(Value::as_bool) {
        Some(value) => value == condition.passing_value,
        None => false,
    }
}

/// Whether a `@defer`/`@stream` with an optional `if` variable is active.
pub fn incremental_enabled(if_condition: Option<&str>, variables: &Variables) -> bool {
    match if_condition {
        Some(name) => variables.get(name).and_then(Value::as_bool).unwrap_or(false),
        None => true,
    }
}

/// Result of testing a record against a type condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeMatch {
    Matches,
    DoesNotMatch,
    /// Membership of an abstract type is not recorded anywhere.
    Unknown,
}

/// Tests a record's typename against an inline fragment's type condition,
/// consulting the type-membership record for abstract conditions.
pub fn match_type_condition<S: RecordLookup + ?Sized>(
    source: &S,
    fragment: &InlineFragment,
    typename: Option<&str>,
) -> TypeMatch {
    let Some(typename) = typename else {
        return TypeMatch::Unknown;
    };
    match &fragment.abstract_key {
        None => {
            if typename == fragment.type_name {
                TypeMatch::Matches
            } else {
                TypeMatch::DoesNotMatch
            }
        }
        Some(abstract_key) => {
            if typename == fragment.type_name {
                return TypeMatch::Matches;
            }
            let recorded = source
                .record(&generate_type_id(typename))
                .and_then(|r| r.get(abstract_key).and_then(|v| v.as_scalar()).and_then(Value::as_bool));
            match recorded {
                Some(true) => TypeMatch::Matches,
                Some(false) => TypeMatch::DoesNotMatch,
                None => match &fragment.possible_types {
                    Some(types) if types.iter().any(|t| t == typename) => TypeMatch::Matches,
                    Some(_) => TypeMatch::DoesNotMatch,
                    None => TypeMatch::Unknown,
                },
            }
        }
    }
}

/// Reads a payload object's server id, accepting strings and numbers.
pub fn response_id(data: &serde_json::Map<String, Value>, id_fields: &[String]) -> Option<Result<DataId, String>> {
    for key in id_fields {
        match data.get(key) {
            None | Some(Value::Null) => continue,
            Some(Value::String(s)) => return Some(Ok(DataId::new(s.clone()))),
            Some(Value::Number(n)) => return Some(Ok(DataId::new(n.to_string()))),
            Some(other) => return Some(Err(other.to_string())),
        }
    }
    None
}

/// Short name for the JSON type of `value`, used in error messages.
pub fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "list",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_core::Record;
    use serde_json::json;
    use std::sync::Arc;

    use crate::source::RecordSource;

    fn fragment(abstract_key: Option<&str>, possible: Option<Vec<&str>>) -> InlineFragment {
        InlineFragment {
            type_name: "Node".into(),
            abstract_key: abstract_key.map(str::to_string),
            possible_types: possible.map(|p| p.into_iter().map(str::to_string).collect()),
            selections: Arc::from(vec![]),
        }
    }

    fn vars(value: Value) -> Variables {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn conditions() {
        let condition = Condition {
            condition: "flag".into(),
            passing_value: false,
            selections: Arc::from(vec![]),
        };
        assert!(condition_passes(&condition, &vars(json!({"flag": false}))));
        assert!(!condition_passes(&condition, &vars(json!({"flag": true}))));
        assert!(!condition_passes(&condition, &Variables::new()));
        assert!(incremental_enabled(None, &Variables::new()));
        assert!(!incremental_enabled(Some("d"), &vars(json!({"d": false}))));
    }

    #[test]
    fn abstract_membership_from_type_record() {
        let mut source = RecordSource::new();
        let mut type_record = Record::new(generate_type_id("User"), Some("__TypeSchema"));
        type_record.set_scalar("__isNode", json!(true));
        source.set(type_record);

        let f = fragment(Some("__isNode"), None);
        assert_eq!(match_type_condition(&source, &f, Some("User")), TypeMatch::Matches);
        assert_eq!(match_type_condition(&source, &f, Some("Story")), TypeMatch::Unknown);
        assert_eq!(match_type_condition(&source, &f, None), TypeMatch::Unknown);

        let declared = fragment(Some("__isNode"), Some(vec!["Story"]));
        assert_eq!(match_type_condition(&source, &declared, Some("Story")), TypeMatch::Matches);
        assert_eq!(match_type_condition(&source, &declared, Some("Page")), TypeMatch::DoesNotMatch);
    }

    #[test]
    fn concrete_conditions() {
        let source = RecordSource::new();
        let mut f = fragment(None, None);
        f.type_name = "User".into();
        assert_eq!(match_type_condition(&source, &f, Some("User")), TypeMatch::Matches);
        assert_eq!(match_type_condition(&source, &f, Some("Page")), TypeMatch::DoesNotMatch);
    }

    #[test]
    fn ids_from_strings_and_numbers() {
        let fields = vec!["id".to_string()];
        let data = json!({"id": 4}).as_object().unwrap().clone();
        assert_eq!(response_id(&data, &fields), Some(Ok(DataId::new("4"))));
        let data = json!({"id": true}).as_object().unwrap().clone();
        assert!(matches!(response_id(&data, &fields), Some(Err(_))));
        let data = json!({"name": "x"}).as_object().unwrap().clone();
        assert_eq!(response_id(&data, &fields), None);
    }
}

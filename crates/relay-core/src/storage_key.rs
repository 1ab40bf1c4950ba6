//! Field arguments and storage keys.
//!
//! A storage key is the field key a value is stored under inside a record:
//! the schema field name plus a canonical rendering of its resolved
//! arguments. Two argument lists that differ only in order (at any nesting
//! depth) always produce the same key; the normalizer and the reader both
//! depend on that to agree on where a value lives.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::descriptor::Variables;

/// A compiled field argument.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum Argument {
    /// A constant known at compile time.
    Literal { name: String, value: Value },
    /// A reference to an operation or fragment variable.
    #[serde(rename_all = "camelCase")]
    Variable { name: String, variable_name: String },
    /// An input object whose fields are themselves arguments.
    ObjectValue { name: String, fields: Vec<Argument> },
    /// A list whose items are arguments (`None` for a literal `null` item).
    ListValue { name: String, items: Vec<Option<Argument>> },
}

impl Argument {
    pub fn literal(name: &str, value: Value) -> Self {
        Argument::Literal {
            name: name.to_string(),
            value,
        }
    }

    pub fn variable(name: &str, variable_name: &str) -> Self {
        Argument::Variable {
            name: name.to_string(),
            variable_name: variable_name.to_string(),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Argument::Literal { name, .. }
            | Argument::Variable { name, .. }
            | Argument::ObjectValue { name, .. }
            | Argument::ListValue { name, .. } => name,
        }
    }

    /// Resolves the argument against `variables`. An undefined variable
    /// resolves to `null`, which omits the argument from storage keys.
    pub fn resolve(&self, variables: &Variables) -> Value {
        match self {
            Argument::Literal { value, .. } => value.clone(),
            Argument::Variable { variable_name, .. } => {
                variables.get(variable_name).cloned().unwrap_or(Value::Null)
            }
            Argument::ObjectValue { fields, .. } => Value::Object(
                fields
                    .iter()
                    .map(|field| (field.name().to_string(), field.resolve(variables)))
                    .collect(),
            ),
            Argument::ListValue { items, .. } => Value::Array(
                items
                    .iter()
                    .map(|item| item.as_ref().map_or(Value::Null, |arg| arg.resolve(variables)))
                    .collect(),
            ),
        }
    }
}

/// Resolves every argument, keyed (and therefore ordered) by name.
pub fn argument_values(args: &[Argument], variables: &Variables) -> BTreeMap<String, Value> {
    args.iter()
        .map(|arg| (arg.name().to_string(), arg.resolve(variables)))
        .collect()
}

/// Renders `name(a:<json>,b:<json>)` from already-resolved argument values.
///
/// Arguments are ordered by name, `null` values are omitted, and each value
/// is rendered with object keys sorted. With no remaining arguments the key
/// is the bare field name.
pub fn format_storage_key(name: &str, args: &BTreeMap<String, Value>) -> String {
    let rendered: Vec<String> = args
        .iter()
        .filter(|(_, value)| !value.is_null())
        .map(|(arg_name, value)| format!("{arg_name}:{}", canonical_json(value)))
        .collect();
    if rendered.is_empty() {
        name.to_string()
    } else {
        format!("{name}({})", rendered.join(","))
    }
}

/// The storage key of a field with the given arguments.
pub fn storage_key(name: &str, args: &[Argument], variables: &Variables) -> String {
    if args.is_empty() {
        return name.to_string();
    }
    format_storage_key(name, &argument_values(args, variables))
}

/// The field name a handle stores its client-side value under:
/// `__<key>_<handle>`, falling back to the field name when no key is given.
pub fn handle_key(handle: &str, key: &str, field_name: &str) -> String {
    if key.is_empty() {
        format!("__{field_name}_{handle}")
    } else {
        format!("__{key}_{handle}")
    }
}

/// The storage key of a handle field: its handle key plus any arguments
/// listed in `filters`.
pub fn handle_storage_key(
    handle: &str,
    key: &str,
    field_name: &str,
    args: &[Argument],
    filters: Option<&[String]>,
    variables: &Variables,
) -> String {
    let name = handle_key(handle, key, field_name);
    let Some(filters) = filters else {
        return name;
    };
    let filter_args: Vec<Argument> = args
        .iter()
        .filter(|arg| filters.iter().any(|f| f == arg.name()))
        .cloned()
        .collect();
    if filter_args.is_empty() {
        return name;
    }
    format_storage_key(&name, &argument_values(&filter_args, variables))
}

/// Serializes `value` as JSON with every object's keys sorted.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(&map[key], out);
            }
            out.push('}');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn vars(value: Value) -> Variables {
        match value {
            Value::Object(map) => map,
            _ => Variables::new(),
        }
    }

    #[test]
    fn no_args_is_bare_name() {
        assert_eq!(storage_key("name", &[], &Variables::new()), "name");
    }

    #[test]
    fn literal_and_variable_args() {
        let args = vec![
            Argument::variable("first", "count"),
            Argument::literal("after", json!("cursor1")),
        ];
        let key = storage_key("friends", &args, &vars(json!({"count": 10})));
        assert_eq!(key, "friends(after:\"cursor1\",first:10)");
    }

    #[test]
    fn null_and_undefined_args_are_omitted() {
        let args = vec![
            Argument::literal("after", Value::Null),
            Argument::variable("first", "missing"),
        ];
        assert_eq!(storage_key("friends", &args, &Variables::new()), "friends");
    }

    #[test]
    fn argument_order_does_not_matter() {
        let a = vec![Argument::literal("a", json!(1)), Argument::literal("b", json!(2))];
        let b = vec![Argument::literal("b", json!(2)), Argument::literal("a", json!(1))];
        let v = Variables::new();
        assert_eq!(storage_key("f", &a, &v), storage_key("f", &b, &v));
        assert_eq!(storage_key("f", &a, &v), "f(a:1,b:2)");
    }

    #[test]
    fn nested_object_keys_are_sorted() {
        let a = vec![Argument::ObjectValue {
            name: "where".into(),
            fields: vec![
                Argument::literal("z", json!(true)),
                Argument::literal("a", json!({"y": 1, "x": 2})),
            ],
        }];
        let key = storage_key("search", &a, &Variables::new());
        assert_eq!(key, "search(where:{\"a\":{\"x\":2,\"y\":1},\"z\":true})");
    }

    #[test]
    fn list_values_keep_order() {
        let args = vec![Argument::ListValue {
            name: "ids".into(),
            items: vec![
                Some(Argument::literal("0", json!("b"))),
                None,
                Some(Argument::variable("2", "id")),
            ],
        }];
        let key = storage_key("nodes", &args, &vars(json!({"id": "a"})));
        assert_eq!(key, "nodes(ids:[\"b\",null,\"a\"])");
    }

    #[test]
    fn handle_keys() {
        assert_eq!(handle_key("connection", "Friends_friends", "friends"), "__Friends_friends_connection");
        assert_eq!(handle_key("deleteRecord", "", "id"), "__id_deleteRecord");

        let args = vec![
            Argument::literal("first", json!(10)),
            Argument::literal("orderBy", json!("name")),
        ];
        let filters = vec!["orderBy".to_string()];
        let key = handle_storage_key(
            "connection",
            "Friends_friends",
            "friends",
            &args,
            Some(&filters),
            &Variables::new(),
        );
        assert_eq!(key, "__Friends_friends_connection(orderBy:\"name\")");
    }

    proptest! {
        #[test]
        fn storage_key_is_order_independent(
            entries in proptest::collection::btree_map("[a-z]{1,6}", -1000i64..1000, 0..6)
        ) {
            let forward: Vec<Argument> = entries
                .iter()
                .map(|(k, v)| Argument::literal(k, json!(v)))
                .collect();
            let mut backward = forward.clone();
            backward.reverse();
            let v = Variables::new();
            prop_assert_eq!(storage_key("field", &forward, &v), storage_key("field", &backward, &v));
        }
    }
}

//! Compiled selection trees.
//!
//! The compiler emits every query, mutation, subscription and fragment as an
//! immutable tree of [`Selection`]s. The normalizer, reader, data checker and
//! reference marker all walk the same tree with an exhaustive `match`, so a
//! new selection kind fails to compile until every traversal handles it.
//!
//! The serialized shape is tagged by `kind`, matching what the compiler
//! writes into its artifacts.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::descriptor::Variables;
use crate::storage_key::{handle_storage_key, storage_key, Argument};

/// A shared, immutable list of selections.
pub type Selections = Arc<[Selection]>;

/// What to do when a `@required` field is `null` or missing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RequiredAction {
    /// Bubble `null` to the parent silently.
    None,
    /// Bubble `null` to the parent and log the violation.
    Log,
    /// Bubble `null` to the parent and fail the snapshot for callers that
    /// ask for strict results.
    Throw,
}

/// One node of a compiled selection tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum Selection {
    ScalarField(ScalarField),
    LinkedField(LinkedField),
    Condition(Condition),
    InlineFragment(InlineFragment),
    FragmentSpread(FragmentSpread),
    TypeDiscriminator(TypeDiscriminator),
    ClientExtension(ClientExtension),
    Defer(Defer),
    Stream(Stream),
    ScalarHandle(FieldHandle),
    LinkedHandle(FieldHandle),
}

/// A leaf field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScalarField {
    #[serde(default)]
    pub alias: Option<String>,
    pub name: String,
    #[serde(default)]
    pub args: Vec<Argument>,
    #[serde(default)]
    pub required: Option<RequiredAction>,
}

/// A field whose value is one record (or a list of records).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkedField {
    #[serde(default)]
    pub alias: Option<String>,
    pub name: String,
    #[serde(default)]
    pub args: Vec<Argument>,
    /// Set when the field's schema type is an object type rather than an
    /// interface or union.
    #[serde(default)]
    pub concrete_type: Option<String>,
    #[serde(default)]
    pub plural: bool,
    pub selections: Selections,
    #[serde(default)]
    pub required: Option<RequiredAction>,
}

/// Selections gated on a boolean variable (`@include`/`@skip`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    pub condition: String,
    pub passing_value: bool,
    pub selections: Selections,
}

/// Selections that apply only to records of a given type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InlineFragment {
    /// The type condition: a concrete type, or an interface/union when
    /// `abstract_key` is set.
    #[serde(rename = "type")]
    pub type_name: String,
    /// Response key of the type discriminator (e.g. `__isNode`) for an
    /// abstract type condition.
    #[serde(default)]
    pub abstract_key: Option<String>,
    /// Concrete types known to satisfy an abstract type condition, used when
    /// the payload carries no discriminator.
    #[serde(default)]
    pub possible_types: Option<Vec<String>>,
    pub selections: Selections,
}

/// A named fragment spread with its `@arguments`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FragmentSpread {
    #[serde(default)]
    pub args: Vec<Argument>,
    pub fragment: Arc<ReaderFragment>,
}

/// Records whether the current record's type implements an abstract type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypeDiscriminator {
    pub abstract_key: String,
}

/// Fields defined only in client schema extensions; absent from payloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientExtension {
    pub selections: Selections,
}

/// A fragment whose data may arrive in a later payload increment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Defer {
    pub label: String,
    /// Boolean variable gating the deferral; when it is false the selections
    /// are expected inline.
    #[serde(rename = "if", default)]
    pub if_condition: Option<String>,
    pub selections: Selections,
}

/// A plural field whose items may arrive one at a time after the initial
/// payload. `selections` holds exactly the streamed linked field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Stream {
    pub label: String,
    #[serde(rename = "if", default)]
    pub if_condition: Option<String>,
    pub selections: Selections,
}

/// A field whose payload is post-processed by a named handler after it is
/// merged into the store (`@connection`, `@deleteRecord`, `@appendEdge`...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldHandle {
    #[serde(default)]
    pub alias: Option<String>,
    pub name: String,
    #[serde(default)]
    pub args: Vec<Argument>,
    pub handle: String,
    #[serde(default)]
    pub key: String,
    #[serde(default)]
    pub filters: Option<Vec<String>>,
    #[serde(default)]
    pub handle_args: Vec<Argument>,
}

/// A root or named fragment as consumed by the reader.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReaderFragment {
    pub name: String,
    pub type_condition: String,
    #[serde(default)]
    pub abstract_key: Option<String>,
    #[serde(default)]
    pub argument_definitions: Vec<ArgumentDefinition>,
    pub selections: Selections,
}

/// A compiled operation as consumed by the normalizer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NormalizationOperation {
    pub name: String,
    #[serde(default)]
    pub argument_definitions: Vec<ArgumentDefinition>,
    pub selections: Selections,
}

/// A declared operation or fragment argument.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum ArgumentDefinition {
    /// Declared locally with an optional default.
    #[serde(rename_all = "camelCase")]
    LocalArgument {
        name: String,
        #[serde(default)]
        default_value: serde_json::Value,
    },
    /// Read from the enclosing operation's variables.
    RootArgument { name: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Query,
    Mutation,
    Subscription,
}

/// Request metadata shared by every execution of an operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestParameters {
    pub name: String,
    pub operation_kind: OperationKind,
    /// Persisted query id, when the operation was persisted.
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default, rename = "cacheID")]
    pub cache_id: Option<String>,
    #[serde(default)]
    pub text: Option<String>,
}

/// The full compiled artifact for an operation: its reader fragment, its
/// normalization tree and request parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConcreteRequest {
    pub fragment: Arc<ReaderFragment>,
    pub operation: Arc<NormalizationOperation>,
    pub params: RequestParameters,
}

impl ConcreteRequest {
    /// Stable content hash of the compiled artifact, usable as a cache key.
    pub fn fingerprint(&self) -> blake3::Hash {
        let mut hasher = blake3::Hasher::new();
        match serde_json::to_vec(self) {
            Ok(bytes) => {
                hasher.update(&bytes);
            }
            // Serializing plain data to a Vec cannot fail; fall back to the
            // name so the hash stays defined.
            Err(_) => {
                hasher.update(self.params.name.as_bytes());
            }
        }
        hasher.finalize()
    }
}

impl ScalarField {
    /// Key of the field in the response object.
    pub fn response_key(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.name)
    }

    pub fn storage_key(&self, variables: &Variables) -> String {
        storage_key(&self.name, &self.args, variables)
    }
}

impl LinkedField {
    pub fn response_key(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.name)
    }

    pub fn storage_key(&self, variables: &Variables) -> String {
        storage_key(&self.name, &self.args, variables)
    }
}

impl FieldHandle {
    pub fn response_key(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.name)
    }

    /// Storage key of the underlying server field.
    pub fn field_storage_key(&self, variables: &Variables) -> String {
        storage_key(&self.name, &self.args, variables)
    }

    /// Storage key the handler writes its client-side value under.
    pub fn handle_storage_key(&self, variables: &Variables) -> String {
        handle_storage_key(
            &self.handle,
            &self.key,
            &self.name,
            &self.args,
            self.filters.as_deref(),
            variables,
        )
    }
}

impl ArgumentDefinition {
    pub fn name(&self) -> &str {
        match self {
            ArgumentDefinition::LocalArgument { name, .. }
            | ArgumentDefinition::RootArgument { name } => name,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn deserializes_compiler_artifact_shape() {
        let selection: Selection = serde_json::from_value(json!({
            "kind": "LinkedField",
            "alias": "best",
            "name": "friends",
            "args": [{"kind": "Literal", "name": "first", "value": 1}],
            "concreteType": "User",
            "plural": true,
            "selections": [
                {"kind": "ScalarField", "name": "id"},
                {"kind": "ScalarField", "name": "name", "required": "THROW"},
                {
                    "kind": "InlineFragment",
                    "type": "Node",
                    "abstractKey": "__isNode",
                    "selections": [{"kind": "TypeDiscriminator", "abstractKey": "__isNode"}]
                }
            ]
        }))
        .unwrap();

        let Selection::LinkedField(field) = selection else {
            panic!("expected linked field");
        };
        assert_eq!(field.response_key(), "best");
        assert_eq!(field.storage_key(&Variables::new()), "friends(first:1)");
        assert!(field.plural);
        assert_eq!(field.selections.len(), 3);
        match &field.selections[1] {
            Selection::ScalarField(f) => assert_eq!(f.required, Some(RequiredAction::Throw)),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn defer_if_is_renamed() {
        let selection: Selection = serde_json::from_value(json!({
            "kind": "Defer",
            "label": "Q$defer$bio",
            "if": "withBio",
            "selections": []
        }))
        .unwrap();
        match selection {
            Selection::Defer(defer) => assert_eq!(defer.if_condition.as_deref(), Some("withBio")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn handle_storage_keys() {
        let handle = FieldHandle {
            alias: None,
            name: "friends".into(),
            args: vec![Argument::literal("first", json!(2))],
            handle: "connection".into(),
            key: "Friends_friends".into(),
            filters: None,
            handle_args: vec![],
        };
        let vars = Variables::new();
        assert_eq!(handle.field_storage_key(&vars), "friends(first:2)");
        assert_eq!(handle.handle_storage_key(&vars), "__Friends_friends_connection");
    }

    #[test]
    fn fingerprint_is_stable_and_content_sensitive() {
        let fragment = Arc::new(ReaderFragment {
            name: "Q".into(),
            type_condition: "Query".into(),
            abstract_key: None,
            argument_definitions: vec![],
            selections: Arc::from(vec![]),
        });
        let make = |name: &str| ConcreteRequest {
            fragment: fragment.clone(),
            operation: Arc::new(NormalizationOperation {
                name: name.into(),
                argument_definitions: vec![],
                selections: Arc::from(vec![]),
            }),
            params: RequestParameters {
                name: name.into(),
                operation_kind: OperationKind::Query,
                id: None,
                cache_id: None,
                text: None,
            },
        };
        assert_eq!(make("Q").fingerprint(), make("Q").fingerprint());
        assert_ne!(make("Q").fingerprint(), make("R").fingerprint());
    }
}

//! Selectors and operation descriptors.
//!
//! A selector pairs a root record id with a compiled selection tree and the
//! variables to evaluate it with. An [`OperationDescriptor`] bundles the
//! reader and normalization selectors for one execution of a request, and is
//! the unit the store retains and checks.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::id::DataId;
use crate::selection::{
    ArgumentDefinition, ConcreteRequest, ReaderFragment, Selections,
};
use crate::storage_key::{canonical_json, Argument};

/// Variable values keyed by name.
pub type Variables = serde_json::Map<String, Value>;

/// Identifies one request: its persisted id (or name) plus its variables.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestIdentifier(String);

impl RequestIdentifier {
    pub fn new(request: &ConcreteRequest, variables: &Variables) -> Self {
        let params = &request.params;
        let base = params
            .cache_id
            .as_deref()
            .or(params.id.as_deref())
            .unwrap_or(&params.name);
        RequestIdentifier(format!(
            "{base}{}",
            canonical_json(&Value::Object(variables.clone()))
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RequestIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The request half of an operation descriptor.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestDescriptor {
    pub identifier: RequestIdentifier,
    pub node: Arc<ConcreteRequest>,
    pub variables: Variables,
}

/// What to read: a fragment evaluated at one record.
#[derive(Debug, Clone, PartialEq)]
pub struct SingularReaderSelector {
    pub data_id: DataId,
    pub node: Arc<ReaderFragment>,
    pub variables: Variables,
    pub owner: RequestDescriptor,
}

/// What to write (or check, or mark): selections evaluated at one record.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizationSelector {
    pub data_id: DataId,
    pub selections: Selections,
    pub variables: Variables,
}

/// One execution of a request, the unit of retain/check/notify bookkeeping.
#[derive(Debug, Clone, PartialEq)]
pub struct OperationDescriptor {
    pub request: RequestDescriptor,
    pub fragment: SingularReaderSelector,
    pub root: NormalizationSelector,
}

impl OperationDescriptor {
    pub fn identifier(&self) -> &RequestIdentifier {
        &self.request.identifier
    }
}

/// Builds an operation descriptor rooted at `data_id` (the root record when
/// `None`). Declared operation variables missing from `variables` take their
/// default values; undeclared variables are dropped.
pub fn create_operation_descriptor(
    request: Arc<ConcreteRequest>,
    variables: &Variables,
    data_id: Option<DataId>,
) -> OperationDescriptor {
    let operation_variables =
        apply_argument_definitions(&request.operation.argument_definitions, variables, variables);
    let data_id = data_id.unwrap_or_else(DataId::root);
    let identifier = RequestIdentifier::new(&request, &operation_variables);
    let owner = RequestDescriptor {
        identifier,
        node: request.clone(),
        variables: operation_variables.clone(),
    };
    OperationDescriptor {
        fragment: SingularReaderSelector {
            data_id: data_id.clone(),
            node: request.fragment.clone(),
            variables: operation_variables.clone(),
            owner: owner.clone(),
        },
        root: NormalizationSelector {
            data_id,
            selections: request.operation.selections.clone(),
            variables: operation_variables,
        },
        request: owner,
    }
}

/// Variables in scope inside `fragment` when spread with `args` from a
/// context whose variables are `parent`, within an operation whose
/// variables are `root`.
pub fn fragment_variables(
    fragment: &ReaderFragment,
    args: &[Argument],
    parent: &Variables,
    root: &Variables,
) -> Variables {
    let provided: Variables = args
        .iter()
        .map(|arg| (arg.name().to_string(), arg.resolve(parent)))
        .collect();
    apply_argument_definitions(&fragment.argument_definitions, &provided, root)
}

fn apply_argument_definitions(
    definitions: &[ArgumentDefinition],
    provided: &Variables,
    root: &Variables,
) -> Variables {
    let mut out = Variables::new();
    for definition in definitions {
        match definition {
            ArgumentDefinition::LocalArgument { name, default_value } => {
                let value = provided
                    .get(name)
                    .filter(|v| !v.is_null())
                    .cloned()
                    .unwrap_or_else(|| default_value.clone());
                out.insert(name.clone(), value);
            }
            ArgumentDefinition::RootArgument { name } => {
                out.insert(name.clone(), root.get(name).cloned().unwrap_or(Value::Null));
            }
        }
    }
    out
}

//! Static node-type specification tables.
//!
//! These tables drive compile-time validation (allowed labels, connection
//! cardinalities), node construction (field renames, defaults), and the
//! scheduler (join policy, timeout, retry defaults). The handler registry
//! pairs each spec with its handler at start-up.

use serde_json::Value;
use std::time::Duration;

use super::diagram::{HandleLabel, NodeType};
use super::executable::JoinPolicy;
use crate::envelope::ContentType;

/// One input or output port of a node type.
#[derive(Debug, Clone, PartialEq)]
pub struct PortSpec {
    pub label: HandleLabel,
    /// `None` accepts any content type.
    pub content_type: Option<ContentType>,
    pub required: bool,
    /// Default applied when a required port has no bound value.
    pub default: Option<Value>,
    /// Consumer opts in to the `raw_text → object` coercion.
    pub accepts_text: bool,
}

impl PortSpec {
    fn new(label: HandleLabel, content_type: Option<ContentType>) -> Self {
        Self {
            label,
            content_type,
            required: false,
            default: None,
            accepts_text: false,
        }
    }

    fn required(mut self) -> Self {
        self.required = true;
        self
    }

    fn with_default(mut self, value: Value) -> Self {
        self.default = Some(value);
        self
    }

    fn accepting_text(mut self) -> Self {
        self.accepts_text = true;
        self
    }
}

/// Static specification of one node type.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeSpec {
    pub node_type: NodeType,
    pub inputs: Vec<PortSpec>,
    pub outputs: Vec<PortSpec>,
    /// `Some(n)` caps the number of incoming arrows.
    pub max_incoming: Option<usize>,
    /// `Some(n)` caps the number of outgoing arrows.
    pub max_outgoing: Option<usize>,
    pub timeout: Duration,
    pub retryable: bool,
    pub max_retries: u32,
    pub join_policy: JoinPolicy,
}

impl NodeSpec {
    pub fn input(&self, label: &HandleLabel) -> Option<&PortSpec> {
        self.inputs.iter().find(|p| &p.label == label)
    }

    pub fn output(&self, label: &HandleLabel) -> Option<&PortSpec> {
        self.outputs.iter().find(|p| &p.label == label)
    }

    /// A single unnamed (default) input port lets unlabelled edges bind to it.
    pub fn single_default_input(&self) -> bool {
        self.inputs.len() == 1 && self.inputs[0].label == HandleLabel::Default
    }
}

fn spec(node_type: NodeType) -> NodeSpec {
    NodeSpec {
        node_type,
        inputs: Vec::new(),
        outputs: Vec::new(),
        max_incoming: None,
        max_outgoing: None,
        timeout: Duration::from_secs(30),
        retryable: false,
        max_retries: 0,
        join_policy: JoinPolicy::All,
    }
}

/// The HANDLE_SPECS table: allowed ports and scheduling defaults per type.
pub fn node_spec(node_type: NodeType) -> NodeSpec {
    use HandleLabel as L;
    use NodeType as T;
    match node_type {
        T::Start => NodeSpec {
            outputs: vec![PortSpec::new(L::Default, Some(ContentType::Object))],
            max_incoming: Some(0),
            timeout: Duration::from_secs(10),
            ..spec(node_type)
        },
        T::Endpoint => NodeSpec {
            inputs: vec![PortSpec::new(L::Default, None).required()],
            max_outgoing: Some(0),
            timeout: Duration::from_secs(30),
            ..spec(node_type)
        },
        T::Condition => NodeSpec {
            inputs: vec![PortSpec::new(L::Default, None)],
            outputs: vec![
                PortSpec::new(L::Condtrue, None),
                PortSpec::new(L::Condfalse, None),
            ],
            timeout: Duration::from_secs(60),
            ..spec(node_type)
        },
        T::PersonJob => NodeSpec {
            inputs: vec![
                PortSpec::new(L::Default, None),
                PortSpec::new(L::First, None),
                PortSpec::new(
                    L::Custom("conversation".into()),
                    Some(ContentType::ConversationState),
                ),
            ],
            outputs: vec![PortSpec::new(L::Default, None)],
            timeout: Duration::from_secs(120),
            ..spec(node_type)
        },
        T::CodeJob => NodeSpec {
            inputs: vec![PortSpec::new(L::Default, None)],
            outputs: vec![
                PortSpec::new(L::Default, Some(ContentType::Object)),
                PortSpec::new(L::Error, Some(ContentType::Error)),
            ],
            timeout: Duration::from_secs(60),
            ..spec(node_type)
        },
        T::ApiJob => NodeSpec {
            inputs: vec![PortSpec::new(L::Default, None)],
            outputs: vec![
                PortSpec::new(L::Default, Some(ContentType::Object)),
                PortSpec::new(L::Error, Some(ContentType::Error)),
            ],
            timeout: Duration::from_secs(30),
            retryable: true,
            max_retries: 3,
            ..spec(node_type)
        },
        T::Db => NodeSpec {
            inputs: vec![PortSpec::new(L::Default, None)],
            outputs: vec![PortSpec::new(L::Default, None)],
            timeout: Duration::from_secs(30),
            ..spec(node_type)
        },
        T::TemplateJob => NodeSpec {
            inputs: vec![PortSpec::new(L::Default, None)],
            outputs: vec![PortSpec::new(L::Default, Some(ContentType::RawText))],
            timeout: Duration::from_secs(30),
            ..spec(node_type)
        },
        T::JsonSchemaValidator => NodeSpec {
            inputs: vec![PortSpec::new(L::Default, Some(ContentType::Object))
                .required()
                .accepting_text()],
            outputs: vec![
                PortSpec::new(L::Default, Some(ContentType::Object)),
                PortSpec::new(L::Error, Some(ContentType::Error)),
            ],
            timeout: Duration::from_secs(30),
            ..spec(node_type)
        },
        T::Hook => NodeSpec {
            inputs: vec![PortSpec::new(L::Default, None)],
            outputs: vec![
                PortSpec::new(L::Default, None),
                PortSpec::new(L::Error, Some(ContentType::Error)),
            ],
            timeout: Duration::from_secs(60),
            ..spec(node_type)
        },
        T::SubDiagram => NodeSpec {
            inputs: vec![PortSpec::new(L::Default, None)],
            outputs: vec![
                PortSpec::new(L::Default, Some(ContentType::Object)),
                PortSpec::new(L::Error, Some(ContentType::Error)),
            ],
            timeout: Duration::from_secs(600),
            ..spec(node_type)
        },
        T::UserResponse => NodeSpec {
            inputs: vec![PortSpec::new(L::Default, None)],
            outputs: vec![PortSpec::new(L::Default, Some(ContentType::RawText))],
            timeout: Duration::from_secs(300),
            ..spec(node_type)
        },
        T::IntegratedApi => NodeSpec {
            inputs: vec![PortSpec::new(L::Default, None)],
            outputs: vec![
                PortSpec::new(L::Default, Some(ContentType::Object)),
                PortSpec::new(L::Error, Some(ContentType::Error)),
            ],
            timeout: Duration::from_secs(30),
            retryable: true,
            max_retries: 3,
            ..spec(node_type)
        },
        T::DiffPatch => NodeSpec {
            inputs: vec![PortSpec::new(L::Default, Some(ContentType::RawText)).required()],
            outputs: vec![
                PortSpec::new(L::Results, Some(ContentType::Object)),
                PortSpec::new(L::Error, Some(ContentType::Error)),
            ],
            timeout: Duration::from_secs(30),
            ..spec(node_type)
        },
        T::IrBuilder => NodeSpec {
            inputs: vec![PortSpec::new(L::Default, None)],
            outputs: vec![PortSpec::new(L::Default, Some(ContentType::Object))],
            timeout: Duration::from_secs(30),
            ..spec(node_type)
        },
        T::TypescriptAst => NodeSpec {
            inputs: vec![PortSpec::new(L::Default, Some(ContentType::RawText))
                .required()
                .with_default(Value::String(String::new()))],
            outputs: vec![PortSpec::new(L::Default, Some(ContentType::Object))],
            timeout: Duration::from_secs(30),
            ..spec(node_type)
        },
    }
}

/// JSON schema of a node type's configuration struct, for embedders that
/// introspect the registry.
pub fn config_schema(node_type: NodeType) -> schemars::schema::RootSchema {
    use crate::domain as d;
    use NodeType as T;
    match node_type {
        T::Start => schemars::schema_for!(d::StartNode),
        T::Endpoint => schemars::schema_for!(d::EndpointNode),
        T::Condition => schemars::schema_for!(d::ConditionNode),
        T::PersonJob => schemars::schema_for!(d::PersonJobNode),
        T::CodeJob => schemars::schema_for!(d::CodeJobNode),
        T::ApiJob => schemars::schema_for!(d::ApiJobNode),
        T::Db => schemars::schema_for!(d::DbNode),
        T::TemplateJob => schemars::schema_for!(d::TemplateJobNode),
        T::JsonSchemaValidator => schemars::schema_for!(d::JsonSchemaValidatorNode),
        T::Hook => schemars::schema_for!(d::HookNode),
        T::SubDiagram => schemars::schema_for!(d::SubDiagramNode),
        T::UserResponse => schemars::schema_for!(d::UserResponseNode),
        T::IntegratedApi => schemars::schema_for!(d::IntegratedApiNode),
        T::DiffPatch => schemars::schema_for!(d::DiffPatchNode),
        T::IrBuilder => schemars::schema_for!(d::IrBuilderNode),
        T::TypescriptAst => schemars::schema_for!(d::TypescriptAstNode),
    }
}

/// The FIELD_MAPPINGS table: import-direction field renames applied before
/// typed-node construction.
pub fn field_mappings(node_type: NodeType) -> &'static [(&'static str, &'static str)] {
    use NodeType as T;
    match node_type {
        T::PersonJob => &[
            ("prompt", "default_prompt"),
            ("first_prompt", "first_only_prompt"),
            ("max_iterations", "max_iteration"),
            ("memory", "memorize_to"),
        ],
        T::Condition => &[("condition", "expression")],
        T::CodeJob => &[("source", "code"), ("lang", "language")],
        T::Db => &[("path", "file"), ("op", "operation")],
        T::ApiJob => &[("endpoint", "url")],
        T::SubDiagram => &[("diagram", "diagram_name")],
        T::TemplateJob => &[("content", "template")],
        _ => &[],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_type_has_a_spec() {
        for t in NodeType::ALL {
            let s = node_spec(t);
            assert_eq!(s.node_type, t);
        }
    }

    #[test]
    fn start_and_endpoint_cardinalities() {
        assert_eq!(node_spec(NodeType::Start).max_incoming, Some(0));
        assert_eq!(node_spec(NodeType::Endpoint).max_outgoing, Some(0));
    }

    #[test]
    fn condition_declares_both_branches() {
        let s = node_spec(NodeType::Condition);
        assert!(s.output(&HandleLabel::Condtrue).is_some());
        assert!(s.output(&HandleLabel::Condfalse).is_some());
        assert!(s.output(&HandleLabel::Default).is_none());
    }

    #[test]
    fn api_jobs_are_retryable_by_default() {
        let s = node_spec(NodeType::ApiJob);
        assert!(s.retryable);
        assert_eq!(s.max_retries, 3);
    }

    #[test]
    fn renames_apply_to_person_job() {
        let m = field_mappings(NodeType::PersonJob);
        assert!(m.contains(&("prompt", "default_prompt")));
    }

    #[test]
    fn config_schemas_expose_required_fields() {
        let schema = config_schema(NodeType::PersonJob);
        let json = serde_json::to_value(&schema).unwrap();
        assert!(json["properties"].get("person").is_some());
        assert!(json["properties"].get("max_iteration").is_some());
    }
}

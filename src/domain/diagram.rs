//! Domain diagram - the compiler's input model.
//!
//! This is the already-parsed structure handed over by format front-ends.
//! The compiler validates it; nothing here assumes well-formedness.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::envelope::ContentType;
use crate::ports::LlmConfig;
use crate::types::{EdgeId, HandleId, NodeId, PersonId};

/// The sixteen node types of the execution core. Additional types may be
/// registered by embedders at start-up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    Start,
    Endpoint,
    Condition,
    PersonJob,
    CodeJob,
    ApiJob,
    Db,
    TemplateJob,
    JsonSchemaValidator,
    Hook,
    SubDiagram,
    UserResponse,
    IntegratedApi,
    DiffPatch,
    IrBuilder,
    TypescriptAst,
}

impl NodeType {
    pub const ALL: [NodeType; 16] = [
        NodeType::Start,
        NodeType::Endpoint,
        NodeType::Condition,
        NodeType::PersonJob,
        NodeType::CodeJob,
        NodeType::ApiJob,
        NodeType::Db,
        NodeType::TemplateJob,
        NodeType::JsonSchemaValidator,
        NodeType::Hook,
        NodeType::SubDiagram,
        NodeType::UserResponse,
        NodeType::IntegratedApi,
        NodeType::DiffPatch,
        NodeType::IrBuilder,
        NodeType::TypescriptAst,
    ];
}

impl std::fmt::Display for NodeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // serde snake_case name without quotes
        let s = serde_json::to_string(self).unwrap_or_default();
        write!(f, "{}", s.trim_matches('"'))
    }
}

/// Handle direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandleDirection {
    Input,
    Output,
}

/// Handle label - the variable name by which arriving envelopes are bound.
///
/// Well-known labels carry scheduler semantics (`condtrue`/`condfalse`,
/// `first`, `error`); any other string is a custom binding name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum HandleLabel {
    Default,
    First,
    Condtrue,
    Condfalse,
    Results,
    Error,
    Custom(String),
}

impl HandleLabel {
    pub fn as_str(&self) -> &str {
        match self {
            HandleLabel::Default => "default",
            HandleLabel::First => "first",
            HandleLabel::Condtrue => "condtrue",
            HandleLabel::Condfalse => "condfalse",
            HandleLabel::Results => "results",
            HandleLabel::Error => "error",
            HandleLabel::Custom(s) => s,
        }
    }

    pub fn is_condition_branch(&self) -> bool {
        matches!(self, HandleLabel::Condtrue | HandleLabel::Condfalse)
    }
}

impl From<String> for HandleLabel {
    fn from(s: String) -> Self {
        match s.as_str() {
            "default" => HandleLabel::Default,
            "first" => HandleLabel::First,
            "condtrue" => HandleLabel::Condtrue,
            "condfalse" => HandleLabel::Condfalse,
            "results" => HandleLabel::Results,
            "error" => HandleLabel::Error,
            _ => HandleLabel::Custom(s),
        }
    }
}

impl From<&str> for HandleLabel {
    fn from(s: &str) -> Self {
        HandleLabel::from(s.to_string())
    }
}

impl From<HandleLabel> for String {
    fn from(l: HandleLabel) -> Self {
        l.as_str().to_string()
    }
}

impl std::fmt::Display for HandleLabel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Editor position (carried through untouched).
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

/// One diagram node as drawn: a type tag plus untyped configuration data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainNode {
    #[serde(rename = "type")]
    pub node_type: NodeType,
    #[serde(default)]
    pub position: Position,
    #[serde(default)]
    pub data: serde_json::Map<String, Value>,
}

/// A directed connection between two handles.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Arrow {
    pub id: EdgeId,
    pub source: HandleId,
    pub target: HandleId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<ContentType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default)]
    pub data: serde_json::Map<String, Value>,
}

/// A named attachment point on a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Handle {
    pub node_id: NodeId,
    pub label: HandleLabel,
    pub direction: HandleDirection,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_type: Option<ContentType>,
}

/// A configured LLM persona.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersonConfig {
    pub label: String,
    pub llm_config: LlmConfig,
}

/// Input to the compiler: the full drawn diagram.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DomainDiagram {
    #[serde(default)]
    pub nodes: BTreeMap<NodeId, DomainNode>,
    #[serde(default)]
    pub arrows: Vec<Arrow>,
    #[serde(default)]
    pub handles: BTreeMap<HandleId, Handle>,
    #[serde(default)]
    pub persons: BTreeMap<PersonId, PersonConfig>,
}

impl DomainDiagram {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a node with the given configuration data.
    pub fn add_node(
        &mut self,
        id: impl Into<NodeId>,
        node_type: NodeType,
        data: serde_json::Map<String, Value>,
    ) -> NodeId {
        let id = id.into();
        self.nodes.insert(
            id.clone(),
            DomainNode {
                node_type,
                position: Position::default(),
                data,
            },
        );
        id
    }

    /// Add a handle; the id follows the `{node}_{label}_{direction}`
    /// convention used by the visual editor.
    pub fn add_handle(
        &mut self,
        node: &NodeId,
        label: impl Into<HandleLabel>,
        direction: HandleDirection,
        data_type: Option<ContentType>,
    ) -> HandleId {
        let label = label.into();
        let dir = match direction {
            HandleDirection::Input => "input",
            HandleDirection::Output => "output",
        };
        let id = HandleId::from(format!("{node}_{label}_{dir}").as_str());
        self.handles.insert(
            id.clone(),
            Handle {
                node_id: node.clone(),
                label,
                direction,
                data_type,
            },
        );
        id
    }

    /// Connect two handles with an arrow.
    pub fn connect(
        &mut self,
        id: impl Into<EdgeId>,
        source: HandleId,
        target: HandleId,
        data: serde_json::Map<String, Value>,
    ) -> EdgeId {
        let id = id.into();
        self.arrows.push(Arrow {
            id: id.clone(),
            source,
            target,
            content_type: None,
            label: None,
            data,
        });
        id
    }
}

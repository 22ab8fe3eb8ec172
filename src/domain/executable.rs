//! Executable diagram - the compiler's frozen output.
//!
//! Nodes and edges live in flat arenas; all traversal goes through the
//! dependency index. There are no back-references between nodes and edges.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;

use super::diagram::{HandleLabel, NodeType, PersonConfig};
use crate::envelope::ContentType;
use crate::person::MemorySettings;
use crate::ports::{CodeLanguage, ToolSelection};
use crate::types::{EdgeId, NodeId, PersonId};

/// When a node has enough incoming tokens to fire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, schemars::JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum JoinPolicy {
    All,
    Any,
    KOfN(usize),
}

impl Default for JoinPolicy {
    fn default() -> Self {
        JoinPolicy::All
    }
}

/// Scope of a person job's `max_iteration` counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, schemars::JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum IterationScope {
    PerEpoch,
    Cumulative,
}

impl Default for IterationScope {
    fn default() -> Self {
        IterationScope::Cumulative
    }
}

// =============================================================================
// Per-type configuration structs
// =============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, schemars::JsonSchema)]
pub struct StartNode {
    /// Seed object emitted at epoch 0, merged with the run's initial inputs.
    #[serde(default)]
    pub custom_data: serde_json::Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, schemars::JsonSchema)]
pub struct EndpointNode {
    #[serde(default)]
    pub save_to_file: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_path: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, schemars::JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ConditionType {
    DetectMaxIterations,
    CheckNodesExecuted,
    CustomExpression,
    LlmDecision,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, schemars::JsonSchema)]
pub struct ConditionNode {
    pub condition_type: ConditionType,
    /// Expression source for `custom_expression`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expression: Option<String>,
    /// Target nodes for `check_nodes_executed`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub node_ids: Vec<NodeId>,
    /// Judge persona for `llm_decision`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub person: Option<PersonId>,
    /// Judge prompt for `llm_decision`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub judge_by: Option<String>,
    /// Skippable condition edges are excluded from join requirements until
    /// they are the only dependency left.
    #[serde(default)]
    pub skippable: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, schemars::JsonSchema)]
pub struct PersonJobNode {
    pub person: PersonId,
    /// Prompt used on the node's first execution at an epoch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_only_prompt: Option<String>,
    /// Prompt used on subsequent executions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_prompt: Option<String>,
    #[serde(default = "default_max_iteration")]
    pub max_iteration: u32,
    #[serde(default)]
    pub max_iteration_scope: IterationScope,
    #[serde(flatten)]
    pub memory: MemorySettings,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ToolSelection>,
    /// Structured output schema forwarded to the LLM port.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text_format: Option<Value>,
}

fn default_max_iteration() -> u32 {
    1
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, schemars::JsonSchema)]
pub struct CodeJobNode {
    pub language: CodeLanguage,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, schemars::JsonSchema)]
pub struct ApiJobNode {
    pub url: String,
    #[serde(default = "default_http_method")]
    pub method: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_s: Option<u64>,
}

fn default_http_method() -> String {
    "GET".to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, schemars::JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum DbOperation {
    Read,
    Write,
    Append,
    Update,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, schemars::JsonSchema)]
pub struct DbNode {
    pub operation: DbOperation,
    pub file: String,
    /// Dot-path selection applied to JSON payloads.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub keys: Vec<String>,
    #[serde(default)]
    pub serialize_json: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, schemars::JsonSchema)]
pub struct TemplateJobNode {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_path: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, schemars::JsonSchema)]
pub struct JsonSchemaValidatorNode {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema_path: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, schemars::JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum HookType {
    Shell,
    Http,
    File,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, schemars::JsonSchema)]
pub struct HookNode {
    pub hook_type: HookType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_path: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, schemars::JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum OutputMode {
    PureList,
    RichObject,
}

impl Default for OutputMode {
    fn default() -> Self {
        OutputMode::PureList
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, schemars::JsonSchema)]
pub struct SubDiagramNode {
    /// Child diagram name resolved against the engine's diagram registry.
    pub diagram_name: String,
    #[serde(default)]
    pub batch: bool,
    #[serde(default = "default_batch_input_key")]
    pub batch_input_key: String,
    #[serde(default)]
    pub output_mode: OutputMode,
    #[serde(default = "default_result_key")]
    pub result_key: String,
}

fn default_batch_input_key() -> String {
    "items".to_string()
}

fn default_result_key() -> String {
    "results".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, schemars::JsonSchema)]
pub struct UserResponseNode {
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_s: Option<u64>,
    /// Fallback answer when no response arrives within the timeout.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_answer: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, schemars::JsonSchema)]
pub struct IntegratedApiNode {
    pub provider: String,
    pub operation: String,
    #[serde(default)]
    pub config: serde_json::Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_s: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, schemars::JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum PatchMode {
    Normal,
    Force,
    DryRun,
    Reverse,
}

impl Default for PatchMode {
    fn default() -> Self {
        PatchMode::Normal
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, schemars::JsonSchema)]
pub struct DiffPatchNode {
    pub target_path: String,
    #[serde(default)]
    pub mode: PatchMode,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, schemars::JsonSchema)]
pub struct IrBuilderNode {
    pub builder: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_key: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, schemars::JsonSchema)]
pub struct TypescriptAstNode {
    /// Declaration kinds to extract from the source.
    #[serde(default = "default_extract")]
    pub extract: Vec<String>,
}

fn default_extract() -> Vec<String> {
    vec!["interface".into(), "type".into(), "enum".into()]
}

// =============================================================================
// Executable node
// =============================================================================

/// Typed node variants. The runtime dispatches handlers on this tag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NodeKind {
    Start(StartNode),
    Endpoint(EndpointNode),
    Condition(ConditionNode),
    PersonJob(PersonJobNode),
    CodeJob(CodeJobNode),
    ApiJob(ApiJobNode),
    Db(DbNode),
    TemplateJob(TemplateJobNode),
    JsonSchemaValidator(JsonSchemaValidatorNode),
    Hook(HookNode),
    SubDiagram(SubDiagramNode),
    UserResponse(UserResponseNode),
    IntegratedApi(IntegratedApiNode),
    DiffPatch(DiffPatchNode),
    IrBuilder(IrBuilderNode),
    TypescriptAst(TypescriptAstNode),
}

impl NodeKind {
    pub fn node_type(&self) -> NodeType {
        match self {
            NodeKind::Start(_) => NodeType::Start,
            NodeKind::Endpoint(_) => NodeType::Endpoint,
            NodeKind::Condition(_) => NodeType::Condition,
            NodeKind::PersonJob(_) => NodeType::PersonJob,
            NodeKind::CodeJob(_) => NodeType::CodeJob,
            NodeKind::ApiJob(_) => NodeType::ApiJob,
            NodeKind::Db(_) => NodeType::Db,
            NodeKind::TemplateJob(_) => NodeType::TemplateJob,
            NodeKind::JsonSchemaValidator(_) => NodeType::JsonSchemaValidator,
            NodeKind::Hook(_) => NodeType::Hook,
            NodeKind::SubDiagram(_) => NodeType::SubDiagram,
            NodeKind::UserResponse(_) => NodeType::UserResponse,
            NodeKind::IntegratedApi(_) => NodeType::IntegratedApi,
            NodeKind::DiffPatch(_) => NodeType::DiffPatch,
            NodeKind::IrBuilder(_) => NodeType::IrBuilder,
            NodeKind::TypescriptAst(_) => NodeType::TypescriptAst,
        }
    }
}

/// Fields common to every node regardless of type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeBase {
    pub id: NodeId,
    /// Display label from the editor.
    pub label: String,
    pub join_policy: JoinPolicy,
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    pub retryable: bool,
    pub max_retries: u32,
}

/// One compiled node: validated configuration plus common scheduling fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutableNode {
    pub base: NodeBase,
    pub kind: NodeKind,
}

impl ExecutableNode {
    pub fn id(&self) -> &NodeId {
        &self.base.id
    }

    pub fn node_type(&self) -> NodeType {
        self.kind.node_type()
    }

    pub fn is_start(&self) -> bool {
        matches!(self.kind, NodeKind::Start(_))
    }

    pub fn is_endpoint(&self) -> bool {
        matches!(self.kind, NodeKind::Endpoint(_))
    }

    pub fn is_condition(&self) -> bool {
        matches!(self.kind, NodeKind::Condition(_))
    }

    /// Whether the node is a condition marked skippable.
    pub fn is_skippable_condition(&self) -> bool {
        matches!(&self.kind, NodeKind::Condition(c) if c.skippable)
    }
}

// =============================================================================
// Executable edge
// =============================================================================

/// Classification assigned during connection resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeKind {
    Data,
    ConditionTrue,
    ConditionFalse,
}

/// Binding strategy for the consumed value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Packing {
    /// Bind under the edge's target label (default).
    Pack,
    /// Shallow-merge object keys into the input namespace.
    Spread,
}

impl Default for Packing {
    fn default() -> Self {
        Packing::Pack
    }
}

/// Declared value rewrites, applied in order at input resolution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransformRule {
    /// Take a dot-path field out of an object body.
    Extract(String),
    /// Wrap the value under a key.
    Wrap(String),
    /// Rename object keys.
    Map(BTreeMap<String, String>),
    /// Render a `{{ var }}` format string against an object body.
    Template(String),
    /// JSON-serialize an object body to raw text (compiler-attached
    /// `object → raw_text` coercion).
    Serialize,
    /// JSON-parse a raw text body into an object (compiler-attached
    /// `raw_text → object` coercion, consumer opt-in).
    Parse,
}

/// One compiled edge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutableEdge {
    pub id: EdgeId,
    pub source_node: NodeId,
    pub source_label: HandleLabel,
    pub target_node: NodeId,
    pub target_label: HandleLabel,
    pub content_type: Option<ContentType>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub transforms: Vec<TransformRule>,
    #[serde(default)]
    pub packing: Packing,
    pub kind: EdgeKind,
    /// Set during graph analysis for edges that close a recorded cycle.
    #[serde(default)]
    pub is_loopback: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

// =============================================================================
// Diagram
// =============================================================================

/// Per-node edge indices into the flat edge arena.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DependencyIndex {
    pub incoming: BTreeMap<NodeId, Vec<usize>>,
    pub outgoing: BTreeMap<NodeId, Vec<usize>>,
}

/// The frozen compiler output. Immutable after assembly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutableDiagram {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub nodes: BTreeMap<NodeId, ExecutableNode>,
    pub edges: Vec<ExecutableEdge>,
    pub index: DependencyIndex,
    pub start_nodes: Vec<NodeId>,
    pub endpoint_nodes: Vec<NodeId>,
    pub persons: BTreeMap<PersonId, PersonConfig>,
    /// Topological rank for acyclic portions; ties broken by NodeId order.
    pub topo_hint: BTreeMap<NodeId, usize>,
    /// Recorded loop subgraphs (strongly-connected components of size > 1
    /// or self loops).
    pub cycles: Vec<Vec<NodeId>>,
}

impl ExecutableDiagram {
    pub fn node(&self, id: &NodeId) -> Option<&ExecutableNode> {
        self.nodes.get(id)
    }

    pub fn incoming_edges(&self, node: &NodeId) -> impl Iterator<Item = &ExecutableEdge> {
        self.index
            .incoming
            .get(node)
            .into_iter()
            .flatten()
            .map(|&i| &self.edges[i])
    }

    pub fn outgoing_edges(&self, node: &NodeId) -> impl Iterator<Item = &ExecutableEdge> {
        self.index
            .outgoing
            .get(node)
            .into_iter()
            .flatten()
            .map(|&i| &self.edges[i])
    }

    pub fn edge(&self, id: &EdgeId) -> Option<&ExecutableEdge> {
        self.edges.iter().find(|e| &e.id == id)
    }

    /// Scheduler tie-break rank: topo hint, then NodeId order.
    pub fn rank(&self, node: &NodeId) -> usize {
        self.topo_hint.get(node).copied().unwrap_or(usize::MAX)
    }
}

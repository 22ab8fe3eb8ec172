//! Domain model: diagrams, nodes, edges, handles, persons.
//!
//! `diagram` holds the compiler input (as parsed by external format
//! front-ends), `executable` the frozen compiler output, and `specs` the
//! static per-node-type specification tables.

mod diagram;
mod executable;
pub mod specs;

pub use diagram::{
    Arrow, DomainDiagram, DomainNode, Handle, HandleDirection, HandleLabel, NodeType, PersonConfig,
    Position,
};
pub use executable::{
    ApiJobNode, CodeJobNode, ConditionNode, ConditionType, DbNode, DbOperation, DependencyIndex,
    DiffPatchNode, EdgeKind, EndpointNode, ExecutableDiagram, ExecutableEdge, ExecutableNode,
    HookNode, HookType, IntegratedApiNode, IrBuilderNode, IterationScope, JoinPolicy,
    JsonSchemaValidatorNode, NodeBase, NodeKind, OutputMode, Packing, PatchMode, PersonJobNode,
    StartNode, SubDiagramNode, TemplateJobNode, TransformRule, TypescriptAstNode,
    UserResponseNode,
};

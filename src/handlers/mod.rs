//! Node handlers - per-type business logic.
//!
//! Every handler implements the same contract: a pure `prepare_inputs`
//! hook, an async `execute` that suspends only on injected ports, an
//! `on_error` conversion hook, and a `post_execute` hook defaulting to
//! identity. Handlers never touch scheduler state; they communicate only
//! through their returned outputs.

pub mod expr;

mod api_job;
mod code_job;
mod condition;
mod db;
mod diff_patch;
mod endpoint;
mod hook;
mod integrated_api;
mod ir_builder;
mod person_job;
mod start;
mod sub_diagram;
mod template_job;
mod typescript_ast;
mod user_response;
mod validator;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::domain::{ExecutableNode, HandleLabel, NodeType};
use crate::engine::{ExecutionContext, NodeTask, ResolvedInputs};
use crate::envelope::Envelope;
use crate::types::{Error, Result};

pub use api_job::ApiJobHandler;
pub use code_job::CodeJobHandler;
pub use condition::ConditionHandler;
pub use db::DbHandler;
pub use diff_patch::DiffPatchHandler;
pub use endpoint::EndpointHandler;
pub use hook::HookHandler;
pub use integrated_api::IntegratedApiHandler;
pub use ir_builder::IrBuilderHandler;
pub use person_job::PersonJobHandler;
pub use start::StartHandler;
pub use sub_diagram::SubDiagramHandler;
pub use template_job::TemplateJobHandler;
pub use typescript_ast::TypescriptAstHandler;
pub use user_response::UserResponseHandler;
pub use validator::JsonSchemaValidatorHandler;

/// A handler's emitted outputs: labelled envelopes published as tokens on
/// matching outgoing edges, plus an optional terminal value recorded for
/// endpoint nodes.
#[derive(Debug, Clone, Default)]
pub struct NodeOutput {
    pub outputs: Vec<(HandleLabel, Envelope)>,
    pub final_value: Option<Value>,
}

impl NodeOutput {
    /// One envelope on the default output.
    pub fn single(envelope: Envelope) -> Self {
        Self {
            outputs: vec![(HandleLabel::Default, envelope)],
            final_value: None,
        }
    }

    /// One envelope on a named output.
    pub fn labeled(label: HandleLabel, envelope: Envelope) -> Self {
        Self {
            outputs: vec![(label, envelope)],
            final_value: None,
        }
    }

    /// No outputs (endpoint nodes).
    pub fn none() -> Self {
        Self::default()
    }

    pub fn with_final(mut self, value: Value) -> Self {
        self.final_value = Some(value);
        self
    }

    /// The envelope used for event summaries.
    pub fn primary(&self) -> Option<&Envelope> {
        self.outputs.first().map(|(_, e)| e)
    }
}

/// Common contract for every node handler.
#[async_trait]
pub trait NodeHandler: Send + Sync {
    fn node_type(&self) -> NodeType;

    /// Pure transformation of resolved inputs before execution; no I/O.
    fn prepare_inputs(
        &self,
        _node: &ExecutableNode,
        inputs: ResolvedInputs,
        _ctx: &ExecutionContext,
    ) -> Result<ResolvedInputs> {
        Ok(inputs)
    }

    /// Execute the node. May suspend on injected ports only.
    async fn execute(
        &self,
        node: &ExecutableNode,
        inputs: ResolvedInputs,
        ctx: &ExecutionContext,
        task: &NodeTask,
    ) -> Result<NodeOutput>;

    /// Convert a failure to an error envelope. The engine emits it on the
    /// node's `error` output handle when one is connected; otherwise the
    /// scheduler's failure semantics apply.
    fn on_error(
        &self,
        error: &Error,
        node: &ExecutableNode,
        ctx: &ExecutionContext,
    ) -> Option<Envelope> {
        Some(Envelope::from_error(
            error.to_string(),
            error.kind(),
            node.id().clone(),
            ctx.execution_id.clone(),
        ))
    }

    /// Post-processing hook; default identity.
    fn post_execute(
        &self,
        output: NodeOutput,
        _node: &ExecutableNode,
        _ctx: &ExecutionContext,
    ) -> NodeOutput {
        output
    }
}

/// Node-type registry pairing handlers with their static specifications.
/// Frozen after registration; the built-in sixteen types are always
/// present in [`HandlerRegistry::builtin`].
pub struct HandlerRegistry {
    handlers: HashMap<NodeType, Arc<dyn NodeHandler>>,
    frozen: bool,
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("types", &self.handlers.keys().collect::<Vec<_>>())
            .field("frozen", &self.frozen)
            .finish()
    }
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
            frozen: false,
        }
    }

    /// Register a handler. Fails after freeze or on duplicates.
    pub fn register(&mut self, handler: Arc<dyn NodeHandler>) -> Result<()> {
        if self.frozen {
            return Err(Error::validation("handler registry is frozen"));
        }
        let node_type = handler.node_type();
        if self.handlers.contains_key(&node_type) {
            return Err(Error::validation(format!(
                "handler for {node_type} already registered"
            )));
        }
        self.handlers.insert(node_type, handler);
        Ok(())
    }

    pub fn freeze(&mut self) {
        self.frozen = true;
    }

    pub fn get(&self, node_type: NodeType) -> Option<Arc<dyn NodeHandler>> {
        self.handlers.get(&node_type).map(Arc::clone)
    }

    /// Registry with all built-in handlers, frozen.
    pub fn builtin() -> Arc<Self> {
        let mut registry = Self::new();
        let handlers: Vec<Arc<dyn NodeHandler>> = vec![
            Arc::new(StartHandler),
            Arc::new(EndpointHandler),
            Arc::new(ConditionHandler),
            Arc::new(PersonJobHandler),
            Arc::new(CodeJobHandler),
            Arc::new(ApiJobHandler),
            Arc::new(DbHandler),
            Arc::new(TemplateJobHandler),
            Arc::new(JsonSchemaValidatorHandler),
            Arc::new(HookHandler),
            Arc::new(SubDiagramHandler),
            Arc::new(UserResponseHandler),
            Arc::new(IntegratedApiHandler),
            Arc::new(DiffPatchHandler),
            Arc::new(IrBuilderHandler),
            Arc::new(TypescriptAstHandler),
        ];
        for handler in handlers {
            #[allow(clippy::expect_used)] // duplicate registration is a programming error
            registry.register(handler).expect("builtin registration");
        }
        registry.freeze();
        Arc::new(registry)
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

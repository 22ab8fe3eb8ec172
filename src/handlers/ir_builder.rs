//! IR builder node - assembles its inputs into a named intermediate
//! representation object.

use async_trait::async_trait;
use serde_json::Value;

use crate::domain::{ExecutableNode, NodeKind, NodeType};
use crate::engine::{ExecutionContext, NodeTask, ResolvedInputs};
use crate::envelope::Envelope;
use crate::types::{Error, Result};

use super::{NodeHandler, NodeOutput};

#[derive(Debug, Default)]
pub struct IrBuilderHandler;

#[async_trait]
impl NodeHandler for IrBuilderHandler {
    fn node_type(&self) -> NodeType {
        NodeType::IrBuilder
    }

    async fn execute(
        &self,
        node: &ExecutableNode,
        inputs: ResolvedInputs,
        ctx: &ExecutionContext,
        _task: &NodeTask,
    ) -> Result<NodeOutput> {
        let NodeKind::IrBuilder(config) = &node.kind else {
            return Err(Error::execution("ir_builder handler on wrong node"));
        };

        let mut ir = serde_json::Map::new();
        ir.insert("builder".to_string(), Value::String(config.builder.clone()));
        ir.insert(
            "sources".to_string(),
            Value::Object(inputs.to_json_map()),
        );

        let body = match &config.output_key {
            Some(key) => {
                let mut wrapped = serde_json::Map::new();
                wrapped.insert(key.clone(), Value::Object(ir));
                Value::Object(wrapped)
            }
            None => Value::Object(ir),
        };

        Ok(NodeOutput::single(Envelope::from_json(
            body,
            node.id().clone(),
            ctx.execution_id.clone(),
        )))
    }
}

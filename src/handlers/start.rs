//! Start node - emits the seed object exactly once per execution.

use async_trait::async_trait;
use serde_json::Value;

use crate::domain::{ExecutableNode, NodeKind, NodeType};
use crate::engine::{ExecutionContext, NodeTask, ResolvedInputs};
use crate::envelope::Envelope;
use crate::types::{Error, Result};

use super::{NodeHandler, NodeOutput};

#[derive(Debug, Default)]
pub struct StartHandler;

#[async_trait]
impl NodeHandler for StartHandler {
    fn node_type(&self) -> NodeType {
        NodeType::Start
    }

    async fn execute(
        &self,
        node: &ExecutableNode,
        _inputs: ResolvedInputs,
        ctx: &ExecutionContext,
        _task: &NodeTask,
    ) -> Result<NodeOutput> {
        let NodeKind::Start(config) = &node.kind else {
            return Err(Error::execution("start handler on non-start node"));
        };

        // Seed object: configured custom data overlaid with run variables.
        let mut body = config.custom_data.clone();
        if let Value::Object(vars) = &ctx.variables {
            for (key, value) in vars {
                body.insert(key.clone(), value.clone());
            }
        }

        Ok(NodeOutput::single(Envelope::from_json(
            Value::Object(body),
            node.id().clone(),
            ctx.execution_id.clone(),
        )))
    }
}

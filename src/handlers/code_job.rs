//! Code job - runs embedded code through the CodeExecutor port.
//!
//! Inputs go to the executor as a JSON map; the raw result is wrapped in an
//! object envelope untouched. Lists and dicts pass through unchanged.

use async_trait::async_trait;
use serde_json::Value;

use crate::domain::{ExecutableNode, NodeKind, NodeType};
use crate::engine::{ExecutionContext, NodeTask, ResolvedInputs};
use crate::envelope::Envelope;
use crate::types::{Error, Result};

use super::{NodeHandler, NodeOutput};

#[derive(Debug, Default)]
pub struct CodeJobHandler;

#[async_trait]
impl NodeHandler for CodeJobHandler {
    fn node_type(&self) -> NodeType {
        NodeType::CodeJob
    }

    async fn execute(
        &self,
        node: &ExecutableNode,
        inputs: ResolvedInputs,
        ctx: &ExecutionContext,
        _task: &NodeTask,
    ) -> Result<NodeOutput> {
        let NodeKind::CodeJob(config) = &node.kind else {
            return Err(Error::execution("code_job handler on non-code node"));
        };

        let code = match (&config.code, &config.file_path) {
            (Some(code), _) => code.clone(),
            (None, Some(path)) => {
                let bytes = ctx.ports.files.read(path).await?;
                String::from_utf8(bytes.to_vec())
                    .map_err(|e| Error::permanent(format!("code file is not UTF-8: {e}")))?
            }
            (None, None) => return Err(Error::permanent("code_job has no code")),
        };

        let handler_inputs = Value::Object(inputs.to_json_map());
        let result = ctx
            .ports
            .code
            .run(config.language, &code, handler_inputs)
            .await?;

        Ok(NodeOutput::single(Envelope::from_json(
            result,
            node.id().clone(),
            ctx.execution_id.clone(),
        )))
    }
}

//! Endpoint node - consumes inputs, optionally persists them, emits nothing.

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::Value;

use crate::domain::{ExecutableNode, NodeKind, NodeType};
use crate::engine::{ExecutionContext, NodeTask, ResolvedInputs};
use crate::envelope::EnvelopeBody;
use crate::types::{Error, Result};

use super::{NodeHandler, NodeOutput};

#[derive(Debug, Default)]
pub struct EndpointHandler;

#[async_trait]
impl NodeHandler for EndpointHandler {
    fn node_type(&self) -> NodeType {
        NodeType::Endpoint
    }

    async fn execute(
        &self,
        node: &ExecutableNode,
        inputs: ResolvedInputs,
        ctx: &ExecutionContext,
        _task: &NodeTask,
    ) -> Result<NodeOutput> {
        let NodeKind::Endpoint(config) = &node.kind else {
            return Err(Error::execution("endpoint handler on non-endpoint node"));
        };

        if config.save_to_file {
            let path = config
                .file_path
                .as_deref()
                .ok_or_else(|| Error::permanent("save_to_file without file_path"))?;
            let payload = match inputs.first_of(&["default"]) {
                Some(envelope) => match envelope.body() {
                    EnvelopeBody::RawText(text) => Bytes::from(text.clone()),
                    EnvelopeBody::Binary(bytes) => bytes.clone(),
                    _ => Bytes::from(serde_json::to_vec_pretty(&envelope.body_json())?),
                },
                None => Bytes::new(),
            };
            ctx.ports.files.write(path, payload).await?;
        }

        // The consumed inputs are the run's terminal value.
        let final_value = Value::Object(inputs.to_json_map());
        Ok(NodeOutput::none().with_final(final_value))
    }
}

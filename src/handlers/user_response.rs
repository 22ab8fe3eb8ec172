//! User response node - raises an interaction on the engine and waits for
//! an answer, falling back to the configured default on timeout.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::domain::{ExecutableNode, NodeKind, NodeType};
use crate::engine::{ExecutionContext, NodeTask, ResolvedInputs};
use crate::envelope::Envelope;
use crate::types::{Error, Result};

use super::{NodeHandler, NodeOutput};

#[derive(Debug, Default)]
pub struct UserResponseHandler;

#[async_trait]
impl NodeHandler for UserResponseHandler {
    fn node_type(&self) -> NodeType {
        NodeType::UserResponse
    }

    async fn execute(
        &self,
        node: &ExecutableNode,
        inputs: ResolvedInputs,
        ctx: &ExecutionContext,
        _task: &NodeTask,
    ) -> Result<NodeOutput> {
        let NodeKind::UserResponse(config) = &node.kind else {
            return Err(Error::execution("user_response handler on wrong node"));
        };

        let context = Value::Object(
            [("inputs".to_string(), Value::Object(inputs.merged_object()))]
                .into_iter()
                .collect(),
        );
        let prompt = ctx.templates.render(&config.prompt, &context);

        let receiver = ctx
            .interactions
            .ask(ctx.execution_id.clone(), node.id().clone(), prompt);

        // The node-level timeout enforced by the driver is the hard bound;
        // this one only switches to the configured fallback answer.
        let wait = config
            .timeout_s
            .map(Duration::from_secs)
            .unwrap_or_else(|| node.base.timeout / 2);

        let answer = tokio::select! {
            answered = receiver => answered.ok(),
            _ = tokio::time::sleep(wait) => None,
            _ = ctx.cancel.cancelled() => {
                ctx.interactions.withdraw(node.id());
                return Err(Error::cancelled("execution cancelled"));
            }
        };

        let text = match answer {
            Some(text) => text,
            None => {
                ctx.interactions.withdraw(node.id());
                config
                    .default_answer
                    .clone()
                    .ok_or_else(|| Error::permanent("no user response before timeout"))?
            }
        };

        Ok(NodeOutput::single(Envelope::from_text(
            text,
            node.id().clone(),
            ctx.execution_id.clone(),
        )))
    }
}

//! Sub-diagram node - runs a registered child diagram, optionally as a
//! batch over an input list with bounded, order-preserving parallelism.

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use serde_json::Value;

use crate::domain::{ExecutableNode, NodeKind, NodeType, OutputMode};
use crate::engine::{ExecutionContext, NodeTask, ResolvedInputs};
use crate::envelope::Envelope;
use crate::types::{Error, Result};

use super::{NodeHandler, NodeOutput};

#[derive(Debug, Default)]
pub struct SubDiagramHandler;

#[async_trait]
impl NodeHandler for SubDiagramHandler {
    fn node_type(&self) -> NodeType {
        NodeType::SubDiagram
    }

    async fn execute(
        &self,
        node: &ExecutableNode,
        inputs: ResolvedInputs,
        ctx: &ExecutionContext,
        _task: &NodeTask,
    ) -> Result<NodeOutput> {
        let NodeKind::SubDiagram(config) = &node.kind else {
            return Err(Error::execution("sub_diagram handler on non-sub node"));
        };

        let child = ctx.engine.diagram(&config.diagram_name).ok_or_else(|| {
            Error::permanent(format!("unknown child diagram '{}'", config.diagram_name))
        })?;

        let base = Value::Object(inputs.merged_object());

        if !config.batch {
            let result = ctx
                .engine
                .run_child(child, base, ctx.depth + 1, &ctx.cancel)
                .await?;
            return Ok(NodeOutput::single(Envelope::from_json(
                result,
                node.id().clone(),
                ctx.execution_id.clone(),
            )));
        }

        let items = base
            .get(&config.batch_input_key)
            .and_then(Value::as_array)
            .cloned()
            .ok_or_else(|| {
                Error::permanent(format!(
                    "batch input '{}' is missing or not a list",
                    config.batch_input_key
                ))
            })?;
        let total_items = items.len();

        // Bounded parallelism; `buffered` preserves item order.
        let results: Vec<Result<Value>> = stream::iter(items.into_iter().map(|item| {
            let engine = ctx.engine.clone();
            let child = child.clone();
            let cancel = ctx.cancel.clone();
            let depth = ctx.depth + 1;
            async move { engine.run_child(child, item, depth, &cancel).await }
        }))
        .buffered(ctx.config.batch_max_concurrent.max(1))
        .collect()
        .await;

        let mut values = Vec::with_capacity(total_items);
        let mut errors = Vec::new();
        for (index, result) in results.into_iter().enumerate() {
            match result {
                Ok(value) => values.push(value),
                Err(err) => {
                    values.push(serde_json::json!({ "error": err.to_string() }));
                    errors.push(serde_json::json!({
                        "index": index,
                        "message": err.to_string(),
                    }));
                }
            }
        }
        let failed = errors.len();

        let envelope = match config.output_mode {
            OutputMode::PureList => Envelope::from_json(
                Value::Array(values),
                node.id().clone(),
                ctx.execution_id.clone(),
            )
            .with_meta("total_items", Value::from(total_items))
            .with_meta("failed", Value::from(failed)),
            OutputMode::RichObject => {
                let mut body = serde_json::Map::new();
                body.insert(config.result_key.clone(), Value::Array(values));
                body.insert("errors".to_string(), Value::Array(errors));
                body.insert("total_items".to_string(), Value::from(total_items));
                body.insert("failed".to_string(), Value::from(failed));
                Envelope::from_json(
                    Value::Object(body),
                    node.id().clone(),
                    ctx.execution_id.clone(),
                )
            }
        };

        Ok(NodeOutput::single(envelope))
    }
}

//! JSON schema validator node.

use async_trait::async_trait;
use serde_json::Value;

use crate::domain::{ExecutableNode, NodeKind, NodeType};
use crate::engine::{ExecutionContext, NodeTask, ResolvedInputs};
use crate::types::{Error, Result};

use super::{NodeHandler, NodeOutput};

#[derive(Debug, Default)]
pub struct JsonSchemaValidatorHandler;

#[async_trait]
impl NodeHandler for JsonSchemaValidatorHandler {
    fn node_type(&self) -> NodeType {
        NodeType::JsonSchemaValidator
    }

    async fn execute(
        &self,
        node: &ExecutableNode,
        inputs: ResolvedInputs,
        ctx: &ExecutionContext,
        _task: &NodeTask,
    ) -> Result<NodeOutput> {
        let NodeKind::JsonSchemaValidator(config) = &node.kind else {
            return Err(Error::execution("validator handler on non-validator node"));
        };

        let schema = match (&config.schema, &config.schema_path) {
            (Some(schema), _) => schema.clone(),
            (None, Some(path)) => {
                let bytes = ctx.ports.files.read(path).await?;
                serde_json::from_slice(&bytes)
                    .map_err(|e| Error::permanent(format!("schema file is invalid JSON: {e}")))?
            }
            (None, None) => return Err(Error::permanent("validator has no schema")),
        };

        let instance = inputs
            .get("default")
            .map(|e| e.body_json())
            .unwrap_or(Value::Null);

        let validator = jsonschema::validator_for(&schema)
            .map_err(|e| Error::permanent(format!("invalid schema: {e}")))?;
        let violations: Vec<String> = validator
            .iter_errors(&instance)
            .map(|err| format!("{}: {err}", err.instance_path))
            .collect();

        if !violations.is_empty() {
            return Err(Error::permanent(format!(
                "schema validation failed: {}",
                violations.join("; ")
            )));
        }

        // Valid payloads pass through untouched.
        let envelope = match inputs.get("default") {
            Some(env) => env.as_ref().clone(),
            None => crate::envelope::Envelope::from_json(
                Value::Null,
                node.id().clone(),
                ctx.execution_id.clone(),
            ),
        };
        Ok(NodeOutput::single(envelope))
    }
}

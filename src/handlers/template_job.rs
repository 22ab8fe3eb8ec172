//! Template job - renders a text template against its inputs.

use async_trait::async_trait;
use serde_json::Value;

use crate::domain::{ExecutableNode, NodeKind, NodeType};
use crate::engine::{ExecutionContext, NodeTask, ResolvedInputs};
use crate::envelope::Envelope;
use crate::types::{Error, Result};

use super::{NodeHandler, NodeOutput};

#[derive(Debug, Default)]
pub struct TemplateJobHandler;

#[async_trait]
impl NodeHandler for TemplateJobHandler {
    fn node_type(&self) -> NodeType {
        NodeType::TemplateJob
    }

    async fn execute(
        &self,
        node: &ExecutableNode,
        inputs: ResolvedInputs,
        ctx: &ExecutionContext,
        _task: &NodeTask,
    ) -> Result<NodeOutput> {
        let NodeKind::TemplateJob(config) = &node.kind else {
            return Err(Error::execution("template handler on non-template node"));
        };

        let template = match (&config.template, &config.template_path) {
            (Some(template), _) => template.clone(),
            (None, Some(path)) => {
                let bytes = ctx.ports.files.read(path).await?;
                String::from_utf8(bytes.to_vec())
                    .map_err(|e| Error::permanent(format!("template is not UTF-8: {e}")))?
            }
            (None, None) => return Err(Error::permanent("template_job has no template")),
        };

        // Inputs are visible both as `inputs.*` and at the top level.
        let merged = inputs.merged_object();
        let mut context = merged.clone();
        context.insert("inputs".to_string(), Value::Object(merged));
        let rendered = ctx.templates.render(&template, &Value::Object(context));

        Ok(NodeOutput::single(Envelope::from_text(
            rendered,
            node.id().clone(),
            ctx.execution_id.clone(),
        )))
    }
}

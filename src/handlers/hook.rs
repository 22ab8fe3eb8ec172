//! Hook node - side-effect dispatch through the shell, HTTP, or file ports.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::Value;

use crate::domain::{ExecutableNode, HookType, NodeKind, NodeType};
use crate::engine::{ExecutionContext, NodeTask, ResolvedInputs};
use crate::envelope::Envelope;
use crate::ports::{CodeLanguage, HttpRequest};
use crate::types::{Error, Result};

use super::{NodeHandler, NodeOutput};

#[derive(Debug, Default)]
pub struct HookHandler;

#[async_trait]
impl NodeHandler for HookHandler {
    fn node_type(&self) -> NodeType {
        NodeType::Hook
    }

    async fn execute(
        &self,
        node: &ExecutableNode,
        inputs: ResolvedInputs,
        ctx: &ExecutionContext,
        _task: &NodeTask,
    ) -> Result<NodeOutput> {
        let NodeKind::Hook(config) = &node.kind else {
            return Err(Error::execution("hook handler on non-hook node"));
        };

        let payload = Value::Object(inputs.to_json_map());

        let result = match config.hook_type {
            HookType::Shell => {
                let command = config
                    .command
                    .as_deref()
                    .ok_or_else(|| Error::permanent("shell hook without command"))?;
                ctx.ports
                    .code
                    .run(CodeLanguage::Shell, command, payload)
                    .await?
            }
            HookType::Http => {
                let url = config
                    .url
                    .as_deref()
                    .ok_or_else(|| Error::permanent("http hook without url"))?;
                let response = ctx
                    .ports
                    .http
                    .request(HttpRequest {
                        method: "POST".to_string(),
                        url: url.to_string(),
                        headers: Default::default(),
                        body: Some(payload),
                        timeout: Duration::from_secs(30),
                    })
                    .await?;
                if !response.is_success() {
                    return Err(Error::transient(format!(
                        "webhook returned {}",
                        response.status
                    )));
                }
                response
                    .json()
                    .unwrap_or_else(|_| serde_json::json!({ "status": response.status }))
            }
            HookType::File => {
                let path = config
                    .file_path
                    .as_deref()
                    .ok_or_else(|| Error::permanent("file hook without file_path"))?;
                let mut line = serde_json::to_string(&payload)?;
                line.push('\n');
                ctx.ports.files.append(path, Bytes::from(line)).await?;
                serde_json::json!({ "appended": path })
            }
        };

        Ok(NodeOutput::single(Envelope::from_json(
            result,
            node.id().clone(),
            ctx.execution_id.clone(),
        )))
    }
}

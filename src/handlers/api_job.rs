//! API job - synchronous HTTP through the HttpClient port.
//!
//! Retryable on 5xx and timeouts only; 4xx responses are permanent.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::domain::{ExecutableNode, NodeKind, NodeType};
use crate::engine::{ExecutionContext, NodeTask, ResolvedInputs};
use crate::envelope::Envelope;
use crate::ports::HttpRequest;
use crate::types::{Error, Result};

use super::{NodeHandler, NodeOutput};

#[derive(Debug, Default)]
pub struct ApiJobHandler;

#[async_trait]
impl NodeHandler for ApiJobHandler {
    fn node_type(&self) -> NodeType {
        NodeType::ApiJob
    }

    async fn execute(
        &self,
        node: &ExecutableNode,
        inputs: ResolvedInputs,
        ctx: &ExecutionContext,
        _task: &NodeTask,
    ) -> Result<NodeOutput> {
        let NodeKind::ApiJob(config) = &node.kind else {
            return Err(Error::execution("api_job handler on non-api node"));
        };

        let context = Value::Object(
            [("inputs".to_string(), Value::Object(inputs.merged_object()))]
                .into_iter()
                .collect(),
        );
        let url = ctx.templates.render(&config.url, &context);

        let body = config
            .body
            .clone()
            .or_else(|| inputs.get("default").map(|e| e.body_json()));

        let timeout = config
            .timeout_s
            .map(Duration::from_secs)
            .unwrap_or(node.base.timeout);

        let response = ctx
            .ports
            .http
            .request(HttpRequest {
                method: config.method.clone(),
                url,
                headers: config.headers.clone(),
                body,
                timeout,
            })
            .await?;

        if response.is_server_error() {
            return Err(Error::transient(format!(
                "upstream returned {}",
                response.status
            )));
        }
        if !response.is_success() {
            return Err(Error::permanent(format!(
                "upstream returned {}: {}",
                response.status, response.body
            )));
        }

        let payload = response
            .json()
            .unwrap_or_else(|_| serde_json::json!({ "text": response.body }));
        let envelope = Envelope::from_json(payload, node.id().clone(), ctx.execution_id.clone())
            .with_meta("status", Value::from(response.status));
        Ok(NodeOutput::single(envelope))
    }
}

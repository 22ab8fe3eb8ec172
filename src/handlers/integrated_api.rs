//! Integrated API node - provider/operation calls routed through the
//! HttpClient port under the `integrated://` scheme. The embedder's client
//! maps provider operations to real endpoints.

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
pub struct IntegratedApiHandler;

#[async_trait]
impl NodeHandler for IntegratedApiHandler {
    fn node_type(&self) -> NodeType {
        NodeType::IntegratedApi
    }

    async fn execute(
        &self,
        node: &ExecutableNode,
        inputs: ResolvedInputs,
        ctx: &ExecutionContext,
        _task: &NodeTask,
    ) -> Result<NodeOutput> {
        let NodeKind::IntegratedApi(config) = &node.kind else {
            return Err(Error::execution("integrated_api handler on wrong node"));
        };

        let mut body = serde_json::Map::new();
        body.insert(
            "config".to_string(),
            Value::Object(config.config.clone()),
        );
        body.insert("inputs".to_string(), Value::Object(inputs.merged_object()));

        let timeout = config
            .timeout_s
            .map(Duration::from_secs)
            .unwrap_or(node.base.timeout);

        let response = ctx
            .ports
            .http
            .request(HttpRequest {
                method: "POST".to_string(),
                url: format!("integrated://{}/{}", config.provider, config.operation),
                headers: Default::default(),
                body: Some(Value::Object(body)),
                timeout,
            })
            .await?;

        if response.is_server_error() {
            return Err(Error::transient(format!(
                "{} returned {}",
                config.provider, response.status
            )));
        }
        if !response.is_success() {
            return Err(Error::permanent(format!(
                "{} returned {}: {}",
                config.provider, response.status, response.body
            )));
        }

        let payload = response
            .json()
            .unwrap_or_else(|_| serde_json::json!({ "text": response.body }));
        Ok(NodeOutput::single(Envelope::from_json(
            payload,
            node.id().clone(),
            ctx.execution_id.clone(),
        )))
    }
}

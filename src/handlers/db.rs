//! Db node - file read/write/append/update through the FileStore port.

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::Value;

use crate::domain::{DbOperation, ExecutableNode, NodeKind, NodeType};
use crate::engine::template::lookup;
use crate::engine::{ExecutionContext, NodeTask, ResolvedInputs};
use crate::envelope::Envelope;
use crate::types::{Error, Result};

use super::{NodeHandler, NodeOutput};

#[derive(Debug, Default)]
pub struct DbHandler;

#[async_trait]
impl NodeHandler for DbHandler {
    fn node_type(&self) -> NodeType {
        NodeType::Db
    }

    async fn execute(
        &self,
        node: &ExecutableNode,
        inputs: ResolvedInputs,
        ctx: &ExecutionContext,
        _task: &NodeTask,
    ) -> Result<NodeOutput> {
        let NodeKind::Db(config) = &node.kind else {
            return Err(Error::execution("db handler on non-db node"));
        };

        let envelope = match config.operation {
            DbOperation::Read => {
                let bytes = ctx.ports.files.read(&config.file).await?;
                let text = String::from_utf8_lossy(&bytes).to_string();
                if config.serialize_json || config.file.ends_with(".json") {
                    let value: Value = serde_json::from_str(&text)
                        .map_err(|e| Error::permanent(format!("invalid JSON payload: {e}")))?;
                    let selected = select_keys(&value, &config.keys);
                    Envelope::from_json(selected, node.id().clone(), ctx.execution_id.clone())
                } else {
                    Envelope::from_text(text, node.id().clone(), ctx.execution_id.clone())
                }
            }
            DbOperation::Write | DbOperation::Append => {
                let payload = payload_bytes(&inputs, config.serialize_json)?;
                match config.operation {
                    DbOperation::Write => ctx.ports.files.write(&config.file, payload).await?,
                    _ => ctx.ports.files.append(&config.file, payload).await?,
                }
                Envelope::from_json(
                    serde_json::json!({ "file": config.file, "written": true }),
                    node.id().clone(),
                    ctx.execution_id.clone(),
                )
            }
            DbOperation::Update => {
                let current = match ctx.ports.files.read(&config.file).await {
                    Ok(bytes) => serde_json::from_slice(&bytes)
                        .unwrap_or(Value::Object(Default::default())),
                    Err(_) => Value::Object(Default::default()),
                };
                let mut merged = match current {
                    Value::Object(map) => map,
                    _ => return Err(Error::permanent("update requires a JSON object file")),
                };
                for (key, value) in inputs.merged_object() {
                    merged.insert(key, value);
                }
                let merged = Value::Object(merged);
                let bytes = Bytes::from(serde_json::to_vec_pretty(&merged)?);
                ctx.ports.files.write(&config.file, bytes).await?;
                Envelope::from_json(merged, node.id().clone(), ctx.execution_id.clone())
            }
        };

        Ok(NodeOutput::single(envelope))
    }
}

/// Dot-path selection over a JSON payload. One key yields the value itself;
/// several yield an object keyed by path.
fn select_keys(value: &Value, keys: &[String]) -> Value {
    match keys {
        [] => value.clone(),
        [single] => lookup(value, single).cloned().unwrap_or(Value::Null),
        many => {
            let mut out = serde_json::Map::new();
            for key in many {
                out.insert(
                    key.clone(),
                    lookup(value, key).cloned().unwrap_or(Value::Null),
                );
            }
            Value::Object(out)
        }
    }
}

fn payload_bytes(inputs: &ResolvedInputs, serialize_json: bool) -> Result<Bytes> {
    let Some(envelope) = inputs.first_of(&["default"]) else {
        return Err(Error::MissingRequiredInput("default".to_string()));
    };
    if serialize_json {
        return Ok(Bytes::from(serde_json::to_vec_pretty(&envelope.body_json())?));
    }
    Ok(match envelope.body() {
        crate::envelope::EnvelopeBody::RawText(text) => Bytes::from(text.clone()),
        crate::envelope::EnvelopeBody::Binary(bytes) => bytes.clone(),
        _ => Bytes::from(serde_json::to_vec_pretty(&envelope.body_json())?),
    })
}

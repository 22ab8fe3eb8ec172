//! Input resolution - consumed tokens to typed handler inputs.
//!
//! Per edge, in consumption order: the body is checked against the edge's
//! declared content type, the edge's transform rules run in declared order,
//! and the value is bound (`pack`) or shallow-merged (`spread`). Declared
//! port defaults fill remaining required inputs. Binding a key twice fails
//! with an input collision; nothing is silently overwritten.
//!
//! Under legacy envelope mode (`STRICT_ENVELOPES=0`) list bodies are
//! wrapped as `{"results": [...]}` at binding time, for compatibility only.

use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::domain::specs::node_spec;
use crate::domain::{ExecutableNode, TransformRule};
use crate::envelope::{ContentType, Envelope, EnvelopeBody};
use crate::types::{Error, ExecutionId, Result};

use super::scheduler::ConsumedToken;
use super::template;

/// Typed inputs handed to a handler, keyed by binding name.
#[derive(Debug, Clone, Default)]
pub struct ResolvedInputs {
    values: BTreeMap<String, Arc<Envelope>>,
}

impl ResolvedInputs {
    pub fn get(&self, label: &str) -> Option<&Arc<Envelope>> {
        self.values.get(label)
    }

    /// First binding found among `labels`, in the given order.
    pub fn first_of<'a>(&'a self, labels: &[&str]) -> Option<&'a Arc<Envelope>> {
        labels.iter().find_map(|l| self.values.get(*l))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Arc<Envelope>)> {
        self.values.iter()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// JSON projection `{label: body}` for code executors, templates, and
    /// expression contexts.
    pub fn to_json_map(&self) -> serde_json::Map<String, Value> {
        self.values
            .iter()
            .map(|(k, v)| (k.clone(), v.body_json()))
            .collect()
    }

    /// Shallow merge of all object bodies, with non-object bodies bound
    /// under their label. This is the namespace condition expressions and
    /// templates see as `inputs`.
    pub fn merged_object(&self) -> serde_json::Map<String, Value> {
        let mut merged = serde_json::Map::new();
        for (label, envelope) in &self.values {
            match envelope.body_json() {
                Value::Object(map) => {
                    for (k, v) in map {
                        merged.entry(k).or_insert(v);
                    }
                }
                other => {
                    merged.insert(label.clone(), other);
                }
            }
        }
        merged
    }

    fn bind(&mut self, key: String, envelope: Arc<Envelope>) -> Result<()> {
        if self.values.contains_key(&key) {
            return Err(Error::InputCollision(key));
        }
        self.values.insert(key, envelope);
        Ok(())
    }
}

/// Resolve consumed tokens into the node's typed input dictionary.
pub fn resolve_inputs(
    node: &ExecutableNode,
    consumed: &[ConsumedToken],
    strict_envelopes: bool,
    execution_id: &ExecutionId,
) -> Result<ResolvedInputs> {
    let mut inputs = ResolvedInputs::default();

    for token in consumed {
        let edge = &token.edge;
        let envelope = token.envelope.as_ref();

        // Type-driven extraction: the body must match the edge's declared
        // content type; no unwrapping, no magic keys.
        if let Some(expected) = edge.content_type {
            let actual = envelope.content_type();
            if actual != expected && actual != ContentType::Error {
                return Err(Error::transform(format!(
                    "edge {} expects {expected} body, got {actual}",
                    edge.id
                )));
            }
        }

        // Declared transforms, in order.
        let mut current = envelope.clone();
        for rule in &edge.transforms {
            current = apply_transform(&current, rule)?;
        }

        // Packing.
        match edge.packing {
            crate::domain::Packing::Pack => {
                let value = legacy_wrap(current, strict_envelopes);
                inputs.bind(edge.target_label.as_str().to_string(), Arc::new(value))?;
            }
            crate::domain::Packing::Spread => match current.body() {
                EnvelopeBody::Object(Value::Object(map)) => {
                    for (key, value) in map {
                        let bound = current.with_body(EnvelopeBody::Object(value.clone()));
                        inputs.bind(key.clone(), Arc::new(bound))?;
                    }
                }
                _ => {
                    return Err(Error::transform(format!(
                        "spread packing on edge {} requires an object body",
                        edge.id
                    )))
                }
            },
        }
    }

    // Declared defaults for required ports, then missing-input failures.
    let spec = node_spec(node.node_type());
    for port in &spec.inputs {
        if !port.required || inputs.get(port.label.as_str()).is_some() {
            continue;
        }
        match &port.default {
            Some(default) => {
                let envelope = default_envelope(default.clone(), node, execution_id);
                inputs.bind(port.label.as_str().to_string(), Arc::new(envelope))?;
            }
            None => {
                return Err(Error::MissingRequiredInput(
                    port.label.as_str().to_string(),
                ))
            }
        }
    }

    Ok(inputs)
}

fn default_envelope(value: Value, node: &ExecutableNode, execution_id: &ExecutionId) -> Envelope {
    match value {
        Value::String(s) => Envelope::from_text(s, node.id().clone(), execution_id.clone()),
        other => Envelope::from_json(other, node.id().clone(), execution_id.clone()),
    }
}

/// Legacy auto-wrapping of list bodies, gated off under strict envelopes.
fn legacy_wrap(envelope: Envelope, strict: bool) -> Envelope {
    if strict {
        return envelope;
    }
    match envelope.body() {
        EnvelopeBody::Object(Value::Array(items)) => {
            let wrapped = serde_json::json!({ "results": items });
            envelope.with_body(EnvelopeBody::Object(wrapped))
        }
        _ => envelope,
    }
}

/// Apply one transform rule; precondition failures are transform errors.
pub fn apply_transform(envelope: &Envelope, rule: &TransformRule) -> Result<Envelope> {
    match rule {
        TransformRule::Extract(path) => {
            let body = match envelope.body() {
                EnvelopeBody::Object(v) => v,
                other => {
                    return Err(Error::transform(format!(
                        "extract({path}) requires an object body, got {}",
                        other.content_type()
                    )))
                }
            };
            let value = template::lookup(body, path).ok_or_else(|| {
                Error::transform(format!("extract({path}) found no value at path"))
            })?;
            Ok(envelope.with_body(EnvelopeBody::Object(value.clone())))
        }
        TransformRule::Wrap(key) => {
            let mut wrapped = serde_json::Map::new();
            wrapped.insert(key.clone(), envelope.body_json());
            Ok(envelope.with_body(EnvelopeBody::Object(Value::Object(wrapped))))
        }
        TransformRule::Map(mapping) => {
            let map = match envelope.body() {
                EnvelopeBody::Object(Value::Object(map)) => map,
                other => {
                    return Err(Error::transform(format!(
                        "map requires an object body, got {}",
                        other.content_type()
                    )))
                }
            };
            let mut renamed = serde_json::Map::new();
            for (key, value) in map {
                let new_key = mapping.get(key).cloned().unwrap_or_else(|| key.clone());
                renamed.insert(new_key, value.clone());
            }
            Ok(envelope.with_body(EnvelopeBody::Object(Value::Object(renamed))))
        }
        TransformRule::Template(format) => {
            let context = match envelope.body() {
                EnvelopeBody::Object(v) => v.clone(),
                EnvelopeBody::RawText(s) => serde_json::json!({ "value": s }),
                other => {
                    return Err(Error::transform(format!(
                        "template requires an object or text body, got {}",
                        other.content_type()
                    )))
                }
            };
            let rendered = template::render(format, &context);
            Ok(envelope.with_body(EnvelopeBody::RawText(rendered)))
        }
        TransformRule::Serialize => match envelope.body() {
            EnvelopeBody::Object(v) => {
                let text = serde_json::to_string(v)?;
                Ok(envelope.with_body(EnvelopeBody::RawText(text)))
            }
            EnvelopeBody::RawText(_) => Ok(envelope.clone()),
            other => Err(Error::transform(format!(
                "serialize requires an object body, got {}",
                other.content_type()
            ))),
        },
        TransformRule::Parse => match envelope.body() {
            EnvelopeBody::RawText(s) => {
                let value: Value = serde_json::from_str(s)
                    .map_err(|e| Error::transform(format!("parse failed: {e}")))?;
                Ok(envelope.with_body(EnvelopeBody::Object(value)))
            }
            EnvelopeBody::Object(_) => Ok(envelope.clone()),
            other => Err(Error::transform(format!(
                "parse requires a text body, got {}",
                other.content_type()
            ))),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{
        EdgeKind, ExecutableEdge, HandleLabel, NodeBase, NodeKind, Packing, PersonJobNode,
    };
    use crate::person::MemorySettings;
    use crate::types::{EdgeId, NodeId, PersonId};
    use serde_json::json;

    fn person_node() -> ExecutableNode {
        ExecutableNode {
            base: NodeBase {
                id: NodeId::from("p"),
                label: "p".into(),
                join_policy: Default::default(),
                timeout: std::time::Duration::from_secs(60),
                retryable: false,
                max_retries: 0,
            },
            kind: NodeKind::PersonJob(PersonJobNode {
                person: PersonId::from("persona"),
                first_only_prompt: None,
                default_prompt: Some("hi".into()),
                max_iteration: 1,
                max_iteration_scope: Default::default(),
                memory: MemorySettings::default(),
                tools: vec![],
                text_format: None,
            }),
        }
    }

    fn edge(label: &str, packing: Packing, transforms: Vec<TransformRule>) -> ExecutableEdge {
        ExecutableEdge {
            id: EdgeId::from("e1"),
            source_node: NodeId::from("src"),
            source_label: HandleLabel::Default,
            target_node: NodeId::from("p"),
            target_label: HandleLabel::from(label),
            content_type: None,
            transforms,
            packing,
            kind: EdgeKind::Data,
            is_loopback: false,
            label: None,
        }
    }

    fn consumed(edge: ExecutableEdge, envelope: Envelope) -> ConsumedToken {
        ConsumedToken {
            edge,
            seq: 1,
            envelope: Arc::new(envelope),
        }
    }

    fn obj_env(value: Value) -> Envelope {
        Envelope::from_json(value, NodeId::from("src"), ExecutionId::from("exec"))
    }

    #[test]
    fn pack_binds_under_target_label() {
        let tokens = vec![consumed(
            edge("payload", Packing::Pack, vec![]),
            obj_env(json!({"x": 7})),
        )];
        let inputs =
            resolve_inputs(&person_node(), &tokens, true, &ExecutionId::from("exec")).unwrap();
        assert_eq!(inputs.get("payload").unwrap().body_json(), json!({"x": 7}));
    }

    #[test]
    fn strict_mode_never_wraps_lists() {
        let tokens = vec![consumed(
            edge("default", Packing::Pack, vec![]),
            obj_env(json!([1, 2, 3])),
        )];
        let inputs =
            resolve_inputs(&person_node(), &tokens, true, &ExecutionId::from("exec")).unwrap();
        assert_eq!(inputs.get("default").unwrap().body_json(), json!([1, 2, 3]));
    }

    #[test]
    fn legacy_mode_wraps_lists() {
        let tokens = vec![consumed(
            edge("default", Packing::Pack, vec![]),
            obj_env(json!([1, 2, 3])),
        )];
        let inputs =
            resolve_inputs(&person_node(), &tokens, false, &ExecutionId::from("exec")).unwrap();
        assert_eq!(
            inputs.get("default").unwrap().body_json(),
            json!({"results": [1, 2, 3]})
        );
    }

    #[test]
    fn spread_merges_keys_and_collides_loudly() {
        let mut e2 = edge("other", Packing::Spread, vec![]);
        e2.id = EdgeId::from("e2");
        let tokens = vec![
            consumed(edge("a", Packing::Pack, vec![]), obj_env(json!({"k": 1}))),
            consumed(e2, obj_env(json!({"a": 2}))),
        ];
        let err =
            resolve_inputs(&person_node(), &tokens, true, &ExecutionId::from("exec")).unwrap_err();
        assert!(matches!(err, Error::InputCollision(key) if key == "a"));
    }

    #[test]
    fn spread_requires_object_body() {
        let tokens = vec![consumed(
            edge("x", Packing::Spread, vec![]),
            obj_env(json!([1])),
        )];
        let err =
            resolve_inputs(&person_node(), &tokens, true, &ExecutionId::from("exec")).unwrap_err();
        assert!(matches!(err, Error::Transform(_)));
    }

    #[test]
    fn transforms_apply_in_declared_order() {
        let tokens = vec![consumed(
            edge(
                "out",
                Packing::Pack,
                vec![
                    TransformRule::Extract("a.b".into()),
                    TransformRule::Wrap("v".into()),
                ],
            ),
            obj_env(json!({"a": {"b": 42}})),
        )];
        let inputs =
            resolve_inputs(&person_node(), &tokens, true, &ExecutionId::from("exec")).unwrap();
        assert_eq!(inputs.get("out").unwrap().body_json(), json!({"v": 42}));
    }

    #[test]
    fn extract_on_non_object_is_transform_error() {
        let env = Envelope::from_text("nope", NodeId::from("src"), ExecutionId::from("exec"));
        let err = apply_transform(&env, &TransformRule::Extract("x".into())).unwrap_err();
        assert!(matches!(err, Error::Transform(_)));
    }

    #[test]
    fn serialize_and_parse_round_trip() {
        let env = obj_env(json!({"a": 1}));
        let text = apply_transform(&env, &TransformRule::Serialize).unwrap();
        assert_eq!(text.as_text(), Some("{\"a\":1}"));
        let back = apply_transform(&text, &TransformRule::Parse).unwrap();
        assert_eq!(back.body_json(), json!({"a": 1}));
    }

    #[test]
    fn merged_object_exposes_input_namespace() {
        let tokens = vec![consumed(
            edge("default", Packing::Pack, vec![]),
            obj_env(json!({"x": 7})),
        )];
        let inputs =
            resolve_inputs(&person_node(), &tokens, true, &ExecutionId::from("exec")).unwrap();
        let merged = inputs.merged_object();
        assert_eq!(merged.get("x"), Some(&json!(7)));
    }
}

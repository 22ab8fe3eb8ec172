//! Phase 4: edge building.
//!
//! Emits one `ExecutableEdge` per resolved connection. Content types
//! propagate from the producing port; the only coercions are
//! `object → raw_text` (JSON-serialize, allowed by default) and
//! `raw_text → object` (consumer opt-in). Everything else is a mismatch and
//! rejected here, never at runtime.

use serde_json::Value;
use std::collections::BTreeMap;

use crate::domain::specs::node_spec;
use crate::domain::{ExecutableEdge, Packing, TransformRule};
use crate::envelope::ContentType;

use super::context::CompilationContext;
use super::{CompileIssue, CompilePhase};

const PHASE: CompilePhase = CompilePhase::EdgeBuilding;

pub fn run(ctx: &mut CompilationContext<'_>) {
    let domain = ctx.domain;
    let mut edges = Vec::with_capacity(ctx.connections.len());

    for conn in &ctx.connections {
        let arrow = &domain.arrows[conn.arrow];
        let source_type = domain.nodes[&conn.source_node].node_type;
        let target_type = domain.nodes[&conn.target_node].node_type;
        let source_spec = node_spec(source_type);
        let target_spec = node_spec(target_type);

        // Producing port type, optionally narrowed by the arrow.
        let produced = source_spec
            .output(&conn.source_label)
            .and_then(|p| p.content_type);
        let declared = arrow.content_type;
        let produced = match (produced, declared) {
            (Some(p), Some(d)) if p != d => {
                ctx.errors.push(CompileIssue::edge(
                    PHASE,
                    format!(
                        "arrow declares content type {d} but port '{}' emits {p}",
                        conn.source_label
                    ),
                    conn.id.clone(),
                ));
                continue;
            }
            (Some(p), _) => Some(p),
            (None, d) => d,
        };

        // Consuming port type; custom binding labels are untyped.
        let consumer = target_spec.input(&conn.target_label);
        let consumed = consumer.and_then(|p| p.content_type);
        let accepts_text = consumer.map(|p| p.accepts_text).unwrap_or(false);

        let mut transforms = match parse_transforms(arrow.data.get("transforms")) {
            Ok(t) => t,
            Err(message) => {
                ctx.errors
                    .push(CompileIssue::edge(PHASE, message, conn.id.clone()));
                continue;
            }
        };

        // Content-type propagation with the declared coercion rules.
        let coercion = match (produced, consumed) {
            (None, _) | (_, None) => None,
            (Some(p), Some(c)) if p == c => None,
            (Some(ContentType::Object), Some(ContentType::RawText)) => {
                Some(TransformRule::Serialize)
            }
            (Some(ContentType::RawText), Some(ContentType::Object)) if accepts_text => {
                Some(TransformRule::Parse)
            }
            (Some(p), Some(c)) => {
                ctx.errors.push(CompileIssue::edge(
                    PHASE,
                    format!(
                        "content type mismatch: '{}' emits {p}, '{}' expects {c}",
                        conn.source_label, conn.target_label
                    ),
                    conn.id.clone(),
                ));
                continue;
            }
        };
        if let Some(rule) = coercion {
            transforms.push(rule);
        }

        let packing = match parse_packing(arrow.data.get("packing")) {
            Ok(p) => p,
            Err(message) => {
                ctx.errors
                    .push(CompileIssue::edge(PHASE, message, conn.id.clone()));
                continue;
            }
        };

        // Spread requires an object at runtime; reject producers that
        // cannot emit one.
        if packing == Packing::Spread {
            if let Some(p) = produced {
                if p != ContentType::Object {
                    ctx.errors.push(CompileIssue::edge(
                        PHASE,
                        format!("spread packing requires an object producer, port emits {p}"),
                        conn.id.clone(),
                    ));
                    continue;
                }
            }
        }

        edges.push(ExecutableEdge {
            id: conn.id.clone(),
            source_node: conn.source_node.clone(),
            source_label: conn.source_label.clone(),
            target_node: conn.target_node.clone(),
            target_label: conn.target_label.clone(),
            content_type: produced,
            transforms,
            packing,
            kind: conn.kind,
            is_loopback: false,
            label: arrow.label.clone(),
        });
    }

    ctx.edges = edges;
}

fn parse_packing(value: Option<&Value>) -> Result<Packing, String> {
    match value {
        None => Ok(Packing::Pack),
        Some(v) => serde_json::from_value(v.clone())
            .map_err(|e| format!("invalid packing: {e}")),
    }
}

/// Transforms are declared as a list of single-rule objects:
/// `[{"extract": "a.b"}, {"wrap": "key"}, {"map": {...}}, {"template": "..."}]`.
fn parse_transforms(value: Option<&Value>) -> Result<Vec<TransformRule>, String> {
    let Some(value) = value else {
        return Ok(Vec::new());
    };
    let list = value
        .as_array()
        .ok_or_else(|| "transforms must be a list".to_string())?;

    let mut rules = Vec::with_capacity(list.len());
    for item in list {
        let obj = item
            .as_object()
            .ok_or_else(|| "each transform must be an object".to_string())?;
        if obj.len() != 1 {
            return Err("each transform must declare exactly one rule".to_string());
        }
        let (rule, arg) = obj.iter().next().ok_or("empty transform")?;
        let parsed = match rule.as_str() {
            "extract" => TransformRule::Extract(
                arg.as_str()
                    .ok_or_else(|| "extract requires a field path".to_string())?
                    .to_string(),
            ),
            "wrap" => TransformRule::Wrap(
                arg.as_str()
                    .ok_or_else(|| "wrap requires a key".to_string())?
                    .to_string(),
            ),
            "map" => {
                let mapping: BTreeMap<String, String> = serde_json::from_value(arg.clone())
                    .map_err(|e| format!("map requires a string mapping: {e}"))?;
                TransformRule::Map(mapping)
            }
            "template" => TransformRule::Template(
                arg.as_str()
                    .ok_or_else(|| "template requires a format string".to_string())?
                    .to_string(),
            ),
            other => return Err(format!("unknown transform rule '{other}'")),
        };
        rules.push(parsed);
    }
    Ok(rules)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transform_list_parses_in_order() {
        let value = serde_json::json!([
            {"extract": "a.b"},
            {"wrap": "key"},
            {"template": "{{ x }}"}
        ]);
        let rules = parse_transforms(Some(&value)).unwrap();
        assert_eq!(
            rules,
            vec![
                TransformRule::Extract("a.b".into()),
                TransformRule::Wrap("key".into()),
                TransformRule::Template("{{ x }}".into()),
            ]
        );
    }

    #[test]
    fn unknown_rule_is_rejected() {
        let value = serde_json::json!([{"explode": true}]);
        assert!(parse_transforms(Some(&value)).is_err());
    }
}

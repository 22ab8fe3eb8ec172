//! Phase 1: structural validation.
//!
//! Unknown node types never reach this phase: the typed `NodeType` enum
//! rejects them at parse time, which is the registry membership check for
//! the built-in set.

use std::collections::{BTreeMap, HashSet};

use crate::domain::specs::node_spec;
use crate::domain::{HandleDirection, HandleLabel, NodeType};
use crate::types::NodeId;

use super::context::CompilationContext;
use super::{CompileIssue, CompilePhase};

const PHASE: CompilePhase = CompilePhase::Validation;

pub fn run(ctx: &mut CompilationContext<'_>) {
    let domain = ctx.domain;

    if domain.nodes.is_empty() {
        ctx.error(CompileIssue::general(PHASE, "diagram has no nodes"));
        return;
    }

    // At least one START and one ENDPOINT.
    let has_start = domain
        .nodes
        .values()
        .any(|n| n.node_type == NodeType::Start);
    let has_endpoint = domain
        .nodes
        .values()
        .any(|n| n.node_type == NodeType::Endpoint);
    if !has_start {
        ctx.error(CompileIssue::general(PHASE, "diagram has no start node"));
    }
    if !has_endpoint {
        ctx.error(CompileIssue::general(PHASE, "diagram has no endpoint node"));
    }

    // Unique edge ids (node and handle ids are map keys, unique by shape).
    let mut seen = HashSet::new();
    for arrow in &domain.arrows {
        if !seen.insert(&arrow.id) {
            ctx.error(CompileIssue::edge(
                PHASE,
                format!("duplicate edge id '{}'", arrow.id),
                arrow.id.clone(),
            ));
        }
    }

    // Handles must point at existing nodes.
    for (id, handle) in &domain.handles {
        if !domain.nodes.contains_key(&handle.node_id) {
            ctx.error(CompileIssue::general(
                PHASE,
                format!("handle '{id}' references unknown node '{}'", handle.node_id),
            ));
        }
    }

    // Every arrow handle reference resolves on the expected direction.
    let mut incoming: BTreeMap<&NodeId, usize> = BTreeMap::new();
    let mut outgoing: BTreeMap<&NodeId, usize> = BTreeMap::new();
    let mut condition_branches: BTreeMap<&NodeId, Vec<HandleLabel>> = BTreeMap::new();

    for arrow in &domain.arrows {
        let source = match domain.handles.get(&arrow.source) {
            Some(h) => h,
            None => {
                ctx.error(CompileIssue::edge(
                    PHASE,
                    format!("unknown source handle '{}'", arrow.source),
                    arrow.id.clone(),
                ));
                continue;
            }
        };
        let target = match domain.handles.get(&arrow.target) {
            Some(h) => h,
            None => {
                ctx.error(CompileIssue::edge(
                    PHASE,
                    format!("unknown target handle '{}'", arrow.target),
                    arrow.id.clone(),
                ));
                continue;
            }
        };

        if source.direction != HandleDirection::Output {
            ctx.error(CompileIssue::edge(
                PHASE,
                format!("source handle '{}' is not an output", arrow.source),
                arrow.id.clone(),
            ));
        }
        if target.direction != HandleDirection::Input {
            ctx.error(CompileIssue::edge(
                PHASE,
                format!("target handle '{}' is not an input", arrow.target),
                arrow.id.clone(),
            ));
        }

        *outgoing.entry(&source.node_id).or_default() += 1;
        *incoming.entry(&target.node_id).or_default() += 1;

        if let Some(node) = domain.nodes.get(&source.node_id) {
            if node.node_type == NodeType::Condition {
                condition_branches
                    .entry(&source.node_id)
                    .or_default()
                    .push(source.label.clone());
            }
        }
    }

    // Per-node-type connection cardinalities.
    for (id, node) in &domain.nodes {
        let spec = node_spec(node.node_type);
        let n_in = incoming.get(id).copied().unwrap_or(0);
        let n_out = outgoing.get(id).copied().unwrap_or(0);

        if let Some(max) = spec.max_incoming {
            if n_in > max {
                ctx.error(CompileIssue::node(
                    PHASE,
                    format!(
                        "{} node accepts at most {max} incoming edge(s), found {n_in}",
                        node.node_type
                    ),
                    id.clone(),
                ));
            }
        }
        if let Some(max) = spec.max_outgoing {
            if n_out > max {
                ctx.error(CompileIssue::node(
                    PHASE,
                    format!(
                        "{} node accepts at most {max} outgoing edge(s), found {n_out}",
                        node.node_type
                    ),
                    id.clone(),
                ));
            }
        }

        // Condition nodes expose exactly two outputs: condtrue and condfalse.
        if node.node_type == NodeType::Condition {
            let branches = condition_branches.get(id).cloned().unwrap_or_default();
            let trues = branches
                .iter()
                .filter(|l| **l == HandleLabel::Condtrue)
                .count();
            let falses = branches
                .iter()
                .filter(|l| **l == HandleLabel::Condfalse)
                .count();
            if trues != 1 || falses != 1 || branches.len() != 2 {
                ctx.error(CompileIssue::node(
                    PHASE,
                    "condition node requires exactly one condtrue and one condfalse output edge",
                    id.clone(),
                ));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compile::compile;
    use crate::domain::DomainDiagram;

    #[test]
    fn empty_diagram_is_rejected() {
        let result = compile(&DomainDiagram::new());
        assert!(!result.is_ok());
        assert!(result.errors.iter().any(|e| e.phase == PHASE));
    }
}

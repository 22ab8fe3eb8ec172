//! Phase 3: connection resolution.
//!
//! Parses each arrow's handle references into `(node, label, direction)`
//! triples, verifies labels against the HANDLE_SPECS tables, and classifies
//! every edge as data or a condition branch. Loop-back edges are identified
//! later, during graph analysis.

use crate::domain::specs::node_spec;
use crate::domain::{EdgeKind, HandleLabel, NodeType};

use super::context::{CompilationContext, ResolvedConnection};
use super::{CompileIssue, CompilePhase};

const PHASE: CompilePhase = CompilePhase::ConnectionResolution;

pub fn run(ctx: &mut CompilationContext<'_>) {
    let domain = ctx.domain;
    let mut connections = Vec::with_capacity(domain.arrows.len());

    for (i, arrow) in domain.arrows.iter().enumerate() {
        // Phase 1 guarantees both handles resolve.
        let (source, target) = match (
            domain.handles.get(&arrow.source),
            domain.handles.get(&arrow.target),
        ) {
            (Some(s), Some(t)) => (s, t),
            _ => continue,
        };

        let source_type = match domain.nodes.get(&source.node_id) {
            Some(n) => n.node_type,
            None => continue,
        };
        let target_type = match domain.nodes.get(&target.node_id) {
            Some(n) => n.node_type,
            None => continue,
        };

        let source_spec = node_spec(source_type);
        let target_spec = node_spec(target_type);

        // Output labels are strict: only declared ports may emit.
        if source_spec.output(&source.label).is_none() {
            ctx.errors.push(CompileIssue::edge(
                PHASE,
                format!(
                    "{source_type} node has no output port '{}'",
                    source.label
                ),
                arrow.id.clone(),
            ));
            continue;
        }

        // Input labels: declared ports or custom binding names. An
        // unlabelled (default) edge may only target a node that declares a
        // default input port.
        let target_ok = match &target.label {
            HandleLabel::Default => target_spec.input(&HandleLabel::Default).is_some(),
            HandleLabel::Custom(_) => true,
            other => target_spec.input(other).is_some(),
        };
        if !target_ok {
            ctx.errors.push(CompileIssue::edge(
                PHASE,
                format!(
                    "{target_type} node has no input port '{}'; labels are mandatory here",
                    target.label
                ),
                arrow.id.clone(),
            ));
            continue;
        }

        let kind = if source_type == NodeType::Condition {
            match source.label {
                HandleLabel::Condtrue => EdgeKind::ConditionTrue,
                HandleLabel::Condfalse => EdgeKind::ConditionFalse,
                // Unreachable: condition outputs are validated in phase 1.
                _ => EdgeKind::Data,
            }
        } else {
            EdgeKind::Data
        };

        connections.push(ResolvedConnection {
            arrow: i,
            id: arrow.id.clone(),
            source_node: source.node_id.clone(),
            source_label: source.label.clone(),
            target_node: target.node_id.clone(),
            target_label: target.label.clone(),
            kind,
        });
    }

    ctx.connections = connections;
}

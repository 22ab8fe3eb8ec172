//! Diagram compiler.
//!
//! Six phases run in order over a shared [`CompilationContext`]; if a phase
//! produces any error, later phases are skipped and the caller receives the
//! aggregated issue list. Compilation is deterministic: the same domain
//! diagram yields an identical executable diagram, including edge ordering
//! and dependency indices.

mod connect;
mod context;
mod edges;
mod graph;
mod transform;
mod validate;

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::domain::{DomainDiagram, ExecutableDiagram};
use crate::types::{EdgeId, NodeId};

pub use context::CompilationContext;

/// Compiler phase tags for issue reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompilePhase {
    Validation,
    NodeTransformation,
    ConnectionResolution,
    EdgeBuilding,
    Optimization,
    Assembly,
}

/// One compiler error or warning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompileIssue {
    pub phase: CompilePhase,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<NodeId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edge_id: Option<EdgeId>,
}

impl CompileIssue {
    pub fn general(phase: CompilePhase, message: impl Into<String>) -> Self {
        Self {
            phase,
            message: message.into(),
            node_id: None,
            edge_id: None,
        }
    }

    pub fn node(phase: CompilePhase, message: impl Into<String>, node_id: NodeId) -> Self {
        Self {
            phase,
            message: message.into(),
            node_id: Some(node_id),
            edge_id: None,
        }
    }

    pub fn edge(phase: CompilePhase, message: impl Into<String>, edge_id: EdgeId) -> Self {
        Self {
            phase,
            message: message.into(),
            node_id: None,
            edge_id: Some(edge_id),
        }
    }
}

impl std::fmt::Display for CompileIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{:?}] {}", self.phase, self.message)?;
        if let Some(n) = &self.node_id {
            write!(f, " (node {n})")?;
        }
        if let Some(e) = &self.edge_id {
            write!(f, " (edge {e})")?;
        }
        Ok(())
    }
}

/// Result of a compile call: either a frozen diagram or the error list.
#[derive(Debug, Clone)]
pub struct CompilationResult {
    pub diagram: Option<Arc<ExecutableDiagram>>,
    pub errors: Vec<CompileIssue>,
    pub warnings: Vec<CompileIssue>,
}

impl CompilationResult {
    pub fn is_ok(&self) -> bool {
        self.diagram.is_some() && self.errors.is_empty()
    }

    /// The compiled diagram, or a validation-style error listing.
    pub fn into_diagram(self) -> Result<Arc<ExecutableDiagram>, Vec<CompileIssue>> {
        match self.diagram {
            Some(d) if self.errors.is_empty() => Ok(d),
            _ => Err(self.errors),
        }
    }
}

/// Compile a domain diagram into its executable form.
pub fn compile(domain: &DomainDiagram) -> CompilationResult {
    let mut ctx = CompilationContext::new(domain);

    let phases: [(&str, fn(&mut CompilationContext<'_>)); 5] = [
        ("validation", validate::run),
        ("node_transformation", transform::run),
        ("connection_resolution", connect::run),
        ("edge_building", edges::run),
        ("optimization", graph::run),
    ];

    for (name, phase) in phases {
        phase(&mut ctx);
        debug!(
            phase = name,
            errors = ctx.errors.len(),
            warnings = ctx.warnings.len(),
            "compiler phase complete"
        );
        if !ctx.errors.is_empty() {
            return CompilationResult {
                diagram: None,
                errors: ctx.errors,
                warnings: ctx.warnings,
            };
        }
    }

    // Phase 6: assembly - freeze the executable diagram.
    let warnings = std::mem::take(&mut ctx.warnings);
    let diagram = ctx.assemble();
    CompilationResult {
        diagram: Some(Arc::new(diagram)),
        errors: Vec::new(),
        warnings,
    }
}

#[cfg(test)]
mod tests;

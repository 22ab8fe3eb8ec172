//! Phase 2: typed-node construction.
//!
//! Applies the declarative FIELD_MAPPINGS renames (import direction), then
//! deserializes each node's data into its typed configuration and validates
//! required fields and value domains.

use serde_json::Value;
use std::time::Duration;

use crate::domain::specs::{field_mappings, node_spec};
use crate::domain::{
    ConditionType, ExecutableNode, HookType, NodeBase, NodeKind, NodeType,
};
use crate::handlers::expr;
use crate::types::NodeId;

use super::context::CompilationContext;
use super::{CompileIssue, CompilePhase};

const PHASE: CompilePhase = CompilePhase::NodeTransformation;

pub fn run(ctx: &mut CompilationContext<'_>) {
    for (id, node) in &ctx.domain.nodes {
        let mut data = node.data.clone();

        // Declarative field renames; an explicit new-name key wins.
        for (from, to) in field_mappings(node.node_type) {
            if let Some(v) = data.remove(*from) {
                data.entry(to.to_string()).or_insert(v);
            }
        }

        let base = match build_base(id, node.node_type, &data) {
            Ok(base) => base,
            Err(message) => {
                ctx.error(CompileIssue::node(PHASE, message, id.clone()));
                continue;
            }
        };

        let kind = match parse_kind(node.node_type, Value::Object(data)) {
            Ok(kind) => kind,
            Err(err) => {
                ctx.error(CompileIssue::node(
                    PHASE,
                    format!("invalid {} configuration: {err}", node.node_type),
                    id.clone(),
                ));
                continue;
            }
        };

        let issues = domain_checks(ctx, id, &kind);
        if !issues.is_empty() {
            for issue in issues {
                ctx.error(issue);
            }
            continue;
        }

        ctx.typed_nodes
            .insert(id.clone(), ExecutableNode { base, kind });
    }
}

fn build_base(
    id: &NodeId,
    node_type: NodeType,
    data: &serde_json::Map<String, Value>,
) -> Result<NodeBase, String> {
    let spec = node_spec(node_type);

    let label = data
        .get("label")
        .and_then(Value::as_str)
        .unwrap_or(id.as_str())
        .to_string();

    let join_policy = match data.get("join_policy") {
        Some(v) => serde_json::from_value(v.clone())
            .map_err(|e| format!("invalid join_policy: {e}"))?,
        None => spec.join_policy,
    };

    let timeout = match data.get("timeout_s") {
        Some(v) => {
            let secs = v
                .as_u64()
                .ok_or_else(|| "timeout_s must be a positive integer".to_string())?;
            Duration::from_secs(secs)
        }
        None => spec.timeout,
    };

    let retryable = match data.get("retryable") {
        Some(v) => v
            .as_bool()
            .ok_or_else(|| "retryable must be a boolean".to_string())?,
        None => spec.retryable,
    };

    let max_retries = match data.get("max_retries") {
        Some(v) => v
            .as_u64()
            .ok_or_else(|| "max_retries must be a non-negative integer".to_string())?
            as u32,
        None => spec.max_retries,
    };

    Ok(NodeBase {
        id: id.clone(),
        label,
        join_policy,
        timeout,
        retryable,
        max_retries,
    })
}

fn parse_kind(node_type: NodeType, value: Value) -> Result<NodeKind, serde_json::Error> {
    use NodeType as T;
    Ok(match node_type {
        T::Start => NodeKind::Start(serde_json::from_value(value)?),
        T::Endpoint => NodeKind::Endpoint(serde_json::from_value(value)?),
        T::Condition => NodeKind::Condition(serde_json::from_value(value)?),
        T::PersonJob => NodeKind::PersonJob(serde_json::from_value(value)?),
        T::CodeJob => NodeKind::CodeJob(serde_json::from_value(value)?),
        T::ApiJob => NodeKind::ApiJob(serde_json::from_value(value)?),
        T::Db => NodeKind::Db(serde_json::from_value(value)?),
        T::TemplateJob => NodeKind::TemplateJob(serde_json::from_value(value)?),
        T::JsonSchemaValidator => NodeKind::JsonSchemaValidator(serde_json::from_value(value)?),
        T::Hook => NodeKind::Hook(serde_json::from_value(value)?),
        T::SubDiagram => NodeKind::SubDiagram(serde_json::from_value(value)?),
        T::UserResponse => NodeKind::UserResponse(serde_json::from_value(value)?),
        T::IntegratedApi => NodeKind::IntegratedApi(serde_json::from_value(value)?),
        T::DiffPatch => NodeKind::DiffPatch(serde_json::from_value(value)?),
        T::IrBuilder => NodeKind::IrBuilder(serde_json::from_value(value)?),
        T::TypescriptAst => NodeKind::TypescriptAst(serde_json::from_value(value)?),
    })
}

/// Value-domain checks beyond what serde enforces.
fn domain_checks(
    ctx: &CompilationContext<'_>,
    id: &NodeId,
    kind: &NodeKind,
) -> Vec<CompileIssue> {
    let mut issues = Vec::new();
    let mut fail = |message: String| {
        issues.push(CompileIssue::node(PHASE, message, id.clone()));
    };

    match kind {
        NodeKind::PersonJob(p) => {
            if !ctx.domain.persons.contains_key(&p.person) {
                fail(format!("unknown person '{}'", p.person));
            }
            if p.max_iteration == 0 {
                fail("max_iteration must be at least 1".to_string());
            }
        }
        NodeKind::Condition(c) => match c.condition_type {
            ConditionType::CustomExpression => match c.expression.as_deref() {
                Some(src) => {
                    if let Err(err) = expr::parse_expression(src) {
                        fail(format!("invalid condition expression: {err}"));
                    }
                }
                None => fail("custom_expression condition requires an expression".to_string()),
            },
            ConditionType::LlmDecision => match &c.person {
                Some(p) if ctx.domain.persons.contains_key(p) => {}
                Some(p) => fail(format!("unknown person '{p}'")),
                None => fail("llm_decision condition requires a person".to_string()),
            },
            ConditionType::CheckNodesExecuted => {
                if c.node_ids.is_empty() {
                    fail("check_nodes_executed condition requires node_ids".to_string());
                }
                for n in &c.node_ids {
                    if !ctx.domain.nodes.contains_key(n) {
                        fail(format!("check_nodes_executed references unknown node '{n}'"));
                    }
                }
            }
            ConditionType::DetectMaxIterations => {}
        },
        NodeKind::CodeJob(c) => {
            if c.code.is_none() && c.file_path.is_none() {
                fail("code_job requires code or file_path".to_string());
            }
        }
        NodeKind::ApiJob(a) => {
            if a.url.is_empty() {
                fail("api_job requires a url".to_string());
            }
        }
        NodeKind::Db(d) => {
            if d.file.is_empty() {
                fail("db node requires a file".to_string());
            }
        }
        NodeKind::TemplateJob(t) => {
            if t.template.is_none() && t.template_path.is_none() {
                fail("template_job requires template or template_path".to_string());
            }
        }
        NodeKind::JsonSchemaValidator(v) => {
            if v.schema.is_none() && v.schema_path.is_none() {
                fail("json_schema_validator requires schema or schema_path".to_string());
            }
        }
        NodeKind::Hook(h) => {
            let missing = match h.hook_type {
                HookType::Shell => h.command.is_none(),
                HookType::Http => h.url.is_none(),
                HookType::File => h.file_path.is_none(),
            };
            if missing {
                fail(format!(
                    "{:?} hook is missing its target field",
                    h.hook_type
                ));
            }
        }
        NodeKind::SubDiagram(s) => {
            if s.diagram_name.is_empty() {
                fail("sub_diagram requires a diagram_name".to_string());
            }
        }
        NodeKind::DiffPatch(d) => {
            if d.target_path.is_empty() {
                fail("diff_patch requires a target_path".to_string());
            }
        }
        _ => {}
    }

    issues
}

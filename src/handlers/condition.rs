//! Condition node - evaluates a predicate and emits exactly one token on
//! the active branch.

use async_trait::async_trait;
use serde_json::Value;

use crate::domain::{ConditionType, ExecutableNode, HandleLabel, IterationScope, NodeKind, NodeType};
use crate::engine::{ExecutionContext, NodeTask, ResolvedInputs};
use crate::envelope::Envelope;
use crate::person::{select_view, MemorySettings, GOLDFISH};
use crate::ports::CompletionRequest;
use crate::types::{Error, NodeId, Result};

use super::{expr, NodeHandler, NodeOutput};

#[derive(Debug, Default)]
pub struct ConditionHandler;

#[async_trait]
impl NodeHandler for ConditionHandler {
    fn node_type(&self) -> NodeType {
        NodeType::Condition
    }

    async fn execute(
        &self,
        node: &ExecutableNode,
        inputs: ResolvedInputs,
        ctx: &ExecutionContext,
        task: &NodeTask,
    ) -> Result<NodeOutput> {
        let NodeKind::Condition(config) = &node.kind else {
            return Err(Error::execution("condition handler on non-condition node"));
        };

        let verdict = match config.condition_type {
            ConditionType::DetectMaxIterations => self.detect_max_iterations(node, ctx, task),
            ConditionType::CheckNodesExecuted => {
                let all_done = config
                    .node_ids
                    .iter()
                    .all(|n| ctx.with_state(|s| s.history.total_count(n)) > 0);
                Ok(all_done)
            }
            ConditionType::CustomExpression => {
                let source = config
                    .expression
                    .as_deref()
                    .ok_or_else(|| Error::permanent("condition is missing its expression"))?;
                let context = Value::Object(
                    [("inputs".to_string(), Value::Object(inputs.merged_object()))]
                        .into_iter()
                        .collect(),
                );
                expr::evaluate(source, &context).map_err(Error::permanent)
            }
            ConditionType::LlmDecision => self.llm_decision(config, node, &inputs, ctx).await,
        }?;

        // Pass the incoming value through on the active branch so the loop
        // body keeps its data.
        let envelope = match inputs.first_of(&["default"]) {
            Some(env) => env.as_ref().clone(),
            None => Envelope::from_json(
                Value::Object(Default::default()),
                node.id().clone(),
                ctx.execution_id.clone(),
            ),
        };
        let label = if verdict {
            HandleLabel::Condtrue
        } else {
            HandleLabel::Condfalse
        };
        Ok(NodeOutput::labeled(
            label,
            envelope.with_meta("branch", Value::Bool(verdict)),
        ))
    }
}

impl ConditionHandler {
    /// True when every person job feeding this condition has exhausted its
    /// iteration bound. With no person-job predecessor, every person job in
    /// the diagram is considered.
    fn detect_max_iterations(
        &self,
        node: &ExecutableNode,
        ctx: &ExecutionContext,
        task: &NodeTask,
    ) -> Result<bool> {
        let mut targets: Vec<(NodeId, u32, IterationScope)> = ctx
            .diagram
            .incoming_edges(node.id())
            .filter_map(|e| ctx.diagram.node(&e.source_node))
            .filter_map(person_job_bounds)
            .collect();
        if targets.is_empty() {
            targets = ctx
                .diagram
                .nodes
                .values()
                .filter_map(person_job_bounds)
                .collect();
        }
        if targets.is_empty() {
            return Ok(false);
        }

        Ok(targets.into_iter().all(|(id, max_iteration, scope)| {
            let count = ctx.with_state(|s| match scope {
                IterationScope::Cumulative => s.history.total_count(&id),
                IterationScope::PerEpoch => s.history.execution_count(&id, task.epoch),
            });
            count >= max_iteration
        }))
    }

    /// Stateless judge call: GOLDFISH memory by default so the decision
    /// depends only on the prompt and inputs.
    async fn llm_decision(
        &self,
        config: &crate::domain::ConditionNode,
        node: &ExecutableNode,
        inputs: &ResolvedInputs,
        ctx: &ExecutionContext,
    ) -> Result<bool> {
        let person = config
            .person
            .clone()
            .ok_or_else(|| Error::permanent("llm_decision requires a person"))?;
        let llm_config = ctx
            .diagram
            .persons
            .get(&person)
            .map(|p| p.llm_config.clone())
            .ok_or_else(|| Error::permanent(format!("unknown person {person}")))?;

        let context = Value::Object(
            [("inputs".to_string(), Value::Object(inputs.merged_object()))]
                .into_iter()
                .collect(),
        );
        let prompt_template = config
            .judge_by
            .as_deref()
            .unwrap_or("Answer true or false: should the flow take the true branch?");
        let prompt = ctx.templates.render(prompt_template, &context);

        let conversation = ctx.with_conversation(|c| c.clone());
        let settings = MemorySettings {
            memorize_to: Some(GOLDFISH.to_string()),
            ..Default::default()
        };
        let view = select_view(
            &conversation,
            &person,
            &llm_config,
            &settings,
            &prompt,
            ctx.ports.llm.as_ref(),
        )
        .await;

        let response = ctx
            .ports
            .llm
            .complete(CompletionRequest {
                person,
                config: llm_config,
                messages: view.messages,
                prompt,
                structured_schema: None,
                tools: vec![],
                temperature: Some(0.0),
            })
            .await?;

        let answer = response.text.trim().to_lowercase();
        Ok(answer.starts_with("true") || answer.starts_with("yes"))
    }
}

fn person_job_bounds(node: &ExecutableNode) -> Option<(NodeId, u32, IterationScope)> {
    match &node.kind {
        NodeKind::PersonJob(p) => Some((
            node.id().clone(),
            p.max_iteration,
            p.max_iteration_scope,
        )),
        _ => None,
    }
}

//! Person job - prompts an LLM persona with a memory view over the global
//! conversation.

use async_trait::async_trait;
use serde_json::Value;

use crate::domain::{ExecutableNode, NodeKind, NodeType};
use crate::engine::{ExecutionContext, NodeTask, ResolvedInputs};
use crate::envelope::Envelope;
use crate::person::{select_view, Message, Speaker};
use crate::ports::CompletionRequest;
use crate::types::{Error, Result};

use super::{NodeHandler, NodeOutput};

#[derive(Debug, Default)]
pub struct PersonJobHandler;

#[async_trait]
impl NodeHandler for PersonJobHandler {
    fn node_type(&self) -> NodeType {
        NodeType::PersonJob
    }

    async fn execute(
        &self,
        node: &ExecutableNode,
        inputs: ResolvedInputs,
        ctx: &ExecutionContext,
        task: &NodeTask,
    ) -> Result<NodeOutput> {
        let NodeKind::PersonJob(config) = &node.kind else {
            return Err(Error::execution("person_job handler on non-person node"));
        };

        let llm_config = ctx
            .diagram
            .persons
            .get(&config.person)
            .map(|p| p.llm_config.clone())
            .ok_or_else(|| Error::permanent(format!("unknown person {}", config.person)))?;

        // First execution at this epoch uses the first-only prompt.
        let first = ctx.with_state(|s| s.history.execution_count(&task.node_id, task.epoch)) <= 1;
        let template = if first {
            config
                .first_only_prompt
                .as_deref()
                .or(config.default_prompt.as_deref())
        } else {
            config
                .default_prompt
                .as_deref()
                .or(config.first_only_prompt.as_deref())
        }
        .ok_or_else(|| Error::permanent("person_job has no prompt configured"))?;

        let mut context_map = serde_json::Map::new();
        context_map.insert("inputs".to_string(), Value::Object(inputs.merged_object()));
        if let Value::Object(vars) = &ctx.variables {
            context_map.insert("variables".to_string(), Value::Object(vars.clone()));
        }
        let prompt = ctx.templates.render(template, &Value::Object(context_map));

        // Memory view before this turn's messages are appended.
        let conversation = ctx.with_conversation(|c| c.clone());
        let view = select_view(
            &conversation,
            &config.person,
            &llm_config,
            &config.memory,
            &prompt,
            ctx.ports.llm.as_ref(),
        )
        .await;

        ctx.with_conversation(|c| {
            c.append(Message::new(
                Speaker::System,
                Speaker::Person(config.person.clone()),
                prompt.clone(),
            ))
        });

        let response = ctx
            .ports
            .llm
            .complete(CompletionRequest {
                person: config.person.clone(),
                config: llm_config,
                messages: view.messages,
                prompt: prompt.clone(),
                structured_schema: config.text_format.clone(),
                tools: config.tools.clone(),
                temperature: None,
            })
            .await?;

        ctx.with_conversation(|c| {
            c.append(Message::new(
                Speaker::Person(config.person.clone()),
                Speaker::System,
                response.text.clone(),
            ))
        });

        let usage = serde_json::json!({
            "input": response.usage.input,
            "output": response.usage.output,
        });
        let envelope = match (&config.text_format, response.structured) {
            (Some(_), Some(structured)) => Envelope::from_json(
                structured,
                node.id().clone(),
                ctx.execution_id.clone(),
            ),
            (Some(_), None) => {
                // Structured output requested but the adapter returned only
                // text: parse it, rejecting invalid JSON.
                let value: Value = serde_json::from_str(&response.text).map_err(|e| {
                    Error::permanent(format!("structured output was not valid JSON: {e}"))
                })?;
                Envelope::from_json(value, node.id().clone(), ctx.execution_id.clone())
            }
            (None, _) => Envelope::from_text(
                response.text,
                node.id().clone(),
                ctx.execution_id.clone(),
            ),
        };

        Ok(NodeOutput::single(envelope.with_meta("usage", usage)))
    }
}

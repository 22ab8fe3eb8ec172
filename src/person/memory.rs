//! Memory views - per-task derived subsets of the conversation.
//!
//! Selection never mutates the conversation. The dual-persona selector
//! reuses the person's LLM config under a transient `__selector` facet and
//! only the returned message ids flow back.

use std::collections::HashSet;

use tracing::warn;

use crate::person::{Conversation, Message};
use crate::ports::{LLMClient, LlmConfig, MemorySelectionRequest};
use crate::types::PersonId;

/// Literal `memorize_to` value for zero memory.
pub const GOLDFISH: &str = "GOLDFISH";

/// Fixed selector temperature.
const SELECTOR_TEMPERATURE: f32 = 0.1;

/// Near-duplicate detection compares this many leading characters of the
/// whitespace-normalized body.
const DEDUPE_PREFIX: usize = 80;

/// User-facing memory configuration carried by a person job.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize, schemars::JsonSchema)]
pub struct MemorySettings {
    /// `"GOLDFISH"` for zero memory, otherwise a natural-language criterion.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memorize_to: Option<String>,

    /// Post-selection cap on retained messages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub at_most: Option<usize>,

    /// Senders excluded from the candidate set.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ignore_person: Vec<PersonId>,
}

/// Result of a memory selection.
#[derive(Debug, Clone)]
pub struct MemoryView {
    pub messages: Vec<Message>,
    /// Set when the selector failed and the pair fallback was applied.
    pub warning: Option<String>,
}

/// Build the memory view for `person` performing the task described by
/// `task_preview`.
pub async fn select_view(
    conversation: &Conversation,
    person: &PersonId,
    config: &LlmConfig,
    settings: &MemorySettings,
    task_preview: &str,
    llm: &dyn LLMClient,
) -> MemoryView {
    if matches!(settings.memorize_to.as_deref(), Some(GOLDFISH)) {
        return MemoryView {
            messages: Vec::new(),
            warning: None,
        };
    }

    let mut candidates = conversation.all_involved(person);
    if !settings.ignore_person.is_empty() {
        let ignored: HashSet<&PersonId> = settings.ignore_person.iter().collect();
        candidates.retain(|m| match &m.from {
            crate::person::Speaker::Person(p) => !ignored.contains(p),
            _ => true,
        });
    }

    let criterion = match settings.memorize_to.as_deref() {
        Some(c) if !c.trim().is_empty() => c.to_string(),
        // No criterion configured: the default filtered view, capped.
        _ => {
            let messages = apply_at_most(candidates, settings.at_most);
            return MemoryView {
                messages,
                warning: None,
            };
        }
    };

    let request = MemorySelectionRequest {
        person: PersonId::from(format!("{person}.__selector").as_str()),
        config: config.clone(),
        candidates: candidates.clone(),
        task_preview: task_preview.to_string(),
        criterion,
        at_most: settings.at_most,
        temperature: SELECTOR_TEMPERATURE,
    };

    match llm.select_memories(request).await {
        Ok(ids) => {
            let wanted: HashSet<_> = ids.into_iter().collect();
            // Unknown ids are dropped; candidate order is preserved.
            let selected: Vec<Message> = candidates
                .into_iter()
                .filter(|m| wanted.contains(&m.id))
                .collect();
            let capped = apply_at_most(selected, settings.at_most);
            MemoryView {
                messages: dedupe_keep_earliest(capped),
                warning: None,
            }
        }
        Err(err) => {
            let message = format!("memory selection failed for {person}: {err}");
            warn!(person = %person, error = %err, "memory selection fell back to conversation pairs");
            let fallback = apply_at_most(conversation.conversation_pairs(person), settings.at_most);
            MemoryView {
                messages: fallback,
                warning: Some(message),
            }
        }
    }
}

/// Keep the most recent `at_most` messages; system messages are always
/// preserved in addition to the cap. Original order is maintained.
fn apply_at_most(messages: Vec<Message>, at_most: Option<usize>) -> Vec<Message> {
    let Some(cap) = at_most else {
        return messages;
    };
    let non_system_total = messages.iter().filter(|m| !m.is_from_system()).count();
    let skip = non_system_total.saturating_sub(cap);
    let mut seen_non_system = 0usize;
    messages
        .into_iter()
        .filter(|m| {
            if m.is_from_system() {
                true
            } else {
                seen_non_system += 1;
                seen_non_system > skip
            }
        })
        .collect()
}

/// Drop near-duplicates (normalized body prefix), keeping the earliest.
fn dedupe_keep_earliest(messages: Vec<Message>) -> Vec<Message> {
    let mut seen: HashSet<String> = HashSet::new();
    messages
        .into_iter()
        .filter(|m| seen.insert(normalize(&m.body)))
        .collect()
}

fn normalize(body: &str) -> String {
    let collapsed = body.split_whitespace().collect::<Vec<_>>().join(" ");
    collapsed.to_lowercase().chars().take(DEDUPE_PREFIX).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::person::Speaker;
    use crate::ports::MockLLMClient;
    use crate::types::MessageId;

    fn config() -> LlmConfig {
        LlmConfig {
            service: "test".into(),
            model: "test-model".into(),
            api_key_id: None,
            system_prompt: None,
            temperature: None,
        }
    }

    fn seeded_conversation(person: &PersonId) -> (Conversation, Vec<MessageId>) {
        let mut conv = Conversation::new();
        let other = PersonId::from("other");
        let ids = vec![
            conv.append(Message::new(
                Speaker::System,
                Speaker::Person(person.clone()),
                "system note",
            )),
            conv.append(Message::new(
                Speaker::Person(other.clone()),
                Speaker::Person(person.clone()),
                "requirements discussion",
            )),
            conv.append(Message::new(
                Speaker::Person(person.clone()),
                Speaker::Person(other),
                "api design reply",
            )),
        ];
        (conv, ids)
    }

    #[tokio::test]
    async fn goldfish_returns_empty_regardless_of_history() {
        let person = PersonId::from("p1");
        let (conv, _) = seeded_conversation(&person);
        let llm = MockLLMClient::new(); // must not be called
        let settings = MemorySettings {
            memorize_to: Some(GOLDFISH.to_string()),
            ..Default::default()
        };
        let view = select_view(&conv, &person, &config(), &settings, "task", &llm).await;
        assert!(view.messages.is_empty());
        assert!(view.warning.is_none());
    }

    #[tokio::test]
    async fn selector_ids_map_back_and_unknown_ids_drop() {
        let person = PersonId::from("p1");
        let (conv, ids) = seeded_conversation(&person);
        let keep = ids[1].clone();

        let mut llm = MockLLMClient::new();
        let keep_clone = keep.clone();
        llm.expect_select_memories().returning(move |req| {
            assert_eq!(req.temperature, 0.1);
            assert!(req.person.as_str().ends_with(".__selector"));
            Ok(vec![keep_clone.clone(), MessageId::from("unknown-id")])
        });

        let settings = MemorySettings {
            memorize_to: Some("requirements, API design".to_string()),
            ..Default::default()
        };
        let view = select_view(&conv, &person, &config(), &settings, "task", &llm).await;
        assert_eq!(view.messages.len(), 1);
        assert_eq!(view.messages[0].id, keep);
    }

    #[tokio::test]
    async fn selector_failure_falls_back_to_pairs_with_warning() {
        let person = PersonId::from("p1");
        let (conv, _) = seeded_conversation(&person);

        let mut llm = MockLLMClient::new();
        llm.expect_select_memories()
            .returning(|_| Err(crate::types::Error::llm(crate::types::LlmErrorKind::Timeout, "slow")));

        let settings = MemorySettings {
            memorize_to: Some("anything".to_string()),
            ..Default::default()
        };
        let view = select_view(&conv, &person, &config(), &settings, "task", &llm).await;
        assert!(view.warning.is_some());
        // The request/response pair is retained.
        assert_eq!(view.messages.len(), 2);
    }

    #[test]
    fn at_most_preserves_system_messages() {
        let person = PersonId::from("p1");
        let other = PersonId::from("other");
        let mut msgs = vec![Message::new(Speaker::System, Speaker::Broadcast, "sys")];
        for i in 0..5 {
            msgs.push(Message::new(
                Speaker::Person(other.clone()),
                Speaker::Person(person.clone()),
                format!("m{i}"),
            ));
        }
        let capped = apply_at_most(msgs, Some(2));
        assert_eq!(capped.len(), 3);
        assert!(capped[0].is_from_system());
        assert_eq!(capped[1].body, "m3");
        assert_eq!(capped[2].body, "m4");
    }

    #[test]
    fn dedupe_keeps_earliest() {
        let a = PersonId::from("a");
        let m1 = Message::new(Speaker::Person(a.clone()), Speaker::Broadcast, "Same   text");
        let m2 = Message::new(Speaker::Person(a), Speaker::Broadcast, "same text");
        let first = m1.id.clone();
        let out = dedupe_keep_earliest(vec![m1, m2]);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].id, first);
    }
}

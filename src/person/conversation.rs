//! Global append-only conversation log.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::types::{MessageId, PersonId};

/// A conversation participant.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Speaker {
    Person(PersonId),
    System,
    Broadcast,
}

impl Speaker {
    pub fn is_system(&self) -> bool {
        matches!(self, Speaker::System)
    }

    pub fn is_person(&self, person: &PersonId) -> bool {
        matches!(self, Speaker::Person(p) if p == person)
    }
}

/// One immutable conversation log entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub from: Speaker,
    pub to: Speaker,
    pub body: String,
    pub ts: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, Value>,
}

impl Message {
    pub fn new(from: Speaker, to: Speaker, body: impl Into<String>) -> Self {
        Self {
            id: MessageId::new(),
            from,
            to,
            body: body.into(),
            ts: Utc::now(),
            metadata: BTreeMap::new(),
        }
    }

    /// Sender or recipient is `person`, or the message is broadcast.
    pub fn involves(&self, person: &PersonId) -> bool {
        self.from.is_person(person)
            || self.to.is_person(person)
            || matches!(self.to, Speaker::Broadcast)
    }

    pub fn is_from_system(&self) -> bool {
        self.from.is_system()
    }
}

/// Append-only ordered message log, global to one execution.
///
/// No operation removes a message. Filters return derived copies and never
/// touch storage.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct Conversation {
    messages: Vec<Message>,
}

impl Conversation {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a message; returns its assigned id.
    pub fn append(&mut self, message: Message) -> MessageId {
        let id = message.id.clone();
        self.messages.push(message);
        id
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    // Base filters. Internal building blocks for memory views; not exposed
    // as user configuration.

    /// Sender or recipient is `person`.
    pub fn all_involved(&self, person: &PersonId) -> Vec<Message> {
        self.messages
            .iter()
            .filter(|m| m.involves(person))
            .cloned()
            .collect()
    }

    /// Sender is `person`.
    pub fn sent_by(&self, person: &PersonId) -> Vec<Message> {
        self.messages
            .iter()
            .filter(|m| m.from.is_person(person))
            .cloned()
            .collect()
    }

    /// Recipient is `person`.
    pub fn sent_to(&self, person: &PersonId) -> Vec<Message> {
        self.messages
            .iter()
            .filter(|m| m.to.is_person(person))
            .cloned()
            .collect()
    }

    /// Sender is system, or `person` sent/received.
    pub fn system_and_me(&self, person: &PersonId) -> Vec<Message> {
        self.messages
            .iter()
            .filter(|m| m.is_from_system() || m.involves(person))
            .cloned()
            .collect()
    }

    /// Adjacent request/response pairs involving `person`: a message sent to
    /// `person` immediately followed by `person`'s reply.
    pub fn conversation_pairs(&self, person: &PersonId) -> Vec<Message> {
        let mut out = Vec::new();
        let mut i = 0;
        while i + 1 < self.messages.len() {
            let req = &self.messages[i];
            let resp = &self.messages[i + 1];
            if req.to.is_person(person) && resp.from.is_person(person) {
                out.push(req.clone());
                out.push(resp.clone());
                i += 2;
            } else {
                i += 1;
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn person(id: &str) -> PersonId {
        PersonId::from(id)
    }

    fn msg(from: Speaker, to: Speaker, body: &str) -> Message {
        Message::new(from, to, body)
    }

    #[test]
    fn append_is_ordered_and_immutable() {
        let mut conv = Conversation::new();
        conv.append(msg(Speaker::System, Speaker::Broadcast, "hello"));
        conv.append(msg(
            Speaker::Person(person("a")),
            Speaker::Person(person("b")),
            "hi b",
        ));
        assert_eq!(conv.len(), 2);
        assert_eq!(conv.messages()[0].body, "hello");

        // Filters do not alter storage.
        let _ = conv.all_involved(&person("a"));
        assert_eq!(conv.len(), 2);
    }

    #[test]
    fn base_filters() {
        let a = person("a");
        let b = person("b");
        let mut conv = Conversation::new();
        conv.append(msg(Speaker::System, Speaker::Person(a.clone()), "sys to a"));
        conv.append(msg(
            Speaker::Person(a.clone()),
            Speaker::Person(b.clone()),
            "a to b",
        ));
        conv.append(msg(
            Speaker::Person(b.clone()),
            Speaker::Person(a.clone()),
            "b to a",
        ));

        assert_eq!(conv.all_involved(&a).len(), 3);
        assert_eq!(conv.sent_by(&a).len(), 1);
        assert_eq!(conv.sent_to(&a).len(), 2);
        assert_eq!(conv.system_and_me(&b).len(), 3);
    }

    #[test]
    fn conversation_pairs_keeps_adjacent_request_response() {
        let a = person("a");
        let b = person("b");
        let mut conv = Conversation::new();
        conv.append(msg(
            Speaker::Person(b.clone()),
            Speaker::Person(a.clone()),
            "question",
        ));
        conv.append(msg(
            Speaker::Person(a.clone()),
            Speaker::Person(b.clone()),
            "answer",
        ));
        conv.append(msg(Speaker::System, Speaker::Broadcast, "noise"));

        let pairs = conv.conversation_pairs(&a);
        assert_eq!(pairs.len(), 2);
        assert_eq!(pairs[0].body, "question");
        assert_eq!(pairs[1].body, "answer");
    }

    #[test]
    fn broadcast_involves_everyone() {
        let a = person("a");
        let m = msg(Speaker::System, Speaker::Broadcast, "to all");
        assert!(m.involves(&a));
    }
}

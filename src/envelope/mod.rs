//! Envelope - the typed message carrier between nodes.
//!
//! Envelopes are immutable once emitted. They are constructed only through
//! the content-type factories below; `with_meta` returns a new envelope and
//! never mutates. The runtime adds wrappers only via explicit edge transform
//! rules: no auto-wrapping, no heuristic type detection, no implicit
//! unboxing on consumption.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::person::Message;
use crate::types::{ExecutionId, NodeId};

/// Content type of an envelope body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentType {
    RawText,
    Object,
    ConversationState,
    Binary,
    Error,
}

impl std::fmt::Display for ContentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ContentType::RawText => "raw_text",
            ContentType::Object => "object",
            ContentType::ConversationState => "conversation_state",
            ContentType::Binary => "binary",
            ContentType::Error => "error",
        };
        write!(f, "{s}")
    }
}

/// Typed envelope payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "content_type", content = "value", rename_all = "snake_case")]
pub enum EnvelopeBody {
    RawText(String),
    Object(Value),
    ConversationState(Vec<Message>),
    Binary(#[serde(with = "base64_bytes")] Bytes),
    Error { message: String, error_type: String },
}

impl EnvelopeBody {
    pub fn content_type(&self) -> ContentType {
        match self {
            EnvelopeBody::RawText(_) => ContentType::RawText,
            EnvelopeBody::Object(_) => ContentType::Object,
            EnvelopeBody::ConversationState(_) => ContentType::ConversationState,
            EnvelopeBody::Binary(_) => ContentType::Binary,
            EnvelopeBody::Error { .. } => ContentType::Error,
        }
    }
}

/// Immutable message carrier flowing between nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    body: EnvelopeBody,
    produced_by: NodeId,
    trace_id: ExecutionId,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    meta: BTreeMap<String, Value>,
}

impl Envelope {
    /// Text envelope.
    pub fn from_text(
        text: impl Into<String>,
        produced_by: NodeId,
        trace_id: ExecutionId,
    ) -> Self {
        Self {
            body: EnvelopeBody::RawText(text.into()),
            produced_by,
            trace_id,
            meta: BTreeMap::new(),
        }
    }

    /// Object envelope. Accepts any JSON object or array; other value kinds
    /// are wrapped verbatim (the resolver enforces port contracts, not the
    /// factory).
    pub fn from_json(value: Value, produced_by: NodeId, trace_id: ExecutionId) -> Self {
        Self {
            body: EnvelopeBody::Object(value),
            produced_by,
            trace_id,
            meta: BTreeMap::new(),
        }
    }

    /// Conversation-state envelope.
    pub fn from_conversation(
        messages: Vec<Message>,
        produced_by: NodeId,
        trace_id: ExecutionId,
    ) -> Self {
        Self {
            body: EnvelopeBody::ConversationState(messages),
            produced_by,
            trace_id,
            meta: BTreeMap::new(),
        }
    }

    /// Binary envelope.
    pub fn from_binary(bytes: Bytes, produced_by: NodeId, trace_id: ExecutionId) -> Self {
        Self {
            body: EnvelopeBody::Binary(bytes),
            produced_by,
            trace_id,
            meta: BTreeMap::new(),
        }
    }

    /// Error envelope. Sets `meta.is_error = true`.
    pub fn from_error(
        message: impl Into<String>,
        error_type: impl Into<String>,
        produced_by: NodeId,
        trace_id: ExecutionId,
    ) -> Self {
        let mut meta = BTreeMap::new();
        meta.insert("is_error".to_string(), Value::Bool(true));
        Self {
            body: EnvelopeBody::Error {
                message: message.into(),
                error_type: error_type.into(),
            },
            produced_by,
            trace_id,
            meta,
        }
    }

    /// Return a new envelope with an extra meta entry. Never mutates.
    pub fn with_meta(mut self, key: impl Into<String>, value: Value) -> Self {
        self.meta.insert(key.into(), value);
        self
    }

    /// Return a new envelope with the same body attributed to a different
    /// producer (used when transforms re-emit a derived envelope).
    pub(crate) fn with_body(&self, body: EnvelopeBody) -> Self {
        Self {
            body,
            produced_by: self.produced_by.clone(),
            trace_id: self.trace_id.clone(),
            meta: self.meta.clone(),
        }
    }

    pub fn body(&self) -> &EnvelopeBody {
        &self.body
    }

    pub fn content_type(&self) -> ContentType {
        self.body.content_type()
    }

    pub fn produced_by(&self) -> &NodeId {
        &self.produced_by
    }

    pub fn trace_id(&self) -> &ExecutionId {
        &self.trace_id
    }

    pub fn meta(&self) -> &BTreeMap<String, Value> {
        &self.meta
    }

    pub fn is_error(&self) -> bool {
        matches!(self.body, EnvelopeBody::Error { .. })
    }

    pub fn as_text(&self) -> Option<&str> {
        match &self.body {
            EnvelopeBody::RawText(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&Value> {
        match &self.body {
            EnvelopeBody::Object(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_conversation(&self) -> Option<&[Message]> {
        match &self.body {
            EnvelopeBody::ConversationState(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_binary(&self) -> Option<&Bytes> {
        match &self.body {
            EnvelopeBody::Binary(b) => Some(b),
            _ => None,
        }
    }

    /// JSON projection of the body for event summaries, final outputs, and
    /// template contexts. Binary bodies project to a length descriptor.
    pub fn body_json(&self) -> Value {
        match &self.body {
            EnvelopeBody::RawText(s) => Value::String(s.clone()),
            EnvelopeBody::Object(v) => v.clone(),
            EnvelopeBody::ConversationState(m) => {
                serde_json::to_value(m).unwrap_or(Value::Null)
            }
            EnvelopeBody::Binary(b) => serde_json::json!({ "binary_len": b.len() }),
            EnvelopeBody::Error {
                message,
                error_type,
            } => serde_json::json!({ "error": message, "error_type": error_type }),
        }
    }

    /// Truncated single-line preview for event payloads.
    pub fn preview(&self, max_len: usize) -> String {
        let full = match &self.body {
            EnvelopeBody::RawText(s) => s.clone(),
            EnvelopeBody::Binary(b) => format!("<{} bytes>", b.len()),
            other => serde_json::to_string(other).unwrap_or_default(),
        };
        let mut line: String = full.replace('\n', " ");
        if line.len() > max_len {
            line.truncate(line.char_indices().take(max_len).last().map_or(0, |(i, c)| i + c.len_utf8()));
            line.push('…');
        }
        line
    }
}

/// Base64 codec for binary bodies in JSON representations.
mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Bytes, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map(Bytes::from)
            .map_err(serde::de::Error::custom)
    }
}

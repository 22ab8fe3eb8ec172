//! Event infrastructure - per-execution sequenced event streams.
//!
//! Every event carries `{execution_id, seq, ts, type, payload}`. Sequences
//! are strictly monotonic per execution starting at 1 and are assigned at
//! publish time under the per-execution mutex.

mod bus;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::envelope::{ContentType, Envelope};
use crate::types::{EdgeId, ExecutionId, NodeId};

pub use bus::{BusError, EventBus, Subscription};

/// Compact projection of an envelope for event payloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvelopeSummary {
    pub content_type: ContentType,
    pub preview: String,
}

impl EnvelopeSummary {
    const PREVIEW_LEN: usize = 120;

    pub fn of(envelope: &Envelope) -> Self {
        Self {
            content_type: envelope.content_type(),
            preview: envelope.preview(Self::PREVIEW_LEN),
        }
    }
}

/// Terminal execution summary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionSummary {
    pub node_executions: usize,
    pub duration_ms: u64,
}

/// Fixed set of event types with their payload shapes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum EventKind {
    ExecutionStarted {
        diagram_id: Option<String>,
        variables: Value,
    },
    NodeStarted {
        node_id: NodeId,
        epoch: u64,
        execution_number: u32,
    },
    NodeCompleted {
        node_id: NodeId,
        epoch: u64,
        execution_number: u32,
        envelope_summary: Option<EnvelopeSummary>,
    },
    NodeFailed {
        node_id: NodeId,
        epoch: u64,
        execution_number: u32,
        error_kind: String,
        message: String,
    },
    TokenPublished {
        edge_id: EdgeId,
        epoch: u64,
        seq: u64,
        content_type: ContentType,
    },
    TokenConsumed {
        edge_id: EdgeId,
        epoch: u64,
        seq: u64,
    },
    ExecutionCompleted {
        summary: ExecutionSummary,
    },
    ExecutionFailed {
        reason: String,
    },
    KeepAlive {
        latest_seq: u64,
    },
}

impl EventKind {
    /// Event type name as it appears on the wire.
    pub fn type_name(&self) -> &'static str {
        match self {
            EventKind::ExecutionStarted { .. } => "execution_started",
            EventKind::NodeStarted { .. } => "node_started",
            EventKind::NodeCompleted { .. } => "node_completed",
            EventKind::NodeFailed { .. } => "node_failed",
            EventKind::TokenPublished { .. } => "token_published",
            EventKind::TokenConsumed { .. } => "token_consumed",
            EventKind::ExecutionCompleted { .. } => "execution_completed",
            EventKind::ExecutionFailed { .. } => "execution_failed",
            EventKind::KeepAlive { .. } => "keep_alive",
        }
    }
}

/// One sequenced event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub execution_id: ExecutionId,
    pub seq: u64,
    pub ts: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: EventKind,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_wire_shape() {
        let event = Event {
            execution_id: ExecutionId::from("exec-1"),
            seq: 3,
            ts: Utc::now(),
            kind: EventKind::TokenConsumed {
                edge_id: EdgeId::from("e1"),
                epoch: 0,
                seq: 1,
            },
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "token_consumed");
        assert_eq!(json["payload"]["edge_id"], "e1");
        assert_eq!(json["seq"], 3);
    }
}

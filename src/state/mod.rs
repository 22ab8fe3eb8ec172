//! Execution state tracking.
//!
//! Three sub-stores per execution: the append-only history, the runtime
//! status machine, and a derived UI projection. Execution decisions are
//! made by token presence, never by status - status exists for observers
//! and for invariant enforcement.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::envelope::Envelope;
use crate::types::{Error, NodeId, Result};

/// Per-node runtime status.
///
/// State transitions:
/// ```text
/// PENDING → RUNNING → {COMPLETED | FAILED | MAXITER_REACHED}
///     ↓         ↓
///  SKIPPED   RUNNING (retry / next iteration)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Pending,
    Running,
    Completed,
    Failed,
    MaxiterReached,
    Skipped,
}

impl NodeStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            NodeStatus::Failed | NodeStatus::MaxiterReached | NodeStatus::Skipped
        )
    }

    /// Check if a transition is valid.
    pub fn can_transition_to(self, to: NodeStatus) -> bool {
        match (self, to) {
            // PENDING
            (NodeStatus::Pending, NodeStatus::Running) => true,
            (NodeStatus::Pending, NodeStatus::Skipped) => true,
            (NodeStatus::Pending, NodeStatus::MaxiterReached) => true,
            // RUNNING
            (NodeStatus::Running, NodeStatus::Completed) => true,
            (NodeStatus::Running, NodeStatus::Failed) => true,
            (NodeStatus::Running, NodeStatus::MaxiterReached) => true,
            // Loop iterations and retries re-enter RUNNING.
            (NodeStatus::Running, NodeStatus::Running) => true,
            (NodeStatus::Completed, NodeStatus::Running) => true,
            (NodeStatus::Completed, NodeStatus::MaxiterReached) => true,
            // Terminal states are sticky.
            _ => false,
        }
    }
}

/// Completion status recorded in history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionStatus {
    Running,
    Completed,
    Failed,
    MaxiterReached,
}

/// One history entry for one node invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub node_id: NodeId,
    pub epoch: u64,
    /// 1-based invocation number of this node across all epochs.
    pub execution_number: u32,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    pub status: CompletionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Arc<Envelope>>,
}

/// Append-only execution history.
#[derive(Debug, Default, Clone)]
pub struct ExecutionHistory {
    records: Vec<ExecutionRecord>,
    /// Completed-or-running invocation counts keyed by (node, epoch).
    counts: BTreeMap<(NodeId, u64), u32>,
    /// Total invocation counts per node.
    totals: BTreeMap<NodeId, u32>,
}

impl ExecutionHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a node start; returns the execution number.
    pub fn record_start(&mut self, node_id: &NodeId, epoch: u64) -> u32 {
        let total = self.totals.entry(node_id.clone()).or_insert(0);
        *total += 1;
        let number = *total;
        *self.counts.entry((node_id.clone(), epoch)).or_insert(0) += 1;
        self.records.push(ExecutionRecord {
            node_id: node_id.clone(),
            epoch,
            execution_number: number,
            started_at: Utc::now(),
            ended_at: None,
            status: CompletionStatus::Running,
            output: None,
        });
        number
    }

    /// Record a node completion for its most recent open record.
    pub fn record_completion(
        &mut self,
        node_id: &NodeId,
        epoch: u64,
        status: CompletionStatus,
        output: Option<Arc<Envelope>>,
    ) {
        if let Some(record) = self
            .records
            .iter_mut()
            .rev()
            .find(|r| &r.node_id == node_id && r.epoch == epoch && r.ended_at.is_none())
        {
            record.ended_at = Some(Utc::now());
            record.status = status;
            record.output = output;
        }
    }

    /// Invocations of `node_id` at `epoch`.
    pub fn execution_count(&self, node_id: &NodeId, epoch: u64) -> u32 {
        self.counts
            .get(&(node_id.clone(), epoch))
            .copied()
            .unwrap_or(0)
    }

    /// Invocations of `node_id` across all epochs.
    pub fn total_count(&self, node_id: &NodeId) -> u32 {
        self.totals.get(node_id).copied().unwrap_or(0)
    }

    /// Most recent recorded output of `node_id`.
    pub fn last_output(&self, node_id: &NodeId) -> Option<&Arc<Envelope>> {
        self.records
            .iter()
            .rev()
            .filter(|r| &r.node_id == node_id)
            .find_map(|r| r.output.as_ref())
    }

    /// Full record timeline in start order.
    pub fn timeline(&self) -> &[ExecutionRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Runtime status map with transition validation.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct RuntimeState {
    status: BTreeMap<NodeId, NodeStatus>,
}

impl RuntimeState {
    pub fn new(nodes: impl IntoIterator<Item = NodeId>) -> Self {
        Self {
            status: nodes
                .into_iter()
                .map(|n| (n, NodeStatus::Pending))
                .collect(),
        }
    }

    pub fn status(&self, node_id: &NodeId) -> NodeStatus {
        self.status
            .get(node_id)
            .copied()
            .unwrap_or(NodeStatus::Pending)
    }

    /// Apply a transition; invalid transitions are internal errors, fatal
    /// to the execution.
    pub fn transition(&mut self, node_id: &NodeId, to: NodeStatus) -> Result<()> {
        let from = self.status(node_id);
        if !from.can_transition_to(to) {
            return Err(Error::execution(format!(
                "invalid status transition for node {node_id}: {from:?} -> {to:?}"
            )));
        }
        self.status.insert(node_id.clone(), to);
        Ok(())
    }

    pub fn all(&self) -> &BTreeMap<NodeId, NodeStatus> {
        &self.status
    }
}

/// Derived observer projection of one node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeProjection {
    pub node_id: NodeId,
    pub status: NodeStatus,
    pub executions: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_ended_at: Option<DateTime<Utc>>,
}

/// Combined history + runtime view for observers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UiSnapshot {
    pub nodes: Vec<NodeProjection>,
    pub total_executions: usize,
}

/// Per-execution state tracker bundling the three sub-stores.
#[derive(Debug, Default)]
pub struct StateTracker {
    pub history: ExecutionHistory,
    pub runtime: RuntimeState,
}

impl StateTracker {
    pub fn new(nodes: impl IntoIterator<Item = NodeId>) -> Self {
        Self {
            history: ExecutionHistory::new(),
            runtime: RuntimeState::new(nodes),
        }
    }

    /// Build the derived UI projection.
    pub fn ui_snapshot(&self) -> UiSnapshot {
        let nodes = self
            .runtime
            .all()
            .iter()
            .map(|(id, status)| NodeProjection {
                node_id: id.clone(),
                status: *status,
                executions: self.history.total_count(id),
                last_ended_at: self
                    .history
                    .timeline()
                    .iter()
                    .rev()
                    .filter(|r| &r.node_id == id)
                    .find_map(|r| r.ended_at),
            })
            .collect();
        UiSnapshot {
            nodes,
            total_executions: self.history.len(),
        }
    }
}

//! Token-driven scheduler.
//!
//! Drives execution by token flow: nodes become candidates when a token
//! arrives on an incoming edge, readiness is evaluated per `(node, epoch)`
//! against the node's join policy, and dispatch order is FIFO with ties
//! among simultaneously ready nodes broken by the compile-time topological
//! hint and then NodeId order.
//!
//! Edge filtering before join evaluation:
//! 1. Start-sourced edges are required only until the target has executed;
//!    loops re-fire from loop-back edges only.
//! 2. Conditional branch edges (skippable ones included) are normally not
//!    required - unless they are the only incoming edges left, in which
//!    case they become required again so a node never fires with zero
//!    dependencies on a loop iteration.
//! 3. Once a condition evaluates at an epoch, its inactive branch edges are
//!    treated as satisfied for that epoch and never block or fire the
//!    target.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::Arc;

use tracing::trace;

use crate::domain::{
    ExecutableDiagram, ExecutableEdge, HandleLabel, IterationScope, JoinPolicy, NodeKind,
};
use crate::envelope::{ContentType, Envelope};
use crate::state::ExecutionHistory;
use crate::types::{EdgeId, NodeId};

use super::tokens::TokenStore;

/// A token consumed from an incoming edge.
#[derive(Debug, Clone)]
pub struct ConsumedToken {
    pub edge: ExecutableEdge,
    pub seq: u64,
    pub envelope: Arc<Envelope>,
}

/// A token published on an outgoing edge.
#[derive(Debug, Clone)]
pub struct PublishedToken {
    pub edge_id: EdgeId,
    pub epoch: u64,
    pub seq: u64,
    pub content_type: ContentType,
    pub target: NodeId,
}

/// Per-execution scheduling state. Owned by the driver task; plain struct
/// called via `&mut self`, not an actor.
#[derive(Debug)]
pub struct Scheduler {
    diagram: Arc<ExecutableDiagram>,
    tokens: TokenStore,
    /// Nodes with at least one fresh token, keyed by (epoch, node).
    candidates: BTreeSet<(u64, NodeId)>,
    /// Ready nodes awaiting dispatch, FIFO.
    ready: VecDeque<(NodeId, u64)>,
    /// Nodes currently queued or running, to avoid double dispatch.
    held: HashSet<(NodeId, u64)>,
    /// Active branch per evaluated condition and epoch.
    branch_taken: HashMap<(NodeId, u64), HandleLabel>,
    current_epoch: u64,
}

impl Scheduler {
    pub fn new(diagram: Arc<ExecutableDiagram>) -> Self {
        Self {
            diagram,
            tokens: TokenStore::new(),
            candidates: BTreeSet::new(),
            ready: VecDeque::new(),
            held: HashSet::new(),
            branch_taken: HashMap::new(),
            current_epoch: 0,
        }
    }

    pub fn current_epoch(&self) -> u64 {
        self.current_epoch
    }

    /// Make every start node a candidate at epoch 0 (the synthetic token on
    /// its virtual incoming edge).
    pub fn seed_start(&mut self) {
        for node in self.diagram.start_nodes.clone() {
            self.candidates.insert((0, node));
        }
    }

    /// Evaluate candidates and move newly ready nodes into the FIFO.
    /// The wake-up path is O(incoming degree) per candidate.
    pub fn refill_ready(&mut self, history: &ExecutionHistory) {
        let mut newly_ready: Vec<(u64, usize, NodeId)> = Vec::new();
        let candidates: Vec<(u64, NodeId)> = self.candidates.iter().cloned().collect();
        for (epoch, node) in candidates {
            if self.held.contains(&(node.clone(), epoch)) {
                continue;
            }
            if self.is_ready(&node, epoch, history) {
                self.candidates.remove(&(epoch, node.clone()));
                self.held.insert((node.clone(), epoch));
                newly_ready.push((epoch, self.diagram.rank(&node), node));
            }
        }
        // Simultaneously ready: topological hint, then NodeId order.
        newly_ready.sort();
        for (epoch, _, node) in newly_ready {
            trace!(node = %node, epoch, "node ready");
            self.ready.push_back((node, epoch));
        }
    }

    /// Pop the next ready node in FIFO order.
    pub fn pop_ready(&mut self) -> Option<(NodeId, u64)> {
        self.ready.pop_front()
    }

    /// Release a node after completion or failure so that later tokens can
    /// schedule it again.
    pub fn release(&mut self, node: &NodeId, epoch: u64) {
        self.held.remove(&(node.clone(), epoch));
    }

    /// Record the active branch of an evaluated condition.
    pub fn record_branch(&mut self, node: &NodeId, epoch: u64, label: HandleLabel) {
        self.branch_taken.insert((node.clone(), epoch), label);
    }

    /// Atomically remove the earliest token from each incoming edge holding
    /// one at `epoch`, keyed for input resolution by target label.
    pub fn consume_inbound(&mut self, node: &NodeId, epoch: u64) -> Vec<ConsumedToken> {
        let edges: Vec<ExecutableEdge> = self
            .diagram
            .incoming_edges(node)
            .cloned()
            .collect();
        let mut consumed = Vec::new();
        for edge in edges {
            if let Some(token) = self.tokens.consume_earliest(&edge.id, epoch) {
                consumed.push(ConsumedToken {
                    edge,
                    seq: token.seq,
                    envelope: token.envelope,
                });
            }
        }
        consumed
    }

    /// Publish a node's outputs as tokens: one token per outgoing edge whose
    /// source label matches an emitted output.
    ///
    /// A loop-back token targeting a node that already executed at the
    /// current epoch advances the epoch first when the target declares
    /// per-epoch iteration semantics; under cumulative semantics the loop
    /// re-fires within the same epoch and the counters keep accumulating.
    pub fn publish_outputs(
        &mut self,
        node: &NodeId,
        node_epoch: u64,
        outputs: &[(HandleLabel, Arc<Envelope>)],
        history: &ExecutionHistory,
    ) -> Vec<PublishedToken> {
        let edges: Vec<ExecutableEdge> = self
            .diagram
            .outgoing_edges(node)
            .cloned()
            .collect();
        let mut published = Vec::new();
        for edge in edges {
            let Some((_, envelope)) = outputs.iter().find(|(label, _)| label == &edge.source_label)
            else {
                continue;
            };

            let mut epoch = node_epoch;
            if edge.is_loopback
                && history.execution_count(&edge.target_node, self.current_epoch) > 0
                && self.target_scope(&edge.target_node) == IterationScope::PerEpoch
            {
                self.current_epoch += 1;
                epoch = self.current_epoch;
            }

            let token = self.tokens.publish(&edge.id, epoch, Arc::clone(envelope));
            self.candidates.insert((epoch, edge.target_node.clone()));
            published.push(PublishedToken {
                edge_id: edge.id.clone(),
                epoch,
                seq: token.seq,
                content_type: envelope.content_type(),
                target: edge.target_node.clone(),
            });
        }
        published
    }

    /// Whether any ready or potentially ready work remains.
    pub fn has_ready_work(&mut self, history: &ExecutionHistory) -> bool {
        if !self.ready.is_empty() {
            return true;
        }
        self.refill_ready(history);
        !self.ready.is_empty()
    }

    pub fn pending_tokens(&self) -> usize {
        self.tokens.pending_total()
    }

    fn target_scope(&self, node: &NodeId) -> IterationScope {
        match self.diagram.node(node).map(|n| &n.kind) {
            Some(NodeKind::PersonJob(p)) => p.max_iteration_scope,
            _ => IterationScope::Cumulative,
        }
    }

    /// Join-policy evaluation with the three edge-filtering rules.
    fn is_ready(&self, node: &NodeId, epoch: u64, history: &ExecutionHistory) -> bool {
        let Some(executable) = self.diagram.node(node) else {
            return false;
        };

        // Start nodes have no incoming edges and execute exactly once.
        if executable.is_start() {
            return history.total_count(node) == 0;
        }

        let in_edges: Vec<&ExecutableEdge> = self.diagram.incoming_edges(node).collect();
        if in_edges.is_empty() {
            return false;
        }

        let inactive_branch = |edge: &ExecutableEdge| {
            edge.source_label.is_condition_branch()
                && self
                    .branch_taken
                    .get(&(edge.source_node.clone(), epoch))
                    .map(|taken| taken != &edge.source_label)
                    .unwrap_or(false)
        };
        let start_satisfied = |edge: &ExecutableEdge| {
            self.diagram
                .node(&edge.source_node)
                .map(|n| n.is_start())
                .unwrap_or(false)
                && history.total_count(node) > 0
        };
        let conditional = |edge: &ExecutableEdge| edge.source_label.is_condition_branch();

        let mut required: Vec<&ExecutableEdge> = in_edges
            .iter()
            .copied()
            .filter(|e| !start_satisfied(e) && !conditional(e))
            .collect();

        // Conditional-becomes-required: with no other dependencies left,
        // the branch edges are the only way this node may fire again,
        // excluding branches already decided against at this epoch.
        if required.is_empty() {
            required = in_edges
                .iter()
                .copied()
                .filter(|e| conditional(e) && !inactive_branch(e))
                .collect();
        }
        if required.is_empty() {
            return false;
        }

        let with_token = required
            .iter()
            .filter(|e| self.tokens.has_token(&e.id, epoch))
            .count();

        match executable.base.join_policy {
            JoinPolicy::All => with_token == required.len(),
            JoinPolicy::Any => with_token >= 1,
            JoinPolicy::KOfN(k) => with_token >= k,
        }
    }
}

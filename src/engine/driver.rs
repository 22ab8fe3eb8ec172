//! Per-execution driver task.
//!
//! One owning task per execution mutates scheduling state; handler
//! invocations run as parallel tasks in a `JoinSet` bounded by the
//! configured concurrency. The loop dispatches ready nodes, waits for
//! completions, publishes output tokens, and finishes when no handler is
//! in flight, nothing is ready, and no tokens remain.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;

use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::domain::{ExecutableDiagram, ExecutableNode, HandleLabel, IterationScope, NodeKind};
use crate::envelope::Envelope;
use crate::events::{EnvelopeSummary, EventKind, ExecutionSummary};
use crate::handlers::NodeOutput;
use crate::person::Conversation;
use crate::state::{CompletionStatus, NodeStatus, StateTracker};
use crate::types::{Error, ExecutionId, NodeId, Result};

use super::context::{ExecutionContext, InteractionHub, NodeTask};
use super::resolver::resolve_inputs;
use super::scheduler::{ConsumedToken, Scheduler};
use super::{Engine, ExecutionOutcome, ExecutionStatus};

/// Message from a handler task back to the driver.
enum TaskMsg {
    Done {
        node_id: NodeId,
        epoch: u64,
        execution_number: u32,
        result: Result<NodeOutput>,
    },
    RetryDue {
        node_id: NodeId,
        epoch: u64,
    },
}

#[allow(clippy::too_many_arguments)]
pub(super) async fn run_execution(
    engine: Engine,
    diagram: Arc<ExecutableDiagram>,
    execution_id: ExecutionId,
    variables: Value,
    cancel: CancellationToken,
    done_tx: watch::Sender<Option<ExecutionOutcome>>,
    state: Arc<RwLock<StateTracker>>,
    interactions: Arc<InteractionHub>,
    depth: u32,
) {
    let bus = engine.bus();
    bus.register_execution(execution_id.clone(), None);
    bus.publish(
        &execution_id,
        EventKind::ExecutionStarted {
            diagram_id: diagram.id.clone(),
            variables: variables.clone(),
        },
    );

    let ctx = ExecutionContext {
        execution_id: execution_id.clone(),
        diagram: Arc::clone(&diagram),
        config: Arc::new(engine.config().clone()),
        ports: engine.ports(),
        conversation: Arc::new(Mutex::new(Conversation::new())),
        state: Arc::clone(&state),
        cancel: cancel.clone(),
        engine: engine.clone(),
        interactions,
        variables,
        templates: engine.templates(),
        depth,
    };

    let mut driver = Driver {
        engine,
        diagram,
        execution_id: execution_id.clone(),
        ctx,
        state,
        scheduler: None,
        tasks: JoinSet::new(),
        in_flight: 0,
        retries: HashMap::new(),
        buffered_inputs: HashMap::new(),
        final_outputs: BTreeMap::new(),
        failure: None,
        started: Instant::now(),
    };

    let outcome = driver.run(cancel).await;
    driver.engine.bus().close_execution(&execution_id);
    let _ = done_tx.send(Some(outcome));
}

struct Driver {
    engine: Engine,
    diagram: Arc<ExecutableDiagram>,
    execution_id: ExecutionId,
    ctx: ExecutionContext,
    state: Arc<RwLock<StateTracker>>,
    scheduler: Option<Scheduler>,
    tasks: JoinSet<TaskMsg>,
    in_flight: usize,
    retries: HashMap<(NodeId, u64), u32>,
    buffered_inputs: HashMap<(NodeId, u64), Vec<ConsumedToken>>,
    final_outputs: BTreeMap<NodeId, Value>,
    failure: Option<String>,
    started: Instant,
}

impl Driver {
    async fn run(&mut self, cancel: CancellationToken) -> ExecutionOutcome {
        let mut scheduler = Scheduler::new(Arc::clone(&self.diagram));
        scheduler.seed_start();
        self.scheduler = Some(scheduler);

        let mut cancelled = false;

        loop {
            if !cancelled && self.failure.is_none() {
                self.dispatch_ready();
            }

            if self.in_flight == 0 {
                if cancelled || cancel.is_cancelled() {
                    cancelled = true;
                    break;
                }
                if self.failure.is_some() {
                    break;
                }
                if !self.has_more_work() {
                    break;
                }
                // Work exists but nothing dispatched: capacity is free, so
                // this means readiness changed between checks; loop again.
                continue;
            }

            tokio::select! {
                _ = cancel.cancelled(), if !cancelled => {
                    cancelled = true;
                    debug!(execution_id = %self.execution_id, "cancellation observed");
                    self.drain_with_grace().await;
                }
                joined = self.tasks.join_next() => {
                    let Some(joined) = joined else {
                        self.in_flight = 0;
                        continue;
                    };
                    self.in_flight = self.in_flight.saturating_sub(1);
                    match joined {
                        Ok(msg) => self.handle_task_msg(msg, cancelled),
                        Err(join_err) => {
                            if !join_err.is_cancelled() {
                                error!(execution_id = %self.execution_id, error = %join_err, "handler task panicked");
                                self.failure = Some(format!("internal: handler task failed: {join_err}"));
                            }
                        }
                    }
                }
            }
        }

        self.finalize(cancelled)
    }

    fn scheduler(&mut self) -> &mut Scheduler {
        #[allow(clippy::expect_used)] // set at the top of run()
        self.scheduler.as_mut().expect("scheduler initialised")
    }

    fn has_more_work(&mut self) -> bool {
        let state = Arc::clone(&self.state);
        #[allow(clippy::unwrap_used)] // lock poisoning is unrecoverable
        let guard = state.read().unwrap();
        self.scheduler
            .as_mut()
            .map(|s| s.has_ready_work(&guard.history))
            .unwrap_or(false)
    }

    /// Dispatch ready nodes up to the concurrency budget.
    fn dispatch_ready(&mut self) {
        let capacity = self.ctx.config.max_concurrent_nodes;
        loop {
            if self.in_flight >= capacity {
                return;
            }
            let next = {
                let state = Arc::clone(&self.state);
                #[allow(clippy::unwrap_used)] // lock poisoning is unrecoverable
                let guard = state.read().unwrap();
                let scheduler = self.scheduler();
                scheduler.refill_ready(&guard.history);
                scheduler.pop_ready()
            };
            let Some((node_id, epoch)) = next else { return };
            self.dispatch(node_id, epoch, None);
            if self.failure.is_some() {
                return;
            }
        }
    }

    /// Consume inputs (or reuse retry-buffered ones) and spawn the handler.
    fn dispatch(&mut self, node_id: NodeId, epoch: u64, retry_inputs: Option<Vec<ConsumedToken>>) {
        let Some(node) = self.diagram.node(&node_id).cloned() else {
            self.failure = Some(format!("internal: unknown node {node_id}"));
            return;
        };

        let consumed = match retry_inputs {
            Some(inputs) => inputs,
            None => {
                let consumed = self.scheduler().consume_inbound(&node_id, epoch);
                for token in &consumed {
                    self.emit(EventKind::TokenConsumed {
                        edge_id: token.edge.id.clone(),
                        epoch,
                        seq: token.seq,
                    });
                }
                consumed
            }
        };

        // Person jobs stop silently once their iteration bound is reached;
        // downstream conditions observe it via detect_max_iterations.
        if let NodeKind::PersonJob(person) = &node.kind {
            let count = self.iteration_count(&node_id, epoch, person.max_iteration_scope);
            if count >= person.max_iteration {
                debug!(node_id = %node_id, count, "max_iteration reached");
                #[allow(clippy::unwrap_used)] // lock poisoning is unrecoverable
                let mut state = self.state.write().unwrap();
                if let Err(err) = state.runtime.transition(&node_id, NodeStatus::MaxiterReached) {
                    drop(state);
                    self.internal_failure(err);
                    return;
                }
                drop(state);
                self.scheduler().release(&node_id, epoch);
                return;
            }
        }

        let execution_number = {
            #[allow(clippy::unwrap_used)] // lock poisoning is unrecoverable
            let mut state = self.state.write().unwrap();
            if let Err(err) = state.runtime.transition(&node_id, NodeStatus::Running) {
                drop(state);
                self.internal_failure(err);
                return;
            }
            state.history.record_start(&node_id, epoch)
        };

        self.emit(EventKind::NodeStarted {
            node_id: node_id.clone(),
            epoch,
            execution_number,
        });

        self.buffered_inputs
            .insert((node_id.clone(), epoch), consumed.clone());

        let ctx = self.ctx.clone();
        let registry = self.engine.registry();
        let task = NodeTask {
            node_id: node_id.clone(),
            epoch,
            execution_number,
        };
        self.in_flight += 1;
        self.tasks.spawn(async move {
            let result = run_handler(&registry, &node, consumed, &ctx, &task).await;
            TaskMsg::Done {
                node_id: task.node_id,
                epoch: task.epoch,
                execution_number: task.execution_number,
                result,
            }
        });
    }

    fn handle_task_msg(&mut self, msg: TaskMsg, cancelled: bool) {
        match msg {
            TaskMsg::RetryDue { node_id, epoch } => {
                if cancelled || self.failure.is_some() {
                    self.buffered_inputs.remove(&(node_id.clone(), epoch));
                    self.scheduler().release(&node_id, epoch);
                    return;
                }
                let inputs = self
                    .buffered_inputs
                    .remove(&(node_id.clone(), epoch))
                    .unwrap_or_default();
                self.dispatch(node_id, epoch, Some(inputs));
            }
            TaskMsg::Done {
                node_id,
                epoch,
                execution_number,
                result,
            } => match result {
                Ok(output) => self.complete_node(node_id, epoch, execution_number, output),
                Err(err) => self.fail_node(node_id, epoch, execution_number, err, cancelled),
            },
        }
    }

    fn complete_node(
        &mut self,
        node_id: NodeId,
        epoch: u64,
        execution_number: u32,
        output: NodeOutput,
    ) {
        let primary = output.primary().cloned().map(Arc::new);

        {
            #[allow(clippy::unwrap_used)] // lock poisoning is unrecoverable
            let mut state = self.state.write().unwrap();
            state.history.record_completion(
                &node_id,
                epoch,
                CompletionStatus::Completed,
                primary.clone(),
            );
            if let Err(err) = state.runtime.transition(&node_id, NodeStatus::Completed) {
                drop(state);
                self.internal_failure(err);
                return;
            }
        }

        self.emit(EventKind::NodeCompleted {
            node_id: node_id.clone(),
            epoch,
            execution_number,
            envelope_summary: primary.as_deref().map(EnvelopeSummary::of),
        });

        if let Some(value) = output.final_value {
            self.final_outputs.insert(node_id.clone(), value);
        }

        // Conditions report the taken branch through their single output.
        let is_condition = self
            .diagram
            .node(&node_id)
            .map(ExecutableNode::is_condition)
            .unwrap_or(false);
        if is_condition {
            if let Some(label) = output.outputs.first().map(|(label, _)| label.clone()) {
                self.scheduler().record_branch(&node_id, epoch, label);
            }
        }

        let outputs: Vec<(HandleLabel, Arc<Envelope>)> = output
            .outputs
            .into_iter()
            .map(|(label, envelope)| (label, Arc::new(envelope)))
            .collect();

        let published = {
            let state = Arc::clone(&self.state);
            #[allow(clippy::unwrap_used)] // lock poisoning is unrecoverable
            let guard = state.read().unwrap();
            self.scheduler
                .as_mut()
                .map(|s| s.publish_outputs(&node_id, epoch, &outputs, &guard.history))
                .unwrap_or_default()
        };
        for token in published {
            self.emit(EventKind::TokenPublished {
                edge_id: token.edge_id,
                epoch: token.epoch,
                seq: token.seq,
                content_type: token.content_type,
            });
        }

        self.retries.remove(&(node_id.clone(), epoch));
        self.buffered_inputs.remove(&(node_id.clone(), epoch));
        self.scheduler().release(&node_id, epoch);
    }

    fn fail_node(
        &mut self,
        node_id: NodeId,
        epoch: u64,
        execution_number: u32,
        err: Error,
        cancelled: bool,
    ) {
        let node = self.diagram.node(&node_id).cloned();
        let retryable = node.as_ref().map(|n| n.base.retryable).unwrap_or(false);
        let max_retries = node.as_ref().map(|n| n.base.max_retries).unwrap_or(0);
        // A handler observing cancellation is not a node failure; the
        // cancellation branch terminates the execution.
        let is_cancel = matches!(err, Error::Cancelled(_));

        {
            #[allow(clippy::unwrap_used)] // lock poisoning is unrecoverable
            let mut state = self.state.write().unwrap();
            state
                .history
                .record_completion(&node_id, epoch, CompletionStatus::Failed, None);
        }

        let attempts = self
            .retries
            .entry((node_id.clone(), epoch))
            .or_insert(0);

        if !cancelled && retryable && err.is_transient() && *attempts < max_retries {
            *attempts += 1;
            let attempt = *attempts;
            let base = self.ctx.config.retry_backoff_base;
            let cap = self.ctx.config.retry_backoff_cap;
            let delay = base
                .saturating_mul(1u32 << (attempt - 1).min(16))
                .min(cap);
            warn!(
                node_id = %node_id,
                attempt,
                ?delay,
                error = %err,
                "transient handler failure, scheduling retry"
            );
            let retry_node = node_id.clone();
            self.in_flight += 1;
            self.tasks.spawn(async move {
                tokio::time::sleep(delay).await;
                TaskMsg::RetryDue {
                    node_id: retry_node,
                    epoch,
                }
            });
            return;
        }

        {
            #[allow(clippy::unwrap_used)] // lock poisoning is unrecoverable
            let mut state = self.state.write().unwrap();
            if let Err(transition_err) = state.runtime.transition(&node_id, NodeStatus::Failed) {
                warn!(node_id = %node_id, error = %transition_err, "status transition after failure");
            }
        }

        self.emit(EventKind::NodeFailed {
            node_id: node_id.clone(),
            epoch,
            execution_number,
            error_kind: err.kind().to_string(),
            message: err.to_string(),
        });

        self.buffered_inputs.remove(&(node_id.clone(), epoch));
        self.scheduler().release(&node_id, epoch);

        if !cancelled && !is_cancel && self.failure.is_none() {
            self.failure = Some(format!("node {node_id} failed: {err}"));
        }
    }

    /// Cancellation: let in-flight handlers run out within the grace
    /// period, then abandon them.
    async fn drain_with_grace(&mut self) {
        let grace = self.ctx.config.handler_cancel_grace;
        let deadline = tokio::time::sleep(grace);
        tokio::pin!(deadline);
        while self.in_flight > 0 {
            tokio::select! {
                _ = &mut deadline => {
                    warn!(execution_id = %self.execution_id, "grace period expired, abandoning handlers");
                    self.tasks.abort_all();
                    while self.tasks.join_next().await.is_some() {}
                    self.in_flight = 0;
                    break;
                }
                joined = self.tasks.join_next() => {
                    let Some(joined) = joined else { break };
                    self.in_flight = self.in_flight.saturating_sub(1);
                    if let Ok(msg) = joined {
                        self.handle_task_msg(msg, true);
                    }
                }
            }
        }
    }

    fn finalize(&mut self, cancelled: bool) -> ExecutionOutcome {
        let pending = self
            .scheduler
            .as_ref()
            .map(|s| s.pending_tokens())
            .unwrap_or(0);
        if pending > 0 {
            warn!(
                execution_id = %self.execution_id,
                pending,
                "execution finished with undrained tokens"
            );
        }

        let (status, reason) = if cancelled {
            (ExecutionStatus::Cancelled, Some("cancelled".to_string()))
        } else if let Some(reason) = self.failure.take() {
            (ExecutionStatus::Failed, Some(reason))
        } else {
            (ExecutionStatus::Completed, None)
        };

        match status {
            ExecutionStatus::Completed => {
                // Terminal sweep: nodes that never ran are skipped.
                #[allow(clippy::unwrap_used)] // lock poisoning is unrecoverable
                let mut state = self.state.write().unwrap();
                let pending_nodes: Vec<NodeId> = state
                    .runtime
                    .all()
                    .iter()
                    .filter(|(_, s)| **s == NodeStatus::Pending)
                    .map(|(n, _)| n.clone())
                    .collect();
                for node in pending_nodes {
                    let _ = state.runtime.transition(&node, NodeStatus::Skipped);
                }
                let summary = ExecutionSummary {
                    node_executions: state.history.len(),
                    duration_ms: self.started.elapsed().as_millis() as u64,
                };
                drop(state);
                self.emit(EventKind::ExecutionCompleted { summary });
            }
            ExecutionStatus::Failed | ExecutionStatus::Cancelled => {
                self.emit(EventKind::ExecutionFailed {
                    reason: reason.clone().unwrap_or_else(|| "unknown".to_string()),
                });
            }
        }

        let history = {
            #[allow(clippy::unwrap_used)] // lock poisoning is unrecoverable
            let state = self.state.read().unwrap();
            state.history.timeline().to_vec()
        };

        debug!(execution_id = %self.execution_id, ?status, "execution finished");
        ExecutionOutcome {
            status,
            reason,
            history,
            final_outputs: std::mem::take(&mut self.final_outputs),
        }
    }

    fn iteration_count(&self, node_id: &NodeId, epoch: u64, scope: IterationScope) -> u32 {
        #[allow(clippy::unwrap_used)] // lock poisoning is unrecoverable
        let state = self.state.read().unwrap();
        match scope {
            IterationScope::Cumulative => state.history.total_count(node_id),
            IterationScope::PerEpoch => state.history.execution_count(node_id, epoch),
        }
    }

    fn internal_failure(&mut self, err: Error) {
        error!(execution_id = %self.execution_id, error = %err, "internal execution error");
        if self.failure.is_none() {
            self.failure = Some(format!("internal: {err}"));
        }
    }

    fn emit(&self, kind: EventKind) {
        self.engine.bus().publish(&self.execution_id, kind);
    }
}

/// Resolve inputs, run the handler with timeout and cancellation, and apply
/// the error-envelope conversion when the node has an `error` output edge.
async fn run_handler(
    registry: &crate::handlers::HandlerRegistry,
    node: &ExecutableNode,
    consumed: Vec<ConsumedToken>,
    ctx: &ExecutionContext,
    task: &NodeTask,
) -> Result<NodeOutput> {
    let handler = registry
        .get(node.node_type())
        .ok_or_else(|| Error::execution(format!("no handler for {}", node.node_type())))?;

    let inputs = resolve_inputs(
        node,
        &consumed,
        ctx.config.strict_envelopes,
        &ctx.execution_id,
    )?;
    let inputs = handler.prepare_inputs(node, inputs, ctx)?;

    let outcome = tokio::select! {
        _ = ctx.cancel.cancelled() => Err(Error::cancelled("execution cancelled")),
        result = tokio::time::timeout(node.base.timeout, handler.execute(node, inputs, ctx, task)) => {
            match result {
                Ok(inner) => inner,
                Err(_) => Err(Error::Timeout(node.base.timeout)),
            }
        }
    };

    match outcome {
        Ok(output) => Ok(handler.post_execute(output, node, ctx)),
        Err(err) => {
            let has_error_edge = ctx
                .diagram
                .outgoing_edges(node.id())
                .any(|e| e.source_label == HandleLabel::Error);
            if has_error_edge && !matches!(err, Error::Cancelled(_)) {
                if let Some(envelope) = handler.on_error(&err, node, ctx) {
                    return Ok(NodeOutput::labeled(HandleLabel::Error, envelope));
                }
            }
            Err(err)
        }
    }
}

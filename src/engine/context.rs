//! Per-execution context shared with handler tasks.
//!
//! The driver owns all scheduling state; handlers receive this context and
//! may only read state (reader side of the per-execution lock), append to
//! the conversation (single writer lock), call ports, and observe the
//! cancellation token.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use serde_json::Value;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::domain::ExecutableDiagram;
use crate::engine::template::TemplateCache;
use crate::engine::Engine;
use crate::person::Conversation;
use crate::ports::Ports;
use crate::state::StateTracker;
use crate::types::{EngineConfig, Error, ExecutionId, NodeId, Result};

/// Info about the specific node invocation a handler is running.
#[derive(Debug, Clone)]
pub struct NodeTask {
    pub node_id: NodeId,
    pub epoch: u64,
    pub execution_number: u32,
}

/// One pending human interaction raised by a user-response node.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct InteractionRequest {
    pub execution_id: ExecutionId,
    pub node_id: NodeId,
    pub prompt: String,
}

/// Raise-and-resolve hub for human-in-the-loop interactions.
#[derive(Debug, Default)]
pub struct InteractionHub {
    pending: Mutex<HashMap<NodeId, (InteractionRequest, oneshot::Sender<String>)>>,
}

impl InteractionHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a question; the returned receiver resolves when an answer
    /// arrives.
    pub fn ask(
        &self,
        execution_id: ExecutionId,
        node_id: NodeId,
        prompt: String,
    ) -> oneshot::Receiver<String> {
        let (tx, rx) = oneshot::channel();
        let request = InteractionRequest {
            execution_id,
            node_id: node_id.clone(),
            prompt,
        };
        self.lock().insert(node_id, (request, tx));
        rx
    }

    /// Answer a pending question.
    pub fn respond(&self, node_id: &NodeId, answer: String) -> Result<()> {
        match self.lock().remove(node_id) {
            Some((_, tx)) => {
                let _ = tx.send(answer);
                Ok(())
            }
            None => Err(Error::not_found(format!(
                "no pending interaction for node {node_id}"
            ))),
        }
    }

    /// Withdraw a question (timeout or cancellation).
    pub fn withdraw(&self, node_id: &NodeId) {
        self.lock().remove(node_id);
    }

    pub fn pending(&self) -> Vec<InteractionRequest> {
        self.lock().values().map(|(r, _)| r.clone()).collect()
    }

    #[allow(clippy::unwrap_used)] // lock poisoning is unrecoverable
    fn lock(
        &self,
    ) -> std::sync::MutexGuard<'_, HashMap<NodeId, (InteractionRequest, oneshot::Sender<String>)>>
    {
        self.pending.lock().unwrap()
    }
}

/// Shared per-execution context.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub execution_id: ExecutionId,
    pub diagram: Arc<ExecutableDiagram>,
    pub config: Arc<EngineConfig>,
    pub ports: Ports,
    pub conversation: Arc<Mutex<Conversation>>,
    pub state: Arc<RwLock<StateTracker>>,
    pub cancel: CancellationToken,
    pub engine: Engine,
    pub interactions: Arc<InteractionHub>,
    /// Initial run variables.
    pub variables: Value,
    pub templates: Arc<TemplateCache>,
    /// Sub-diagram nesting depth; 0 for top-level runs.
    pub depth: u32,
}

impl ExecutionContext {
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Read-side access to history and runtime state.
    pub fn with_state<T>(&self, f: impl FnOnce(&StateTracker) -> T) -> T {
        #[allow(clippy::unwrap_used)] // lock poisoning is unrecoverable
        let guard = self.state.read().unwrap();
        f(&guard)
    }

    /// Append to the global conversation under the single writer lock.
    pub fn with_conversation<T>(&self, f: impl FnOnce(&mut Conversation) -> T) -> T {
        #[allow(clippy::unwrap_used)] // lock poisoning is unrecoverable
        let mut guard = self.conversation.lock().unwrap();
        f(&mut guard)
    }
}

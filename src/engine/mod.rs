//! Execution engine.
//!
//! The engine owns the shared services (event bus, handler registry, ports,
//! diagram registry) and spawns one driver task per execution. The driver
//! is the single owner of scheduling state; handler tasks run concurrently
//! and suspend only on ports.

pub mod context;
mod driver;
pub mod resolver;
pub mod scheduler;
pub mod template;
pub mod tokens;

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, RwLock};

use serde_json::Value;
use tokio::sync::{watch, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::domain::ExecutableDiagram;
use crate::events::{BusError, EventBus, Subscription};
use crate::handlers::HandlerRegistry;
use crate::ports::Ports;
use crate::state::{ExecutionRecord, StateTracker, UiSnapshot};
use crate::types::{EngineConfig, Error, ExecutionId, NodeId, Result};

pub use context::{ExecutionContext, InteractionHub, InteractionRequest, NodeTask};
pub use resolver::{resolve_inputs, ResolvedInputs};
pub use scheduler::{ConsumedToken, PublishedToken, Scheduler};
pub use template::TemplateCache;
pub use tokens::{Token, TokenStore};

/// Terminal status of an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Completed,
    Failed,
    Cancelled,
}

/// Terminal result of one execution.
#[derive(Debug, Clone)]
pub struct ExecutionOutcome {
    pub status: ExecutionStatus,
    pub reason: Option<String>,
    pub history: Vec<ExecutionRecord>,
    /// Per endpoint node, the JSON projection of the inputs it consumed.
    pub final_outputs: BTreeMap<NodeId, Value>,
}

struct ExecutionHandle {
    cancel: CancellationToken,
    done: watch::Receiver<Option<ExecutionOutcome>>,
    interactions: Arc<InteractionHub>,
    state: Arc<RwLock<StateTracker>>,
}

struct EngineInner {
    config: Arc<EngineConfig>,
    bus: Arc<EventBus>,
    registry: Arc<HandlerRegistry>,
    ports: Ports,
    diagrams: RwLock<HashMap<String, Arc<ExecutableDiagram>>>,
    executions: Mutex<HashMap<ExecutionId, ExecutionHandle>>,
    /// Bounds concurrent child diagrams across the process.
    child_permits: Arc<Semaphore>,
    templates: Arc<TemplateCache>,
}

/// The execution engine. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine").finish_non_exhaustive()
    }
}

impl Engine {
    pub fn new(config: EngineConfig, ports: Ports) -> Self {
        Self::with_registry(config, ports, HandlerRegistry::builtin())
    }

    /// Engine with a custom (frozen) handler registry.
    pub fn with_registry(
        config: EngineConfig,
        ports: Ports,
        registry: Arc<HandlerRegistry>,
    ) -> Self {
        let bus = EventBus::new(&config);
        let child_permits = Arc::new(Semaphore::new(config.sub_diagram_max_concurrent));
        let templates = Arc::new(TemplateCache::new(config.prompt_template_cache));
        Self {
            inner: Arc::new(EngineInner {
                config: Arc::new(config),
                bus,
                registry,
                ports,
                diagrams: RwLock::new(HashMap::new()),
                executions: Mutex::new(HashMap::new()),
                child_permits,
                templates,
            }),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn bus(&self) -> Arc<EventBus> {
        Arc::clone(&self.inner.bus)
    }

    pub(crate) fn registry(&self) -> Arc<HandlerRegistry> {
        Arc::clone(&self.inner.registry)
    }

    pub(crate) fn ports(&self) -> Ports {
        self.inner.ports.clone()
    }

    pub(crate) fn templates(&self) -> Arc<TemplateCache> {
        Arc::clone(&self.inner.templates)
    }

    /// Register a compiled diagram under a name for sub-diagram resolution.
    pub fn register_diagram(&self, name: impl Into<String>, diagram: Arc<ExecutableDiagram>) {
        #[allow(clippy::unwrap_used)] // lock poisoning is unrecoverable
        self.inner
            .diagrams
            .write()
            .unwrap()
            .insert(name.into(), diagram);
    }

    pub fn diagram(&self, name: &str) -> Option<Arc<ExecutableDiagram>> {
        #[allow(clippy::unwrap_used)] // lock poisoning is unrecoverable
        self.inner.diagrams.read().unwrap().get(name).map(Arc::clone)
    }

    /// Start an execution; returns immediately with its id.
    pub fn start(
        &self,
        diagram: Arc<ExecutableDiagram>,
        initial_inputs: Option<Value>,
    ) -> ExecutionId {
        self.start_internal(
            diagram,
            initial_inputs.unwrap_or_else(|| Value::Object(Default::default())),
            0,
            None,
        )
    }

    pub(crate) fn start_internal(
        &self,
        diagram: Arc<ExecutableDiagram>,
        variables: Value,
        depth: u32,
        parent_cancel: Option<&CancellationToken>,
    ) -> ExecutionId {
        let execution_id = ExecutionId::new();
        let cancel = parent_cancel
            .map(CancellationToken::child_token)
            .unwrap_or_default();
        let (done_tx, done_rx) = watch::channel(None);
        let interactions = Arc::new(InteractionHub::new());
        let state = Arc::new(RwLock::new(StateTracker::new(
            diagram.nodes.keys().cloned(),
        )));

        {
            #[allow(clippy::unwrap_used)] // lock poisoning is unrecoverable
            let mut executions = self.inner.executions.lock().unwrap();
            executions.insert(
                execution_id.clone(),
                ExecutionHandle {
                    cancel: cancel.clone(),
                    done: done_rx,
                    interactions: Arc::clone(&interactions),
                    state: Arc::clone(&state),
                },
            );
        }

        info!(execution_id = %execution_id, depth, "execution starting");
        tokio::spawn(driver::run_execution(
            self.clone(),
            diagram,
            execution_id.clone(),
            variables,
            cancel,
            done_tx,
            state,
            interactions,
            depth,
        ));
        execution_id
    }

    /// Wait for an execution's terminal outcome.
    pub async fn wait(&self, execution_id: &ExecutionId) -> Result<ExecutionOutcome> {
        let mut done = {
            #[allow(clippy::unwrap_used)] // lock poisoning is unrecoverable
            let executions = self.inner.executions.lock().unwrap();
            executions
                .get(execution_id)
                .map(|h| h.done.clone())
                .ok_or_else(|| Error::not_found(format!("unknown execution {execution_id}")))?
        };
        loop {
            {
                let value = done.borrow_and_update();
                if let Some(outcome) = value.as_ref() {
                    return Ok(outcome.clone());
                }
            }
            done.changed()
                .await
                .map_err(|_| Error::execution("driver task dropped without an outcome"))?;
        }
    }

    /// Start and wait.
    pub async fn run(
        &self,
        diagram: Arc<ExecutableDiagram>,
        initial_inputs: Option<Value>,
    ) -> Result<ExecutionOutcome> {
        let id = self.start(diagram, initial_inputs);
        self.wait(&id).await
    }

    /// Request cancellation. In-flight handlers get the configured grace
    /// period before being abandoned.
    pub fn cancel(&self, execution_id: &ExecutionId) -> Result<()> {
        #[allow(clippy::unwrap_used)] // lock poisoning is unrecoverable
        let executions = self.inner.executions.lock().unwrap();
        let handle = executions
            .get(execution_id)
            .ok_or_else(|| Error::not_found(format!("unknown execution {execution_id}")))?;
        handle.cancel.cancel();
        Ok(())
    }

    /// Answer a pending user-response interaction.
    pub fn respond(
        &self,
        execution_id: &ExecutionId,
        node_id: &NodeId,
        answer: impl Into<String>,
    ) -> Result<()> {
        let interactions = self.interactions(execution_id)?;
        interactions.respond(node_id, answer.into())
    }

    /// Pending user-response interactions for an execution.
    pub fn pending_interactions(
        &self,
        execution_id: &ExecutionId,
    ) -> Result<Vec<InteractionRequest>> {
        Ok(self.interactions(execution_id)?.pending())
    }

    /// Attach an event subscriber, optionally resuming from a sequence.
    pub fn subscribe(
        &self,
        execution_id: &ExecutionId,
        last_seq: Option<u64>,
    ) -> std::result::Result<Subscription, BusError> {
        self.inner.bus.subscribe(execution_id, last_seq)
    }

    /// Observer projection of history and runtime state.
    pub fn ui_snapshot(&self, execution_id: &ExecutionId) -> Result<UiSnapshot> {
        #[allow(clippy::unwrap_used)] // lock poisoning is unrecoverable
        let executions = self.inner.executions.lock().unwrap();
        let handle = executions
            .get(execution_id)
            .ok_or_else(|| Error::not_found(format!("unknown execution {execution_id}")))?;
        #[allow(clippy::unwrap_used)] // lock poisoning is unrecoverable
        let state = handle.state.read().unwrap();
        Ok(state.ui_snapshot())
    }

    /// Run a child diagram to completion, bounded by the process-wide
    /// child-diagram budget, and unwrap its terminal value.
    pub(crate) async fn run_child(
        &self,
        diagram: Arc<ExecutableDiagram>,
        variables: Value,
        depth: u32,
        parent_cancel: &CancellationToken,
    ) -> Result<Value> {
        let _permit = Arc::clone(&self.inner.child_permits)
            .acquire_owned()
            .await
            .map_err(|_| Error::execution("child diagram semaphore closed"))?;
        let id = self.start_internal(diagram, variables, depth, Some(parent_cancel));
        let outcome = self.wait(&id).await?;
        match outcome.status {
            ExecutionStatus::Completed => Ok(unwrap_final_outputs(outcome.final_outputs)),
            ExecutionStatus::Failed => Err(Error::permanent(
                outcome
                    .reason
                    .unwrap_or_else(|| "child diagram failed".to_string()),
            )),
            ExecutionStatus::Cancelled => Err(Error::cancelled("child diagram cancelled")),
        }
    }

    fn interactions(&self, execution_id: &ExecutionId) -> Result<Arc<InteractionHub>> {
        #[allow(clippy::unwrap_used)] // lock poisoning is unrecoverable
        let executions = self.inner.executions.lock().unwrap();
        executions
            .get(execution_id)
            .map(|h| Arc::clone(&h.interactions))
            .ok_or_else(|| Error::not_found(format!("unknown execution {execution_id}")))
    }
}

/// A child diagram's result: with a single endpoint binding a single label,
/// that body; otherwise the full projection.
fn unwrap_final_outputs(final_outputs: BTreeMap<NodeId, Value>) -> Value {
    let mut values: Vec<Value> = final_outputs.into_values().collect();
    if values.len() != 1 {
        return Value::Array(values);
    }
    let value = values.remove(0);
    match value {
        Value::Object(map) if map.len() == 1 => {
            map.into_iter().next().map(|(_, v)| v).unwrap_or(Value::Null)
        }
        other => other,
    }
}

//! Ordered, replayable event bus.
//!
//! Per execution the bus keeps a bounded ring of recent events and a list of
//! live subscribers with bounded outboxes. Publication assigns the sequence
//! under the per-execution mutex and is fire-and-forget: a slow subscriber
//! whose outbox overflows is detached with a backpressure signal and may
//! reattach later with its last-received sequence.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::types::{EngineConfig, ExecutionId};

use super::{Event, EventKind};

/// Subscriber-facing bus failures. These never affect the publisher.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BusError {
    #[error("unknown execution '{0}'")]
    UnknownExecution(ExecutionId),

    /// Requested events were already evicted from the ring. `oldest` is the
    /// oldest retained sequence.
    #[error("sequence gap: resume from {requested} but oldest retained is {oldest}")]
    Gap { requested: u64, oldest: u64 },
}

struct SubscriberEntry {
    sender: mpsc::Sender<Event>,
    detached: Arc<AtomicBool>,
}

struct ExecState {
    ring: VecDeque<Event>,
    ring_capacity: usize,
    next_seq: u64,
    subscribers: Vec<SubscriberEntry>,
    keepalive: Option<tokio::task::JoinHandle<()>>,
    closed: bool,
}

impl ExecState {
    fn current_max(&self) -> u64 {
        self.next_seq - 1
    }

    fn oldest_retained(&self) -> Option<u64> {
        self.ring.front().map(|e| e.seq)
    }
}

/// Per-execution sequenced event delivery with bounded replay.
pub struct EventBus {
    ring_default: usize,
    outbox_capacity: usize,
    keepalive_interval: Duration,
    executions: Mutex<HashMap<ExecutionId, ExecState>>,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("ring_default", &self.ring_default)
            .field("outbox_capacity", &self.outbox_capacity)
            .finish_non_exhaustive()
    }
}

impl EventBus {
    pub fn new(config: &EngineConfig) -> Arc<Self> {
        Arc::new(Self {
            ring_default: config.event_ring_max_len,
            outbox_capacity: config.subscriber_outbox_max,
            keepalive_interval: config.keepalive_interval,
            executions: Mutex::new(HashMap::new()),
        })
    }

    /// Register an execution stream, optionally overriding the ring size,
    /// and start its keepalive task.
    pub fn register_execution(
        self: &Arc<Self>,
        execution_id: ExecutionId,
        ring_capacity: Option<usize>,
    ) {
        let mut map = self.lock();
        if map.contains_key(&execution_id) {
            return;
        }

        let keepalive = {
            let bus = Arc::clone(self);
            let id = execution_id.clone();
            let interval = self.keepalive_interval;
            tokio::spawn(async move {
                loop {
                    tokio::time::sleep(interval).await;
                    if !bus.emit_keepalive(&id) {
                        break;
                    }
                }
            })
        };

        map.insert(
            execution_id,
            ExecState {
                ring: VecDeque::new(),
                ring_capacity: ring_capacity.unwrap_or(self.ring_default).max(1),
                next_seq: 1,
                subscribers: Vec::new(),
                keepalive: Some(keepalive),
                closed: false,
            },
        );
    }

    /// Publish an event. The sequence is assigned here, under the lock.
    /// Returns the assigned sequence; the only failure is an unknown
    /// execution.
    pub fn publish(&self, execution_id: &ExecutionId, kind: EventKind) -> Option<u64> {
        let mut map = self.lock();
        let state = match map.get_mut(execution_id) {
            Some(s) => s,
            None => {
                warn!(execution_id = %execution_id, "publish on unknown execution");
                return None;
            }
        };
        Some(Self::publish_locked(execution_id, state, kind))
    }

    fn publish_locked(execution_id: &ExecutionId, state: &mut ExecState, kind: EventKind) -> u64 {
        let seq = state.next_seq;
        state.next_seq += 1;

        let event = Event {
            execution_id: execution_id.clone(),
            seq,
            ts: Utc::now(),
            kind,
        };

        if state.ring.len() >= state.ring_capacity {
            state.ring.pop_front();
        }
        state.ring.push_back(event.clone());

        // Fan out without blocking; overflowing subscribers are detached.
        state.subscribers.retain(|sub| {
            match sub.sender.try_send(event.clone()) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    sub.detached.store(true, Ordering::Release);
                    warn!(
                        execution_id = %execution_id,
                        seq,
                        "subscriber outbox overflow, detaching"
                    );
                    false
                }
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            }
        });

        seq
    }

    fn emit_keepalive(&self, execution_id: &ExecutionId) -> bool {
        let mut map = self.lock();
        let Some(state) = map.get_mut(execution_id) else {
            return false;
        };
        if state.closed {
            return false;
        }
        let latest = state.current_max();
        Self::publish_locked(execution_id, state, EventKind::KeepAlive { latest_seq: latest });
        true
    }

    /// Attach a subscriber.
    ///
    /// With `last_seq`, all retained events with `seq > last_seq` are staged
    /// for delivery before any live event; if any needed event was already
    /// evicted the call fails with [`BusError::Gap`]. Without `last_seq`
    /// only events published after attachment are delivered.
    pub fn subscribe(
        &self,
        execution_id: &ExecutionId,
        last_seq: Option<u64>,
    ) -> Result<Subscription, BusError> {
        let mut map = self.lock();
        let state = map
            .get_mut(execution_id)
            .ok_or_else(|| BusError::UnknownExecution(execution_id.clone()))?;

        let backlog: VecDeque<Event> = match last_seq {
            None => VecDeque::new(),
            Some(last) => {
                let needed_from = last + 1;
                if state.current_max() >= needed_from {
                    match state.oldest_retained() {
                        Some(oldest) if oldest <= needed_from => state
                            .ring
                            .iter()
                            .filter(|e| e.seq > last)
                            .cloned()
                            .collect(),
                        retained => {
                            return Err(BusError::Gap {
                                requested: needed_from,
                                oldest: retained.unwrap_or(state.next_seq),
                            })
                        }
                    }
                } else {
                    VecDeque::new()
                }
            }
        };

        let (sender, receiver) = mpsc::channel(self.outbox_capacity);
        let detached = Arc::new(AtomicBool::new(false));
        if !state.closed {
            state.subscribers.push(SubscriberEntry {
                sender,
                detached: Arc::clone(&detached),
            });
        }
        debug!(
            execution_id = %execution_id,
            backlog = backlog.len(),
            "subscriber attached"
        );

        Ok(Subscription {
            backlog,
            receiver,
            detached,
        })
    }

    /// Stop the keepalive task and release live subscribers. The ring stays
    /// available for late replay subscribers.
    pub fn close_execution(&self, execution_id: &ExecutionId) {
        let mut map = self.lock();
        if let Some(state) = map.get_mut(execution_id) {
            state.closed = true;
            if let Some(task) = state.keepalive.take() {
                task.abort();
            }
            state.subscribers.clear();
        }
    }

    /// Drop all bus state for an execution.
    pub fn remove_execution(&self, execution_id: &ExecutionId) {
        let mut map = self.lock();
        if let Some(state) = map.remove(execution_id) {
            if let Some(task) = state.keepalive {
                task.abort();
            }
        }
    }

    /// Current max sequence, for observers.
    pub fn current_seq(&self, execution_id: &ExecutionId) -> Option<u64> {
        let map = self.lock();
        map.get(execution_id).map(|s| s.current_max())
    }

    #[allow(clippy::unwrap_used)] // lock poisoning is unrecoverable here
    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<ExecutionId, ExecState>> {
        self.executions.lock().unwrap()
    }
}

/// A subscriber's view of one execution's event stream.
///
/// Buffered replay events drain before live events. After a backpressure
/// detach, `recv` returns `None` and [`Subscription::was_detached`] reports
/// it; reattach via `subscribe` with the last received sequence.
#[derive(Debug)]
pub struct Subscription {
    backlog: VecDeque<Event>,
    receiver: mpsc::Receiver<Event>,
    detached: Arc<AtomicBool>,
}

impl Subscription {
    pub async fn recv(&mut self) -> Option<Event> {
        if let Some(event) = self.backlog.pop_front() {
            return Some(event);
        }
        self.receiver.recv().await
    }

    /// Non-blocking drain, used by observers that poll.
    pub fn try_recv(&mut self) -> Option<Event> {
        if let Some(event) = self.backlog.pop_front() {
            return Some(event);
        }
        self.receiver.try_recv().ok()
    }

    pub fn was_detached(&self) -> bool {
        self.detached.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_bus(ring: usize, outbox: usize) -> Arc<EventBus> {
        let mut config = EngineConfig::default();
        config.event_ring_max_len = ring;
        config.subscriber_outbox_max = outbox;
        config.keepalive_interval = Duration::from_secs(3600);
        EventBus::new(&config)
    }

    fn keepalive(n: u64) -> EventKind {
        EventKind::KeepAlive { latest_seq: n }
    }

    #[tokio::test]
    async fn sequences_start_at_one_and_are_monotonic() {
        let bus = test_bus(16, 8);
        let id = ExecutionId::from("e1");
        bus.register_execution(id.clone(), None);
        assert_eq!(bus.publish(&id, keepalive(0)), Some(1));
        assert_eq!(bus.publish(&id, keepalive(1)), Some(2));
        assert_eq!(bus.current_seq(&id), Some(2));
    }

    #[tokio::test]
    async fn replay_then_live_in_order() {
        let bus = test_bus(16, 8);
        let id = ExecutionId::from("e1");
        bus.register_execution(id.clone(), None);
        for i in 0..5 {
            bus.publish(&id, keepalive(i));
        }

        let mut sub = bus.subscribe(&id, Some(2)).unwrap();
        bus.publish(&id, keepalive(99));

        let seqs: Vec<u64> = {
            let mut v = Vec::new();
            for _ in 0..4 {
                v.push(sub.recv().await.unwrap().seq);
            }
            v
        };
        assert_eq!(seqs, vec![3, 4, 5, 6]);
    }

    #[tokio::test]
    async fn gap_error_when_ring_evicted() {
        let bus = test_bus(2, 8);
        let id = ExecutionId::from("e1");
        bus.register_execution(id.clone(), None);
        for i in 0..6 {
            bus.publish(&id, keepalive(i));
        }
        // Ring retains seq 5..=6; resuming from 2 needs 3.
        let err = bus.subscribe(&id, Some(2)).unwrap_err();
        assert!(matches!(err, BusError::Gap { requested: 3, oldest: 5 }));
    }

    #[tokio::test]
    async fn slow_subscriber_is_detached() {
        let bus = test_bus(64, 2);
        let id = ExecutionId::from("e1");
        bus.register_execution(id.clone(), None);
        let mut sub = bus.subscribe(&id, None).unwrap();
        for i in 0..5 {
            bus.publish(&id, keepalive(i));
        }
        // Outbox of 2 overflowed without a reader: subscriber detached
        // after receiving the buffered prefix.
        assert_eq!(sub.recv().await.unwrap().seq, 1);
        assert_eq!(sub.recv().await.unwrap().seq, 2);
        assert!(sub.recv().await.is_none());
        assert!(sub.was_detached());
    }

    #[tokio::test]
    async fn unknown_execution_errors() {
        let bus = test_bus(8, 8);
        let id = ExecutionId::from("missing");
        assert!(matches!(
            bus.subscribe(&id, None),
            Err(BusError::UnknownExecution(_))
        ));
        assert_eq!(bus.publish(&id, keepalive(0)), None);
    }
}

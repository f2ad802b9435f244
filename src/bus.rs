use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use serde::Serialize;
use tokio::sync::broadcast;

use crate::log_debug;
use crate::store::{EventRecord, Store};
use crate::types::{now_rfc3339, PhaseStatus, TaskStatus, TokenUsage};

/// Rolling session counters pushed with `session.update` and handed to
/// new subscribers so they are not blind until the next transition.
#[derive(Serialize, Clone, Debug, Default, PartialEq)]
pub struct SessionSnapshot {
    pub active_tasks: u32,
    pub tokens: TokenUsage,
    pub cost_usd: f64,
    pub is_paused: bool,
    pub duration_secs: u64,
}

/// Everything observable the engine does.
#[derive(Serialize, Clone, Debug, PartialEq)]
#[serde(untagged)]
pub enum Event {
    TaskStateChanged {
        task_id: String,
        old: TaskStatus,
        new: TaskStatus,
    },
    PhaseStateChanged {
        task_id: String,
        phase_id: String,
        old: PhaseStatus,
        new: PhaseStatus,
    },
    IterationAppended {
        task_id: String,
        phase_id: String,
        index: u32,
        tokens: TokenUsage,
        cost_usd: f64,
    },
    /// A detect-mode sync found conflicts but config says proceed.
    SyncAdvisory {
        task_id: String,
        phase_id: String,
        conflicts: Vec<String>,
    },
    SessionUpdate(SessionSnapshot),
}

impl Event {
    pub fn kind(&self) -> &'static str {
        match self {
            Event::TaskStateChanged { .. } => "task.state_changed",
            Event::PhaseStateChanged { .. } => "phase.state_changed",
            Event::IterationAppended { .. } => "iteration.appended",
            Event::SyncAdvisory { .. } => "phase.sync_advisory",
            Event::SessionUpdate(_) => "session.update",
        }
    }

    pub fn task_id(&self) -> Option<&str> {
        match self {
            Event::TaskStateChanged { task_id, .. }
            | Event::PhaseStateChanged { task_id, .. }
            | Event::IterationAppended { task_id, .. }
            | Event::SyncAdvisory { task_id, .. } => Some(task_id),
            Event::SessionUpdate(_) => None,
        }
    }
}

/// An event stamped with its per-process sequence number.
#[derive(Clone, Debug)]
pub struct SeqEvent {
    pub seq: u64,
    pub event: Event,
}

const DEFAULT_CAPACITY: usize = 256;

/// Single-process publish/subscribe.
///
/// Delivery is best-effort and never blocks a publisher: subscribers
/// that fall behind the channel capacity lose the oldest events
/// (`RecvError::Lagged`) instead of slowing the executors down.
pub struct EventBus {
    tx: broadcast::Sender<SeqEvent>,
    seq: AtomicU64,
    last_session: Mutex<SessionSnapshot>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            tx,
            seq: AtomicU64::new(0),
            last_session: Mutex::new(SessionSnapshot::default()),
        }
    }

    /// Publish an event. Non-blocking; returns the assigned sequence
    /// number. Having no subscribers is not an error.
    pub fn publish(&self, event: Event) -> u64 {
        if let Event::SessionUpdate(ref snapshot) = event {
            let mut last = self.last_session.lock().unwrap_or_else(|e| e.into_inner());
            *last = snapshot.clone();
        }
        let seq = self.seq.fetch_add(1, Ordering::SeqCst) + 1;
        let _ = self.tx.send(SeqEvent { seq, event });
        seq
    }

    /// Subscribe, receiving the latest session snapshot synchronously
    /// plus a live receiver for everything after it.
    pub fn subscribe(&self) -> (SessionSnapshot, broadcast::Receiver<SeqEvent>) {
        let snapshot = self
            .last_session
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        (snapshot, self.tx.subscribe())
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

/// Publish to the bus and, when a store is given, mirror the event into
/// the store-backed log for replay. Mirror failures are logged and
/// dropped; events must never block or fail the engine.
pub async fn emit(bus: &EventBus, store: Option<&dyn Store>, event: Event) {
    let record = store.map(|_| to_record(&event));
    bus.publish(event);
    if let (Some(store), Some(record)) = (store, record) {
        if let Err(e) = store.append_event(record).await {
            log_debug!("event mirror failed: {}", e);
        }
    }
}

fn to_record(event: &Event) -> EventRecord {
    EventRecord {
        seq: 0, // assigned by the store
        task_id: event.task_id().map(|s| s.to_string()),
        kind: event.kind().to_string(),
        payload: serde_json::to_value(event).unwrap_or(serde_json::Value::Null),
        created: now_rfc3339(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task_event(id: &str) -> Event {
        Event::TaskStateChanged {
            task_id: id.to_string(),
            old: TaskStatus::Planned,
            new: TaskStatus::Running,
        }
    }

    #[tokio::test]
    async fn subscribers_receive_in_order() {
        let bus = EventBus::default();
        let (_, mut rx) = bus.subscribe();

        bus.publish(task_event("T-001"));
        bus.publish(task_event("T-002"));

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert!(first.seq < second.seq);
        assert_eq!(first.event.task_id(), Some("T-001"));
        assert_eq!(second.event.task_id(), Some("T-002"));
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_fine() {
        let bus = EventBus::default();
        let seq = bus.publish(task_event("T-001"));
        assert_eq!(seq, 1);
    }

    #[tokio::test]
    async fn snapshot_delivered_on_subscribe() {
        let bus = EventBus::default();
        bus.publish(Event::SessionUpdate(SessionSnapshot {
            active_tasks: 2,
            cost_usd: 1.5,
            ..Default::default()
        }));

        let (snapshot, _rx) = bus.subscribe();
        assert_eq!(snapshot.active_tasks, 2);
        assert!((snapshot.cost_usd - 1.5).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn slow_subscriber_drops_instead_of_blocking() {
        let bus = EventBus::new(2);
        let (_, mut rx) = bus.subscribe();

        for i in 0..10 {
            bus.publish(task_event(&format!("T-{:03}", i)));
        }

        // The first recv reports the lag; publishing never blocked.
        match rx.recv().await {
            Err(broadcast::error::RecvError::Lagged(missed)) => assert!(missed > 0),
            Ok(event) => panic!("expected lag, got {:?}", event.event),
            Err(e) => panic!("unexpected error: {}", e),
        }
    }

    #[test]
    fn event_kinds_are_stable_strings() {
        assert_eq!(task_event("T-001").kind(), "task.state_changed");
        assert_eq!(
            Event::SessionUpdate(SessionSnapshot::default()).kind(),
            "session.update"
        );
    }
}

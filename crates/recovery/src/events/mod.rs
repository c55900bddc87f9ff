//! Typed event bus for execution lifecycle notifications.
//!
//! Every component publishes [`ExecutionEvent`]s on a shared [`EventBus`].
//! Consumers either hold a broadcast receiver from [`EventBus::subscribe`] or
//! register an [`EventObserver`] that is called synchronously on publish.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, warn};
use uuid::Uuid;

/// Dotted topic names, one per event variant
pub struct EventTopics;

impl EventTopics {
    pub const EXECUTION_STARTED: &'static str = "execution.started";
    pub const EXECUTION_COMPLETED: &'static str = "execution.completed";
    pub const EXECUTION_FAILED: &'static str = "execution.failed";
    pub const ACTION_STARTED: &'static str = "action.started";
    pub const ACTION_COMPLETED: &'static str = "action.completed";
    pub const ACTION_FAILED: &'static str = "action.failed";
    pub const CHECKPOINT_PROCESSING: &'static str = "checkpoint.processing";
    pub const CHECKPOINT_REACHED: &'static str = "checkpoint.reached";
    pub const CHECKPOINT_FAILED: &'static str = "checkpoint.failed";
    pub const CHECKPOINT_ERROR: &'static str = "checkpoint.error";
    pub const ROLLBACK_STARTED: &'static str = "rollback.started";
    pub const ROLLBACK_COMPLETED: &'static str = "rollback.completed";
    pub const ROLLBACK_FAILED: &'static str = "rollback.failed";
    pub const MONITORING_STARTED: &'static str = "monitoring.started";
    pub const MONITORING_UPDATE: &'static str = "monitoring.update";
    pub const MONITORING_ANOMALY: &'static str = "monitoring.anomaly";
    pub const MONITORING_COMPLETED: &'static str = "monitoring.completed";

    pub fn all() -> Vec<&'static str> {
        vec![
            Self::EXECUTION_STARTED,
            Self::EXECUTION_COMPLETED,
            Self::EXECUTION_FAILED,
            Self::ACTION_STARTED,
            Self::ACTION_COMPLETED,
            Self::ACTION_FAILED,
            Self::CHECKPOINT_PROCESSING,
            Self::CHECKPOINT_REACHED,
            Self::CHECKPOINT_FAILED,
            Self::CHECKPOINT_ERROR,
            Self::ROLLBACK_STARTED,
            Self::ROLLBACK_COMPLETED,
            Self::ROLLBACK_FAILED,
            Self::MONITORING_STARTED,
            Self::MONITORING_UPDATE,
            Self::MONITORING_ANOMALY,
            Self::MONITORING_COMPLETED,
        ]
    }
}

/// Lifecycle events emitted during an execution
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExecutionEvent {
    ExecutionStarted {
        execution_id: Uuid,
        strategy_id: String,
        action_count: usize,
        dry_run: bool,
    },
    ExecutionCompleted {
        execution_id: Uuid,
        strategy_id: String,
        duration_ms: u64,
        resolved: bool,
    },
    ExecutionFailed {
        execution_id: Uuid,
        strategy_id: String,
        error: String,
        rollback_performed: bool,
    },
    ActionStarted {
        execution_id: Uuid,
        action_id: String,
        action_type: String,
    },
    ActionCompleted {
        execution_id: Uuid,
        action_id: String,
        duration_ms: u64,
        fallback_used: Option<String>,
    },
    ActionFailed {
        execution_id: Uuid,
        action_id: String,
        error: String,
    },
    CheckpointProcessing {
        execution_id: Uuid,
        checkpoint: String,
    },
    CheckpointReached {
        execution_id: Uuid,
        checkpoint: String,
        verification_id: Uuid,
        confidence: f64,
    },
    CheckpointFailed {
        execution_id: Uuid,
        checkpoint: String,
        verification_id: Uuid,
        confidence: f64,
    },
    CheckpointError {
        execution_id: Uuid,
        checkpoint: String,
        error: String,
    },
    RollbackStarted {
        rollback_id: Uuid,
        execution_id: Uuid,
        action_count: usize,
    },
    RollbackCompleted {
        rollback_id: Uuid,
        execution_id: Uuid,
        duration_ms: u64,
    },
    RollbackFailed {
        rollback_id: Uuid,
        execution_id: Uuid,
        failed_actions: Vec<String>,
    },
    MonitoringStarted {
        execution_id: Uuid,
        interval_ms: u64,
    },
    MonitoringUpdate {
        execution_id: Uuid,
        cpu_usage_percent: f64,
        memory_usage_percent: f64,
    },
    MonitoringAnomaly {
        execution_id: Uuid,
        metric: String,
        value: f64,
        threshold: f64,
        message: String,
    },
    MonitoringCompleted {
        execution_id: Uuid,
        report_id: String,
    },
}

impl ExecutionEvent {
    pub fn topic(&self) -> &'static str {
        match self {
            ExecutionEvent::ExecutionStarted { .. } => EventTopics::EXECUTION_STARTED,
            ExecutionEvent::ExecutionCompleted { .. } => EventTopics::EXECUTION_COMPLETED,
            ExecutionEvent::ExecutionFailed { .. } => EventTopics::EXECUTION_FAILED,
            ExecutionEvent::ActionStarted { .. } => EventTopics::ACTION_STARTED,
            ExecutionEvent::ActionCompleted { .. } => EventTopics::ACTION_COMPLETED,
            ExecutionEvent::ActionFailed { .. } => EventTopics::ACTION_FAILED,
            ExecutionEvent::CheckpointProcessing { .. } => EventTopics::CHECKPOINT_PROCESSING,
            ExecutionEvent::CheckpointReached { .. } => EventTopics::CHECKPOINT_REACHED,
            ExecutionEvent::CheckpointFailed { .. } => EventTopics::CHECKPOINT_FAILED,
            ExecutionEvent::CheckpointError { .. } => EventTopics::CHECKPOINT_ERROR,
            ExecutionEvent::RollbackStarted { .. } => EventTopics::ROLLBACK_STARTED,
            ExecutionEvent::RollbackCompleted { .. } => EventTopics::ROLLBACK_COMPLETED,
            ExecutionEvent::RollbackFailed { .. } => EventTopics::ROLLBACK_FAILED,
            ExecutionEvent::MonitoringStarted { .. } => EventTopics::MONITORING_STARTED,
            ExecutionEvent::MonitoringUpdate { .. } => EventTopics::MONITORING_UPDATE,
            ExecutionEvent::MonitoringAnomaly { .. } => EventTopics::MONITORING_ANOMALY,
            ExecutionEvent::MonitoringCompleted { .. } => EventTopics::MONITORING_COMPLETED,
        }
    }

    /// Execution this event belongs to
    pub fn execution_id(&self) -> Uuid {
        match self {
            ExecutionEvent::ExecutionStarted { execution_id, .. }
            | ExecutionEvent::ExecutionCompleted { execution_id, .. }
            | ExecutionEvent::ExecutionFailed { execution_id, .. }
            | ExecutionEvent::ActionStarted { execution_id, .. }
            | ExecutionEvent::ActionCompleted { execution_id, .. }
            | ExecutionEvent::ActionFailed { execution_id, .. }
            | ExecutionEvent::CheckpointProcessing { execution_id, .. }
            | ExecutionEvent::CheckpointReached { execution_id, .. }
            | ExecutionEvent::CheckpointFailed { execution_id, .. }
            | ExecutionEvent::CheckpointError { execution_id, .. }
            | ExecutionEvent::RollbackStarted { execution_id, .. }
            | ExecutionEvent::RollbackCompleted { execution_id, .. }
            | ExecutionEvent::RollbackFailed { execution_id, .. }
            | ExecutionEvent::MonitoringStarted { execution_id, .. }
            | ExecutionEvent::MonitoringUpdate { execution_id, .. }
            | ExecutionEvent::MonitoringAnomaly { execution_id, .. }
            | ExecutionEvent::MonitoringCompleted { execution_id, .. } => *execution_id,
        }
    }
}

/// Event wrapped with delivery metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub id: Uuid,
    pub topic: String,
    pub event: ExecutionEvent,
    pub timestamp: DateTime<Utc>,
}

/// Synchronous observer called on every publish
pub trait EventObserver: Send + Sync {
    fn on_event(&self, envelope: &EventEnvelope) -> anyhow::Result<()>;

    fn name(&self) -> &str {
        "observer"
    }
}

/// Broadcast bus shared by the executor and its managers
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<EventEnvelope>,
    observers: Arc<RwLock<Vec<Arc<dyn EventObserver>>>>,
    published: Arc<AtomicU64>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.sender.receiver_count())
            .field("observers", &self.observers.read().len())
            .field("published", &self.published.load(Ordering::Relaxed))
            .finish()
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _rx) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            observers: Arc::new(RwLock::new(Vec::new())),
            published: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EventEnvelope> {
        self.sender.subscribe()
    }

    pub fn register_observer(&self, observer: Arc<dyn EventObserver>) {
        debug!(target: "event_bus", observer = observer.name(), "registered observer");
        self.observers.write().push(observer);
    }

    /// Publish an event. Never fails: missing subscribers and observer
    /// errors are logged.
    pub fn publish(&self, event: ExecutionEvent) {
        let envelope = EventEnvelope {
            id: Uuid::new_v4(),
            topic: event.topic().to_string(),
            event,
            timestamp: Utc::now(),
        };
        self.published.fetch_add(1, Ordering::Relaxed);

        let observers: Vec<Arc<dyn EventObserver>> = self.observers.read().clone();
        for observer in observers {
            if let Err(e) = observer.on_event(&envelope) {
                warn!(
                    target: "event_bus",
                    observer = observer.name(),
                    topic = %envelope.topic,
                    "observer failed: {}",
                    e
                );
            }
        }

        let topic = envelope.topic.clone();
        match self.sender.send(envelope) {
            Ok(receivers) => debug!(target: "event_bus", topic = %topic, receivers, "published"),
            Err(_) => debug!(target: "event_bus", topic = %topic, "no subscribers"),
        }
    }

    pub fn published_count(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }
}

/// Observer that keeps every envelope it sees, mostly useful in tests
#[derive(Default)]
pub struct RecordingObserver {
    events: RwLock<Vec<EventEnvelope>>,
}

impl RecordingObserver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<EventEnvelope> {
        self.events.read().clone()
    }

    pub fn topics(&self) -> Vec<String> {
        self.events.read().iter().map(|e| e.topic.clone()).collect()
    }

    pub fn count(&self, topic: &str) -> usize {
        self.events.read().iter().filter(|e| e.topic == topic).count()
    }
}

impl EventObserver for RecordingObserver {
    fn on_event(&self, envelope: &EventEnvelope) -> anyhow::Result<()> {
        self.events.write().push(envelope.clone());
        Ok(())
    }

    fn name(&self) -> &str {
        "recording"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FailingObserver;

    impl EventObserver for FailingObserver {
        fn on_event(&self, _envelope: &EventEnvelope) -> anyhow::Result<()> {
            anyhow::bail!("observer down")
        }
    }

    fn started() -> ExecutionEvent {
        ExecutionEvent::ExecutionStarted {
            execution_id: Uuid::new_v4(),
            strategy_id: "s1".into(),
            action_count: 2,
            dry_run: false,
        }
    }

    #[tokio::test]
    async fn test_publish_subscribe() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();
        bus.publish(started());

        let envelope = rx.recv().await.expect("should receive");
        assert_eq!(envelope.topic, EventTopics::EXECUTION_STARTED);
        assert!(matches!(envelope.event, ExecutionEvent::ExecutionStarted { action_count: 2, .. }));
    }

    #[test]
    fn test_publish_without_subscribers_does_not_panic() {
        let bus = EventBus::default();
        bus.publish(started());
        assert_eq!(bus.published_count(), 1);
    }

    #[test]
    fn test_failing_observer_does_not_block_others() {
        let bus = EventBus::default();
        let recorder = RecordingObserver::new();
        bus.register_observer(Arc::new(FailingObserver));
        bus.register_observer(recorder.clone());

        bus.publish(started());
        assert_eq!(recorder.count(EventTopics::EXECUTION_STARTED), 1);
    }

    #[test]
    fn test_topics_are_unique() {
        let mut topics = EventTopics::all();
        let total = topics.len();
        topics.sort();
        topics.dedup();
        assert_eq!(topics.len(), total);
    }

    #[test]
    fn test_event_serializes_with_type_tag() {
        let json = serde_json::to_value(started()).expect("serialize");
        assert_eq!(json["type"], "execution_started");
    }
}

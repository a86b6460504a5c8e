use crate::Event;
use std::collections::HashSet;

pub mod fs;
pub mod in_memory;

/// Prefix of the error `create_instance` returns for an existing instance.
pub const INSTANCE_EXISTS: &str = "instance already exists";

/// Queue identity used by `enqueue_work` and the peek-lock operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueKind {
    /// Completions and raised events bound for an instance loop.
    Orchestrator,
    /// Activity executions.
    Worker,
    /// Timer schedules and cancellations.
    Timer,
}

/// Provider-backed work items. Items carrying `execution_id` are filtered
/// by the runtime when they belong to an older execution.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub enum WorkItem {
    ActivityExecute {
        instance: String,
        execution_id: u64,
        id: u64,
        name: String,
        input: String,
    },
    ActivityCompleted {
        instance: String,
        execution_id: u64,
        id: u64,
        result: String,
    },
    ActivityFailed {
        instance: String,
        execution_id: u64,
        id: u64,
        error: String,
    },
    TimerSchedule {
        instance: String,
        execution_id: u64,
        id: u64,
        fire_at_ms: u64,
    },
    TimerCancel {
        instance: String,
        execution_id: u64,
        id: u64,
    },
    TimerFired {
        instance: String,
        execution_id: u64,
        id: u64,
        fire_at_ms: u64,
    },
    /// External event raised by a client. Not tied to an execution so that
    /// it survives continue-as-new.
    ExternalRaised {
        instance: String,
        name: String,
        data: String,
        raise_id: String,
    },
}

/// Storage abstraction for per-instance histories and the three work queues.
///
/// Each instance owns numbered executions starting at 1; `read` and
/// `append` address the latest one. Appends are idempotent for
/// completion-like events (see [`DedupeKey`]).
#[async_trait::async_trait]
pub trait HistoryStore: Send + Sync {
    /// Events of the latest execution, or empty if the instance is unknown.
    async fn read(&self, instance: &str) -> Vec<Event>;
    /// Append to the latest execution. Fails for unknown instances.
    async fn append(&self, instance: &str, new_events: Vec<Event>) -> Result<(), String>;
    /// Drop all instances and queued work.
    async fn reset(&self);
    async fn list_instances(&self) -> Vec<String>;
    async fn dump_all_pretty(&self) -> String;

    /// Atomically create an empty instance with execution 1. Fails if the
    /// instance already exists.
    async fn create_instance(&self, instance: &str) -> Result<(), String>;

    async fn enqueue_work(&self, kind: QueueKind, item: WorkItem) -> Result<(), String>;
    /// Take the head of a queue and hide it until `ack` or `abandon`.
    async fn dequeue_peek_lock(&self, kind: QueueKind) -> Option<(WorkItem, String)>;
    async fn ack(&self, kind: QueueKind, token: &str) -> Result<(), String>;
    /// Return a locked item to the front of its queue. Released items keep
    /// the order in which they were first dequeued, whatever order they
    /// are abandoned in.
    async fn abandon(&self, kind: QueueKind, token: &str) -> Result<(), String>;

    async fn latest_execution_id(&self, instance: &str) -> Option<u64>;
    async fn list_executions(&self, instance: &str) -> Vec<u64>;
    async fn read_with_execution(&self, instance: &str, execution_id: u64) -> Vec<Event>;
    async fn append_with_execution(
        &self,
        instance: &str,
        execution_id: u64,
        new_events: Vec<Event>,
    ) -> Result<(), String>;
    /// Open the next execution, seeded with `OrchestrationStarted`, and
    /// return its id.
    async fn create_new_execution(&self, instance: &str, orchestration: &str, input: &str) -> Result<u64, String>;
}

/// Queue slot. `order` is assigned on first dequeue and kept while the
/// item is locked or released, so released items return in FIFO order.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub(crate) struct QueuedItem {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order: Option<u64>,
    pub item: WorkItem,
}

/// Insert a released item behind the released items dequeued before it and
/// ahead of everything not yet dequeued.
pub(crate) fn reinsert_released(queue: &mut Vec<QueuedItem>, order: u64, item: WorkItem) {
    let pos = queue
        .iter()
        .take_while(|q| q.order.is_some_and(|o| o < order))
        .count();
    queue.insert(
        pos,
        QueuedItem {
            order: Some(order),
            item,
        },
    );
}

/// Identity under which a history event may appear at most once per execution.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DedupeKey {
    Activity(u64),
    Timer(u64),
    TimerCancel(u64),
    Raise(String),
    Terminal,
}

impl DedupeKey {
    pub fn of(ev: &Event) -> Option<DedupeKey> {
        match ev {
            Event::ActivityCompleted { id, .. } | Event::ActivityFailed { id, .. } => Some(DedupeKey::Activity(*id)),
            Event::TimerFired { id, .. } => Some(DedupeKey::Timer(*id)),
            Event::TimerCancelled { id } => Some(DedupeKey::TimerCancel(*id)),
            Event::ExternalEvent { raise_id, .. } => Some(DedupeKey::Raise(raise_id.clone())),
            Event::OrchestrationCompleted { .. }
            | Event::OrchestrationFailed { .. }
            | Event::OrchestrationContinuedAsNew { .. } => Some(DedupeKey::Terminal),
            _ => None,
        }
    }
}

/// Filter `new_events` down to those not already represented in `existing`
/// (or earlier in the same batch).
pub fn filter_duplicates(existing: &[Event], new_events: Vec<Event>) -> Vec<Event> {
    let mut seen: HashSet<DedupeKey> = existing.iter().filter_map(DedupeKey::of).collect();
    new_events
        .into_iter()
        .filter(|ev| match DedupeKey::of(ev) {
            Some(key) => seen.insert(key),
            None => true,
        })
        .collect()
}

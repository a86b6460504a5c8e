use std::sync::Arc;

use tracing::{debug, warn};

use crate::Event;
use crate::providers::{QueueKind, WorkItem};
use crate::runtime::Runtime;

pub async fn dispatch_call_activity(
    rt: &Arc<Runtime>,
    instance: &str,
    execution_id: u64,
    history: &[Event],
    id: u64,
    name: String,
    input: String,
) {
    let already_done = history.iter().any(|e| {
        matches!(e, Event::ActivityCompleted { id: cid, .. } | Event::ActivityFailed { id: cid, .. } if *cid == id)
    });
    if already_done {
        return;
    }
    let item = WorkItem::ActivityExecute {
        instance: instance.to_string(),
        execution_id,
        id,
        name: name.clone(),
        input,
    };
    if let Err(e) = rt.history_store.enqueue_work(QueueKind::Worker, item).await {
        warn!(instance, id, name=%name, error=%e, "failed to enqueue activity");
    } else {
        debug!(instance, execution_id, id, name=%name, "activity enqueued");
    }
}

pub async fn dispatch_create_timer(
    rt: &Arc<Runtime>,
    instance: &str,
    execution_id: u64,
    history: &[Event],
    id: u64,
    fire_at_ms: u64,
) {
    let already_fired = history
        .iter()
        .any(|e| matches!(e, Event::TimerFired { id: cid, .. } if *cid == id));
    if already_fired {
        return;
    }
    let item = WorkItem::TimerSchedule {
        instance: instance.to_string(),
        execution_id,
        id,
        fire_at_ms,
    };
    if let Err(e) = rt.history_store.enqueue_work(QueueKind::Timer, item).await {
        warn!(instance, id, error=%e, "failed to enqueue timer");
    }
}

pub async fn dispatch_cancel_timer(rt: &Arc<Runtime>, instance: &str, execution_id: u64, id: u64) {
    let item = WorkItem::TimerCancel {
        instance: instance.to_string(),
        execution_id,
        id,
    };
    if let Err(e) = rt.history_store.enqueue_work(QueueKind::Timer, item).await {
        warn!(instance, id, error=%e, "failed to enqueue timer cancellation");
    }
}

pub async fn dispatch_wait_external(instance: &str, id: u64, name: &str) {
    // Raised events are buffered in history; the subscription itself needs no work item
    debug!(instance, id, name=%name, "subscribed to external event");
}

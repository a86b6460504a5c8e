use std::sync::Arc;

use tracing::{debug, warn};

use crate::Event;
use crate::providers::{HistoryStore, QueueKind, WorkItem};
use crate::runtime::router::OrchestratorMsg;

fn has_event(history: &[Event], pred: impl Fn(&Event) -> bool) -> bool {
    history.iter().any(pred)
}

fn activity_settled(history: &[Event], id: u64) -> bool {
    has_event(history, |e| {
        matches!(e, Event::ActivityCompleted { id: cid, .. } | Event::ActivityFailed { id: cid, .. } if *cid == id)
    })
}

fn timer_settled(history: &[Event], id: u64) -> bool {
    has_event(history, |e| {
        matches!(e, Event::TimerFired { id: cid, .. } | Event::TimerCancelled { id: cid } if *cid == id)
    })
}

/// Apply one inbox message to the in-memory history. Returns the ack token
/// and whether the history changed. Completions with no matching schedule,
/// duplicates, and fires of settled timers leave the history untouched.
pub fn append_completion(history: &mut Vec<Event>, msg: OrchestratorMsg) -> (Option<String>, bool) {
    match msg {
        OrchestratorMsg::ActivityCompleted {
            instance,
            id,
            result,
            ack_token,
            ..
        } => {
            let scheduled = has_event(history, |e| matches!(e, Event::ActivityScheduled { id: cid, .. } if *cid == id));
            if !scheduled || activity_settled(history, id) {
                debug!(instance = %instance, id, scheduled, "ignoring activity completion");
                return (ack_token, false);
            }
            history.push(Event::ActivityCompleted { id, result });
            (ack_token, true)
        }
        OrchestratorMsg::ActivityFailed {
            instance,
            id,
            error,
            ack_token,
            ..
        } => {
            let scheduled = has_event(history, |e| matches!(e, Event::ActivityScheduled { id: cid, .. } if *cid == id));
            if !scheduled || activity_settled(history, id) {
                debug!(instance = %instance, id, scheduled, "ignoring activity failure");
                return (ack_token, false);
            }
            history.push(Event::ActivityFailed { id, error });
            (ack_token, true)
        }
        OrchestratorMsg::TimerFired {
            instance,
            id,
            fire_at_ms,
            ack_token,
            ..
        } => {
            let created = has_event(history, |e| matches!(e, Event::TimerCreated { id: cid, .. } if *cid == id));
            if !created || timer_settled(history, id) {
                debug!(instance = %instance, id, created, "ignoring stale timer fire");
                return (ack_token, false);
            }
            history.push(Event::TimerFired { id, fire_at_ms });
            (ack_token, true)
        }
        OrchestratorMsg::ExternalByName {
            instance,
            name,
            data,
            raise_id,
            ack_token,
        } => {
            if has_event(history, |e| matches!(e, Event::ExternalEvent { raise_id: r, .. } if *r == raise_id)) {
                debug!(instance = %instance, name=%name, raise_id=%raise_id, "ignoring redelivered external event");
                return (ack_token, false);
            }
            // Buffered whether or not a wait is currently subscribed
            history.push(Event::ExternalEvent { name, data, raise_id });
            (ack_token, true)
        }
    }
}

/// Re-enqueue work that the history shows as scheduled but unsettled, so an
/// instance resumed from storage continues where it stopped.
pub async fn rehydrate_pending(
    instance: &str,
    execution_id: u64,
    history: &[Event],
    history_store: &Arc<dyn HistoryStore>,
) {
    for e in history {
        match e {
            Event::ActivityScheduled { id, name, input } if !activity_settled(history, *id) => {
                let item = WorkItem::ActivityExecute {
                    instance: instance.to_string(),
                    execution_id,
                    id: *id,
                    name: name.clone(),
                    input: input.clone(),
                };
                if let Err(err) = history_store.enqueue_work(QueueKind::Worker, item).await {
                    warn!(instance, id, error=%err, "rehydrate: failed to enqueue activity");
                }
            }
            Event::TimerCreated { id, fire_at_ms } if !timer_settled(history, *id) => {
                let item = WorkItem::TimerSchedule {
                    instance: instance.to_string(),
                    execution_id,
                    id: *id,
                    fire_at_ms: *fire_at_ms,
                };
                if let Err(err) = history_store.enqueue_work(QueueKind::Timer, item).await {
                    warn!(instance, id, error=%err, "rehydrate: failed to enqueue timer");
                }
            }
            _ => {}
        }
    }
}

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::providers::{HistoryStore, QueueKind, WorkItem};

type TimerKey = (String, u64, u64);

/// In-process timer wheel. Accepts `TimerSchedule` and `TimerCancel`
/// items and enqueues `TimerFired` to the orchestrator queue when due.
pub struct TimerService {
    store: Arc<dyn HistoryStore>,
    pending: HashMap<TimerKey, u64>,
    poll_ms: u64,
}

pub(crate) fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

impl TimerService {
    pub fn start(store: Arc<dyn HistoryStore>, poll_ms: u64) -> (JoinHandle<()>, mpsc::UnboundedSender<WorkItem>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let svc = Self {
            store,
            pending: HashMap::new(),
            poll_ms,
        };
        (tokio::spawn(svc.run(rx)), tx)
    }

    fn accept(&mut self, item: WorkItem) {
        match item {
            WorkItem::TimerSchedule {
                instance,
                execution_id,
                id,
                fire_at_ms,
            } => {
                debug!(instance = %instance, execution_id, id, fire_at_ms, "timer scheduled");
                self.pending.insert((instance, execution_id, id), fire_at_ms);
            }
            WorkItem::TimerCancel {
                instance,
                execution_id,
                id,
            } => {
                if self.pending.remove(&(instance.clone(), execution_id, id)).is_some() {
                    debug!(instance = %instance, execution_id, id, "timer cancelled");
                }
            }
            other => warn!(?other, "timer service: ignoring unexpected work item"),
        }
    }

    fn next_wait(&self) -> Duration {
        let now = now_ms();
        let until_due = self
            .pending
            .values()
            .min()
            .map(|at| at.saturating_sub(now))
            .unwrap_or(self.poll_ms);
        Duration::from_millis(until_due.min(self.poll_ms))
    }

    async fn fire_due(&mut self) {
        let now = now_ms();
        let due: Vec<TimerKey> = self
            .pending
            .iter()
            .filter(|(_, at)| **at <= now)
            .map(|(k, _)| k.clone())
            .collect();
        for key in due {
            let Some(fire_at_ms) = self.pending.remove(&key) else {
                continue;
            };
            let (instance, execution_id, id) = key;
            let item = WorkItem::TimerFired {
                instance: instance.clone(),
                execution_id,
                id,
                fire_at_ms,
            };
            if let Err(e) = self.store.enqueue_work(QueueKind::Orchestrator, item).await {
                warn!(instance = %instance, id, error=%e, "timer service: failed to enqueue TimerFired; retrying");
                self.pending.insert((instance, execution_id, id), fire_at_ms);
            }
        }
    }

    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<WorkItem>) {
        loop {
            tokio::select! {
                msg = rx.recv() => match msg {
                    Some(item) => self.accept(item),
                    None => break,
                },
                _ = tokio::time::sleep(self.next_wait()) => {}
            }
            self.fire_due().await;
        }
    }
}

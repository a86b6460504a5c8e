use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::Mutex;

use super::{HistoryStore, QueueKind, QueuedItem, WorkItem, filter_duplicates, reinsert_released};
use crate::Event;

const DEFAULT_CAP: usize = 1024;

/// Process-local history store. Executions are kept per instance in
/// creation order; queues live in memory with the same peek-lock
/// semantics as the filesystem provider.
pub struct InMemoryHistoryStore {
    instances: Mutex<HashMap<String, Vec<Vec<Event>>>>,
    queues: Mutex<HashMap<QueueKind, Vec<QueuedItem>>>,
    // Locked items with their dequeue order
    locked: Mutex<HashMap<(QueueKind, String), (u64, WorkItem)>>,
    next_token: AtomicU64,
    cap: usize,
}

impl Default for InMemoryHistoryStore {
    fn default() -> Self {
        Self::new_with_cap(DEFAULT_CAP)
    }
}

impl InMemoryHistoryStore {
    /// Create a store with a custom per-execution history cap.
    pub fn new_with_cap(cap: usize) -> Self {
        Self {
            instances: Mutex::new(HashMap::new()),
            queues: Mutex::new(HashMap::new()),
            locked: Mutex::new(HashMap::new()),
            next_token: AtomicU64::new(1),
            cap,
        }
    }
}

#[async_trait::async_trait]
impl HistoryStore for InMemoryHistoryStore {
    async fn read(&self, instance: &str) -> Vec<Event> {
        self.instances
            .lock()
            .await
            .get(instance)
            .and_then(|execs| execs.last().cloned())
            .unwrap_or_default()
    }

    async fn append(&self, instance: &str, new_events: Vec<Event>) -> Result<(), String> {
        let latest = self
            .latest_execution_id(instance)
            .await
            .ok_or_else(|| format!("instance not found: {instance}"))?;
        self.append_with_execution(instance, latest, new_events).await
    }

    async fn reset(&self) {
        self.instances.lock().await.clear();
        self.queues.lock().await.clear();
        self.locked.lock().await.clear();
    }

    async fn list_instances(&self) -> Vec<String> {
        let mut out: Vec<String> = self.instances.lock().await.keys().cloned().collect();
        out.sort();
        out
    }

    async fn dump_all_pretty(&self) -> String {
        let instances = self.instances.lock().await;
        let mut names: Vec<&String> = instances.keys().collect();
        names.sort();
        let mut out = String::new();
        for inst in names {
            out.push_str(&format!("instance={inst}\n"));
            for (idx, exec) in instances[inst].iter().enumerate() {
                for ev in exec {
                    out.push_str(&format!("  exec#{} {ev:#?}\n", idx + 1));
                }
            }
        }
        out
    }

    async fn create_instance(&self, instance: &str) -> Result<(), String> {
        let mut instances = self.instances.lock().await;
        if instances.contains_key(instance) {
            return Err(format!("{}: {instance}", super::INSTANCE_EXISTS));
        }
        instances.insert(instance.to_string(), vec![Vec::new()]);
        Ok(())
    }

    async fn enqueue_work(&self, kind: QueueKind, item: WorkItem) -> Result<(), String> {
        let mut queues = self.queues.lock().await;
        let q = queues.entry(kind).or_default();
        if !q.iter().any(|queued| queued.item == item) {
            q.push(QueuedItem { order: None, item });
        }
        Ok(())
    }

    async fn dequeue_peek_lock(&self, kind: QueueKind) -> Option<(WorkItem, String)> {
        let mut queues = self.queues.lock().await;
        let q = queues.get_mut(&kind)?;
        if q.is_empty() {
            return None;
        }
        let QueuedItem { order, item } = q.remove(0);
        let seq = self.next_token.fetch_add(1, Ordering::Relaxed);
        let token = format!("{seq:x}");
        self.locked
            .lock()
            .await
            .insert((kind, token.clone()), (order.unwrap_or(seq), item.clone()));
        Some((item, token))
    }

    async fn ack(&self, kind: QueueKind, token: &str) -> Result<(), String> {
        self.locked.lock().await.remove(&(kind, token.to_string()));
        Ok(())
    }

    async fn abandon(&self, kind: QueueKind, token: &str) -> Result<(), String> {
        let mut queues = self.queues.lock().await;
        if let Some((order, item)) = self.locked.lock().await.remove(&(kind, token.to_string())) {
            reinsert_released(queues.entry(kind).or_default(), order, item);
        }
        Ok(())
    }

    async fn latest_execution_id(&self, instance: &str) -> Option<u64> {
        let instances = self.instances.lock().await;
        let execs = instances.get(instance)?;
        if execs.is_empty() { None } else { Some(execs.len() as u64) }
    }

    async fn list_executions(&self, instance: &str) -> Vec<u64> {
        match self.latest_execution_id(instance).await {
            Some(lat) => (1..=lat).collect(),
            None => Vec::new(),
        }
    }

    async fn read_with_execution(&self, instance: &str, execution_id: u64) -> Vec<Event> {
        let instances = self.instances.lock().await;
        execution_id
            .checked_sub(1)
            .and_then(|idx| instances.get(instance)?.get(idx as usize).cloned())
            .unwrap_or_default()
    }

    async fn append_with_execution(
        &self,
        instance: &str,
        execution_id: u64,
        new_events: Vec<Event>,
    ) -> Result<(), String> {
        let mut instances = self.instances.lock().await;
        let exec = execution_id
            .checked_sub(1)
            .and_then(|idx| instances.get_mut(instance)?.get_mut(idx as usize))
            .ok_or_else(|| format!("execution not found: {instance}#{execution_id}"))?;
        let fresh = filter_duplicates(exec, new_events);
        if exec.len() + fresh.len() > self.cap {
            return Err(format!(
                "history cap exceeded (cap={}, have={}, append={})",
                self.cap,
                exec.len(),
                fresh.len()
            ));
        }
        exec.extend(fresh);
        Ok(())
    }

    async fn create_new_execution(&self, instance: &str, orchestration: &str, input: &str) -> Result<u64, String> {
        let mut instances = self.instances.lock().await;
        let execs = instances.entry(instance.to_string()).or_default();
        execs.push(vec![Event::OrchestrationStarted {
            name: orchestration.to_string(),
            input: input.to_string(),
        }]);
        Ok(execs.len() as u64)
    }
}

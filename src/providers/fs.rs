use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::Mutex;
use tokio::{fs, io::AsyncWriteExt};

use super::{HistoryStore, QueueKind, QueuedItem, WorkItem, filter_duplicates, reinsert_released};
use crate::Event;

/// Filesystem-backed history store: one JSONL file per execution under
/// `<root>/<instance>/<execution_id>.jsonl`, plus one JSONL file per queue.
#[derive(Clone)]
pub struct FsHistoryStore {
    root: PathBuf,
    orch_queue_file: PathBuf,
    work_queue_file: PathBuf,
    timer_queue_file: PathBuf,
    cap: usize,
    // Serializes read-modify-write cycles on the queue files
    queue_gate: Arc<Mutex<()>>,
    lock_seq: Arc<AtomicU64>,
}

impl FsHistoryStore {
    /// Create a new store rooted at the given directory path.
    /// If `reset_on_create` is true, delete any existing data under the root first.
    /// Otherwise items still locked by a previous process are returned to
    /// their queues in dequeue order.
    pub fn new(root: impl AsRef<Path>, reset_on_create: bool) -> Self {
        let path = root.as_ref().to_path_buf();
        if reset_on_create {
            let _ = std::fs::remove_dir_all(&path);
        }
        let orch_q = path.join("orch-queue.jsonl");
        let work_q = path.join("work-queue.jsonl");
        let timer_q = path.join("timer-queue.jsonl");
        // best-effort create
        let _ = std::fs::create_dir_all(&path);
        for q in [&orch_q, &work_q, &timer_q] {
            let _ = std::fs::OpenOptions::new().create(true).append(true).open(q);
        }
        let store = Self {
            root: path,
            orch_queue_file: orch_q,
            work_queue_file: work_q,
            timer_queue_file: timer_q,
            cap: 1024,
            queue_gate: Arc::new(Mutex::new(())),
            lock_seq: Arc::new(AtomicU64::new(0)),
        };
        for kind in [QueueKind::Orchestrator, QueueKind::Worker, QueueKind::Timer] {
            if let Err(e) = store.recover_locked(kind) {
                tracing::warn!(queue = ?kind, error = %e, "fs store: failed to recover locked items");
            }
        }
        store
    }

    /// Put orphaned lock sidecars back at the head of the queue. Dequeue
    /// orders only mean something within one process, so they are cleared.
    fn recover_locked(&self, kind: QueueKind) -> Result<(), String> {
        let mut sidecars: Vec<PathBuf> = match std::fs::read_dir(self.lock_dir(kind)) {
            Ok(rd) => rd
                .filter_map(|ent| ent.ok().map(|e| e.path()))
                .filter(|p| p.extension().is_some_and(|ext| ext == "lock"))
                .collect(),
            Err(_) => Vec::new(),
        };
        let content = std::fs::read_to_string(self.queue_file(kind)).unwrap_or_default();
        let mut items: Vec<QueuedItem> = content
            .lines()
            .filter_map(|l| serde_json::from_str::<QueuedItem>(l).ok())
            .collect();
        if sidecars.is_empty() && items.iter().all(|q| q.order.is_none()) {
            return Ok(());
        }
        sidecars.sort();
        for path in &sidecars {
            let data = std::fs::read_to_string(path).map_err(|e| e.to_string())?;
            if let Ok(locked) = serde_json::from_str::<QueuedItem>(&data)
                && !items.iter().any(|q| q.item == locked.item)
            {
                items.push(locked);
            }
        }
        // Released and locked items first, by dequeue order; the rest keep their place
        items.sort_by_key(|q| (q.order.is_none(), q.order));
        let mut body = String::new();
        for q in items {
            let plain = QueuedItem { order: None, item: q.item };
            body.push_str(&serde_json::to_string(&plain).map_err(|e| e.to_string())?);
            body.push('\n');
        }
        let qf = self.queue_file(kind);
        let tmp = qf.with_extension("jsonl.tmp");
        std::fs::write(&tmp, body).map_err(|e| e.to_string())?;
        std::fs::rename(&tmp, qf).map_err(|e| e.to_string())?;
        for path in sidecars {
            std::fs::remove_file(path).map_err(|e| e.to_string())?;
        }
        Ok(())
    }

    /// Create a new store with a custom history cap (useful for tests).
    pub fn new_with_cap(root: impl AsRef<Path>, reset_on_create: bool, cap: usize) -> Self {
        let mut s = Self::new(root, reset_on_create);
        s.cap = cap;
        s
    }

    fn inst_root(&self, instance: &str) -> PathBuf {
        self.root.join(instance)
    }
    fn exec_path(&self, instance: &str, execution_id: u64) -> PathBuf {
        self.inst_root(instance).join(format!("{}.jsonl", execution_id))
    }
    fn lock_dir(&self, kind: QueueKind) -> PathBuf {
        match kind {
            QueueKind::Orchestrator => self.root.join(".locks/orch"),
            QueueKind::Worker => self.root.join(".locks/work"),
            QueueKind::Timer => self.root.join(".locks/timer"),
        }
    }
    fn lock_path(&self, kind: QueueKind, token: &str) -> PathBuf {
        self.lock_dir(kind).join(format!("{token}.lock"))
    }
    fn queue_file(&self, kind: QueueKind) -> &PathBuf {
        match kind {
            QueueKind::Orchestrator => &self.orch_queue_file,
            QueueKind::Worker => &self.work_queue_file,
            QueueKind::Timer => &self.timer_queue_file,
        }
    }

    async fn load_queue(&self, kind: QueueKind) -> Vec<QueuedItem> {
        let content = fs::read_to_string(self.queue_file(kind)).await.unwrap_or_default();
        content
            .lines()
            .filter_map(|l| serde_json::from_str::<QueuedItem>(l).ok())
            .collect()
    }

    /// Rewrite a queue file atomically via a temp file and rename.
    async fn store_queue(&self, kind: QueueKind, items: &[QueuedItem]) -> Result<(), String> {
        let qf = self.queue_file(kind);
        let tmp = qf.with_extension("jsonl.tmp");
        let mut body = String::new();
        for it in items {
            body.push_str(&serde_json::to_string(it).map_err(|e| e.to_string())?);
            body.push('\n');
        }
        fs::write(&tmp, body).await.map_err(|e| e.to_string())?;
        fs::rename(&tmp, qf).await.map_err(|e| e.to_string())
    }

    async fn read_events(path: &Path) -> Vec<Event> {
        let data = fs::read_to_string(path).await.unwrap_or_default();
        data.lines()
            .filter(|line| !line.trim().is_empty())
            .filter_map(|line| serde_json::from_str::<Event>(line).ok())
            .collect()
    }
}

#[async_trait::async_trait]
impl HistoryStore for FsHistoryStore {
    async fn read(&self, instance: &str) -> Vec<Event> {
        match self.latest_execution_id(instance).await {
            Some(latest) => self.read_with_execution(instance, latest).await,
            None => Vec::new(),
        }
    }

    async fn append(&self, instance: &str, new_events: Vec<Event>) -> Result<(), String> {
        let latest = self
            .latest_execution_id(instance)
            .await
            .ok_or_else(|| format!("instance not found: {instance}"))?;
        self.append_with_execution(instance, latest, new_events).await
    }

    /// Remove the root directory and all contents.
    async fn reset(&self) {
        let _ = fs::remove_dir_all(&self.root).await;
    }

    /// List instances by scanning instance directories.
    async fn list_instances(&self) -> Vec<String> {
        let mut out = Vec::new();
        if let Ok(mut rd) = fs::read_dir(&self.root).await {
            while let Ok(Some(ent)) = rd.next_entry().await {
                let is_dir = ent.file_type().await.map(|t| t.is_dir()).unwrap_or(false);
                if let Some(name) = ent.file_name().to_str()
                    && is_dir
                    && !name.starts_with('.')
                {
                    out.push(name.to_string());
                }
            }
        }
        out.sort();
        out
    }

    async fn dump_all_pretty(&self) -> String {
        let mut out = String::new();
        for inst in self.list_instances().await {
            out.push_str(&format!("instance={inst}\n"));
            for eid in self.list_executions(&inst).await {
                for ev in self.read_with_execution(&inst, eid).await {
                    out.push_str(&format!("  exec#{eid} {ev:#?}\n"));
                }
            }
        }
        out
    }

    async fn create_instance(&self, instance: &str) -> Result<(), String> {
        fs::create_dir_all(&self.root).await.map_err(|e| e.to_string())?;
        // create_dir fails on an existing directory, which makes creation atomic
        fs::create_dir(self.inst_root(instance))
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::AlreadyExists => format!("{}: {instance}", super::INSTANCE_EXISTS),
                _ => e.to_string(),
            })?;
        fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(self.exec_path(instance, 1))
            .await
            .map_err(|e| e.to_string())?;
        Ok(())
    }

    async fn enqueue_work(&self, kind: QueueKind, item: WorkItem) -> Result<(), String> {
        let _gate = self.queue_gate.lock().await;
        let mut items = self.load_queue(kind).await;
        if items.iter().any(|q| q.item == item) {
            return Ok(());
        }
        items.push(QueuedItem { order: None, item });
        self.store_queue(kind, &items).await
    }

    async fn dequeue_peek_lock(&self, kind: QueueKind) -> Option<(WorkItem, String)> {
        let _gate = self.queue_gate.lock().await;
        let mut items = self.load_queue(kind).await;
        if items.is_empty() {
            return None;
        }
        let first = items.remove(0);
        let seq = self.lock_seq.fetch_add(1, Ordering::Relaxed);
        let order = first.order.unwrap_or(seq);
        // Zero-padded so sidecar names sort in dequeue order
        let token = format!("{order:016x}-{:x}-{seq:x}", std::process::id());
        let locked = QueuedItem {
            order: Some(order),
            item: first.item,
        };
        // Persist the lock sidecar before the item leaves the queue file
        fs::create_dir_all(self.lock_dir(kind)).await.ok()?;
        let line = serde_json::to_string(&locked).ok()?;
        fs::write(self.lock_path(kind, &token), line).await.ok()?;
        self.store_queue(kind, &items).await.ok()?;
        Some((locked.item, token))
    }

    async fn ack(&self, kind: QueueKind, token: &str) -> Result<(), String> {
        let path = self.lock_path(kind, token);
        if fs::try_exists(&path).await.unwrap_or(false) {
            fs::remove_file(&path).await.map_err(|e| e.to_string())?;
        }
        Ok(())
    }

    async fn abandon(&self, kind: QueueKind, token: &str) -> Result<(), String> {
        let _gate = self.queue_gate.lock().await;
        let path = self.lock_path(kind, token);
        if !fs::try_exists(&path).await.unwrap_or(false) {
            return Ok(());
        }
        let data = fs::read_to_string(&path).await.map_err(|e| e.to_string())?;
        let locked: QueuedItem = serde_json::from_str(&data).map_err(|e| e.to_string())?;
        let mut items = self.load_queue(kind).await;
        let order = locked.order.unwrap_or(0);
        reinsert_released(&mut items, order, locked.item);
        self.store_queue(kind, &items).await?;
        fs::remove_file(&path).await.map_err(|e| e.to_string())?;
        Ok(())
    }

    async fn latest_execution_id(&self, instance: &str) -> Option<u64> {
        let inst_dir = self.inst_root(instance);
        let mut max_eid = 0u64;
        if let Ok(mut rd) = fs::read_dir(&inst_dir).await {
            while let Ok(Some(ent)) = rd.next_entry().await {
                if let Some(name) = ent.file_name().to_str()
                    && let Some(stem) = name.strip_suffix(".jsonl")
                    && let Ok(id) = stem.parse::<u64>()
                {
                    max_eid = max_eid.max(id);
                }
            }
        }
        if max_eid == 0 { None } else { Some(max_eid) }
    }

    async fn list_executions(&self, instance: &str) -> Vec<u64> {
        match self.latest_execution_id(instance).await {
            Some(lat) => (1..=lat).collect(),
            None => Vec::new(),
        }
    }

    async fn read_with_execution(&self, instance: &str, execution_id: u64) -> Vec<Event> {
        Self::read_events(&self.exec_path(instance, execution_id)).await
    }

    async fn append_with_execution(
        &self,
        instance: &str,
        execution_id: u64,
        new_events: Vec<Event>,
    ) -> Result<(), String> {
        let path = self.exec_path(instance, execution_id);
        if !fs::try_exists(&path).await.map_err(|e| e.to_string())? {
            return Err(format!("execution not found: {}#{}", instance, execution_id));
        }
        let existing = Self::read_events(&path).await;
        let fresh = filter_duplicates(&existing, new_events);
        if existing.len() + fresh.len() > self.cap {
            return Err(format!(
                "history cap exceeded (cap={}, have={}, append={})",
                self.cap,
                existing.len(),
                fresh.len()
            ));
        }
        if fresh.is_empty() {
            return Ok(());
        }
        let mut body = String::new();
        for ev in &fresh {
            body.push_str(&serde_json::to_string(ev).map_err(|e| e.to_string())?);
            body.push('\n');
        }
        let mut file = fs::OpenOptions::new()
            .append(true)
            .open(&path)
            .await
            .map_err(|e| e.to_string())?;
        file.write_all(body.as_bytes()).await.map_err(|e| e.to_string())?;
        file.flush().await.map_err(|e| e.to_string())?;
        Ok(())
    }

    async fn create_new_execution(&self, instance: &str, orchestration: &str, input: &str) -> Result<u64, String> {
        let lat = self.latest_execution_id(instance).await.unwrap_or(0) + 1;
        fs::create_dir_all(self.inst_root(instance))
            .await
            .map_err(|e| e.to_string())?;
        fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(self.exec_path(instance, lat))
            .await
            .map_err(|e| e.to_string())?;
        self.append_with_execution(
            instance,
            lat,
            vec![Event::OrchestrationStarted {
                name: orchestration.to_string(),
                input: input.to_string(),
            }],
        )
        .await?;
        Ok(lat)
    }
}

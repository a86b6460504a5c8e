use crate::_typed_codec::{Codec, Json};
use crate::providers::in_memory::InMemoryHistoryStore;
use crate::providers::{HistoryStore, QueueKind, WorkItem};
use crate::runtime::replay::{Decision, ReplayEngine as _};
use crate::runtime::status::status_from_history;
use crate::{Event, OrchestrationContext, logging};
use async_trait::async_trait;
use serde::{Serialize, de::DeserializeOwned};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

pub mod completions;
pub mod dispatch;
pub mod registry;
pub mod replay;
pub mod router;
pub mod status;
pub(crate) mod timers;

/// High-level orchestration status derived from history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrchestrationStatus {
    NotFound,
    Running,
    Completed { output: String },
    Failed { error: String },
}

/// Error type returned by orchestration wait helpers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitError {
    Timeout,
    Other(String),
}

/// How `raise_event` handled a signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalDisposition {
    /// Queued for the instance; it stays buffered in history until a wait consumes it.
    Enqueued,
    /// The instance already completed or failed, so the signal was dropped.
    DroppedTerminal,
}

/// Trait implemented by orchestration handlers that can be invoked by the runtime.
#[async_trait]
pub trait OrchestrationHandler: Send + Sync {
    async fn invoke(&self, ctx: OrchestrationContext, input: String) -> Result<String, String>;
}

/// Function wrapper that implements `OrchestrationHandler`.
pub struct FnOrchestration<F, Fut>(pub F)
where
    F: Fn(OrchestrationContext, String) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<String, String>> + Send + 'static;

#[async_trait]
impl<F, Fut> OrchestrationHandler for FnOrchestration<F, Fut>
where
    F: Fn(OrchestrationContext, String) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<String, String>> + Send + 'static,
{
    async fn invoke(&self, ctx: OrchestrationContext, input: String) -> Result<String, String> {
        (self.0)(ctx, input).await
    }
}

pub use registry::{ActivityRegistry, ActivityRegistryBuilder, OrchestrationRegistry, OrchestrationRegistryBuilder};
pub use router::{InstanceRouter, OrchestratorMsg};

type ResultWaiter = oneshot::Sender<(Vec<Event>, Result<String, String>)>;

/// In-process runtime that executes activities and timers and persists
/// history via a `HistoryStore`.
pub struct Runtime {
    router_tx: mpsc::UnboundedSender<OrchestratorMsg>,
    router: Arc<InstanceRouter>,
    joins: Mutex<Vec<JoinHandle<()>>>,
    instance_joins: Mutex<Vec<JoinHandle<()>>>,
    history_store: Arc<dyn HistoryStore>,
    active_instances: Mutex<HashSet<String>>,
    // Instances found unfinished at startup; their pending work is re-enqueued once
    resume_pending: Mutex<HashSet<String>>,
    result_waiters: Mutex<HashMap<String, Vec<ResultWaiter>>>,
    orchestration_registry: OrchestrationRegistry,
    /// Track the current execution ID for each active instance
    current_execution_ids: Mutex<HashMap<String, u64>>,
}

fn terminal_result(history: &[Event]) -> Option<Result<String, String>> {
    match status_from_history(history) {
        OrchestrationStatus::Completed { output } => Some(Ok(output)),
        OrchestrationStatus::Failed { error } => Some(Err(error)),
        _ => None,
    }
}

fn started_name(history: &[Event]) -> Option<String> {
    history.iter().find_map(|e| match e {
        Event::OrchestrationStarted { name, .. } => Some(name.clone()),
        _ => None,
    })
}

impl Runtime {
    // Associated constants for runtime behavior
    const COMPLETION_BATCH_LIMIT: usize = 128;
    const POLLER_GATE_DELAY_MS: u64 = 5;
    const POLLER_IDLE_SLEEP_MS: u64 = 10;
    const ORCH_IDLE_DEHYDRATE_MS: u64 = 1000;

    /// Internal: apply pure decisions by dispatching work for them.
    async fn apply_decisions(
        self: &Arc<Self>,
        instance: &str,
        execution_id: u64,
        history: &[Event],
        decisions: Vec<Decision>,
    ) {
        debug!("apply_decisions: {instance} {decisions:?}");
        for d in decisions {
            match d {
                Decision::ContinueAsNew { .. } => { /* handled by caller */ }
                Decision::CallActivity { id, name, input } => {
                    dispatch::dispatch_call_activity(self, instance, execution_id, history, id, name, input).await;
                }
                Decision::CreateTimer { id, fire_at_ms } => {
                    dispatch::dispatch_create_timer(self, instance, execution_id, history, id, fire_at_ms).await;
                }
                Decision::CancelTimer { id } => {
                    dispatch::dispatch_cancel_timer(self, instance, execution_id, id).await;
                }
                Decision::WaitExternal { id, name } => {
                    dispatch::dispatch_wait_external(instance, id, &name).await;
                }
            }
        }
    }

    async fn ensure_instance_active(self: &Arc<Self>, instance: &str, orchestration_name: &str) -> bool {
        if self.active_instances.lock().await.contains(instance) {
            return false;
        }
        let inner = self.clone().spawn_instance(instance, orchestration_name);
        // Wrap to normalize handle type to JoinHandle<()>
        let wrapper = tokio::spawn(async move {
            let _ = inner.await;
        });
        self.instance_joins.lock().await.push(wrapper);
        true
    }

    /// Create the instance with its first execution unless it already
    /// exists. Returns whether this call created it.
    async fn create_and_activate(
        self: &Arc<Self>,
        instance: &str,
        orchestration_name: &str,
        input: String,
    ) -> Result<bool, String> {
        match self.history_store.create_instance(instance).await {
            Ok(()) => {
                let started = vec![Event::OrchestrationStarted {
                    name: orchestration_name.to_string(),
                    input,
                }];
                self.history_store
                    .append(instance, started)
                    .await
                    .map_err(|e| format!("failed to append OrchestrationStarted: {e}"))?;
                info!(instance, orchestration=%orchestration_name, "instance created");
                self.ensure_instance_active(instance, orchestration_name).await;
                Ok(true)
            }
            Err(e) if e.starts_with(crate::providers::INSTANCE_EXISTS) => {
                debug!(instance, "instance already exists");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    async fn start_internal_rx(
        self: Arc<Self>,
        instance: &str,
        orchestration_name: &str,
        input: String,
    ) -> Result<oneshot::Receiver<(Vec<Event>, Result<String, String>)>, String> {
        let created = self.create_and_activate(instance, orchestration_name, input).await?;
        if !created {
            warn!(instance, "instance already has history; duplicate start accepted");
        }
        let (tx, rx) = oneshot::channel::<(Vec<Event>, Result<String, String>)>();
        self.result_waiters
            .lock()
            .await
            .entry(instance.to_string())
            .or_default()
            .push(tx);
        // The instance may have finished before the waiter was registered
        let hist = self.history_store.read(instance).await;
        if let Some(result) = terminal_result(&hist) {
            self.notify_waiters(instance, &hist, result).await;
        } else if !created {
            self.ensure_instance_active(instance, orchestration_name).await;
        }
        Ok(rx)
    }

    async fn notify_waiters(&self, instance: &str, history: &[Event], result: Result<String, String>) {
        if let Some(waiters) = self.result_waiters.lock().await.remove(instance) {
            for w in waiters {
                let _ = w.send((history.to_vec(), result.clone()));
            }
        }
    }

    /// Get the current execution ID for an instance, or fetch from store if not tracked
    async fn get_execution_id_for_instance(&self, instance: &str) -> u64 {
        if let Some(&exec_id) = self.current_execution_ids.lock().await.get(instance) {
            return exec_id;
        }
        self.history_store.latest_execution_id(instance).await.unwrap_or(1)
    }

    /// Validate that a completion's execution_id matches the current running execution.
    /// Returns true if valid, false if should be ignored (with warning logged).
    async fn validate_completion_execution_id(&self, instance: &str, completion_execution_id: u64) -> bool {
        let current_id = self.get_execution_id_for_instance(instance).await;
        if completion_execution_id == current_id {
            return true;
        }
        if completion_execution_id < current_id {
            warn!(
                instance = %instance,
                completion_execution_id = completion_execution_id,
                current_execution_id = current_id,
                "ignoring completion from older execution (likely from ContinueAsNew)"
            );
        } else {
            warn!(
                instance = %instance,
                completion_execution_id = completion_execution_id,
                current_execution_id = current_id,
                "ignoring completion from future execution (unexpected)"
            );
        }
        false
    }

    /// Common handler for orchestrator-queue items that target a specific instance.
    /// Validates execution ID (if provided), ensures the instance is active (rehydrates) or
    /// forwards the message to the in-proc router with the provided ack token.
    async fn orchestrator_deliver_or_rehydrate<F>(
        self: &Arc<Self>,
        instance: &str,
        exec_id_check: Option<u64>,
        token: String,
        build_msg: F,
    ) where
        F: FnOnce(String) -> OrchestratorMsg,
    {
        if let Some(execution_id) = exec_id_check
            && !self.validate_completion_execution_id(instance, execution_id).await
        {
            let _ = self.history_store.ack(QueueKind::Orchestrator, &token).await;
            return;
        }

        if !self.router.is_registered(instance).await {
            if self.history_store.latest_execution_id(instance).await.is_none() {
                warn!(instance, "dropping message for unknown instance");
                let _ = self.history_store.ack(QueueKind::Orchestrator, &token).await;
                return;
            }
            let hist = self.history_store.read(instance).await;
            if terminal_result(&hist).is_some() {
                match build_msg(token.clone()) {
                    OrchestratorMsg::ExternalByName { name, .. } => {
                        warn!(instance, event_name=%name, "dropping external event raised to terminated instance")
                    }
                    other => debug!(instance, ?other, "dropping completion for terminated instance"),
                }
                let _ = self.history_store.ack(QueueKind::Orchestrator, &token).await;
                return;
            }
            match started_name(&hist) {
                Some(orch_name) => {
                    self.ensure_instance_active(instance, &orch_name).await;
                }
                None => debug!(instance, "instance not started yet; deferring message"),
            }
            let _ = self.history_store.abandon(QueueKind::Orchestrator, &token).await;
            tokio::time::sleep(std::time::Duration::from_millis(Self::POLLER_GATE_DELAY_MS)).await;
            return;
        }

        // Active: forward with ack token
        let _ = self.router_tx.send(build_msg(token));
    }

    /// Start an orchestration and return a handle resolving to its final
    /// history and string output. An existing instance is not recreated.
    pub async fn start_orchestration(
        self: Arc<Self>,
        instance: &str,
        orchestration_name: &str,
        input: impl Into<String>,
    ) -> Result<JoinHandle<(Vec<Event>, Result<String, String>)>, String> {
        let rx = self
            .clone()
            .start_internal_rx(instance, orchestration_name, input.into())
            .await?;
        Ok(tokio::spawn(async move {
            rx.await
                .unwrap_or_else(|_| (Vec::new(), Err("runtime dropped the result waiter".to_string())))
        }))
    }

    /// Start a typed orchestration; input/output are serialized internally.
    pub async fn start_orchestration_typed<In, Out>(
        self: Arc<Self>,
        instance: &str,
        orchestration_name: &str,
        input: In,
    ) -> Result<JoinHandle<(Vec<Event>, Result<Out, String>)>, String>
    where
        In: Serialize,
        Out: DeserializeOwned + Send + 'static,
    {
        let payload = Json::encode(&input).map_err(|e| format!("encode: {e}"))?;
        let rx = self
            .clone()
            .start_internal_rx(instance, orchestration_name, payload)
            .await?;
        Ok(tokio::spawn(async move {
            match rx.await {
                Ok((hist, Ok(s))) => (hist, Json::decode::<Out>(&s)),
                Ok((hist, Err(e))) => (hist, Err(e)),
                Err(_) => (Vec::new(), Err("runtime dropped the result waiter".to_string())),
            }
        }))
    }

    /// Create the instance if it does not exist yet, without waiting for a
    /// result. Returns `true` when this call created it.
    pub async fn ensure_orchestration(
        self: Arc<Self>,
        instance: &str,
        orchestration_name: &str,
        input: impl Into<String>,
    ) -> Result<bool, String> {
        self.create_and_activate(instance, orchestration_name, input.into()).await
    }

    /// Typed variant of `ensure_orchestration`.
    pub async fn ensure_orchestration_typed<In: Serialize>(
        self: Arc<Self>,
        instance: &str,
        orchestration_name: &str,
        input: &In,
    ) -> Result<bool, String> {
        let payload = Json::encode(input).map_err(|e| format!("encode: {e}"))?;
        self.ensure_orchestration(instance, orchestration_name, payload).await
    }

    /// Start a new runtime using the in-memory history store.
    pub async fn start(
        activity_registry: Arc<registry::ActivityRegistry>,
        orchestration_registry: OrchestrationRegistry,
    ) -> Arc<Self> {
        let history_store: Arc<dyn HistoryStore> = Arc::new(InMemoryHistoryStore::default());
        Self::start_with_store(history_store, activity_registry, orchestration_registry).await
    }

    /// Start a new runtime with a custom `HistoryStore` implementation.
    /// Unfinished instances found in the store are resumed.
    pub async fn start_with_store(
        history_store: Arc<dyn HistoryStore>,
        activity_registry: Arc<registry::ActivityRegistry>,
        orchestration_registry: OrchestrationRegistry,
    ) -> Arc<Self> {
        // Install a default subscriber if none set (ok to call many times)
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
            .try_init();

        let (router_tx, mut router_rx) = mpsc::unbounded_channel::<OrchestratorMsg>();
        let router = Arc::new(InstanceRouter::new());
        let mut joins: Vec<JoinHandle<()>> = Vec::new();

        // spawn router forwarding task
        let router_clone = router.clone();
        let store_for_router = history_store.clone();
        joins.push(tokio::spawn(async move {
            while let Some(msg) = router_rx.recv().await {
                // The inbox went away after the dispatcher checked it; release for redelivery
                if let Err(msg) = router_clone.forward(msg).await
                    && let Some(token) = msg.ack_token()
                {
                    let _ = store_for_router.abandon(QueueKind::Orchestrator, token).await;
                }
            }
        }));

        let runtime = Arc::new(Self {
            router_tx,
            router,
            joins: Mutex::new(joins),
            instance_joins: Mutex::new(Vec::new()),
            history_store,
            active_instances: Mutex::new(HashSet::new()),
            resume_pending: Mutex::new(HashSet::new()),
            result_waiters: Mutex::new(HashMap::new()),
            orchestration_registry,
            current_execution_ids: Mutex::new(HashMap::new()),
        });

        let handle = runtime.clone().start_orchestration_dispatcher();
        runtime.joins.lock().await.push(handle);

        // background work dispatcher (executes activities)
        let work_handle = runtime.clone().start_work_dispatcher(activity_registry);
        runtime.joins.lock().await.push(work_handle);

        let timer_handle = runtime.clone().start_timer_dispatcher();
        runtime.joins.lock().await.push(timer_handle);

        runtime.resume_pending_instances().await;
        runtime
    }

    /// Reactivate every instance whose latest execution has not finished.
    async fn resume_pending_instances(self: &Arc<Self>) {
        for inst in self.history_store.list_instances().await {
            let hist = self.history_store.read(&inst).await;
            if terminal_result(&hist).is_some() {
                continue;
            }
            let Some(orch_name) = started_name(&hist) else {
                continue;
            };
            info!(instance=%inst, orchestration=%orch_name, "resuming unfinished instance");
            self.resume_pending.lock().await.insert(inst.clone());
            self.ensure_instance_active(&inst, &orch_name).await;
        }
    }

    fn start_orchestration_dispatcher(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                let Some((item, token)) = self.history_store.dequeue_peek_lock(QueueKind::Orchestrator).await else {
                    tokio::time::sleep(std::time::Duration::from_millis(Self::POLLER_IDLE_SLEEP_MS)).await;
                    continue;
                };
                match item {
                    WorkItem::ActivityCompleted {
                        instance,
                        execution_id,
                        id,
                        result,
                    } => {
                        debug!("ActivityCompleted: {instance} {execution_id} {id} {result}");
                        let instance_c = instance.clone();
                        self.orchestrator_deliver_or_rehydrate(&instance, Some(execution_id), token, move |t| {
                            OrchestratorMsg::ActivityCompleted {
                                instance: instance_c,
                                execution_id,
                                id,
                                result,
                                ack_token: Some(t),
                            }
                        })
                        .await;
                    }
                    WorkItem::ActivityFailed {
                        instance,
                        execution_id,
                        id,
                        error,
                    } => {
                        debug!("ActivityFailed: {instance} {execution_id} {id} {error}");
                        let instance_c = instance.clone();
                        self.orchestrator_deliver_or_rehydrate(&instance, Some(execution_id), token, move |t| {
                            OrchestratorMsg::ActivityFailed {
                                instance: instance_c,
                                execution_id,
                                id,
                                error,
                                ack_token: Some(t),
                            }
                        })
                        .await;
                    }
                    WorkItem::TimerFired {
                        instance,
                        execution_id,
                        id,
                        fire_at_ms,
                    } => {
                        debug!("TimerFired: {instance} {execution_id} {id} {fire_at_ms}");
                        let instance_c = instance.clone();
                        self.orchestrator_deliver_or_rehydrate(&instance, Some(execution_id), token, move |t| {
                            OrchestratorMsg::TimerFired {
                                instance: instance_c,
                                execution_id,
                                id,
                                fire_at_ms,
                                ack_token: Some(t),
                            }
                        })
                        .await;
                    }
                    // Not tied to an execution: it belongs to whichever execution is current
                    WorkItem::ExternalRaised {
                        instance,
                        name,
                        data,
                        raise_id,
                    } => {
                        debug!("ExternalRaised: {instance} {name} {data} {raise_id}");
                        let instance_c = instance.clone();
                        self.orchestrator_deliver_or_rehydrate(&instance, None, token, move |t| {
                            OrchestratorMsg::ExternalByName {
                                instance: instance_c,
                                name,
                                data,
                                raise_id,
                                ack_token: Some(t),
                            }
                        })
                        .await;
                    }
                    other => {
                        error!(?other, "unexpected WorkItem in Orchestrator dispatcher; dropping");
                        let _ = self.history_store.ack(QueueKind::Orchestrator, &token).await;
                    }
                }
            }
        })
    }

    fn start_work_dispatcher(self: Arc<Self>, activities: Arc<registry::ActivityRegistry>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                let Some((item, token)) = self.history_store.dequeue_peek_lock(QueueKind::Worker).await else {
                    tokio::time::sleep(std::time::Duration::from_millis(Self::POLLER_IDLE_SLEEP_MS)).await;
                    continue;
                };
                // Activities may be slow; run each on its own task
                let rt = self.clone();
                let activities = activities.clone();
                tokio::spawn(async move { rt.execute_activity(&activities, item, token).await });
            }
        })
    }

    async fn execute_activity(&self, activities: &registry::ActivityRegistry, item: WorkItem, token: String) {
        let WorkItem::ActivityExecute {
            instance,
            execution_id,
            id,
            name,
            input,
        } = item
        else {
            error!(?item, "unexpected WorkItem in Worker dispatcher; dropping");
            let _ = self.history_store.ack(QueueKind::Worker, &token).await;
            return;
        };
        let outcome = match activities.get(&name) {
            Some(handler) => handler.invoke(input).await,
            None => Err(format!("unregistered:{}", name)),
        };
        let completion = match outcome {
            Ok(result) => WorkItem::ActivityCompleted {
                instance: instance.clone(),
                execution_id,
                id,
                result,
            },
            Err(error) => {
                warn!(instance=%instance, id, name=%name, error=%error, "activity failed");
                WorkItem::ActivityFailed {
                    instance: instance.clone(),
                    execution_id,
                    id,
                    error,
                }
            }
        };
        if let Err(e) = self.history_store.enqueue_work(QueueKind::Orchestrator, completion).await {
            // Leave the item locked-out so it is not acked without a recorded completion
            error!(instance=%instance, id, error=%e, "failed to enqueue activity completion");
            let _ = self.history_store.abandon(QueueKind::Worker, &token).await;
            return;
        }
        let _ = self.history_store.ack(QueueKind::Worker, &token).await;
    }

    fn start_timer_dispatcher(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let (svc_jh, svc_tx) =
                crate::runtime::timers::TimerService::start(self.history_store.clone(), Self::POLLER_IDLE_SLEEP_MS);

            // Intake: forward schedules and cancellations to the service, then ack
            loop {
                let Some((item, token)) = self.history_store.dequeue_peek_lock(QueueKind::Timer).await else {
                    if svc_jh.is_finished() {
                        error!("timer service stopped");
                        return;
                    }
                    tokio::time::sleep(std::time::Duration::from_millis(Self::POLLER_IDLE_SLEEP_MS)).await;
                    continue;
                };
                match item {
                    WorkItem::TimerSchedule { .. } | WorkItem::TimerCancel { .. } => {
                        let _ = svc_tx.send(item);
                    }
                    other => error!(?other, "unexpected WorkItem in Timer dispatcher; dropping"),
                }
                let _ = self.history_store.ack(QueueKind::Timer, &token).await;
            }
        })
    }

    /// Abort background tasks and instance loops. Channels are dropped with the runtime.
    pub async fn shutdown(self: Arc<Self>) {
        let mut joins = self.joins.lock().await;
        for j in joins.drain(..) {
            j.abort();
        }
        let mut instance_joins = self.instance_joins.lock().await;
        for j in instance_joins.drain(..) {
            j.abort();
        }
    }

    /// Close the instance's inbox after a terminal outcome and notify waiters.
    /// Messages still queued in the inbox are acknowledged and dropped.
    async fn finish_instance(
        &self,
        instance: &str,
        comp_rx: &mut mpsc::UnboundedReceiver<OrchestratorMsg>,
        history: &[Event],
        result: Result<String, String>,
    ) {
        self.router.unregister(instance).await;
        while let Ok(msg) = comp_rx.try_recv() {
            if let OrchestratorMsg::ExternalByName { name, .. } = &msg {
                warn!(instance, event_name=%name, "dropping external event raised to terminated instance");
            }
            if let Some(t) = msg.ack_token() {
                let _ = self.history_store.ack(QueueKind::Orchestrator, t).await;
            }
        }
        self.notify_waiters(instance, history, result).await;
    }

    /// Close the inbox of an idle instance; anything that raced in goes back
    /// to the provider queue and will rehydrate the instance.
    async fn dehydrate_instance(&self, instance: &str, comp_rx: &mut mpsc::UnboundedReceiver<OrchestratorMsg>) {
        self.router.unregister(instance).await;
        while let Ok(msg) = comp_rx.try_recv() {
            if let Some(t) = msg.ack_token() {
                let _ = self.history_store.abandon(QueueKind::Orchestrator, t).await;
            }
        }
        debug!(instance, "dehydrated idle instance");
    }

    /// Close the current execution with `OrchestrationContinuedAsNew`, open
    /// the next one, and carry unconsumed external events into it.
    async fn continue_as_new(
        &self,
        instance: &str,
        orchestration_name: &str,
        execution_id: u64,
        turn_deltas: &[Event],
        input: &str,
        carried: Vec<Event>,
    ) -> Result<u64, String> {
        let mut closing = turn_deltas.to_vec();
        closing.push(Event::OrchestrationContinuedAsNew {
            input: input.to_string(),
        });
        self.history_store
            .append_with_execution(instance, execution_id, closing)
            .await?;
        let new_execution_id = self
            .history_store
            .create_new_execution(instance, orchestration_name, input)
            .await?;
        let carried_count = carried.len();
        if !carried.is_empty() {
            self.history_store
                .append_with_execution(instance, new_execution_id, carried)
                .await?;
        }
        self.current_execution_ids
            .lock()
            .await
            .insert(instance.to_string(), new_execution_id);
        info!(
            instance,
            previous_execution_id = execution_id,
            execution_id = new_execution_id,
            carried_events = carried_count,
            "continued as new"
        );
        Ok(new_execution_id)
    }

    /// Drive an instance until it finishes or goes idle. Returns the latest
    /// history and the terminal result; an idle (dehydrated) instance
    /// returns `Ok("")`.
    pub async fn run_instance(self: Arc<Self>, instance: &str, orchestration_name: &str) -> (Vec<Event>, Result<String, String>) {
        // Ensure instance not already active in this runtime
        {
            let mut act = self.active_instances.lock().await;
            if !act.insert(instance.to_string()) {
                return (Vec::new(), Err("already_active".into()));
            }
        }
        // Ensure removal of active flag even if the task panics
        struct ActiveGuard {
            rt: Arc<Runtime>,
            inst: String,
        }
        impl Drop for ActiveGuard {
            fn drop(&mut self) {
                let rt = self.rt.clone();
                let inst = self.inst.clone();
                // spawn the removal since Drop can't be async
                let _ = tokio::spawn(async move {
                    rt.active_instances.lock().await.remove(&inst);
                    rt.current_execution_ids.lock().await.remove(&inst);
                });
            }
        }
        let _active_guard = ActiveGuard {
            rt: self.clone(),
            inst: instance.to_string(),
        };

        let mut execution_id = self.history_store.latest_execution_id(instance).await.unwrap_or(1);
        let mut history = self.history_store.read_with_execution(instance, execution_id).await;
        self.current_execution_ids
            .lock()
            .await
            .insert(instance.to_string(), execution_id);

        if let Some(result) = terminal_result(&history) {
            self.notify_waiters(instance, &history, result.clone()).await;
            return (history, result);
        }

        let mut comp_rx = self.router.register(instance).await;

        if self.resume_pending.lock().await.remove(instance) {
            completions::rehydrate_pending(instance, execution_id, &history, &self.history_store).await;
        }

        let mut current_input: String = history
            .iter()
            .find_map(|e| match e {
                Event::OrchestrationStarted { name, input } if name == orchestration_name => Some(input.clone()),
                _ => None,
            })
            .unwrap_or_default();

        let Some(orchestration_handler) = self.orchestration_registry.get(orchestration_name) else {
            let err = format!("unregistered:{}", orchestration_name);
            let failed = Event::OrchestrationFailed { error: err.clone() };
            if let Err(e) = self
                .history_store
                .append_with_execution(instance, execution_id, vec![failed.clone()])
                .await
            {
                error!(instance, error=%e, "failed to append OrchestrationFailed for unknown orchestration");
            }
            history.push(failed);
            self.finish_instance(instance, &mut comp_rx, &history, Err(err.clone()))
                .await;
            return (history, Err(err));
        };

        let engine = replay::DefaultReplayEngine::new();
        let mut turn_index: u64 = 0;
        let mut replay_frontier = replay::loaded_frontier(&history);
        loop {
            let baseline_len = history.len();
            let (hist_after, decisions, logs, out_opt, claims) = engine.replay(
                history,
                turn_index,
                replay_frontier,
                orchestration_handler.clone(),
                current_input.clone(),
            );
            history = hist_after;
            logging::flush_turn_logs(instance, execution_id, turn_index, logs);

            // ContinueAsNew ends this execution regardless of out_opt
            if let Some(input) = decisions.iter().find_map(|d| match d {
                Decision::ContinueAsNew { input } => Some(input.clone()),
                _ => None,
            }) {
                match self
                    .continue_as_new(
                        instance,
                        orchestration_name,
                        execution_id,
                        &history[baseline_len..],
                        &input,
                        claims.pending_external_events,
                    )
                    .await
                {
                    Ok(new_execution_id) => {
                        execution_id = new_execution_id;
                        history = self
                            .history_store
                            .read_with_execution(instance, execution_id)
                            .await;
                        current_input = input;
                        turn_index = 0;
                        replay_frontier = 0;
                        continue;
                    }
                    Err(e) => {
                        error!(instance, execution_id, error=%e, "continue-as-new failed");
                        let err = format!("continue-as-new failed: {e}");
                        self.finish_instance(instance, &mut comp_rx, &history, Err(err.clone()))
                            .await;
                        return (history, Err(err));
                    }
                }
            }

            // Persist deltas produced by this turn
            if history.len() > baseline_len
                && let Err(e) = self
                    .history_store
                    .append_with_execution(instance, execution_id, history[baseline_len..].to_vec())
                    .await
            {
                error!(instance, turn_index, error=%e, "failed to append turn events");
                let err = format!("history append failed: {e}");
                self.finish_instance(instance, &mut comp_rx, &history, Err(err.clone()))
                    .await;
                return (history, Err(err));
            }

            if let Some(out) = out_opt {
                let term = match &out {
                    Ok(s) => Event::OrchestrationCompleted { output: s.clone() },
                    Err(e) => Event::OrchestrationFailed { error: e.clone() },
                };
                if let Err(e) = self
                    .history_store
                    .append_with_execution(instance, execution_id, vec![term.clone()])
                    .await
                {
                    error!(instance, turn_index, error=%e, "failed to append terminal event");
                    let err = format!("history append failed: {e}");
                    self.finish_instance(instance, &mut comp_rx, &history, Err(err.clone()))
                        .await;
                    return (history, Err(err));
                }
                history.push(term);
                match &out {
                    Ok(output) => info!(instance, execution_id, output=%output, "orchestration completed"),
                    Err(error) => warn!(instance, execution_id, error=%error, "orchestration failed"),
                }
                self.finish_instance(instance, &mut comp_rx, &history, out.clone())
                    .await;
                return (history, out);
            }

            self.apply_decisions(instance, execution_id, &history, decisions).await;

            // Receive at least one completion, or dehydrate on idle timeout.
            // Instances with result waiters stay resident.
            let len_before_completions = history.len();
            let first = loop {
                match tokio::time::timeout(
                    std::time::Duration::from_millis(Self::ORCH_IDLE_DEHYDRATE_MS),
                    comp_rx.recv(),
                )
                .await
                {
                    Ok(msg) => break msg,
                    Err(_timeout) => {
                        if !self.result_waiters.lock().await.contains_key(instance) {
                            break None;
                        }
                    }
                }
            };
            let Some(first) = first else {
                self.dehydrate_instance(instance, &mut comp_rx).await;
                return (history, Ok(String::new()));
            };

            let mut batch = vec![first];
            while batch.len() < Self::COMPLETION_BATCH_LIMIT {
                match comp_rx.try_recv() {
                    Ok(msg) => batch.push(msg),
                    Err(_) => break,
                }
            }
            let mut ack_tokens: Vec<String> = Vec::new();
            for msg in batch {
                if let (Some(t), _changed) = completions::append_completion(&mut history, msg) {
                    ack_tokens.push(t);
                }
            }

            // Persist, then ack the peek-locked items that produced the events
            if history.len() > len_before_completions {
                if let Err(e) = self
                    .history_store
                    .append_with_execution(instance, execution_id, history[len_before_completions..].to_vec())
                    .await
                {
                    error!(instance, turn_index, error=%e, "failed to append history");
                    for t in &ack_tokens {
                        let _ = self.history_store.abandon(QueueKind::Orchestrator, t).await;
                    }
                    let err = format!("history append failed: {e}");
                    self.finish_instance(instance, &mut comp_rx, &history, Err(err.clone()))
                        .await;
                    return (history, Err(err));
                }
                turn_index = turn_index.saturating_add(1);
            }
            for t in ack_tokens {
                let _ = self.history_store.ack(QueueKind::Orchestrator, &t).await;
            }
            replay_frontier = len_before_completions;
        }
    }

    /// Spawn an instance loop and return a handle resolving to its history
    /// and output.
    pub fn spawn_instance(
        self: Arc<Self>,
        instance: &str,
        orchestration_name: &str,
    ) -> JoinHandle<(Vec<Event>, Result<String, String>)> {
        let this_for_task = self.clone();
        let inst = instance.to_string();
        let orch_name = orchestration_name.to_string();
        tokio::spawn(async move { this_for_task.run_instance(&inst, &orch_name).await })
    }
}

impl Runtime {
    /// Raise an external event by name. The event is buffered in the
    /// instance's history until a wait on `name` consumes it; an instance
    /// that already completed or failed drops it.
    pub async fn raise_event(
        &self,
        instance: &str,
        name: impl Into<String>,
        data: impl Into<String>,
    ) -> Result<SignalDisposition, String> {
        let raise_id = uuid::Uuid::new_v4().to_string();
        self.raise_event_with_id(instance, name, data, raise_id).await
    }

    /// Like `raise_event` with a caller-chosen `raise_id`. Raising twice with
    /// the same id records the event once.
    pub async fn raise_event_with_id(
        &self,
        instance: &str,
        name: impl Into<String>,
        data: impl Into<String>,
        raise_id: impl Into<String>,
    ) -> Result<SignalDisposition, String> {
        let name_str = name.into();
        let data_str = data.into();
        let raise_id = raise_id.into();
        if self.history_store.latest_execution_id(instance).await.is_none() {
            return Err(format!("instance not found: {instance}"));
        }
        if let OrchestrationStatus::Completed { .. } | OrchestrationStatus::Failed { .. } =
            self.get_orchestration_status(instance).await
        {
            warn!(instance, event_name=%name_str, "raise_event: instance has terminated; dropping external event");
            return Ok(SignalDisposition::DroppedTerminal);
        }
        self.history_store
            .enqueue_work(
                QueueKind::Orchestrator,
                WorkItem::ExternalRaised {
                    instance: instance.to_string(),
                    name: name_str.clone(),
                    data: data_str.clone(),
                    raise_id: raise_id.clone(),
                },
            )
            .await
            .map_err(|e| {
                warn!(instance, name=%name_str, error=%e, "raise_event: failed to enqueue ExternalRaised");
                e
            })?;
        info!(instance, name=%name_str, data=%data_str, raise_id=%raise_id, "raise_event: enqueued external");
        Ok(SignalDisposition::Enqueued)
    }

    /// Wait until the orchestration reaches a terminal state (Completed/Failed) or the timeout elapses.
    pub async fn wait_for_orchestration(
        &self,
        instance: &str,
        timeout: std::time::Duration,
    ) -> Result<OrchestrationStatus, WaitError> {
        let deadline = std::time::Instant::now() + timeout;
        // poll with backoff
        let mut delay_ms: u64 = 5;
        loop {
            match self.get_orchestration_status(instance).await {
                st @ (OrchestrationStatus::Completed { .. } | OrchestrationStatus::Failed { .. }) => return Ok(st),
                _ if std::time::Instant::now() >= deadline => return Err(WaitError::Timeout),
                _ => {
                    tokio::time::sleep(std::time::Duration::from_millis(delay_ms)).await;
                    delay_ms = (delay_ms.saturating_mul(2)).min(100);
                }
            }
        }
    }

    /// Typed variant: returns Ok(Ok<T>) on Completed with decoded output, Ok(Err(String)) on Failed.
    pub async fn wait_for_orchestration_typed<Out: DeserializeOwned>(
        &self,
        instance: &str,
        timeout: std::time::Duration,
    ) -> Result<Result<Out, String>, WaitError> {
        match self.wait_for_orchestration(instance, timeout).await? {
            OrchestrationStatus::Completed { output } => match Json::decode::<Out>(&output) {
                Ok(v) => Ok(Ok(v)),
                Err(e) => Err(WaitError::Other(format!("decode failed: {e}"))),
            },
            OrchestrationStatus::Failed { error } => Ok(Err(error)),
            other => Err(WaitError::Other(format!("unexpected status {other:?}"))),
        }
    }
}

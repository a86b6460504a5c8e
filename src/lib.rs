//! Deterministic orchestration core and the signal-or-timer workflow built on it.
//!
//! The crate records append-only `Event`s and replays them so that
//! orchestration logic stays deterministic across restarts. It provides:
//!
//! - Public data model: `Event`, `Action`
//! - Orchestration driver: `run_turn`, `run_turn_with`, and `Executor`
//! - An `OrchestrationContext` with futures to schedule activities,
//!   timers, and external events using correlation IDs
//! - A `DurableFuture` that composes with the deterministic `select2`
//! - The `workflow` module: a long-lived orchestration that races an
//!   external signal against a bounded timer and continues-as-new until
//!   its expiration passes
use std::collections::HashSet;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll, Waker};

pub mod config;
pub mod error;
pub mod futures;
pub mod logging;
pub mod providers;
pub mod runtime;
pub mod workflow;

pub use runtime::{OrchestrationHandler, OrchestrationRegistry, OrchestrationRegistryBuilder, OrchestrationStatus};

/// System activity returning wall-clock milliseconds since the Unix epoch.
pub const SYSTEM_NOW_ACTIVITY: &str = "__system_now";
/// System activity returning a fresh random identifier.
pub const SYSTEM_NEW_GUID_ACTIVITY: &str = "__system_new_guid";

use crate::_typed_codec::Codec;
use crate::logging::LogLevel;
use serde::{Deserialize, Serialize};

// Internal codec utilities for typed I/O
mod _typed_codec {
    use serde::{Serialize, de::DeserializeOwned};
    use serde_json::Value;
    pub trait Codec {
        fn encode<T: Serialize>(v: &T) -> Result<String, String>;
        fn decode<T: DeserializeOwned>(s: &str) -> Result<T, String>;
    }
    pub struct Json;
    impl Codec for Json {
        fn encode<T: Serialize>(v: &T) -> Result<String, String> {
            // Bare strings are stored raw so string payloads read naturally in history
            match serde_json::to_value(v) {
                Ok(Value::String(s)) => Ok(s),
                Ok(val) => serde_json::to_string(&val).map_err(|e| e.to_string()),
                Err(e) => Err(e.to_string()),
            }
        }
        fn decode<T: DeserializeOwned>(s: &str) -> Result<T, String> {
            match serde_json::from_str::<T>(s) {
                Ok(v) => Ok(v),
                Err(_) => {
                    let val = Value::String(s.to_string());
                    serde_json::from_value(val).map_err(|e| e.to_string())
                }
            }
        }
    }
}

/// Append-only orchestration history entries persisted by a provider and
/// consumed during replay. Scheduling events and their completions share a
/// stable correlation `id`; external events are buffered by name instead.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum Event {
    /// Execution started by orchestration name with its input.
    OrchestrationStarted { name: String, input: String },
    /// Orchestration completed with a final result.
    OrchestrationCompleted { output: String },
    /// Orchestration failed with a final error.
    OrchestrationFailed { error: String },
    /// Execution ended by continuing as new with fresh input.
    OrchestrationContinuedAsNew { input: String },

    /// Activity was scheduled with a unique ID and input.
    ActivityScheduled { id: u64, name: String, input: String },
    /// Activity completed successfully with a result.
    ActivityCompleted { id: u64, result: String },
    /// Activity failed with an error string.
    ActivityFailed { id: u64, error: String },

    /// Timer was created and will fire at absolute time `fire_at_ms`.
    TimerCreated { id: u64, fire_at_ms: u64 },
    /// Timer fired at logical time `fire_at_ms`.
    TimerFired { id: u64, fire_at_ms: u64 },
    /// Timer lost a race and was cancelled; a later `TimerFired` is ignored.
    TimerCancelled { id: u64 },

    /// A wait on the named external event was recorded.
    ExternalSubscribed { id: u64, name: String },
    /// An external event was raised. It stays buffered until a wait on
    /// `name` consumes it; `raise_id` makes redelivery idempotent.
    ExternalEvent { name: String, data: String, raise_id: String },
}

impl Event {
    /// True for events that close an execution.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Event::OrchestrationCompleted { .. }
                | Event::OrchestrationFailed { .. }
                | Event::OrchestrationContinuedAsNew { .. }
        )
    }
}

/// Declarative decisions produced by an orchestration turn. The host
/// materializes these into work items and, eventually, completion events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Schedule an activity invocation.
    CallActivity { id: u64, name: String, input: String },
    /// Create a timer firing at an absolute time.
    CreateTimer { id: u64, fire_at_ms: u64 },
    /// Best-effort cancellation of a timer that lost a race.
    CancelTimer { id: u64 },
    /// Subscribe to an external event by name.
    WaitExternal { id: u64, name: String },
    /// End this execution and start a fresh one with `input`.
    ContinueAsNew { input: String },
}

#[derive(Debug)]
struct CtxInner {
    history: Vec<Event>,
    actions: Vec<Action>,
    next_correlation_id: u64,

    turn_index: u64,
    // Events at or beyond this index were appended since the previous turn
    replay_frontier: usize,
    replaying: bool,
    log_buffer: Vec<(LogLevel, String)>,

    claimed_activity_ids: HashSet<u64>,
    claimed_timer_ids: HashSet<u64>,
    claimed_external_ids: HashSet<u64>,
    // History positions of ExternalEvents already handed to a wait
    consumed_externals: HashSet<usize>,
    // Correlation ids of select losers; they never resolve
    cancelled_ids: HashSet<u64>,
}

impl CtxInner {
    fn new(history: Vec<Event>, replay_frontier: usize) -> Self {
        let mut max_id = 0u64;
        for ev in &history {
            let id_opt = match ev {
                Event::ActivityScheduled { id, .. }
                | Event::ActivityCompleted { id, .. }
                | Event::ActivityFailed { id, .. }
                | Event::TimerCreated { id, .. }
                | Event::TimerFired { id, .. }
                | Event::TimerCancelled { id }
                | Event::ExternalSubscribed { id, .. } => Some(*id),
                Event::OrchestrationStarted { .. }
                | Event::OrchestrationCompleted { .. }
                | Event::OrchestrationFailed { .. }
                | Event::OrchestrationContinuedAsNew { .. }
                | Event::ExternalEvent { .. } => None,
            };
            if let Some(id) = id_opt {
                max_id = max_id.max(id);
            }
        }
        let replay_frontier = replay_frontier.min(history.len());
        let replaying = replay_frontier > 0
            && !history[replay_frontier..]
                .iter()
                .any(|e| matches!(e, Event::OrchestrationStarted { .. }));
        Self {
            history,
            actions: Vec::new(),
            next_correlation_id: max_id.saturating_add(1),
            turn_index: 0,
            replay_frontier,
            replaying,
            log_buffer: Vec::new(),
            claimed_activity_ids: Default::default(),
            claimed_timer_ids: Default::default(),
            claimed_external_ids: Default::default(),
            consumed_externals: Default::default(),
            cancelled_ids: Default::default(),
        }
    }

    fn record_action(&mut self, a: Action) {
        // A new decision means execution has moved past recorded history
        self.replaying = false;
        self.actions.push(a);
    }

    /// Note that the orchestration observed the event at `idx`.
    fn observe(&mut self, idx: usize) {
        if idx >= self.replay_frontier {
            self.replaying = false;
        }
    }

    fn next_id(&mut self) -> u64 {
        let id = self.next_correlation_id;
        self.next_correlation_id += 1;
        id
    }

    fn first_unconsumed_external(&self, name: &str) -> Option<usize> {
        self.history.iter().enumerate().find_map(|(idx, e)| match e {
            Event::ExternalEvent { name: n, .. } if n == name && !self.consumed_externals.contains(&idx) => Some(idx),
            _ => None,
        })
    }

    fn pending_external_events(&self) -> Vec<Event> {
        self.history
            .iter()
            .enumerate()
            .filter(|(idx, e)| matches!(e, Event::ExternalEvent { .. }) && !self.consumed_externals.contains(idx))
            .map(|(_, e)| e.clone())
            .collect()
    }
}

/// User-facing orchestration context for scheduling and replay-safe helpers.
///
/// This is the replay context threaded through orchestration code: every
/// non-deterministic input (time, which task won a race, activity results)
/// is read from the history it wraps instead of from the environment.
#[derive(Clone)]
pub struct OrchestrationContext {
    inner: Arc<Mutex<CtxInner>>,
}

impl OrchestrationContext {
    /// Construct a new context from an existing history vector. All events
    /// are treated as new, so logging is not suppressed.
    pub fn new(history: Vec<Event>) -> Self {
        Self::with_frontier(history, 0)
    }

    /// Construct a context where events before `replay_frontier` were
    /// already processed by an earlier turn.
    pub fn with_frontier(history: Vec<Event>, replay_frontier: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(CtxInner::new(history, replay_frontier))),
        }
    }

    fn lock(&self) -> MutexGuard<'_, CtxInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn take_actions(&self) -> Vec<Action> {
        std::mem::take(&mut self.lock().actions)
    }

    /// The zero-based turn counter assigned by the host for diagnostics.
    pub fn turn_index(&self) -> u64 {
        self.lock().turn_index
    }
    pub(crate) fn set_turn_index(&self, idx: u64) {
        self.lock().turn_index = idx;
    }

    /// True while the orchestration is re-executing decisions that an
    /// earlier turn already made.
    pub fn is_replaying(&self) -> bool {
        self.lock().replaying
    }

    /// Drain the buffered log messages accumulated during the last turn.
    pub fn take_log_buffer(&self) -> Vec<(LogLevel, String)> {
        std::mem::take(&mut self.lock().log_buffer)
    }

    /// Buffer a log message for the current turn. Messages produced while
    /// replaying are dropped so each one is emitted once.
    pub fn push_log(&self, level: LogLevel, msg: impl Into<String>) {
        let mut inner = self.lock();
        if !inner.replaying {
            inner.log_buffer.push((level, msg.into()));
        }
    }

    pub fn log_info(&self, msg: impl Into<String>) {
        self.push_log(LogLevel::Info, msg);
    }
    pub fn log_warn(&self, msg: impl Into<String>) {
        self.push_log(LogLevel::Warn, msg);
    }
    pub fn log_error(&self, msg: impl Into<String>) {
        self.push_log(LogLevel::Error, msg);
    }
    pub fn log_debug(&self, msg: impl Into<String>) {
        self.push_log(LogLevel::Debug, msg);
    }

    /// Replay-stable wall-clock reading in milliseconds since the epoch.
    /// The first execution records the value via a system activity; replays
    /// read it back from history.
    pub async fn utc_now_ms(&self) -> Result<u64, String> {
        let v = self
            .schedule_activity(crate::SYSTEM_NOW_ACTIVITY, "")
            .into_activity()
            .await?;
        v.parse::<u64>().map_err(|e| format!("system_now returned {v:?}: {e}"))
    }

    /// Replay-stable fresh identifier from a system activity.
    pub async fn new_guid(&self) -> Result<String, String> {
        self.schedule_activity(crate::SYSTEM_NEW_GUID_ACTIVITY, "")
            .into_activity()
            .await
    }

    /// Request that this execution end and a fresh one start with `input`.
    /// Unconsumed external events are carried into the new execution.
    pub fn continue_as_new(&self, input: impl Into<String>) {
        self.lock().record_action(Action::ContinueAsNew { input: input.into() });
    }

    pub fn continue_as_new_typed<In: Serialize>(&self, input: &In) -> Result<(), String> {
        let payload = crate::_typed_codec::Json::encode(input)?;
        self.continue_as_new(payload);
        Ok(())
    }

    /// External events recorded in history that no wait has consumed yet.
    pub fn pending_external_events(&self) -> Vec<Event> {
        self.lock().pending_external_events()
    }
}

pub use crate::futures::{DurableFuture, DurableOutput, SelectFuture};
use crate::futures::Kind;

impl OrchestrationContext {
    /// Schedule an activity and return a `DurableFuture` correlated to it.
    pub fn schedule_activity(&self, name: impl Into<String>, input: impl Into<String>) -> DurableFuture {
        let name: String = name.into();
        let input: String = input.into();
        let mut inner = self.lock();
        // Adopt an existing scheduled activity id that matches and isn't claimed yet
        let adopted_id = inner
            .history
            .iter()
            .find_map(|e| match e {
                Event::ActivityScheduled {
                    id,
                    name: n,
                    input: inp,
                } if n == &name && inp == &input && !inner.claimed_activity_ids.contains(id) => Some(*id),
                _ => None,
            })
            .unwrap_or_else(|| inner.next_id());
        inner.claimed_activity_ids.insert(adopted_id);
        drop(inner);
        DurableFuture(Kind::Activity {
            id: adopted_id,
            name,
            input,
            ctx: self.clone(),
        })
    }

    /// Typed helper that serializes input; pair with `into_activity_typed`.
    pub fn schedule_activity_typed<In: Serialize>(
        &self,
        name: impl Into<String>,
        input: &In,
    ) -> Result<DurableFuture, String> {
        let payload = crate::_typed_codec::Json::encode(input)?;
        Ok(self.schedule_activity(name, payload))
    }

    /// Schedule a timer firing at absolute time `fire_at_ms`.
    pub fn schedule_timer_at(&self, fire_at_ms: u64) -> DurableFuture {
        let mut inner = self.lock();
        let adopted = inner.history.iter().find_map(|e| match e {
            Event::TimerCreated { id, fire_at_ms: at } if !inner.claimed_timer_ids.contains(id) => Some((*id, *at)),
            _ => None,
        });
        // A recorded timer keeps its recorded deadline
        let (id, fire_at_ms) = adopted.unwrap_or_else(|| (inner.next_id(), fire_at_ms));
        inner.claimed_timer_ids.insert(id);
        drop(inner);
        DurableFuture(Kind::Timer {
            id,
            fire_at_ms,
            ctx: self.clone(),
        })
    }

    /// Wait for the next external event with this name and return its `DurableFuture`.
    pub fn schedule_wait(&self, name: impl Into<String>) -> DurableFuture {
        let name: String = name.into();
        let mut inner = self.lock();
        let adopted_id = inner
            .history
            .iter()
            .find_map(|e| match e {
                Event::ExternalSubscribed { id, name: n } if n == &name && !inner.claimed_external_ids.contains(id) => {
                    Some(*id)
                }
                _ => None,
            })
            .unwrap_or_else(|| inner.next_id());
        inner.claimed_external_ids.insert(adopted_id);
        drop(inner);
        DurableFuture(Kind::External {
            id: adopted_id,
            name,
            ctx: self.clone(),
        })
    }

    /// Deterministic select over two futures: returns (winner_index, DurableOutput).
    /// The loser is cancelled.
    pub fn select2(&self, a: DurableFuture, b: DurableFuture) -> SelectFuture {
        SelectFuture::new(self.clone(), vec![a, b])
    }

    /// Deterministic select over N futures.
    pub fn select(&self, futures: Vec<DurableFuture>) -> SelectFuture {
        SelectFuture::new(self.clone(), futures)
    }
}

fn poll_once<F: Future>(fut: std::pin::Pin<&mut F>) -> Poll<F::Output> {
    let mut cx = Context::from_waker(Waker::noop());
    fut.poll(&mut cx)
}

/// Tuple returned by `run_turn` and `run_turn_with` containing the updated
/// history, actions to execute, per-turn logs, and an optional output.
pub type TurnResult<O> = (Vec<Event>, Vec<Action>, Vec<(LogLevel, String)>, Option<O>);

/// Poll the orchestrator once with the provided history, producing
/// updated history, requested `Action`s, buffered logs, and an optional output.
pub fn run_turn<O, F>(history: Vec<Event>, orchestrator: impl Fn(OrchestrationContext) -> F) -> TurnResult<O>
where
    F: Future<Output = O>,
{
    run_turn_with(history, 0, 0, orchestrator)
}

/// Same as `run_turn` but annotates the context with a turn index and
/// the replay frontier used to suppress duplicate logs.
pub fn run_turn_with<O, F>(
    history: Vec<Event>,
    turn_index: u64,
    replay_frontier: usize,
    orchestrator: impl Fn(OrchestrationContext) -> F,
) -> TurnResult<O>
where
    F: Future<Output = O>,
{
    let (hist, actions, logs, out, _claims) = run_turn_with_claims(history, turn_index, replay_frontier, orchestrator);
    (hist, actions, logs, out)
}

/// Snapshot of what the orchestrator claimed and consumed during a single poll.
#[derive(Debug, Clone, Default)]
pub struct ClaimedIdsSnapshot {
    pub activities: HashSet<u64>,
    pub timers: HashSet<u64>,
    pub externals: HashSet<u64>,
    pub cancelled: HashSet<u64>,
    /// External events still unconsumed at the end of the poll.
    pub pending_external_events: Vec<Event>,
}

impl OrchestrationContext {
    pub(crate) fn claimed_ids_snapshot(&self) -> ClaimedIdsSnapshot {
        let inner = self.lock();
        ClaimedIdsSnapshot {
            activities: inner.claimed_activity_ids.clone(),
            timers: inner.claimed_timer_ids.clone(),
            externals: inner.claimed_external_ids.clone(),
            cancelled: inner.cancelled_ids.clone(),
            pending_external_events: inner.pending_external_events(),
        }
    }
}

/// Same as `run_turn_with` but also returns which correlation IDs were claimed
/// and which external events are still buffered.
pub fn run_turn_with_claims<O, F>(
    history: Vec<Event>,
    turn_index: u64,
    replay_frontier: usize,
    orchestrator: impl Fn(OrchestrationContext) -> F,
) -> (
    Vec<Event>,
    Vec<Action>,
    Vec<(LogLevel, String)>,
    Option<O>,
    ClaimedIdsSnapshot,
)
where
    F: Future<Output = O>,
{
    let ctx = OrchestrationContext::with_frontier(history, replay_frontier);
    ctx.set_turn_index(turn_index);
    let fut = std::pin::pin!(orchestrator(ctx.clone()));
    let out = match poll_once(fut) {
        Poll::Ready(out) => Some(out),
        Poll::Pending => None,
    };
    let actions = ctx.take_actions();
    let logs = ctx.take_log_buffer();
    let claims = ctx.claimed_ids_snapshot();
    let hist_after = ctx.lock().history.clone();
    (hist_after, actions, logs, out, claims)
}

/// Helper for single-threaded, host-driven execution in tests and samples.
pub struct Executor;

impl Executor {
    /// Drives an orchestrator by alternately replaying one turn and invoking
    /// the provided `execute_actions` to materialize requested actions into
    /// history, until the orchestrator completes.
    pub fn drive_to_completion<O, F, X>(
        mut history: Vec<Event>,
        orchestrator: impl Fn(OrchestrationContext) -> F,
        mut execute_actions: X,
    ) -> (Vec<Event>, O)
    where
        F: Future<Output = O>,
        X: FnMut(Vec<Action>, &mut Vec<Event>),
    {
        loop {
            let (hist_after_replay, actions, _logs, output) = run_turn(history, &orchestrator);
            history = hist_after_replay;
            if let Some(out) = output {
                return (history, out);
            }
            execute_actions(actions, &mut history);
        }
    }
}

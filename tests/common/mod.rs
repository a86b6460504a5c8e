#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Arc;

use data_or_timer::config::WaitPolicy;
use data_or_timer::logging::LogLevel;
use data_or_timer::providers::HistoryStore;
use data_or_timer::runtime::Runtime;
use data_or_timer::workflow::{self, ORCHESTRATION_NAME, SAY_HELLO, WorkflowInput};
use data_or_timer::{Action, Event, SYSTEM_NOW_ACTIVITY, run_turn_with_claims};

/// Poll the latest execution of `instance` until `pred` holds or `timeout_ms` elapses.
pub async fn wait_for_history<F>(store: Arc<dyn HistoryStore>, instance: &str, pred: F, timeout_ms: u64) -> bool
where
    F: Fn(&Vec<Event>) -> bool,
{
    let deadline = std::time::Instant::now() + std::time::Duration::from_millis(timeout_ms);
    loop {
        let hist = store.read(instance).await;
        if pred(&hist) {
            return true;
        }
        if std::time::Instant::now() > deadline {
            return false;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
}

pub async fn wait_for_subscription(store: Arc<dyn HistoryStore>, instance: &str, name: &str, timeout_ms: u64) -> bool {
    wait_for_history(
        store,
        instance,
        |hist| {
            hist.iter()
                .any(|e| matches!(e, Event::ExternalSubscribed { name: n, .. } if n == name))
        },
        timeout_ms,
    )
    .await
}

/// Poll until `instance` has at least `count` executions.
pub async fn wait_for_executions(rt: &Arc<Runtime>, instance: &str, count: usize, timeout_ms: u64) -> bool {
    let deadline = std::time::Instant::now() + std::time::Duration::from_millis(timeout_ms);
    loop {
        if rt.list_executions(instance).await.len() >= count {
            return true;
        }
        if std::time::Instant::now() > deadline {
            return false;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
}

/// Every execution's history for `instance`, oldest first.
pub async fn all_executions(rt: &Arc<Runtime>, instance: &str) -> Vec<Vec<Event>> {
    let mut out = Vec::new();
    for eid in rt.list_executions(instance).await {
        out.push(rt.get_execution_history(instance, eid).await);
    }
    out
}

pub fn say_hello_inputs(history: &[Event]) -> Vec<String> {
    history
        .iter()
        .filter_map(|e| match e {
            Event::ActivityScheduled { name, input, .. } if name == SAY_HELLO => Some(input.clone()),
            _ => None,
        })
        .collect()
}

/// How a simulated execution ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionEnd {
    ContinuedAsNew(WorkflowInput),
    Completed(String),
    Failed(String),
}

/// Single-threaded host for the data-or-timer orchestration on a virtual
/// clock. It materializes actions the way the runtime does: the clock
/// activity completes immediately, `SayHello` after `activity_delay_ms`,
/// timers at their deadline, and signals at the instant they are raised.
/// Time only moves forward when the orchestration is blocked.
pub struct SimHost {
    pub now_ms: u64,
    pub policy: WaitPolicy,
    pub event_name: String,
    pub activity_delay_ms: u64,
    /// When set, `SayHello` fails with this error.
    pub say_hello_error: Option<String>,

    pub input: WorkflowInput,
    pub history: Vec<Event>,
    /// Closed executions, oldest first.
    pub executions: Vec<Vec<Event>>,
    pub logs: Vec<(LogLevel, String)>,
    pub cancelled_timers: Vec<u64>,
    pub say_hello_calls: Vec<String>,

    turn_index: u64,
    frontier: usize,
    raise_seq: u64,
    signals: BTreeMap<u64, Vec<String>>,
    timers: BTreeMap<u64, u64>,
    activities: Vec<(u64, u64, Result<String, String>)>,
}

impl SimHost {
    pub fn new(policy: WaitPolicy, activity_delay_ms: u64, start_ms: u64) -> Self {
        Self {
            now_ms: start_ms,
            policy,
            event_name: data_or_timer::config::DEFAULT_EVENT_NAME.to_string(),
            activity_delay_ms,
            say_hello_error: None,
            input: WorkflowInput { expiration_ms: 0 },
            history: Vec::new(),
            executions: Vec::new(),
            logs: Vec::new(),
            cancelled_timers: Vec::new(),
            say_hello_calls: Vec::new(),
            turn_index: 0,
            frontier: 0,
            raise_seq: 0,
            signals: BTreeMap::new(),
            timers: BTreeMap::new(),
            activities: Vec::new(),
        }
    }

    /// Create the instance with `expiration_ms` at the current virtual time.
    pub fn start(&mut self, expiration_ms: u64) {
        self.input = WorkflowInput { expiration_ms };
        self.history = vec![Event::OrchestrationStarted {
            name: ORCHESTRATION_NAME.to_string(),
            input: serde_json::to_string(&self.input).unwrap(),
        }];
        self.turn_index = 0;
        self.frontier = 0;
    }

    /// Raise a signal at virtual time `at_ms`.
    pub fn raise_at(&mut self, at_ms: u64, payload: impl Into<String>) {
        self.signals.entry(at_ms).or_default().push(payload.into());
    }

    fn next_raise_id(&mut self) -> String {
        self.raise_seq += 1;
        format!("sim-raise-{}", self.raise_seq)
    }

    fn deliver_due_signals(&mut self) {
        let due: Vec<u64> = self.signals.range(..=self.now_ms).map(|(at, _)| *at).collect();
        for at in due {
            for data in self.signals.remove(&at).unwrap_or_default() {
                let raise_id = self.next_raise_id();
                self.history.push(Event::ExternalEvent {
                    name: self.event_name.clone(),
                    data,
                    raise_id,
                });
            }
        }
    }

    /// One turn of the orchestration against the current history.
    pub fn turn(&mut self) -> (Vec<Action>, Option<Result<String, String>>, Vec<Event>) {
        let policy = self.policy;
        let input = self.input;
        let event_name = self.event_name.clone();
        let (hist, actions, logs, out, claims) =
            run_turn_with_claims(self.history.clone(), self.turn_index, self.frontier, move |ctx| {
                let event_name = event_name.clone();
                async move {
                    workflow::data_or_timer(ctx, input, policy, event_name)
                        .await
                        .map_err(|e| e.to_string())
                }
            });
        self.history = hist;
        self.logs.extend(logs);
        (actions, out, claims.pending_external_events)
    }

    /// Drive the current execution until it continues-as-new or finishes.
    pub fn run_execution(&mut self) -> ExecutionEnd {
        for _ in 0..10_000 {
            self.deliver_due_signals();
            let (actions, out, pending) = self.turn();

            if let Some(next) = actions.iter().find_map(|a| match a {
                Action::ContinueAsNew { input } => Some(input.clone()),
                _ => None,
            }) {
                let next_input: WorkflowInput = serde_json::from_str(&next).unwrap();
                self.history
                    .push(Event::OrchestrationContinuedAsNew { input: next.clone() });
                self.executions.push(std::mem::take(&mut self.history));
                self.timers.clear();
                self.activities.clear();
                self.input = next_input;
                self.history = vec![Event::OrchestrationStarted {
                    name: ORCHESTRATION_NAME.to_string(),
                    input: next,
                }];
                self.history.extend(pending);
                self.turn_index = 0;
                self.frontier = 0;
                return ExecutionEnd::ContinuedAsNew(next_input);
            }
            if let Some(out) = out {
                let (ev, end) = match out {
                    Ok(o) => (Event::OrchestrationCompleted { output: o.clone() }, ExecutionEnd::Completed(o)),
                    Err(e) => (Event::OrchestrationFailed { error: e.clone() }, ExecutionEnd::Failed(e)),
                };
                self.history.push(ev);
                self.executions.push(self.history.clone());
                return end;
            }

            for action in actions {
                match action {
                    Action::CallActivity { id, name, .. } if name == SYSTEM_NOW_ACTIVITY => {
                        self.activities.push((id, self.now_ms, Ok(self.now_ms.to_string())));
                    }
                    Action::CallActivity { id, name, input } if name == SAY_HELLO => {
                        self.say_hello_calls.push(input.clone());
                        let result = match &self.say_hello_error {
                            Some(err) => Err(err.clone()),
                            None => Ok(format!("Hello {input}!")),
                        };
                        self.activities.push((id, self.now_ms + self.activity_delay_ms, result));
                    }
                    Action::CallActivity { name, .. } => panic!("unexpected activity {name}"),
                    Action::CreateTimer { id, fire_at_ms } => {
                        self.timers.insert(id, fire_at_ms);
                    }
                    Action::CancelTimer { id } => {
                        self.timers.remove(&id);
                        self.cancelled_timers.push(id);
                    }
                    Action::WaitExternal { .. } | Action::ContinueAsNew { .. } => {}
                }
            }

            self.frontier = self.history.len();
            self.turn_index += 1;

            // Completions due now, then advance to the next pending instant
            if !self.complete_due() {
                let next_at = [
                    self.signals.keys().next().copied(),
                    self.activities.iter().map(|(_, at, _)| *at).min(),
                    self.timers.values().min().copied(),
                ]
                .into_iter()
                .flatten()
                .min()
                .expect("orchestration is blocked with nothing pending");
                self.now_ms = self.now_ms.max(next_at);
                self.deliver_due_signals();
                self.complete_due();
            }
        }
        panic!("execution did not settle");
    }

    fn complete_due(&mut self) -> bool {
        let now = self.now_ms;
        let mut any = false;
        let (due, rest): (Vec<_>, Vec<_>) = std::mem::take(&mut self.activities)
            .into_iter()
            .partition(|(_, at, _)| *at <= now);
        self.activities = rest;
        for (id, _, result) in due {
            any = true;
            self.history.push(match result {
                Ok(result) => Event::ActivityCompleted { id, result },
                Err(error) => Event::ActivityFailed { id, error },
            });
        }
        let fired: Vec<(u64, u64)> = self
            .timers
            .iter()
            .filter(|(_, at)| **at <= now)
            .map(|(id, at)| (*id, *at))
            .collect();
        for (id, fire_at_ms) in fired {
            any = true;
            self.timers.remove(&id);
            self.history.push(Event::TimerFired { id, fire_at_ms });
        }
        any
    }

    /// Run executions until the instance finishes; returns the terminal
    /// outcome and how many executions it took.
    pub fn run_to_end(&mut self, max_executions: usize) -> (ExecutionEnd, usize) {
        for n in 1..=max_executions {
            match self.run_execution() {
                ExecutionEnd::ContinuedAsNew(_) => continue,
                end => return (end, n),
            }
        }
        panic!("instance still running after {max_executions} executions");
    }

    pub fn info_logs(&self) -> Vec<String> {
        self.logs
            .iter()
            .filter(|(level, _)| *level == LogLevel::Info)
            .map(|(_, m)| m.clone())
            .collect()
    }
}

pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_millis() as u64
}

/// Millisecond-scale settings so runtime tests finish quickly.
pub fn fast_config(lifetime_ms: u64) -> data_or_timer::config::DataOrTimerConfig {
    data_or_timer::config::DataOrTimerConfig {
        wait: WaitPolicy::new(50, 150).unwrap(),
        lifetime_ms,
        activity_delay_ms: 20,
        ..Default::default()
    }
}

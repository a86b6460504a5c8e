use crate::error::WorkflowError;
use crate::{DurableOutput, OrchestrationContext};

/// Which side of a signal-vs-timer race completed first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RaceOutcome {
    /// A signal arrived (or was already buffered) before the timer fired.
    /// Carries the signal payload.
    SignalWon(String),
    TimerWon,
}

/// Race a durable timer firing at `wakeup_ms` against the next signal named
/// `signal_name`.
///
/// The winner is the completion recorded first in history, so a signal
/// buffered before the race wins immediately. On `SignalWon` the timer has
/// been cancelled before this returns. On `TimerWon` the wait is abandoned
/// and any signal stays buffered for the next race.
pub async fn race(ctx: &OrchestrationContext, wakeup_ms: u64, signal_name: &str) -> Result<RaceOutcome, WorkflowError> {
    let wait = ctx.schedule_wait(signal_name);
    let timer = ctx.schedule_timer_at(wakeup_ms);
    match ctx.select2(wait, timer).await {
        (0, DurableOutput::External(payload)) => Ok(RaceOutcome::SignalWon(payload)),
        (1, DurableOutput::Timer) => Ok(RaceOutcome::TimerWon),
        (idx, other) => Err(WorkflowError::SignalChannelClosed(format!(
            "race branch {idx} completed with {other:?}"
        ))),
    }
}

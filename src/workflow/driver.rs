use crate::OrchestrationContext;
use crate::config::WaitPolicy;
use crate::error::WorkflowError;
use crate::workflow::activity::say_hello;
use crate::workflow::race::{RaceOutcome, race};
use crate::workflow::window::{compute_window, wakeup_time};
use crate::workflow::{EXPIRED_OUTPUT, WorkflowInput};

/// How one round of the workflow ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoundOutcome {
    /// A signal won the race and `SayHello` ran on its payload.
    Signalled { payload: String, greeting: String },
    /// The timer won before the expiration.
    Active { now_ms: u64 },
    /// The timer won and the expiration has passed.
    Expired { now_ms: u64 },
}

impl RoundOutcome {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RoundOutcome::Expired { .. })
    }
}

/// One round: read the clock, size the wait window, race the signal
/// against the timer and act on the winner.
pub async fn run_round(
    ctx: &OrchestrationContext,
    input: WorkflowInput,
    policy: WaitPolicy,
    event_name: &str,
) -> Result<RoundOutcome, WorkflowError> {
    let now_ms = ctx.utc_now_ms().await.map_err(WorkflowError::Clock)?;
    let window = compute_window(input.expiration_ms, now_ms, policy.min_delay(), policy.max_delay());
    let wakeup_ms = wakeup_time(now_ms, window);
    ctx.log_info(format!(
        "[ORC] Orchestration begins with expiration at {}, waitTime {}ms, next wakeup at {wakeup_ms}",
        input.expiration_ms,
        window.as_millis()
    ));

    match race(ctx, wakeup_ms, event_name).await? {
        RaceOutcome::SignalWon(payload) => {
            ctx.log_info(format!("[ORC] Data Event Triggered, data = {payload}"));
            let greeting = say_hello(ctx, &payload).await?;
            ctx.log_info(format!("[ORC] Activity result {greeting}"));
            Ok(RoundOutcome::Signalled { payload, greeting })
        }
        RaceOutcome::TimerWon => {
            ctx.log_info("[ORC] Timer Triggered");
            let now_ms = ctx.utc_now_ms().await.map_err(WorkflowError::Clock)?;
            if now_ms >= input.expiration_ms {
                ctx.log_info("[ORC] Orchestration expired");
                Ok(RoundOutcome::Expired { now_ms })
            } else {
                Ok(RoundOutcome::Active { now_ms })
            }
        }
    }
}

/// Orchestration body. Ends with `"expired"` once a timer-won round finds
/// the expiration passed; any other round continues-as-new with the same
/// input and unconsumed signals carried over.
pub async fn data_or_timer(
    ctx: OrchestrationContext,
    input: WorkflowInput,
    policy: WaitPolicy,
    event_name: String,
) -> Result<String, WorkflowError> {
    let outcome = run_round(&ctx, input, policy, &event_name).await?;
    if outcome.is_terminal() {
        return Ok(EXPIRED_OUTPUT.to_string());
    }
    // A signal never ends the instance, even one that arrives after expiration
    ctx.log_info("[ORC] Restarting for another round");
    ctx.continue_as_new_typed(&input).map_err(WorkflowError::Input)?;
    Ok(String::new())
}

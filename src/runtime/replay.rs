use std::sync::Arc;

use crate::logging::LogLevel;
use crate::runtime::OrchestrationHandler;
use crate::{Action, Event};

/// Decisions are the same as public Actions; we emit them directly from the replay core.
pub type Decision = Action;

pub type ReplayOutcome = (
    Vec<Event>,
    Vec<Decision>,
    Vec<(LogLevel, String)>,
    Option<Result<String, String>>,
    crate::ClaimedIdsSnapshot,
);

pub trait ReplayEngine: Send + Sync {
    /// Replays one turn and returns updated history, pure decisions, logs,
    /// optional output, and the claimed ids snapshot.
    fn replay(
        &self,
        history: Vec<Event>,
        turn_index: u64,
        replay_frontier: usize,
        handler: Arc<dyn OrchestrationHandler>,
        input: String,
    ) -> ReplayOutcome;
}

#[derive(Default)]
pub struct DefaultReplayEngine;

impl DefaultReplayEngine {
    pub fn new() -> Self {
        Self
    }
}

impl ReplayEngine for DefaultReplayEngine {
    fn replay(
        &self,
        history: Vec<Event>,
        turn_index: u64,
        replay_frontier: usize,
        handler: Arc<dyn OrchestrationHandler>,
        input: String,
    ) -> ReplayOutcome {
        let orchestrator = |ctx: crate::OrchestrationContext| {
            let h = handler.clone();
            let inp = input.clone();
            async move { h.invoke(ctx, inp).await }
        };
        crate::run_turn_with_claims(history, turn_index, replay_frontier, orchestrator)
    }
}

/// Replay frontier for a history loaded from the store: everything up to
/// the last decision the orchestration recorded was already observed by a
/// previous turn.
pub fn loaded_frontier(history: &[Event]) -> usize {
    history
        .iter()
        .rposition(|e| {
            matches!(
                e,
                Event::ActivityScheduled { .. }
                    | Event::TimerCreated { .. }
                    | Event::TimerCancelled { .. }
                    | Event::ExternalSubscribed { .. }
            )
        })
        .map(|idx| idx + 1)
        .unwrap_or(0)
}

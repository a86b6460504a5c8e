use crate::Event;
use crate::runtime::{OrchestrationStatus, Runtime};

/// Status implied by the events of one execution.
pub fn status_from_history(history: &[Event]) -> OrchestrationStatus {
    if history.is_empty() {
        return OrchestrationStatus::NotFound;
    }
    for e in history.iter().rev() {
        match e {
            Event::OrchestrationCompleted { output } => {
                return OrchestrationStatus::Completed { output: output.clone() };
            }
            Event::OrchestrationFailed { error } => return OrchestrationStatus::Failed { error: error.clone() },
            _ => {}
        }
    }
    // A continued-as-new execution hands over to the next one, so it still counts as running
    OrchestrationStatus::Running
}

impl Runtime {
    /// Status of the latest execution of `instance`.
    pub async fn get_orchestration_status(&self, instance: &str) -> OrchestrationStatus {
        let hist = self.history_store.read(instance).await;
        status_from_history(&hist)
    }

    /// Execution ids recorded for `instance`, oldest first.
    pub async fn list_executions(&self, instance: &str) -> Vec<u64> {
        self.history_store.list_executions(instance).await
    }

    /// Full history of one execution.
    pub async fn get_execution_history(&self, instance: &str, execution_id: u64) -> Vec<Event> {
        self.history_store.read_with_execution(instance, execution_id).await
    }
}

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::info;

use crate::config::DataOrTimerConfig;
use crate::error::AdmissionError;
use crate::runtime::{OrchestrationStatus, Runtime, SignalDisposition, WaitError};
use crate::workflow::{ORCHESTRATION_NAME, WorkflowInput};

/// Entry point that keeps one instance per key alive and signals it.
pub struct SingletonClient {
    runtime: Arc<Runtime>,
    config: DataOrTimerConfig,
    // Orders create-then-signal for callers sharing this client
    admission: Mutex<()>,
}

/// Status lookup for one instance.
#[derive(Clone)]
pub struct StatusQuery {
    runtime: Arc<Runtime>,
    instance: String,
}

impl std::fmt::Debug for StatusQuery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatusQuery").field("instance", &self.instance).finish()
    }
}

impl StatusQuery {
    pub async fn current(&self) -> OrchestrationStatus {
        self.runtime.get_orchestration_status(&self.instance).await
    }

    /// Wait until the instance completes or fails.
    pub async fn wait(&self, timeout: Duration) -> Result<OrchestrationStatus, WaitError> {
        self.runtime.wait_for_orchestration(&self.instance, timeout).await
    }
}

/// What an admission call did.
#[derive(Debug, Clone)]
pub struct StatusHandle {
    pub instance: String,
    /// This call created the instance.
    pub created: bool,
    /// Payload of the signal that was raised.
    pub payload: String,
    pub disposition: SignalDisposition,
    pub status_query: StatusQuery,
}

impl SingletonClient {
    pub fn new(runtime: Arc<Runtime>, config: DataOrTimerConfig) -> Self {
        Self {
            runtime,
            config,
            admission: Mutex::new(()),
        }
    }

    pub fn config(&self) -> &DataOrTimerConfig {
        &self.config
    }

    /// Create the instance for `instance_key` if there is none, then raise
    /// a signal carrying `payload`. An existing instance is never recreated,
    /// whatever its state.
    pub async fn ensure_and_signal(
        &self,
        instance_key: &str,
        initial_expiration_ms: u64,
        payload: &str,
    ) -> Result<StatusHandle, AdmissionError> {
        let _gate = self.admission.lock().await;
        let input = WorkflowInput {
            expiration_ms: initial_expiration_ms,
        };
        let created = self
            .runtime
            .clone()
            .ensure_orchestration_typed(instance_key, ORCHESTRATION_NAME, &input)
            .await
            .map_err(|reason| AdmissionError::Create {
                instance: instance_key.to_string(),
                reason,
            })?;
        if created {
            info!(instance = %instance_key, expiration_ms = initial_expiration_ms, "[CLI] Starting new orchestration");
        } else {
            info!(instance = %instance_key, "[CLI] Orchestration already exists");
        }

        info!(instance = %instance_key, "[CLI] Sending data {payload}");
        let disposition = self
            .runtime
            .raise_event(instance_key, self.config.event_name.clone(), payload)
            .await
            .map_err(|reason| AdmissionError::Signal {
                instance: instance_key.to_string(),
                reason,
            })?;

        Ok(StatusHandle {
            instance: instance_key.to_string(),
            created,
            payload: payload.to_string(),
            disposition,
            status_query: StatusQuery {
                runtime: self.runtime.clone(),
                instance: instance_key.to_string(),
            },
        })
    }

    /// Signal the configured singleton with a fresh `DATA:{uuid}` payload,
    /// creating it to expire `lifetime` from now if needed.
    pub async fn start_or_signal(&self) -> Result<StatusHandle, AdmissionError> {
        let now_ms = crate::runtime::timers::now_ms();
        let expiration_ms = now_ms.saturating_add(self.config.lifetime_ms);
        let payload = format!("DATA:{}", uuid::Uuid::new_v4());
        self.ensure_and_signal(&self.config.instance_key, expiration_ms, &payload)
            .await
    }
}

//! The data-or-timer workflow.
//!
//! One singleton instance repeatedly races an external signal against a
//! bounded timer. A signal runs `SayHello` on its payload; a timer checks
//! the instance's fixed expiration. Every round that does not end the
//! instance continues-as-new with the same expiration.
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::config::DataOrTimerConfig;
use crate::runtime::{ActivityRegistry, ActivityRegistryBuilder, OrchestrationRegistry, OrchestrationRegistryBuilder};

pub mod activity;
pub mod admission;
pub mod driver;
pub mod race;
pub mod window;

pub use admission::{SingletonClient, StatusHandle};
pub use driver::{RoundOutcome, data_or_timer, run_round};
pub use race::{RaceOutcome, race};
pub use window::{compute_window, wakeup_time};

pub const ORCHESTRATION_NAME: &str = "DataOrTimer";
pub const SAY_HELLO: &str = "SayHello";
/// Output of an instance that ended because its expiration passed.
pub const EXPIRED_OUTPUT: &str = "expired";

/// The only state carried across continuations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowInput {
    /// Absolute expiration, ms since the Unix epoch.
    pub expiration_ms: u64,
}

pub fn register_orchestrations(builder: OrchestrationRegistryBuilder, config: &DataOrTimerConfig) -> OrchestrationRegistryBuilder {
    let policy = config.wait;
    let event_name = config.event_name.clone();
    builder.register_typed::<WorkflowInput, String, _, _>(ORCHESTRATION_NAME, move |ctx, input| {
        let event_name = event_name.clone();
        async move {
            data_or_timer(ctx, input, policy, event_name)
                .await
                .map_err(|e| e.to_string())
        }
    })
}

pub fn register_activities(builder: ActivityRegistryBuilder, config: &DataOrTimerConfig) -> ActivityRegistryBuilder {
    let delay = config.activity_delay();
    builder.register(SAY_HELLO, move |name: String| activity::say_hello_activity(delay, name))
}

pub fn orchestration_registry(config: &DataOrTimerConfig) -> OrchestrationRegistry {
    register_orchestrations(OrchestrationRegistry::builder(), config).build()
}

pub fn activity_registry(config: &DataOrTimerConfig) -> Arc<ActivityRegistry> {
    Arc::new(register_activities(ActivityRegistry::builder(), config).build())
}

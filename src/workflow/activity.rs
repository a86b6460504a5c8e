use std::time::Duration;

use tracing::info;

use crate::OrchestrationContext;
use crate::error::WorkflowError;
use crate::workflow::SAY_HELLO;

/// Schedule `SayHello` for `name` and await its greeting.
pub async fn say_hello(ctx: &OrchestrationContext, name: &str) -> Result<String, WorkflowError> {
    ctx.schedule_activity(SAY_HELLO, name)
        .into_activity()
        .await
        .map_err(WorkflowError::Activity)
}

/// Activity body: a slow greeting.
pub async fn say_hello_activity(delay: Duration, name: String) -> Result<String, String> {
    info!(name=%name, "[ACT] Saying hello to {name}, STARTED.");
    tokio::time::sleep(delay).await;
    info!(name=%name, "[ACT] Saying hello to {name}, DONE.");
    Ok(format!("Hello {name}!"))
}

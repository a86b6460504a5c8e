use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

/// Severity of a message buffered by an orchestration turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// Emit the messages buffered during one turn with the instance fields attached.
pub fn flush_turn_logs(instance: &str, execution_id: u64, turn_index: u64, logs: Vec<(LogLevel, String)>) {
    for (level, msg) in logs {
        match level {
            LogLevel::Debug => debug!(instance, execution_id, turn_index, "{msg}"),
            LogLevel::Info => info!(instance, execution_id, turn_index, "{msg}"),
            LogLevel::Warn => warn!(instance, execution_id, turn_index, "{msg}"),
            LogLevel::Error => error!(instance, execution_id, turn_index, "{msg}"),
        }
    }
}

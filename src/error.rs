use thiserror::Error;

/// Failures that end a data-or-timer instance.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WorkflowError {
    /// The side-effect activity returned an error.
    #[error("activity failed: {0}")]
    Activity(String),

    /// The signal wait completed with something other than a signal.
    #[error("signal channel closed: {0}")]
    SignalChannelClosed(String),

    /// The replay-safe clock could not be read.
    #[error("clock read failed: {0}")]
    Clock(String),

    /// Input or continuation payload could not be encoded.
    #[error("invalid input: {0}")]
    Input(String),
}

/// Failures of the singleton entry point.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AdmissionError {
    #[error("failed to create instance {instance}: {reason}")]
    Create { instance: String, reason: String },

    #[error("failed to signal instance {instance}: {reason}")]
    Signal { instance: String, reason: String },
}

/// Invalid or unreadable configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("min delay {min_ms}ms exceeds max delay {max_ms}ms")]
    InvertedWindow { min_ms: u64, max_ms: u64 },

    #[error("{field} must be greater than zero")]
    Empty { field: &'static str },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

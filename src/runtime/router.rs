use std::collections::HashMap;

use tokio::sync::{Mutex, mpsc};
use tracing::debug;

/// Messages delivered to a live instance loop. `ack_token` is the
/// peek-lock token of the provider queue item that produced the message.
#[derive(Debug, Clone)]
pub enum OrchestratorMsg {
    ActivityCompleted {
        instance: String,
        execution_id: u64,
        id: u64,
        result: String,
        ack_token: Option<String>,
    },
    ActivityFailed {
        instance: String,
        execution_id: u64,
        id: u64,
        error: String,
        ack_token: Option<String>,
    },
    TimerFired {
        instance: String,
        execution_id: u64,
        id: u64,
        fire_at_ms: u64,
        ack_token: Option<String>,
    },
    ExternalByName {
        instance: String,
        name: String,
        data: String,
        raise_id: String,
        ack_token: Option<String>,
    },
}

impl OrchestratorMsg {
    pub fn instance(&self) -> &str {
        match self {
            OrchestratorMsg::ActivityCompleted { instance, .. }
            | OrchestratorMsg::ActivityFailed { instance, .. }
            | OrchestratorMsg::TimerFired { instance, .. }
            | OrchestratorMsg::ExternalByName { instance, .. } => instance,
        }
    }

    pub fn ack_token(&self) -> Option<&str> {
        match self {
            OrchestratorMsg::ActivityCompleted { ack_token, .. }
            | OrchestratorMsg::ActivityFailed { ack_token, .. }
            | OrchestratorMsg::TimerFired { ack_token, .. }
            | OrchestratorMsg::ExternalByName { ack_token, .. } => ack_token.as_deref(),
        }
    }
}

/// In-process routing table from instance id to its loop's inbox.
pub struct InstanceRouter {
    pub(crate) inboxes: Mutex<HashMap<String, mpsc::UnboundedSender<OrchestratorMsg>>>,
}

impl InstanceRouter {
    pub fn new() -> Self {
        Self {
            inboxes: Mutex::new(HashMap::new()),
        }
    }

    pub async fn register(&self, instance: &str) -> mpsc::UnboundedReceiver<OrchestratorMsg> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inboxes.lock().await.insert(instance.to_string(), tx);
        rx
    }

    pub async fn unregister(&self, instance: &str) {
        self.inboxes.lock().await.remove(instance);
    }

    pub async fn is_registered(&self, instance: &str) -> bool {
        self.inboxes.lock().await.contains_key(instance)
    }

    /// Deliver to the instance inbox. The message is handed back when the
    /// instance has no live inbox so the caller can release its lock token.
    pub async fn forward(&self, msg: OrchestratorMsg) -> Result<(), OrchestratorMsg> {
        let inboxes = self.inboxes.lock().await;
        match inboxes.get(msg.instance()) {
            Some(tx) => tx.send(msg).map_err(|e| e.0),
            None => {
                debug!(instance = msg.instance(), "router: no inbox for instance");
                Err(msg)
            }
        }
    }
}

impl Default for InstanceRouter {
    fn default() -> Self {
        Self::new()
    }
}

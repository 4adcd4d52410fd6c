use crate::{InstanceId, RunStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Events emitted while instances run
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ExecutionEvent {
    InstanceStarted {
        instance_id: InstanceId,
        template_id: String,
        timestamp: DateTime<Utc>,
    },
    InstanceFinished {
        instance_id: InstanceId,
        status: RunStatus,
        iterations: usize,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },
    InstanceFailed {
        instance_id: InstanceId,
        error: String,
        timestamp: DateTime<Utc>,
    },
    NodeStarted {
        instance_id: InstanceId,
        node_id: String,
        iteration: usize,
        timestamp: DateTime<Utc>,
    },
    NodeCompleted {
        instance_id: InstanceId,
        node_id: String,
        attempts: u32,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },
    NodeFailed {
        instance_id: InstanceId,
        node_id: String,
        error: String,
        attempts: u32,
        timestamp: DateTime<Utc>,
    },
    FanOut {
        instance_id: InstanceId,
        node_id: String,
        branches: usize,
        timestamp: DateTime<Utc>,
    },
    BarrierReleased {
        instance_id: InstanceId,
        node_id: String,
        arrived: usize,
        expected: usize,
        timestamp: DateTime<Utc>,
    },
    BarrierSkipped {
        instance_id: InstanceId,
        node_id: String,
        arrived: usize,
        expected: usize,
        timestamp: DateTime<Utc>,
    },
}

impl ExecutionEvent {
    pub fn instance_id(&self) -> InstanceId {
        match self {
            ExecutionEvent::InstanceStarted { instance_id, .. }
            | ExecutionEvent::InstanceFinished { instance_id, .. }
            | ExecutionEvent::InstanceFailed { instance_id, .. }
            | ExecutionEvent::NodeStarted { instance_id, .. }
            | ExecutionEvent::NodeCompleted { instance_id, .. }
            | ExecutionEvent::NodeFailed { instance_id, .. }
            | ExecutionEvent::FanOut { instance_id, .. }
            | ExecutionEvent::BarrierReleased { instance_id, .. }
            | ExecutionEvent::BarrierSkipped { instance_id, .. } => *instance_id,
        }
    }
}

/// Broadcast bus shared by every instance of an orchestrator
pub struct EventBus {
    sender: broadcast::Sender<ExecutionEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ExecutionEvent> {
        self.sender.subscribe()
    }

    /// Send to current subscribers; dropped silently when there are none.
    pub fn emit(&self, event: ExecutionEvent) {
        let _ = self.sender.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1000)
    }
}

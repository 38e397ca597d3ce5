//! Broadcast event bus for run and stage status transitions.
//!
//! Built on `tokio::sync::broadcast`. Publishing with no active subscribers
//! is a no-op; slow subscribers may observe lag rather than blocking the
//! coordinator.

use stageflow_types::run::{RunStatus, StageStatus};
use tokio::sync::broadcast;
use uuid::Uuid;

/// A run-level or stage-level transition.
#[derive(Debug, Clone)]
pub enum RunEvent {
    RunStarted {
        run_id: Uuid,
        workflow_id: String,
    },
    StageTransition {
        run_id: Uuid,
        stage_id: String,
        status: StageStatus,
    },
    RunFinished {
        run_id: Uuid,
        status: RunStatus,
    },
}

/// Multi-consumer bus for run events.
///
/// Cloning the bus clones the sender, allowing multiple producers and
/// consumers.
pub struct RunEventBus {
    sender: broadcast::Sender<RunEvent>,
}

impl RunEventBus {
    /// Create a new bus with the given channel capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Create a new subscriber that receives all future events.
    pub fn subscribe(&self) -> broadcast::Receiver<RunEvent> {
        self.sender.subscribe()
    }

    /// Publish an event to all current subscribers.
    pub fn publish(&self, event: RunEvent) {
        let _ = self.sender.send(event);
    }
}

impl Clone for RunEventBus {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
        }
    }
}

impl Default for RunEventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

impl std::fmt::Debug for RunEventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunEventBus")
            .field("receiver_count", &self.sender.receiver_count())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

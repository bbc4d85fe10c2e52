//! Coordinator state and response types.
//!
//! # State Transitions
//!
//! ```text
//!            shutdown()                 drained
//! Running ─────────────→ ShuttingDown ─────────→ Stopped
//! ```
//!
//! - **Running**: accepting triggers and status queries.
//! - **ShuttingDown**: triggers are rejected; in-flight background tasks
//!   get a bounded window to finish.
//! - **Stopped**: background tasks drained or aborted, store closed.

use serde::{Deserialize, Serialize};

/// Lifecycle of the replay coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinatorState {
    Running,
    ShuttingDown,
    Stopped,
}

impl CoordinatorState {
    pub fn accepts_triggers(self) -> bool {
        self == CoordinatorState::Running
    }
}

impl std::fmt::Display for CoordinatorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CoordinatorState::Running => write!(f, "Running"),
            CoordinatorState::ShuttingDown => write!(f, "ShuttingDown"),
            CoordinatorState::Stopped => write!(f, "Stopped"),
        }
    }
}

/// Acknowledgement of `POST /replay`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerResponse {
    pub replay_id: String,
}

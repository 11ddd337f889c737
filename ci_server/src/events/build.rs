//! Build lifecycle events.

use serde::{Deserialize, Serialize};

use crate::models::build::{BuildId, BuildState};

/// Events that move a build through its state machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum BuildEvent {
    /// The build script is about to be started.
    Started,
    /// The script exited with status 0.
    Succeeded,
    /// The script exited non-zero or was killed by a signal.
    ///
    /// Signal deaths are reported as `128 + signal`, the shell convention.
    Failed { return_code: i32 },
    /// Cancellation won the race against the script's exit.
    Canceled,
    /// Infrastructure failure: checkout, missing script, spawn error.
    Errored { message: String },
}

impl BuildEvent {
    pub fn name(&self) -> &'static str {
        match self {
            BuildEvent::Started => "started",
            BuildEvent::Succeeded => "succeeded",
            BuildEvent::Failed { .. } => "failed",
            BuildEvent::Canceled => "canceled",
            BuildEvent::Errored { .. } => "errored",
        }
    }

    /// State the build ends up in once this event is applied.
    pub fn target_state(&self) -> BuildState {
        match self {
            BuildEvent::Started => BuildState::Running,
            BuildEvent::Succeeded => BuildState::Success,
            BuildEvent::Failed { .. } => BuildState::Failed,
            BuildEvent::Canceled => BuildState::Canceled,
            BuildEvent::Errored { .. } => BuildState::Errored,
        }
    }
}

/// Notification published on the event bus whenever a build record is saved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BuildUpdate {
    pub id: BuildId,
    pub state: BuildState,
    pub revision: String,
}

//! A build — one execution of a repository's build script at a revision.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::events::build::BuildEvent;

/// Composite build key: repository plus per-repository sequence number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BuildId {
    pub repository_id: i64,
    pub number: i64,
}

impl BuildId {
    pub fn new(repository_id: i64, number: i64) -> Self {
        Self {
            repository_id,
            number,
        }
    }
}

impl fmt::Display for BuildId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.repository_id, self.number)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildState {
    Waiting,
    Running,
    Success,
    Failed,
    Canceled,
    Errored,
}

impl BuildState {
    /// Terminal states are absorbing: no event leaves them.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            BuildState::Success | BuildState::Failed | BuildState::Canceled | BuildState::Errored
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BuildState::Waiting => "waiting",
            BuildState::Running => "running",
            BuildState::Success => "success",
            BuildState::Failed => "failed",
            BuildState::Canceled => "canceled",
            BuildState::Errored => "errored",
        }
    }
}

impl fmt::Display for BuildState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BuildState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "waiting" => Ok(BuildState::Waiting),
            "running" => Ok(BuildState::Running),
            "success" => Ok(BuildState::Success),
            "failed" => Ok(BuildState::Failed),
            "canceled" => Ok(BuildState::Canceled),
            "errored" => Ok(BuildState::Errored),
            other => Err(format!("unknown build state: {other}")),
        }
    }
}

/// Metadata of the commit being built.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitInfo {
    pub revision: String,
    pub ref_name: String,
    pub message: String,
    pub author_name: String,
    pub author_email: String,
}

impl CommitInfo {
    pub fn new(revision: impl Into<String>, ref_name: impl Into<String>) -> Self {
        Self {
            revision: revision.into(),
            ref_name: ref_name.into(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransitionError {
    #[error("build {id} cannot apply `{event}` in state {state}")]
    Invalid {
        id: BuildId,
        state: BuildState,
        event: &'static str,
    },
    #[error("build {id} output is sealed")]
    OutputSealed { id: BuildId },
}

/// The persisted build record.
///
/// State, output and timestamps only change through [`BuildRecord::apply`] and
/// [`BuildRecord::attach_output`], which is how the terminal-state invariants
/// are kept.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildRecord {
    pub id: BuildId,
    pub commit: CommitInfo,
    /// Working tree the script runs in.
    pub path: PathBuf,
    /// Script to execute, resolved inside `path`.
    pub script: PathBuf,
    state: BuildState,
    #[serde(with = "hex::serde")]
    output: Vec<u8>,
    return_code: Option<i32>,
    error: Option<String>,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
}

impl BuildRecord {
    /// Create a record in the `Waiting` state.
    pub fn new(id: BuildId, commit: CommitInfo, path: PathBuf, script: PathBuf) -> Self {
        Self {
            id,
            commit,
            path,
            script,
            state: BuildState::Waiting,
            output: Vec::new(),
            return_code: None,
            error: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }

    pub fn state(&self) -> BuildState {
        self.state
    }

    /// Finalized output. Empty while the build runs; the live copy is in its
    /// output stream.
    pub fn output(&self) -> &[u8] {
        &self.output
    }

    /// Exit status; only meaningful once the build is `Success` or `Failed`.
    pub fn return_code(&self) -> Option<i32> {
        self.return_code
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        self.finished_at
    }

    pub fn duration(&self) -> Option<chrono::Duration> {
        Some(self.finished_at? - self.started_at?)
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Store the finished output. Allowed only before the terminal event.
    pub fn attach_output(&mut self, output: Vec<u8>) -> Result<(), TransitionError> {
        if self.state.is_terminal() {
            return Err(TransitionError::OutputSealed { id: self.id });
        }
        self.output = output;
        Ok(())
    }

    /// Apply a state machine event.
    ///
    /// `Waiting -> Running -> {Success, Failed, Canceled}`, plus `Errored` from
    /// either non-terminal state.
    pub fn apply(&mut self, event: BuildEvent) -> Result<(), TransitionError> {
        let allowed = match (&event, self.state) {
            (BuildEvent::Started, BuildState::Waiting) => true,
            (BuildEvent::Errored { .. }, state) => !state.is_terminal(),
            (_, BuildState::Running) => !matches!(event, BuildEvent::Started),
            _ => false,
        };
        if !allowed {
            return Err(TransitionError::Invalid {
                id: self.id,
                state: self.state,
                event: event.name(),
            });
        }

        let now = Utc::now();
        self.state = event.target_state();
        match event {
            BuildEvent::Started => self.started_at = Some(now),
            BuildEvent::Succeeded => self.return_code = Some(0),
            BuildEvent::Failed { return_code } => self.return_code = Some(return_code),
            BuildEvent::Canceled => {}
            BuildEvent::Errored { message } => self.error = Some(message),
        }
        if self.state.is_terminal() {
            self.finished_at = Some(now);
        }
        Ok(())
    }
}

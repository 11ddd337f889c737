//! Registry of builds that are currently running.
//!
//! Entries live exactly as long as a build is `Running`: the build task adds
//! its handle before the script starts and removes it after the terminal
//! record has been persisted. HTTP handlers use it to attach live readers and
//! to cancel; shutdown uses it to cancel everything and wait for the drain.

use std::collections::HashMap;
use std::pin::pin;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tokio::sync::Notify;

use crate::models::build::{BuildId, BuildRecord};
use crate::services::cancel::{CancelControl, CancelError};
use crate::services::output_stream::OutputStream;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("build {0} is already registered")]
    AlreadyRegistered(BuildId),
    #[error("registry is closed, server is shutting down")]
    ShuttingDown,
}

/// Handle to a running build.
#[derive(Debug, Clone)]
pub struct RunningBuild {
    /// The record as it was when the build entered `Running`.
    pub record: Arc<BuildRecord>,
    pub output: OutputStream,
    pub cancel: CancelControl,
}

impl RunningBuild {
    pub fn new(record: BuildRecord, output: OutputStream, cancel: CancelControl) -> Self {
        Self {
            record: Arc::new(record),
            output,
            cancel,
        }
    }

    pub fn id(&self) -> BuildId {
        self.record.id
    }
}

#[derive(Default)]
struct Table {
    builds: HashMap<BuildId, RunningBuild>,
    closed: bool,
}

#[derive(Default)]
struct Inner {
    table: RwLock<Table>,
    /// Signalled whenever an entry is removed.
    removed: Notify,
}

#[derive(Clone, Default)]
pub struct RunningBuildRegistry {
    inner: Arc<Inner>,
}

impl RunningBuildRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, Table> {
        self.inner.table.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Table> {
        self.inner.table.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn add(&self, id: BuildId, handle: RunningBuild) -> Result<(), RegistryError> {
        let running = {
            let mut table = self.write();
            if table.closed {
                return Err(RegistryError::ShuttingDown);
            }
            if table.builds.contains_key(&id) {
                return Err(RegistryError::AlreadyRegistered(id));
            }
            table.builds.insert(id, handle);
            table.builds.len()
        };
        crate::metrics::running_builds(running);
        tracing::debug!(build = %id, running, "Build registered");
        Ok(())
    }

    pub fn remove(&self, id: BuildId) -> Option<RunningBuild> {
        let (removed, running) = {
            let mut table = self.write();
            let removed = table.builds.remove(&id);
            (removed, table.builds.len())
        };
        if removed.is_some() {
            crate::metrics::running_builds(running);
            tracing::debug!(build = %id, running, "Build unregistered");
            self.inner.removed.notify_waiters();
        }
        removed
    }

    pub fn get(&self, id: BuildId) -> Option<RunningBuild> {
        self.read().builds.get(&id).cloned()
    }

    pub fn list(&self) -> Vec<RunningBuild> {
        self.read().builds.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.read().builds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.read().closed
    }

    /// Request cancellation of one build.
    ///
    /// Absent builds and builds that already had a cancellation request both
    /// report [`CancelError::NotRunning`].
    pub fn cancel(&self, id: BuildId) -> Result<(), CancelError> {
        // Clone the handle out so the kill path never runs under the lock
        let handle = self.get(id).ok_or(CancelError::NotRunning)?;
        handle.cancel.cancel()
    }

    /// Request cancellation of every registered build; returns how many
    /// requests took effect.
    ///
    /// The table is snapshotted and the lock released before any control is
    /// signalled, so a build finishing concurrently can still `remove` itself.
    pub fn cancel_all(&self) -> usize {
        let snapshot = self.list();
        let mut canceled = 0;
        for handle in snapshot {
            match handle.cancel.cancel() {
                Ok(()) => {
                    canceled += 1;
                    tracing::info!(build = %handle.id(), "Cancellation requested");
                }
                Err(CancelError::NotRunning) => {
                    tracing::debug!(build = %handle.id(), "Build already finishing");
                }
            }
        }
        canceled
    }

    /// Refuse new registrations from now on.
    pub fn close(&self) {
        self.write().closed = true;
    }

    /// Wait until no build is registered.
    pub async fn wait_idle(&self) {
        loop {
            let mut removed = pin!(self.inner.removed.notified());
            removed.as_mut().enable();
            if self.is_empty() {
                return;
            }
            removed.await;
        }
    }

    /// Close, cancel everything in flight and wait until all builds are gone.
    pub async fn shutdown(&self) {
        self.close();
        let canceled = self.cancel_all();
        tracing::info!(canceled, "Waiting for running builds to finish");
        self.wait_idle().await;
    }
}

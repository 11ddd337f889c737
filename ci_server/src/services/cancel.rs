//! One-shot cancellation signal for a running build.

use std::pin::pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::Notify;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum CancelError {
    /// The build already finished, or cancellation was already requested.
    #[error("build is not running")]
    NotRunning,
}

#[derive(Default)]
struct Flags {
    requested: bool,
    finished: bool,
}

#[derive(Default)]
struct Inner {
    flags: Mutex<Flags>,
    notify: Notify,
}

/// Cancellation control shared between the supervisor and whoever wants to
/// stop the build (HTTP handlers, shutdown).
///
/// Requesting is a protected set-once flag followed by a broadcast; nothing
/// here can block the caller or fail on repeated use.
#[derive(Clone, Default)]
pub struct CancelControl {
    inner: Arc<Inner>,
}

impl CancelControl {
    pub fn new() -> Self {
        Self::default()
    }

    fn flags(&self) -> MutexGuard<'_, Flags> {
        self.inner.flags.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Request cancellation.
    ///
    /// Succeeds exactly once, and only while the build has not finished.
    pub fn cancel(&self) -> Result<(), CancelError> {
        {
            let mut flags = self.flags();
            if flags.finished || flags.requested {
                return Err(CancelError::NotRunning);
            }
            flags.requested = true;
        }
        self.inner.notify.notify_waiters();
        Ok(())
    }

    /// Close the control once the supervisor stopped listening. Later
    /// cancellation requests report [`CancelError::NotRunning`].
    pub fn finish(&self) {
        self.flags().finished = true;
    }

    pub fn is_requested(&self) -> bool {
        self.flags().requested
    }

    pub fn is_finished(&self) -> bool {
        self.flags().finished
    }

    /// Resolves once cancellation has been requested; pending forever otherwise.
    pub async fn cancelled(&self) {
        loop {
            let mut notified = pin!(self.inner.notify.notified());
            notified.as_mut().enable();
            if self.is_requested() {
                return;
            }
            notified.await;
        }
    }
}

impl std::fmt::Debug for CancelControl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let flags = self.flags();
        f.debug_struct("CancelControl")
            .field("requested", &flags.requested)
            .field("finished", &flags.finished)
            .finish()
    }
}

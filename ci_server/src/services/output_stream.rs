//! Live build output: an append-only byte log with any number of readers.
//!
//! A single producer (the build's stdout/stderr pumps) appends with
//! [`OutputStream::write`] and closes with [`OutputStream::end`]. Every reader
//! owns its own cursor, starts at offset 0 and therefore always sees the full
//! backlog before new data. The writer keeps no per-reader bookkeeping: it
//! wakes everybody through one [`Notify`] and each reader re-checks its cursor.
//!
//! Lost wakeups are ruled out by the order of operations. A reader registers
//! interest (`Notified::enable`) *before* it takes the lock to check
//! "caught up and not done"; the writer appends or sets `done` under that same
//! lock and only then calls `notify_waiters`. A write that lands after the
//! reader's check therefore always finds the reader already registered.

use std::pin::pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures_util::stream::{self, Stream};
use tokio::sync::Notify;

/// Upper bound on the bytes a single `read` returns, so that a reader that
/// attaches late to a large log does not copy it in one go.
pub const MAX_CHUNK: usize = 64 * 1024;

#[derive(Default)]
struct Log {
    data: Vec<u8>,
    done: bool,
}

#[derive(Default)]
struct Shared {
    log: Mutex<Log>,
    changed: Notify,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Log> {
        // The log is append-only, a panicking holder cannot leave it half-written
        self.log.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Cheaply cloneable handle to one build's output log.
#[derive(Clone, Default)]
pub struct OutputStream {
    shared: Arc<Shared>,
}

impl OutputStream {
    pub fn new() -> Self {
        Self::default()
    }

    /// A stream that is already finished and holds `content`.
    pub fn finished(content: Vec<u8>) -> Self {
        let stream = Self::new();
        {
            let mut log = stream.shared.lock();
            log.data = content;
            log.done = true;
        }
        stream
    }

    /// Append `bytes` and wake blocked readers.
    ///
    /// Writes after [`end`](Self::end) are dropped.
    pub fn write(&self, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }
        {
            let mut log = self.shared.lock();
            if log.done {
                tracing::warn!(len = bytes.len(), "write to finished output stream dropped");
                return;
            }
            log.data.extend_from_slice(bytes);
        }
        self.shared.changed.notify_waiters();
    }

    /// Mark the stream finished. Returns `true` only for the call that
    /// actually closed it; later calls are no-ops.
    pub fn end(&self) -> bool {
        {
            let mut log = self.shared.lock();
            if log.done {
                return false;
            }
            log.done = true;
        }
        self.shared.changed.notify_waiters();
        true
    }

    pub fn is_done(&self) -> bool {
        self.shared.lock().done
    }

    pub fn len(&self) -> usize {
        self.shared.lock().data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy of everything written so far.
    pub fn snapshot(&self) -> Vec<u8> {
        self.shared.lock().data.clone()
    }

    /// Independent reader positioned at the start of the log.
    pub fn open_reader(&self) -> OutputReader {
        OutputReader {
            shared: Arc::clone(&self.shared),
            offset: 0,
        }
    }
}

impl std::fmt::Debug for OutputStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let log = self.shared.lock();
        f.debug_struct("OutputStream")
            .field("len", &log.data.len())
            .field("done", &log.done)
            .finish()
    }
}

/// Outcome of a non-blocking read attempt.
#[derive(Debug, PartialEq, Eq)]
enum ReadStatus {
    Data(Vec<u8>),
    Empty,
    Closed,
}

/// One consumer's cursor into an [`OutputStream`].
///
/// Dropping a reader has no effect on the writer or on other readers.
pub struct OutputReader {
    shared: Arc<Shared>,
    offset: usize,
}

impl OutputReader {
    /// Bytes consumed so far.
    pub fn offset(&self) -> usize {
        self.offset
    }

    fn poll(&mut self) -> ReadStatus {
        let log = self.shared.lock();
        if self.offset < log.data.len() {
            let end = log.data.len().min(self.offset + MAX_CHUNK);
            let chunk = log.data[self.offset..end].to_vec();
            self.offset = end;
            ReadStatus::Data(chunk)
        } else if log.done {
            ReadStatus::Closed
        } else {
            ReadStatus::Empty
        }
    }

    /// Next chunk of output, waiting for the writer when caught up.
    ///
    /// Returns `None` once the stream has ended and everything was read.
    pub async fn read(&mut self) -> Option<Vec<u8>> {
        let shared = Arc::clone(&self.shared);
        loop {
            let mut changed = pin!(shared.changed.notified());
            changed.as_mut().enable();
            match self.poll() {
                ReadStatus::Data(chunk) => return Some(chunk),
                ReadStatus::Closed => return None,
                ReadStatus::Empty => changed.await,
            }
        }
    }

    /// Read until end-of-stream and return everything from the cursor on.
    pub async fn read_to_end(&mut self) -> Vec<u8> {
        let mut out = Vec::new();
        while let Some(chunk) = self.read().await {
            out.extend_from_slice(&chunk);
        }
        out
    }

    /// Adapt the reader into a `Stream` of chunks, e.g. for an HTTP body.
    pub fn into_stream(self) -> impl Stream<Item = Vec<u8>> + Send + 'static {
        stream::unfold(self, |mut reader| async move {
            let chunk = reader.read().await?;
            Some((chunk, reader))
        })
    }
}

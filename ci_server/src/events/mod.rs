//! Build events and the in-process bus that fans them out to subscribers.

pub mod build;

use std::sync::{Arc, PoisonError, RwLock};

use tokio::sync::broadcast;

use self::build::BuildUpdate;

/// Capacity of the update channel; slow subscribers skip ahead when lagging.
const BUS_CAPACITY: usize = 256;

/// Broadcasts [`BuildUpdate`]s to every live subscriber (the `/api/updates` feed).
///
/// Closing the bus drops the sender, which ends every subscription once the
/// buffered updates have been read.
#[derive(Clone)]
pub struct EventBus {
    sender: Arc<RwLock<Option<broadcast::Sender<BuildUpdate>>>>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(BUS_CAPACITY);
        Self {
            sender: Arc::new(RwLock::new(Some(sender))),
        }
    }

    /// Publish an update. Having no subscribers is not an error.
    pub fn publish(&self, update: BuildUpdate) {
        let sender = self.sender.read().unwrap_or_else(PoisonError::into_inner);
        if let Some(sender) = sender.as_ref() {
            let _ = sender.send(update);
        }
    }

    /// Subscribe to future updates. After [`close`](Self::close) the
    /// receiver reports `Closed` immediately.
    pub fn subscribe(&self) -> broadcast::Receiver<BuildUpdate> {
        let sender = self.sender.read().unwrap_or_else(PoisonError::into_inner);
        match sender.as_ref() {
            Some(sender) => sender.subscribe(),
            None => broadcast::channel(1).1,
        }
    }

    pub fn close(&self) {
        self.sender
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

//! Single-slot metadata rendezvous.
//!
//! Metadata updates arrive through the dispatcher front-end while the
//! executor sits in its select loop. The slot between them holds at most
//! one pending update: metadata is cumulative, so when a second update
//! lands before the executor drains the first, last-write-wins is correct
//! and nothing queues.

use std::sync::Mutex;

use drover_core::JobMetadata;
use tokio::sync::Notify;

/// A single-element, last-write-wins mailbox between the front-end and the
/// executor's select loop.
#[derive(Debug, Default)]
pub struct MetadataSlot {
    slot: Mutex<Option<JobMetadata>>,
    notify: Notify,
}

impl MetadataSlot {
    /// Creates an empty slot.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fills the slot, overwriting any undelivered update, and wakes the
    /// executor.
    pub fn publish(&self, update: JobMetadata) {
        {
            let mut slot = self.slot.lock().expect("metadata slot lock poisoned");
            *slot = Some(update);
        }
        self.notify.notify_one();
    }

    /// Waits until the slot holds an update.
    ///
    /// Returns immediately if one is already pending. Cancellation-safe:
    /// dropping the future loses no update because the value stays in the
    /// slot until [`take`](Self::take) drains it.
    pub async fn updated(&self) {
        loop {
            if self.slot.lock().expect("metadata slot lock poisoned").is_some() {
                return;
            }
            self.notify.notified().await;
        }
    }

    /// Drains the pending update, resetting the slot to empty.
    #[must_use]
    pub fn take(&self) -> Option<JobMetadata> {
        self.slot.lock().expect("metadata slot lock poisoned").take()
    }
}

//! Single-slot batching mailbox.
//!
//! A mailbox is always in exactly one of two states: empty, or holding one
//! pending batch. Producers append to the pending batch; the single consumer
//! takes the whole batch at once, resetting the mailbox to empty. Draining
//! everything that accumulated since the previous fetch keeps round trips
//! short without busy-waiting.

use parking_lot::Mutex;
use std::mem;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::message::Message;

/// Errors returned by mailbox operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum MailboxError {
    /// The caller's cancellation scope fired first.
    #[error("mailbox operation cancelled")]
    Cancelled,
}

enum Slot {
    Empty,
    Pending(Vec<Message>),
}

struct MailboxInner {
    slot: Mutex<Slot>,
    ready: Notify,
}

/// Handoff queue between many producers and one consumer.
///
/// Cloning yields another handle to the same mailbox.
#[derive(Clone)]
pub struct Mailbox {
    inner: Arc<MailboxInner>,
}

impl std::fmt::Debug for Mailbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mailbox")
            .field("pending", &self.pending())
            .finish()
    }
}

impl Default for Mailbox {
    fn default() -> Self {
        Self::new()
    }
}

impl Mailbox {
    /// Creates an empty mailbox.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MailboxInner {
                slot: Mutex::new(Slot::Empty),
                ready: Notify::new(),
            }),
        }
    }

    /// Appends `message` to the pending batch, creating a batch of one if
    /// the mailbox is empty.
    ///
    /// Never blocks beyond a brief critical section.
    ///
    /// # Errors
    ///
    /// Returns [`MailboxError::Cancelled`] if `cancel` has already fired; the
    /// message is dropped in that case.
    pub fn deliver(&self, cancel: &CancellationToken, message: Message) -> Result<(), MailboxError> {
        if cancel.is_cancelled() {
            return Err(MailboxError::Cancelled);
        }
        {
            let mut slot = self.inner.slot.lock();
            match &mut *slot {
                Slot::Empty => *slot = Slot::Pending(vec![message]),
                Slot::Pending(batch) => batch.push(message),
            }
        }
        self.inner.ready.notify_one();
        Ok(())
    }

    /// Waits for a non-empty batch, then removes and returns all of it.
    ///
    /// Only one task may fetch from a given mailbox.
    ///
    /// # Errors
    ///
    /// Returns [`MailboxError::Cancelled`] if `cancel` fires before a batch
    /// is available.
    pub async fn fetch(&self, cancel: &CancellationToken) -> Result<Vec<Message>, MailboxError> {
        loop {
            if let Some(batch) = self.take() {
                return Ok(batch);
            }
            tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(MailboxError::Cancelled),
                () = self.inner.ready.notified() => {}
            }
        }
    }

    /// Number of messages waiting in the pending batch.
    #[must_use]
    pub fn pending(&self) -> usize {
        match &*self.inner.slot.lock() {
            Slot::Empty => 0,
            Slot::Pending(batch) => batch.len(),
        }
    }

    fn take(&self) -> Option<Vec<Message>> {
        let mut slot = self.inner.slot.lock();
        match mem::replace(&mut *slot, Slot::Empty) {
            Slot::Empty => None,
            Slot::Pending(batch) => Some(batch),
        }
    }
}

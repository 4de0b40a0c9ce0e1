//! Per-worker port table.

use std::collections::HashMap;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use super::SupervisorError;
use crate::message::{Headers, Id};

type CloseSlot = watch::Sender<Option<Headers>>;

/// Open ports of every worker, each with a slot that receives the headers
/// of the `close` message that ends it.
#[derive(Debug, Default)]
pub(crate) struct PortTable {
    workers: HashMap<Id, HashMap<Id, CloseSlot>>,
}

impl PortTable {
    pub(crate) fn add_worker(&mut self, worker: Id) {
        self.workers.entry(worker).or_default();
    }

    pub(crate) fn open(&mut self, worker: Id, port: Id) -> Result<(), SupervisorError> {
        let ports = self
            .workers
            .get_mut(&worker)
            .ok_or(SupervisorError::NoWorker(worker))?;
        if ports.contains_key(&port) {
            return Err(SupervisorError::PortAlreadyOpen { worker, port });
        }
        let (slot, _) = watch::channel(None);
        ports.insert(port, slot);
        Ok(())
    }

    /// Removes the port, handing `closing` to anyone waiting on it.
    pub(crate) fn close(
        &mut self,
        worker: Id,
        port: Id,
        closing: &Headers,
    ) -> Result<(), SupervisorError> {
        let ports = self
            .workers
            .get_mut(&worker)
            .ok_or(SupervisorError::NoWorker(worker))?;
        let slot = ports
            .remove(&port)
            .ok_or(SupervisorError::NoPort { worker, port })?;
        slot.send_replace(Some(closing.clone()));
        Ok(())
    }

    pub(crate) fn subscribe(
        &self,
        worker: Id,
        port: Id,
    ) -> Result<watch::Receiver<Option<Headers>>, SupervisorError> {
        let ports = self
            .workers
            .get(&worker)
            .ok_or(SupervisorError::NoWorker(worker))?;
        let slot = ports
            .get(&port)
            .ok_or(SupervisorError::NoPort { worker, port })?;
        Ok(slot.subscribe())
    }

    pub(crate) fn open_count(&self) -> usize {
        self.workers.values().map(HashMap::len).sum()
    }
}

/// Waitable handle resolving once a port is closed.
#[derive(Debug)]
pub struct PortClosed {
    worker: Id,
    port: Id,
    slot: watch::Receiver<Option<Headers>>,
    cancel: CancellationToken,
}

impl PortClosed {
    pub(crate) fn new(
        worker: Id,
        port: Id,
        slot: watch::Receiver<Option<Headers>>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            worker,
            port,
            slot,
            cancel,
        }
    }

    /// Worker owning the port.
    #[must_use]
    pub fn worker(&self) -> Id {
        self.worker
    }

    /// The port being watched.
    #[must_use]
    pub fn port(&self) -> Id {
        self.port
    }

    /// Returns `true` if the port has already been closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.slot.borrow().is_some()
    }

    /// Waits for the port to close and returns the headers of the `close`
    /// message.
    ///
    /// # Errors
    ///
    /// Returns [`SupervisorError::Cancelled`] if the supervisor stops first.
    pub async fn wait(mut self) -> Result<Headers, SupervisorError> {
        loop {
            let closing = self.slot.borrow_and_update().clone();
            if let Some(headers) = closing {
                return Ok(headers);
            }
            tokio::select! {
                biased;
                () = self.cancel.cancelled() => return Err(SupervisorError::Cancelled),
                changed = self.slot.changed() => {
                    if changed.is_err() {
                        let closing = self.slot.borrow().clone();
                        return closing.ok_or(SupervisorError::Cancelled);
                    }
                }
            }
        }
    }
}

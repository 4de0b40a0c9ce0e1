//! What a worker sees of the tree.
//!
//! A spawned worker receives a [`WorkerContext`]: its identity, its inbox,
//! a handle for sending into the shared outbox and a way to watch ports.
//! Engines use a [`CommandIssuer`] to make reentrant calls while still in
//! the middle of handling an inbound message.

mod error;

pub use error::WorkerError;

use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::infrastructure::config::DebugSettings;
use crate::mailbox::Mailbox;
use crate::message::{Id, Message};
use crate::supervisor::{PortClosed, Supervisor};

/// Per-worker view of the supervision tree.
#[derive(Debug)]
pub struct WorkerContext {
    id: Id,
    parent: Id,
    cancel: CancellationToken,
    inbox: Mailbox,
    supervisor: Supervisor,
}

impl WorkerContext {
    pub(crate) fn new(
        id: Id,
        parent: Id,
        cancel: CancellationToken,
        inbox: Mailbox,
        supervisor: Supervisor,
    ) -> Self {
        Self {
            id,
            parent,
            cancel,
            inbox,
            supervisor,
        }
    }

    /// This worker's id.
    #[must_use]
    pub fn id(&self) -> Id {
        self.id
    }

    /// The id this worker was spawned under.
    #[must_use]
    pub fn parent(&self) -> Id {
        self.parent
    }

    /// Debug toggles of the tree.
    #[must_use]
    pub fn debug(&self) -> DebugSettings {
        self.supervisor.debug()
    }

    /// Waits for the next batch of inbound messages.
    ///
    /// # Errors
    ///
    /// Fails with a cancellation error once the worker is terminated or the
    /// tree stops.
    pub async fn fetch(&self) -> Result<Vec<Message>, WorkerError> {
        Ok(self.inbox.fetch(&self.cancel).await?)
    }

    /// Sends a message into the tree. The sender field is left as is.
    ///
    /// # Errors
    ///
    /// Fails with a cancellation error once the worker is terminated.
    pub fn deliver(&self, message: Message) -> Result<(), WorkerError> {
        Ok(self.supervisor.outbox().deliver(&self.cancel, message)?)
    }

    /// Returns a handle resolving when `port` on `worker` closes.
    ///
    /// # Errors
    ///
    /// Fails if the worker is unknown or the port is not open.
    pub fn port_closed(&self, worker: Id, port: Id) -> Result<PortClosed, WorkerError> {
        Ok(self.supervisor.port_closed(worker, port)?)
    }

    /// Cancels this worker only; siblings keep running.
    pub fn terminate(&self) {
        debug!(worker = %self.id, "Terminating worker");
        self.cancel.cancel();
    }

    /// The worker's cancellation scope.
    #[must_use]
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// A cloneable handle for issuing reentrant commands as this worker.
    #[must_use]
    pub fn commands(&self) -> CommandIssuer {
        CommandIssuer {
            id: self.id,
            outbox: self.supervisor.outbox().clone(),
            cancel: self.cancel.clone(),
        }
    }
}

/// Issues outbound requests on behalf of a worker and waits for the reply.
///
/// Each call gets a fresh one-shot reply channel, so a command issued from
/// inside an engine call is routed exactly like one from any other worker.
#[derive(Debug, Clone)]
pub struct CommandIssuer {
    id: Id,
    outbox: Mailbox,
    cancel: CancellationToken,
}

impl CommandIssuer {
    /// Id stamped as the sender of every command.
    #[must_use]
    pub fn id(&self) -> Id {
        self.id
    }

    /// Cancellation scope of the issuing worker.
    #[must_use]
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Sends `message` into the tree without waiting for anything.
    ///
    /// # Errors
    ///
    /// Fails with a cancellation error once the worker is terminated.
    pub fn deliver(&self, message: Message) -> Result<(), WorkerError> {
        Ok(self.outbox.deliver(&self.cancel, message)?)
    }

    /// Sends `request` as this worker and waits for its reply.
    ///
    /// # Errors
    ///
    /// Returns [`WorkerError::Cancelled`] if the worker is cancelled before
    /// the reply arrives and [`WorkerError::ReplyDropped`] if the request was
    /// discarded unanswered.
    pub async fn issue(&self, mut request: Message) -> Result<Message, WorkerError> {
        request.headers.from = self.id;
        let (tx, rx) = oneshot::channel();
        request.response = Some(tx);

        self.outbox
            .deliver(&self.cancel, request)
            .map_err(|_| WorkerError::Cancelled)?;

        tokio::select! {
            biased;
            reply = rx => reply.map_err(|_| WorkerError::ReplyDropped),
            () = self.cancel.cancelled() => Err(WorkerError::Cancelled),
        }
    }
}

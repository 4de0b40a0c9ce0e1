//! Operations available to the top-level caller.
//!
//! The driver is not a worker. It sends as [`Id::DRIVER`], which the
//! supervisor lets block on any worker, and waits on its own reply
//! channels.

use bytes::Bytes;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info};

use crate::message::{Headers, Id, Message, MessageType};
use crate::supervisor::{Supervisor, SupervisorError};

/// Failure of a driver exchange.
#[derive(Debug, Error)]
pub enum DriverError {
    /// The supervisor refused the message.
    #[error(transparent)]
    Supervisor(#[from] SupervisorError),

    /// The worker answered with an `error` reply.
    #[error("{0}")]
    Rejected(String),

    /// The request was dropped without a reply.
    #[error("worker {0} dropped the request")]
    NoReply(Id),

    /// The request body could not be encoded.
    #[error("invalid request body: {0}")]
    Body(#[from] serde_json::Error),
}

#[derive(Serialize)]
#[serde(tag = "method", rename_all = "camelCase")]
enum Call<'a> {
    Evaluate { source: &'a str },
    Import { location: &'a str },
    ImportBundle { location: &'a str },
}

/// Driver-side handle on a started supervisor.
#[derive(Debug, Clone)]
pub struct Driver {
    supervisor: Supervisor,
}

impl Driver {
    /// Wraps `supervisor`.
    #[must_use]
    pub fn new(supervisor: Supervisor) -> Self {
        Self { supervisor }
    }

    /// The wrapped supervisor.
    #[must_use]
    pub fn supervisor(&self) -> &Supervisor {
        &self.supervisor
    }

    /// Sends a synchronous `system` message with `body` to `worker` and
    /// waits for the reply.
    ///
    /// # Errors
    ///
    /// Returns [`DriverError::Rejected`] with the reply's error text for
    /// `error` replies, and fails if the tree has stopped or the request
    /// is dropped unanswered.
    pub async fn request(&self, worker: Id, body: impl Into<Bytes>) -> Result<Message, DriverError> {
        let (request, reply) = Message::request(
            Headers::new(MessageType::System)
                .with_from(Id::DRIVER)
                .with_to(worker),
        );
        self.supervisor.deliver(request.with_body(body))?;
        let reply = reply.await.map_err(|_| DriverError::NoReply(worker))?;
        if let Some(text) = reply.error_text() {
            return Err(DriverError::Rejected(text.to_owned()));
        }
        Ok(reply)
    }

    async fn call(&self, worker: Id, call: &Call<'_>) -> Result<Message, DriverError> {
        let body = serde_json::to_vec(call)?;
        self.request(worker, body).await
    }

    /// Evaluates `source` in `worker`.
    ///
    /// # Errors
    ///
    /// See [`Driver::request`].
    pub async fn evaluate(&self, worker: Id, source: &str) -> Result<Message, DriverError> {
        self.call(worker, &Call::Evaluate { source }).await
    }

    /// Imports the module at `location` into `worker`.
    ///
    /// # Errors
    ///
    /// See [`Driver::request`].
    pub async fn import(&self, worker: Id, location: &str) -> Result<Message, DriverError> {
        self.call(worker, &Call::Import { location }).await
    }

    /// Imports the prebuilt bundle at `location` into `worker`.
    ///
    /// # Errors
    ///
    /// See [`Driver::request`].
    pub async fn import_bundle(&self, worker: Id, location: &str) -> Result<Message, DriverError> {
        self.call(worker, &Call::ImportBundle { location }).await
    }

    /// Waits for every open port to close, then stops the tree and waits
    /// for all workers to exit.
    pub async fn shutdown(&self) {
        debug!(ports = self.supervisor.open_port_count(), "Waiting for open ports");
        self.supervisor.wait_ports().await;
        info!("All ports closed, stopping");
        self.supervisor.stop();
        self.supervisor.wait().await;
    }
}

//! Error type returned from worker entry points.

use thiserror::Error;

use crate::engine::EngineError;
use crate::mailbox::MailboxError;
use crate::protocol::ProtocolError;
use crate::supervisor::SupervisorError;

/// Why a worker stopped or an exchange failed.
#[derive(Debug, Error)]
pub enum WorkerError {
    /// The worker's cancellation scope fired.
    #[error("worker cancelled")]
    Cancelled,

    /// A reply channel was dropped without an answer.
    #[error("reply channel closed without a reply")]
    ReplyDropped,

    /// Mailbox failure.
    #[error(transparent)]
    Mailbox(#[from] MailboxError),

    /// Framing failure.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// Engine failure.
    #[error(transparent)]
    Engine(#[from] EngineError),

    /// Supervisor rejected an operation.
    #[error(transparent)]
    Supervisor(#[from] SupervisorError),
}

impl WorkerError {
    /// Whether this error is a normal way for a worker to stop.
    ///
    /// Cancellation and end of stream are ordinary shutdown paths, as is an
    /// oversized exchange, which asks for a graceful stop. Everything else
    /// is a bug and is treated as fatal by the supervisor.
    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        match self {
            Self::Cancelled
            | Self::Mailbox(MailboxError::Cancelled)
            | Self::Supervisor(SupervisorError::Cancelled) => true,
            Self::Engine(e) => e.is_shutdown(),
            _ => false,
        }
    }
}

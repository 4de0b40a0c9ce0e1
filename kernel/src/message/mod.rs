//! The message envelope exchanged between the driver, the supervisor and
//! workers.
//!
//! A [`Message`] is built and donated by its sender. Once it sits in a
//! mailbox only the receiver touches it, usually to produce a reply that is
//! handed back through [`Message::response`].

mod headers;
mod id;

pub use headers::{Headers, MessageType};
pub use id::Id;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tracing::debug;

/// One-shot channel half used to answer a message.
pub type ReplyTx = oneshot::Sender<Message>;
/// Receiving half of a reply channel.
pub type ReplyRx = oneshot::Receiver<Message>;

/// Optional resource-usage accounting reported by an engine alongside a reply.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "MeterRepr")]
pub struct Meter {
    /// Compute units consumed.
    pub compute: Option<u64>,
    /// Bytes allocated.
    pub allocate: Option<u64>,
}

// Engines report either a bare compute count or the detailed object.
#[derive(Deserialize)]
#[serde(untagged)]
enum MeterRepr {
    Compute(u64),
    Detailed {
        #[serde(default)]
        compute: Option<u64>,
        #[serde(default)]
        allocate: Option<u64>,
    },
}

impl From<MeterRepr> for Meter {
    fn from(repr: MeterRepr) -> Self {
        match repr {
            MeterRepr::Compute(compute) => Self {
                compute: Some(compute),
                allocate: None,
            },
            MeterRepr::Detailed { compute, allocate } => Self { compute, allocate },
        }
    }
}

/// A routed message: headers, raw body, and an optional reply channel.
///
/// A `None` response channel means fire-and-forget.
#[derive(Debug)]
pub struct Message {
    /// Routing and classification.
    pub headers: Headers,
    /// Raw body bytes.
    pub body: Bytes,
    /// Where the single reply goes, if one is expected.
    pub response: Option<ReplyTx>,
    /// Usage accounting attached by the engine, if any.
    pub meter: Option<Meter>,
}

impl Message {
    /// Creates a fire-and-forget message with an empty body.
    #[must_use]
    pub fn new(headers: Headers) -> Self {
        Self {
            headers,
            body: Bytes::new(),
            response: None,
            meter: None,
        }
    }

    /// Creates a synchronous request and returns the receiving end of its
    /// reply channel.
    #[must_use]
    pub fn request(headers: Headers) -> (Self, ReplyRx) {
        let (tx, rx) = oneshot::channel();
        let message = Self {
            headers: headers.sync(),
            body: Bytes::new(),
            response: Some(tx),
            meter: None,
        };
        (message, rx)
    }

    /// Creates an asynchronous message that still carries a reply channel,
    /// used purely for flow-control acknowledgement.
    #[must_use]
    pub fn acknowledged(headers: Headers) -> (Self, ReplyRx) {
        let (tx, rx) = oneshot::channel();
        let message = Self {
            headers,
            body: Bytes::new(),
            response: Some(tx),
            meter: None,
        };
        (message, rx)
    }

    /// Replaces the body.
    #[must_use]
    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// Returns `true` when a reply channel is still armed.
    #[must_use]
    pub fn expects_reply(&self) -> bool {
        self.response.is_some()
    }

    /// Consumes the reply channel and sends `reply` through it.
    ///
    /// Delivery is best-effort: if the waiting side has already gone away
    /// the reply is dropped. Returns `true` if the reply was handed over.
    pub fn respond(&mut self, reply: Message) -> bool {
        let Some(tx) = self.response.take() else {
            return false;
        };
        match tx.send(reply) {
            Ok(()) => true,
            Err(dropped) => {
                debug!(
                    kind = %dropped.headers.kind,
                    to = %dropped.headers.to,
                    "Reply receiver gone, dropping reply"
                );
                false
            }
        }
    }

    /// Answers with an `error` reply addressed back to the sender.
    pub fn respond_error(&mut self, reason: impl Into<String>) -> bool {
        let mut headers = self.headers.reply(MessageType::Error);
        headers.error = Some(reason.into());
        self.respond(Message::new(headers))
    }

    /// Answers with an empty reply of `kind` addressed back to the sender.
    pub fn respond_with(&mut self, kind: MessageType) -> bool {
        let headers = self.headers.reply(kind);
        self.respond(Message::new(headers))
    }

    /// Returns the error text of an `error` reply.
    #[must_use]
    pub fn error_text(&self) -> Option<&str> {
        match self.headers.kind {
            MessageType::Error => Some(self.headers.error.as_deref().unwrap_or("")),
            _ => None,
        }
    }
}

//! Wire-level message headers.

use serde::{Deserialize, Serialize};
use std::fmt;

use super::Id;

/// The closed set of message types understood by every component.
///
/// Unrecognized type strings fail to deserialize and surface as protocol
/// errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    /// Tears down the addressed worker only.
    Terminate,
    /// A system call to a worker.
    System,
    /// A plain data message, usually scoped to a port.
    Send,
    /// Closes a port. Addressed to the supervisor.
    Close,
    /// Opens a port. Addressed to the supervisor.
    Open,
    /// Successful reply.
    Ok,
    /// Failed reply; `Headers::error` carries the reason.
    Error,
    /// Flow-control acknowledgement without data.
    Ack,
}

impl MessageType {
    /// Returns the wire spelling of the type.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Terminate => "terminate",
            Self::System => "system",
            Self::Send => "send",
            Self::Close => "close",
            Self::Open => "open",
            Self::Ok => "ok",
            Self::Error => "error",
            Self::Ack => "ack",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Routing and classification fields of a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Headers {
    /// Message type.
    #[serde(rename = "type")]
    pub kind: MessageType,
    /// Marks a blocking request expecting exactly one reply.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub sync: bool,
    /// Sender.
    #[serde(default)]
    pub from: Id,
    /// Addressee.
    #[serde(default)]
    pub to: Id,
    /// Sub-channel of the worker; `0` is the default channel.
    #[serde(default)]
    pub port: Id,
    /// Error text for `error` replies.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Headers {
    /// Creates headers of the given type with every other field zeroed.
    #[must_use]
    pub fn new(kind: MessageType) -> Self {
        Self {
            kind,
            sync: false,
            from: Id::SUPERVISOR,
            to: Id::SUPERVISOR,
            port: Id::SUPERVISOR,
            error: None,
        }
    }

    /// Creates `error` headers carrying `reason`.
    #[must_use]
    pub fn error(reason: impl Into<String>) -> Self {
        Self {
            error: Some(reason.into()),
            ..Self::new(MessageType::Error)
        }
    }

    /// Sets the sender.
    #[must_use]
    pub fn with_from(mut self, from: Id) -> Self {
        self.from = from;
        self
    }

    /// Sets the addressee.
    #[must_use]
    pub fn with_to(mut self, to: Id) -> Self {
        self.to = to;
        self
    }

    /// Sets the port.
    #[must_use]
    pub fn with_port(mut self, port: Id) -> Self {
        self.port = port;
        self
    }

    /// Marks the message as a blocking request.
    #[must_use]
    pub fn sync(mut self) -> Self {
        self.sync = true;
        self
    }

    /// Headers for a reply travelling back along this message's route.
    #[must_use]
    pub fn reply(&self, kind: MessageType) -> Self {
        Self {
            kind,
            sync: false,
            from: self.to,
            to: self.from,
            port: self.port,
            error: None,
        }
    }
}

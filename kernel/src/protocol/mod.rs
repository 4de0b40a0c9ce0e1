//! Byte-level framing shared by every engine transport.
//!
//! A frame is `headers-JSON 0x01 body`. Engines that report usage prepend a
//! metering block, giving `meter-JSON 0x01 headers-JSON 0x01 body`. Frames
//! travel unchanged over both the subprocess pipes (wrapped in a tagged
//! [`Record`]) and the in-process linear-memory buffer.

mod netstring;

pub use netstring::{NetstringCodec, DEFAULT_MAX_RECORD_LENGTH};

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::message::{Headers, Message, Meter};

/// Separator between the JSON blocks and the body of a frame.
pub const DELIMITER: u8 = 0x01;

/// Errors produced while encoding or decoding frames and records.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// A frame without the `0x01` separator.
    #[error("invalid message, must have \\x01 delimiter")]
    MissingDelimiter,

    /// The headers block is not valid JSON or names an unknown message type.
    #[error("invalid message headers: {0}")]
    InvalidHeaders(#[source] serde_json::Error),

    /// The metering block is not valid JSON.
    #[error("invalid meter data: {0}")]
    InvalidMeter(#[source] serde_json::Error),

    /// A transport record with no tag byte.
    #[error("empty record")]
    EmptyRecord,

    /// A transport record whose tag is not understood in this position.
    #[error("unexpected record tag {:?}", char::from(*.0))]
    UnexpectedTag(u8),

    /// Malformed netstring length prefix or terminator.
    #[error("netstring syntax error: {0}")]
    Netstring(String),

    /// A netstring longer than the codec accepts.
    #[error("record of {len} bytes exceeds limit of {max} bytes")]
    RecordTooLong {
        /// Declared length.
        len: usize,
        /// Configured limit.
        max: usize,
    },

    /// Underlying transport failure.
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Encodes a message as `headers-JSON 0x01 body`.
///
/// # Errors
///
/// Returns [`ProtocolError::InvalidHeaders`] if the headers cannot be
/// serialized.
pub fn encode_frame(message: &Message) -> Result<BytesMut, ProtocolError> {
    let headers = serde_json::to_vec(&message.headers).map_err(ProtocolError::InvalidHeaders)?;
    let mut frame = BytesMut::with_capacity(headers.len() + 1 + message.body.len());
    frame.put_slice(&headers);
    frame.put_u8(DELIMITER);
    frame.put_slice(&message.body);
    Ok(frame)
}

/// Decodes a `headers-JSON 0x01 body` frame into a message without a reply
/// channel.
///
/// The body is everything after the first delimiter and may itself contain
/// `0x01` bytes.
///
/// # Errors
///
/// Returns [`ProtocolError::MissingDelimiter`] or
/// [`ProtocolError::InvalidHeaders`].
pub fn decode_frame(frame: Bytes) -> Result<Message, ProtocolError> {
    let split = find_delimiter(&frame)?;
    let headers: Headers =
        serde_json::from_slice(&frame[..split]).map_err(ProtocolError::InvalidHeaders)?;
    Ok(Message::new(headers).with_body(frame.slice(split + 1..)))
}

/// Decodes a `meter-JSON 0x01 headers-JSON 0x01 body` frame.
///
/// # Errors
///
/// Returns [`ProtocolError::InvalidMeter`] for a malformed metering block
/// and otherwise the same errors as [`decode_frame`].
pub fn decode_metered_frame(frame: Bytes) -> Result<Message, ProtocolError> {
    let split = find_delimiter(&frame)?;
    let meter: Meter =
        serde_json::from_slice(&frame[..split]).map_err(ProtocolError::InvalidMeter)?;
    let mut message = decode_frame(frame.slice(split + 1..))?;
    message.meter = Some(meter);
    Ok(message)
}

fn find_delimiter(frame: &[u8]) -> Result<usize, ProtocolError> {
    frame
        .iter()
        .position(|&b| b == DELIMITER)
        .ok_or(ProtocolError::MissingDelimiter)
}

/// A tagged record on the subprocess transport.
///
/// The first byte of every netstring payload selects the record kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Record {
    /// `.` terminal success payload.
    Ok(Bytes),
    /// `!` terminal failure; UTF-8 error text, no frame.
    Error(String),
    /// `?` a frame the peer wants answered with a [`Record::Reply`].
    Command(Bytes),
    /// `/` the answer to an earlier [`Record::Command`].
    Reply(Bytes),
    /// `e` source text to evaluate.
    Evaluate(Bytes),
}

impl Record {
    /// Tag byte for this record kind.
    #[must_use]
    pub const fn tag(&self) -> u8 {
        match self {
            Self::Ok(_) => b'.',
            Self::Error(_) => b'!',
            Self::Command(_) => b'?',
            Self::Reply(_) => b'/',
            Self::Evaluate(_) => b'e',
        }
    }

    /// Splits a raw netstring payload into tag and content.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::EmptyRecord`] for an empty payload and
    /// [`ProtocolError::UnexpectedTag`] for an unknown tag byte.
    pub fn parse(raw: Bytes) -> Result<Self, ProtocolError> {
        let Some(&tag) = raw.first() else {
            return Err(ProtocolError::EmptyRecord);
        };
        let payload = raw.slice(1..);
        match tag {
            b'.' => Ok(Self::Ok(payload)),
            b'!' => Ok(Self::Error(String::from_utf8_lossy(&payload).into_owned())),
            b'?' => Ok(Self::Command(payload)),
            b'/' => Ok(Self::Reply(payload)),
            b'e' => Ok(Self::Evaluate(payload)),
            other => Err(ProtocolError::UnexpectedTag(other)),
        }
    }

    /// Serializes the record as `tag payload`, ready for netstring framing.
    #[must_use]
    pub fn to_bytes(&self) -> Bytes {
        let payload: &[u8] = match self {
            Self::Ok(p) | Self::Command(p) | Self::Reply(p) | Self::Evaluate(p) => p,
            Self::Error(text) => text.as_bytes(),
        };
        let mut out = BytesMut::with_capacity(payload.len() + 1);
        out.put_u8(self.tag());
        out.put_slice(payload);
        out.freeze()
    }
}

//! Netstring record codec: `<decimal length>:<payload>,`.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::ProtocolError;

/// Largest record accepted by [`NetstringCodec::default`].
pub const DEFAULT_MAX_RECORD_LENGTH: usize = 64 * 1024 * 1024;

// Enough digits for any length up to usize::MAX on 64-bit targets.
const MAX_PREFIX_DIGITS: usize = 20;

/// Length-prefixed framing for the subprocess pipes.
#[derive(Debug, Clone, Copy)]
pub struct NetstringCodec {
    max_length: usize,
    // Payload length of the record currently being read, once its prefix is
    // consumed.
    pending: Option<usize>,
}

impl Default for NetstringCodec {
    fn default() -> Self {
        Self::with_max_length(DEFAULT_MAX_RECORD_LENGTH)
    }
}

impl NetstringCodec {
    /// Creates a codec rejecting records longer than `max_length` bytes.
    #[must_use]
    pub const fn with_max_length(max_length: usize) -> Self {
        Self {
            max_length,
            pending: None,
        }
    }

    /// Maximum accepted payload length.
    #[must_use]
    pub const fn max_length(&self) -> usize {
        self.max_length
    }

    fn decode_prefix(&self, src: &mut BytesMut) -> Result<Option<usize>, ProtocolError> {
        let Some(colon) = src.iter().position(|&b| b == b':') else {
            if src.len() > MAX_PREFIX_DIGITS {
                return Err(ProtocolError::Netstring("length prefix too long".into()));
            }
            if let Some(bad) = src.iter().find(|b| !b.is_ascii_digit()) {
                return Err(ProtocolError::Netstring(format!(
                    "unexpected byte {bad:#04x} in length prefix"
                )));
            }
            return Ok(None);
        };

        let digits = &src[..colon];
        if digits.is_empty() || !digits.iter().all(u8::is_ascii_digit) {
            return Err(ProtocolError::Netstring("invalid length prefix".into()));
        }
        let len = std::str::from_utf8(digits)
            .ok()
            .and_then(|s| s.parse::<usize>().ok())
            .ok_or_else(|| ProtocolError::Netstring("length prefix overflow".into()))?;
        if len > self.max_length {
            return Err(ProtocolError::RecordTooLong {
                len,
                max: self.max_length,
            });
        }
        src.advance(colon + 1);
        Ok(Some(len))
    }
}

impl Decoder for NetstringCodec {
    type Item = Bytes;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>, ProtocolError> {
        let len = match self.pending {
            Some(len) => len,
            None => match self.decode_prefix(src)? {
                Some(len) => {
                    self.pending = Some(len);
                    len
                }
                None => return Ok(None),
            },
        };

        if src.len() < len + 1 {
            src.reserve(len + 1 - src.len());
            return Ok(None);
        }

        let payload = src.split_to(len).freeze();
        let terminator = src.get_u8();
        self.pending = None;
        if terminator != b',' {
            return Err(ProtocolError::Netstring(format!(
                "expected ',' terminator, found {terminator:#04x}"
            )));
        }
        Ok(Some(payload))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>, ProtocolError> {
        match self.decode(src)? {
            Some(frame) => Ok(Some(frame)),
            None if src.is_empty() && self.pending.is_none() => Ok(None),
            None => Err(ProtocolError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "stream ended inside a netstring",
            ))),
        }
    }
}

impl<B: AsRef<[u8]>> Encoder<B> for NetstringCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: B, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        let payload = item.as_ref();
        if payload.len() > self.max_length {
            return Err(ProtocolError::RecordTooLong {
                len: payload.len(),
                max: self.max_length,
            });
        }
        let prefix = payload.len().to_string();
        dst.reserve(prefix.len() + payload.len() + 2);
        dst.put_slice(prefix.as_bytes());
        dst.put_u8(b':');
        dst.put_slice(payload);
        dst.put_u8(b',');
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_length_prefix_and_terminator() {
        let mut codec = NetstringCodec::default();
        let mut dst = BytesMut::new();
        codec.encode(b"hello world!", &mut dst).unwrap();
        assert_eq!(&dst[..], b"12:hello world!,");

        dst.clear();
        codec.encode(b"", &mut dst).unwrap();
        assert_eq!(&dst[..], b"0:,");
    }

    #[test]
    fn decodes_across_partial_reads() {
        let mut codec = NetstringCodec::default();
        let mut src = BytesMut::from(&b"5:he"[..]);
        assert_eq!(codec.decode(&mut src).unwrap(), None);

        src.extend_from_slice(b"llo,3:a");
        assert_eq!(
            codec.decode(&mut src).unwrap(),
            Some(Bytes::from_static(b"hello"))
        );
        assert_eq!(codec.decode(&mut src).unwrap(), None);

        src.extend_from_slice(b"bc,");
        assert_eq!(
            codec.decode(&mut src).unwrap(),
            Some(Bytes::from_static(b"abc"))
        );
        assert!(src.is_empty());
    }

    #[test]
    fn rejects_missing_terminator() {
        let mut codec = NetstringCodec::default();
        let mut src = BytesMut::from(&b"2:ab;"[..]);
        assert!(matches!(
            codec.decode(&mut src),
            Err(ProtocolError::Netstring(_))
        ));
    }

    #[test]
    fn rejects_garbage_prefix() {
        let mut codec = NetstringCodec::default();
        let mut src = BytesMut::from(&b"x2:ab,"[..]);
        assert!(matches!(
            codec.decode(&mut src),
            Err(ProtocolError::Netstring(_))
        ));
    }

    #[test]
    fn enforces_max_length() {
        let mut codec = NetstringCodec::with_max_length(4);
        let mut src = BytesMut::from(&b"10:0123456789,"[..]);
        assert!(matches!(
            codec.decode(&mut src),
            Err(ProtocolError::RecordTooLong { len: 10, max: 4 })
        ));

        let mut dst = BytesMut::new();
        assert!(codec.encode(b"too long", &mut dst).is_err());
    }

    #[test]
    fn eof_inside_record_is_an_error() {
        let mut codec = NetstringCodec::default();
        let mut src = BytesMut::from(&b"9:abc"[..]);
        assert!(codec.decode_eof(&mut src).is_err());

        let mut codec = NetstringCodec::default();
        let mut src = BytesMut::new();
        assert_eq!(codec.decode_eof(&mut src).unwrap(), None);
    }
}

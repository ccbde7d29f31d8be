//! Protobase fixed header.
//!
//! ```text
//! 0      1          2        6            10         14           18
//! +------+----------+--------+------------+----------+------------+
//! | kind | name len |   id   | session id | text len | binary len |
//! +------+----------+--------+------------+----------+------------+
//! ```
//!
//! All multi-byte fields are big-endian `u32`. An id or session id of zero
//! means "not set".

use crate::codec::CodecError;
use crate::exchange::FrameKind;
use bytes::{Buf, BufMut, BytesMut};

/// Encoded header size.
pub const HEADER_LEN: usize = 18;

const KIND_MESSAGE: u8 = 0;
const KIND_PING: u8 = 1;
const KIND_PONG: u8 = 2;

/// Decoded protobase header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// `None` for ordinary messages.
    pub kind: Option<FrameKind>,
    pub name_len: u8,
    pub id: u32,
    pub session_id: u32,
    pub text_len: u32,
    pub binary_len: u32,
}

impl Header {
    /// Bytes that follow the header.
    pub fn body_len(&self) -> usize {
        self.name_len as usize + self.text_len as usize + self.binary_len as usize
    }

    /// Parse a header from the front of `input` without consuming it.
    ///
    /// Returns `Ok(None)` if fewer than `HEADER_LEN` bytes are available.
    pub fn parse(input: &[u8]) -> Result<Option<Header>, CodecError> {
        if input.len() < HEADER_LEN {
            return Ok(None);
        }
        let mut buf = &input[..HEADER_LEN];
        let kind = match buf.get_u8() {
            KIND_MESSAGE => None,
            KIND_PING => Some(FrameKind::Ping),
            KIND_PONG => Some(FrameKind::Pong),
            tag => return Err(CodecError::UnknownKind(tag)),
        };
        Ok(Some(Header {
            kind,
            name_len: buf.get_u8(),
            id: buf.get_u32(),
            session_id: buf.get_u32(),
            text_len: buf.get_u32(),
            binary_len: buf.get_u32(),
        }))
    }

    pub fn write(&self, dst: &mut BytesMut) {
        let kind = match self.kind {
            Some(FrameKind::Ping) => KIND_PING,
            Some(FrameKind::Pong) => KIND_PONG,
            _ => KIND_MESSAGE,
        };
        dst.put_u8(kind);
        dst.put_u8(self.name_len);
        dst.put_u32(self.id);
        dst.put_u32(self.session_id);
        dst.put_u32(self.text_len);
        dst.put_u32(self.binary_len);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_layout() {
        let header = Header {
            kind: Some(FrameKind::Ping),
            name_len: 3,
            id: 0x0102_0304,
            session_id: 9,
            text_len: 5,
            binary_len: 256,
        };
        let mut buf = BytesMut::new();
        header.write(&mut buf);
        assert_eq!(buf.len(), HEADER_LEN);
        assert_eq!(&buf[..6], &[1, 3, 1, 2, 3, 4]);
        assert_eq!(&buf[14..], &[0, 0, 1, 0]);
        assert_eq!(header.body_len(), 264);

        assert_eq!(Header::parse(&buf).unwrap(), Some(header));
        assert_eq!(Header::parse(&buf[..17]).unwrap(), None);
    }

    #[test]
    fn test_unknown_kind() {
        let mut buf = [0u8; HEADER_LEN];
        buf[0] = 7;
        assert!(matches!(
            Header::parse(&buf),
            Err(CodecError::UnknownKind(7))
        ));
    }
}

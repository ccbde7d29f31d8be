//! Websocket-style frame header parser and writer.
//!
//! ```text
//!  0               1               2               3
//!  0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7
//! +-+-+-+-+-------+-+-------------+-------------------------------+
//! |F|R|R|R| kind  |M| Payload len |    Extended payload length    |
//! |I|S|S|S|  (4)  |A|     (7)     |            (16/32)            |
//! |N|V|V|V|       |S|             |   (if payload len==126/127)   |
//! +-+-+-+-+-------+-+-------------+-------------------------------+
//! ```
//!
//! Length 126 is followed by a u16, 127 by a u32, both big-endian. Inbound
//! frames may carry a 4-byte mask key after the length; outbound frames
//! never do.

use crate::codec::CodecError;
use crate::exchange::FrameKind;
use bytes::{BufMut, BytesMut};

/// Final-fragment flag in byte 0.
pub const FIN: u8 = 0x80;
/// Reserved bits in byte 0.
pub const RSV: u8 = 0x70;
/// Mask flag in byte 1.
pub const MASK: u8 = 0x80;
/// Length sentinel: u16 length follows.
pub const LEN_U16: u8 = 126;
/// Length sentinel: u32 length follows.
pub const LEN_U32: u8 = 127;
/// Bytes needed before the length sentinel can be read.
pub const MIN_HEADER: usize = 2;

/// Parsed frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub kind: FrameKind,
    pub payload_len: usize,
    pub mask: Option<[u8; 4]>,
    /// Bytes occupied by the header, mask key included.
    pub header_len: usize,
}

/// Header parse result.
#[derive(Debug)]
pub enum ParseResult {
    /// Header fully present.
    Complete(FrameHeader),
    /// At least `needed` bytes are required to finish the header.
    Incomplete { needed: usize },
    /// Protocol violation.
    Error(CodecError),
}

/// Parse a frame header from the front of `input` without consuming it.
pub fn parse_header(input: &[u8]) -> ParseResult {
    if input.len() < MIN_HEADER {
        return ParseResult::Incomplete { needed: MIN_HEADER };
    }

    let b0 = input[0];
    let b1 = input[1];

    if b0 & FIN == 0 {
        return ParseResult::Error(CodecError::Fragmented);
    }
    if b0 & RSV != 0 {
        return ParseResult::Error(CodecError::MalformedHeader("reserved bits set"));
    }
    let tag = b0 & 0x0F;
    let kind = match FrameKind::from_tag(tag) {
        Some(kind) => kind,
        None => return ParseResult::Error(CodecError::UnknownKind(tag)),
    };

    // The sentinel decides how long the header is.
    let (payload_len, mut offset) = match b1 & !MASK {
        LEN_U16 => {
            if input.len() < 4 {
                return ParseResult::Incomplete { needed: 4 };
            }
            (u16::from_be_bytes([input[2], input[3]]) as usize, 4)
        }
        LEN_U32 => {
            if input.len() < 6 {
                return ParseResult::Incomplete { needed: 6 };
            }
            let len = u32::from_be_bytes([input[2], input[3], input[4], input[5]]);
            (len as usize, 6)
        }
        len => (len as usize, MIN_HEADER),
    };

    let mask = if b1 & MASK != 0 {
        if input.len() < offset + 4 {
            return ParseResult::Incomplete { needed: offset + 4 };
        }
        let key = [
            input[offset],
            input[offset + 1],
            input[offset + 2],
            input[offset + 3],
        ];
        offset += 4;
        Some(key)
    } else {
        None
    };

    ParseResult::Complete(FrameHeader {
        kind,
        payload_len,
        mask,
        header_len: offset,
    })
}

/// Size of the minimal unmasked header for a payload of `len` bytes.
pub fn header_len(len: usize) -> Result<usize, CodecError> {
    if len < LEN_U16 as usize {
        Ok(2)
    } else if len <= u16::MAX as usize {
        Ok(4)
    } else if len <= u32::MAX as usize {
        Ok(6)
    } else {
        Err(CodecError::FrameTooLarge {
            size: len,
            limit: u32::MAX as usize,
        })
    }
}

/// Write the minimal unmasked header for a `kind` frame of `len` bytes.
///
/// Returns the header size. `len` must already have passed `header_len`.
pub fn write_header(kind: FrameKind, len: usize, dst: &mut BytesMut) -> usize {
    dst.put_u8(FIN | kind.tag());
    if len < LEN_U16 as usize {
        dst.put_u8(len as u8);
        2
    } else if len <= u16::MAX as usize {
        dst.put_u8(LEN_U16);
        dst.put_u16(len as u16);
        4
    } else {
        dst.put_u8(LEN_U32);
        dst.put_u32(len as u32);
        6
    }
}

/// XOR `payload` in place with the 4-byte mask key.
pub fn unmask(payload: &mut [u8], mask: [u8; 4]) {
    for (i, b) in payload.iter_mut().enumerate() {
        *b ^= mask[i % 4];
    }
}

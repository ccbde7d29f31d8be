//! Websocket-style frame protocol.
//!
//! Each message is one frame: a 2, 4 or 6-byte header followed by the raw
//! payload. The final-fragment flag is always set; fragmented frames are
//! rejected.
//!
//! ## Masking
//!
//! This codec plays the server role. Frames it writes are never masked.
//! Frames it reads may be masked, as clients are required to do; the key
//! is consumed and the payload unmasked before it reaches the exchange.
//!
//! ## Protocol Format
//!
//! ```text
//! 0x81 0x05 "hello"            text frame, 5 bytes
//! 0x82 0x7E 0x00 0xC8 <200>    binary frame, 200 bytes
//! 0x89 0x00                    ping
//! ```

pub mod frame;

use crate::buffer::Allocator;
use crate::codec::{Codec, CodecError, DecodeContext, Limits, PendingHeader};
use crate::connection::ConnectionInfo;
use crate::exchange::{Exchange, ExchangeKind, FrameKind, Message};
use bytes::{Buf, BytesMut};
use frame::ParseResult;
use tracing::trace;

/// Protocol id negotiated by websocket connections.
pub const PROTOCOL_ID: &str = "WebSocket";

/// Frame codec for websocket-style connections.
#[derive(Debug, Clone, Default)]
pub struct WebSocketCodec {
    limits: Limits,
}

impl WebSocketCodec {
    pub fn new(limits: Limits) -> Self {
        Self { limits }
    }
}

impl Codec for WebSocketCodec {
    fn protocol_id(&self) -> &'static str {
        PROTOCOL_ID
    }

    fn exchange_kind(&self) -> ExchangeKind {
        ExchangeKind::Frame
    }

    fn decode(
        &self,
        cx: &mut DecodeContext<'_>,
        src: &mut BytesMut,
    ) -> Result<Option<Exchange>, CodecError> {
        let (kind, payload_len, mask) = match cx.state().pending() {
            Some(PendingHeader::Frame {
                kind,
                payload_len,
                mask,
            }) => (kind, payload_len, mask),
            Some(_) => return Err(CodecError::MalformedHeader("foreign decode state")),
            None => match frame::parse_header(src) {
                ParseResult::Complete(header) => {
                    self.limits.check(header.payload_len)?;
                    src.advance(header.header_len);
                    cx.state().set_pending(PendingHeader::Frame {
                        kind: header.kind,
                        payload_len: header.payload_len,
                        mask: header.mask,
                    });
                    (header.kind, header.payload_len, header.mask)
                }
                ParseResult::Incomplete { .. } => return Ok(None),
                ParseResult::Error(e) => return Err(e),
            },
        };

        if src.len() < payload_len {
            return Ok(None);
        }
        cx.state().take_pending();

        let mut payload = src.split_to(payload_len);
        if let Some(mask) = mask {
            frame::unmask(&mut payload, mask);
        }
        if kind == FrameKind::Text && std::str::from_utf8(&payload).is_err() {
            return Err(CodecError::InvalidText);
        }

        trace!(conn = cx.conn().id(), ?kind, payload_len, "decoded frame");

        let mut exchange = cx.obtain(ExchangeKind::Frame);
        if let Some(msg) = exchange.as_message_mut() {
            msg.set_kind(kind);
            msg.payload_mut().set_read(payload.freeze());
        }
        Ok(Some(exchange))
    }

    fn encode(
        &self,
        _conn: &ConnectionInfo,
        exchange: &Exchange,
        alloc: &mut dyn Allocator,
    ) -> Result<BytesMut, CodecError> {
        let msg = match exchange {
            Exchange::Frame(msg) => msg,
            other => {
                return Err(CodecError::WrongExchange {
                    codec: PROTOCOL_ID,
                    found: other.kind(),
                })
            }
        };

        let kind = msg.kind().unwrap_or(FrameKind::Text);
        let data = msg.payload().write();
        self.limits.check(data.len())?;
        let header_len = frame::header_len(data.len())?;

        let mut buf = alloc.allocate(header_len + data.len())?;
        frame::write_header(kind, data.len(), &mut buf);
        buf.extend_from_slice(data);
        Ok(buf)
    }

    fn create_ping(&self, conn: &ConnectionInfo) -> Option<Exchange> {
        if !self.applies_to(conn) {
            return None;
        }
        Some(Exchange::Frame(Message::new(FrameKind::Ping)))
    }

    fn create_pong(&self, conn: &ConnectionInfo, ping: Exchange) -> Option<Exchange> {
        if !self.applies_to(conn) {
            return None;
        }
        let mut msg = match ping {
            Exchange::Frame(msg) => msg,
            _ => return None,
        };
        // The pong carries the ping's application data back.
        let data = msg.payload_mut().take_read();
        msg.payload_mut().write_bytes(&data);
        msg.set_kind(FrameKind::Pong);
        Some(Exchange::Frame(msg))
    }
}

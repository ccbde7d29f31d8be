//! Length-prefixed protocol.
//!
//! ## Protocol Format
//!
//! ```text
//! [len: i32 BE][payload: len bytes]
//! ```
//!
//! Two negative lengths are reserved for heartbeats and carry no payload:
//! `-1` is a ping, `-2` a pong.

use crate::buffer::Allocator;
use crate::codec::{Codec, CodecError, DecodeContext, Limits, PendingHeader};
use crate::connection::ConnectionInfo;
use crate::exchange::{Exchange, ExchangeKind, FrameKind, Message};
use bytes::{Buf, BufMut, BytesMut};
use tracing::trace;

/// Protocol id of length-prefixed connections.
pub const PROTOCOL_ID: &str = "FixedLength";

/// Size of the length prefix.
pub const PREFIX_LEN: usize = 4;

const PING: i32 = -1;
const PONG: i32 = -2;

/// Codec for 4-byte length-prefixed messages.
#[derive(Debug, Clone, Default)]
pub struct FixedLengthCodec {
    limits: Limits,
}

impl FixedLengthCodec {
    pub fn new(limits: Limits) -> Self {
        Self { limits }
    }

    fn heartbeat(&self, cx: &mut DecodeContext<'_>, kind: FrameKind) -> Exchange {
        let mut exchange = cx.obtain(ExchangeKind::Text);
        exchange.set_frame_kind(kind);
        exchange
    }
}

impl Codec for FixedLengthCodec {
    fn protocol_id(&self) -> &'static str {
        PROTOCOL_ID
    }

    fn exchange_kind(&self) -> ExchangeKind {
        ExchangeKind::Text
    }

    fn decode(
        &self,
        cx: &mut DecodeContext<'_>,
        src: &mut BytesMut,
    ) -> Result<Option<Exchange>, CodecError> {
        let len = match cx.state().pending() {
            Some(PendingHeader::Length { len }) => len,
            Some(_) => return Err(CodecError::MalformedHeader("foreign decode state")),
            None => {
                if src.len() < PREFIX_LEN {
                    return Ok(None);
                }
                match src.get_i32() {
                    PING => return Ok(Some(self.heartbeat(cx, FrameKind::Ping))),
                    PONG => return Ok(Some(self.heartbeat(cx, FrameKind::Pong))),
                    n if n < 0 => return Err(CodecError::MalformedHeader("negative length")),
                    n => {
                        let len = n as usize;
                        self.limits.check(len)?;
                        cx.state().set_pending(PendingHeader::Length { len });
                        len
                    }
                }
            }
        };

        if src.len() < len {
            return Ok(None);
        }
        cx.state().take_pending();

        let payload = src.split_to(len).freeze();
        trace!(conn = cx.conn().id(), len, "decoded message");

        let mut exchange = cx.obtain(ExchangeKind::Text);
        if let Some(msg) = exchange.as_message_mut() {
            msg.set_kind(FrameKind::Binary);
            msg.payload_mut().set_read(payload);
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
            Exchange::Text(msg) => msg,
            other => {
                return Err(CodecError::WrongExchange {
                    codec: PROTOCOL_ID,
                    found: other.kind(),
                })
            }
        };

        match msg.kind() {
            Some(FrameKind::Ping) | Some(FrameKind::Pong) => {
                let mut buf = alloc.allocate(PREFIX_LEN)?;
                let marker = if msg.kind() == Some(FrameKind::Ping) {
                    PING
                } else {
                    PONG
                };
                buf.put_i32(marker);
                Ok(buf)
            }
            _ => {
                let data = msg.payload().write();
                self.limits.check(data.len())?;
                let len = i32::try_from(data.len()).map_err(|_| CodecError::FrameTooLarge {
                    size: data.len(),
                    limit: i32::MAX as usize,
                })?;
                let mut buf = alloc.allocate(PREFIX_LEN + data.len())?;
                buf.put_i32(len);
                buf.extend_from_slice(data);
                Ok(buf)
            }
        }
    }

    fn create_ping(&self, conn: &ConnectionInfo) -> Option<Exchange> {
        if !self.applies_to(conn) {
            return None;
        }
        Some(Exchange::Text(Message::new(FrameKind::Ping)))
    }

    fn create_pong(&self, conn: &ConnectionInfo, mut ping: Exchange) -> Option<Exchange> {
        if !self.applies_to(conn) || ping.kind() != ExchangeKind::Text {
            return None;
        }
        ping.set_frame_kind(FrameKind::Pong);
        Some(ping)
    }
}

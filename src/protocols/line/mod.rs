//! Line-delimited text protocol.
//!
//! ## Protocol Format
//!
//! ```text
//! hello\n
//! hello\r\n      (the \r is stripped)
//! ```
//!
//! Messages must be UTF-8. There is no heartbeat.

use crate::buffer::Allocator;
use crate::codec::{Codec, CodecError, DecodeContext, Limits};
use crate::connection::ConnectionInfo;
use crate::exchange::{Exchange, ExchangeKind, FrameKind};
use bytes::{Buf, BytesMut};
use tracing::trace;

/// Protocol id of line connections.
pub const PROTOCOL_ID: &str = "LineBased";

/// Codec for `\n`-terminated text.
#[derive(Debug, Clone, Default)]
pub struct LineCodec {
    limits: Limits,
}

impl LineCodec {
    pub fn new(limits: Limits) -> Self {
        Self { limits }
    }
}

impl Codec for LineCodec {
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
        // Resume the search where the previous call stopped.
        let start = cx.state().scanned().min(src.len());
        let newline = match src[start..].iter().position(|&b| b == b'\n') {
            Some(pos) => start + pos,
            None => {
                if src.len() > self.limits.max_frame_size {
                    return Err(CodecError::FrameTooLarge {
                        size: src.len(),
                        limit: self.limits.max_frame_size,
                    });
                }
                cx.state().set_scanned(src.len());
                return Ok(None);
            }
        };
        cx.state().set_scanned(0);

        let mut line = src.split_to(newline);
        src.advance(1);
        if line.last() == Some(&b'\r') {
            line.truncate(line.len() - 1);
        }
        self.limits.check(line.len())?;
        if std::str::from_utf8(&line).is_err() {
            return Err(CodecError::InvalidText);
        }

        trace!(conn = cx.conn().id(), len = line.len(), "decoded line");

        let mut exchange = cx.obtain(ExchangeKind::Text);
        if let Some(msg) = exchange.as_message_mut() {
            msg.set_kind(FrameKind::Text);
            msg.payload_mut().set_read(line.freeze());
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
        let data = msg.payload().write();
        self.limits.check(data.len())?;

        let mut buf = alloc.allocate(data.len() + 1)?;
        buf.extend_from_slice(data);
        buf.extend_from_slice(b"\n");
        Ok(buf)
    }
}

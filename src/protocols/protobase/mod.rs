//! Protobase: named, correlated exchanges with text and binary parts.
//!
//! Every message carries a service name (used as the hashed balancing key),
//! an exchange id for correlating replies, an optional session id for sticky
//! balancing, a UTF-8 text part and a binary part. Pings and pongs are
//! header-only messages.
//!
//! ## Protocol Format
//!
//! ```text
//! [header: 18 bytes][name][text][binary]
//! ```

mod header;

pub use header::{Header, HEADER_LEN};

use crate::buffer::Allocator;
use crate::codec::{Codec, CodecError, DecodeContext, Limits, PendingHeader};
use crate::connection::ConnectionInfo;
use crate::exchange::{Exchange, ExchangeKind, FrameKind, ProtobaseExchange};
use bytes::{Buf, BytesMut};
use tracing::trace;

/// Protocol id of protobase connections.
pub const PROTOCOL_ID: &str = "Protobase";

/// Codec for protobase exchanges.
#[derive(Debug, Clone, Default)]
pub struct ProtobaseCodec {
    limits: Limits,
}

impl ProtobaseCodec {
    pub fn new(limits: Limits) -> Self {
        Self { limits }
    }
}

fn utf8(bytes: BytesMut) -> Result<String, CodecError> {
    String::from_utf8(bytes.to_vec()).map_err(|_| CodecError::InvalidText)
}

fn wire_len(len: usize) -> Result<u32, CodecError> {
    u32::try_from(len).map_err(|_| CodecError::FrameTooLarge {
        size: len,
        limit: u32::MAX as usize,
    })
}

impl Codec for ProtobaseCodec {
    fn protocol_id(&self) -> &'static str {
        PROTOCOL_ID
    }

    fn exchange_kind(&self) -> ExchangeKind {
        ExchangeKind::Protobase
    }

    fn decode(
        &self,
        cx: &mut DecodeContext<'_>,
        src: &mut BytesMut,
    ) -> Result<Option<Exchange>, CodecError> {
        let header = match cx.state().pending() {
            Some(PendingHeader::Protobase(header)) => header,
            Some(_) => return Err(CodecError::MalformedHeader("foreign decode state")),
            None => match Header::parse(src)? {
                Some(header) => {
                    self.limits.check(header.body_len())?;
                    src.advance(HEADER_LEN);
                    cx.state().set_pending(PendingHeader::Protobase(header));
                    header
                }
                None => return Ok(None),
            },
        };

        if src.len() < header.body_len() {
            return Ok(None);
        }
        cx.state().take_pending();

        let name = utf8(src.split_to(header.name_len as usize))?;
        let text = utf8(src.split_to(header.text_len as usize))?;
        let binary = src.split_to(header.binary_len as usize).freeze();

        trace!(
            conn = cx.conn().id(),
            id = header.id,
            name = %name,
            text_len = header.text_len,
            binary_len = header.binary_len,
            "decoded protobase exchange"
        );

        let mut exchange = cx.obtain(ExchangeKind::Protobase);
        if let Some(p) = exchange.as_protobase_mut() {
            if let Some(kind) = header.kind {
                p.set_kind(kind);
            }
            // pooled exchanges come back reset, so the write-once fields are free
            if header.id != 0 {
                p.set_id(header.id)
                    .map_err(|_| CodecError::MalformedHeader("exchange id reused"))?;
            }
            if !name.is_empty() {
                p.set_name(name)
                    .map_err(|_| CodecError::MalformedHeader("service name reused"))?;
            }
            if header.session_id != 0 {
                p.set_session_id(header.session_id);
            }
            p.set_read_text(text);
            p.binary_mut().set_read(binary);
        }
        Ok(Some(exchange))
    }

    fn encode(
        &self,
        _conn: &ConnectionInfo,
        exchange: &Exchange,
        alloc: &mut dyn Allocator,
    ) -> Result<BytesMut, CodecError> {
        let p = match exchange {
            Exchange::Protobase(p) => p,
            other => {
                return Err(CodecError::WrongExchange {
                    codec: PROTOCOL_ID,
                    found: other.kind(),
                })
            }
        };

        let name = p.name().unwrap_or_default().as_bytes();
        let name_len = u8::try_from(name.len()).map_err(|_| CodecError::FrameTooLarge {
            size: name.len(),
            limit: u8::MAX as usize,
        })?;
        let text = p.write_text().as_bytes();
        let binary = p.written_binary();

        let header = Header {
            kind: p.kind(),
            name_len,
            id: p.id().unwrap_or(0),
            session_id: p.session_id().unwrap_or(0),
            text_len: wire_len(text.len())?,
            binary_len: wire_len(binary.len())?,
        };
        self.limits.check(header.body_len())?;

        let mut buf = alloc.allocate(HEADER_LEN + header.body_len())?;
        header.write(&mut buf);
        buf.extend_from_slice(name);
        buf.extend_from_slice(text);
        buf.extend_from_slice(binary);
        Ok(buf)
    }

    fn create_ping(&self, conn: &ConnectionInfo) -> Option<Exchange> {
        if !self.applies_to(conn) {
            return None;
        }
        Some(Exchange::Protobase(ProtobaseExchange::heartbeat(
            FrameKind::Ping,
        )))
    }

    fn create_pong(&self, conn: &ConnectionInfo, mut ping: Exchange) -> Option<Exchange> {
        if !self.applies_to(conn) {
            return None;
        }
        ping.as_protobase_mut()?.set_kind(FrameKind::Pong);
        Some(ping)
    }
}

//! Protocol codec contract.
//!
//! A codec turns inbound bytes into exchanges (decode) and exchanges into
//! outbound bytes (encode), and synthesizes heartbeat messages. One codec
//! instance is shared by every connection speaking its protocol, across
//! workers, so it holds no per-connection state: a partially read header
//! lives in the connection's `DecodeState` instead.

use crate::buffer::Allocator;
use crate::connection::ConnectionInfo;
use crate::exchange::{Exchange, ExchangeKind, FrameKind};
use crate::pool::ExchangePools;
use crate::protocols::protobase::Header as ProtobaseHeader;
use bytes::BytesMut;
use std::io;
use thiserror::Error;

/// Default frame budget per connection.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Codec failures.
///
/// Everything except `Io` and `WrongExchange` is a protocol violation and
/// fatal for the connection.
#[derive(Debug, Error)]
pub enum CodecError {
    /// Header bytes that no valid frame can start with.
    #[error("malformed header: {0}")]
    MalformedHeader(&'static str),
    /// Kind tag outside the supported set.
    #[error("unknown message kind tag {0}")]
    UnknownKind(u8),
    /// Frame without the final-fragment flag.
    #[error("fragmented frames are not supported")]
    Fragmented,
    /// Declared length beyond the connection's frame budget.
    #[error("frame of {size} bytes exceeds limit of {limit}")]
    FrameTooLarge { size: usize, limit: usize },
    /// Text payload that is not UTF-8.
    #[error("text payload is not valid UTF-8")]
    InvalidText,
    /// Exchange of a family this codec does not speak.
    #[error("{codec} cannot encode {found:?} exchanges")]
    WrongExchange {
        codec: &'static str,
        found: ExchangeKind,
    },
    /// Allocator exhaustion or transport failure.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl CodecError {
    /// Whether this error means the peer broke the wire protocol.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            CodecError::MalformedHeader(_)
                | CodecError::UnknownKind(_)
                | CodecError::Fragmented
                | CodecError::FrameTooLarge { .. }
                | CodecError::InvalidText
        )
    }
}

impl From<CodecError> for io::Error {
    fn from(e: CodecError) -> Self {
        match e {
            CodecError::Io(e) => e,
            other => io::Error::new(io::ErrorKind::InvalidData, other),
        }
    }
}

/// Size limits applied by codecs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    /// Largest frame payload accepted or produced.
    pub max_frame_size: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }
}

impl Limits {
    /// Fail with `FrameTooLarge` if `size` is over budget.
    pub fn check(&self, size: usize) -> Result<(), CodecError> {
        if size > self.max_frame_size {
            return Err(CodecError::FrameTooLarge {
                size,
                limit: self.max_frame_size,
            });
        }
        Ok(())
    }
}

/// A header that has been consumed while its payload is still in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingHeader {
    /// Websocket-style frame header.
    Frame {
        kind: FrameKind,
        payload_len: usize,
        mask: Option<[u8; 4]>,
    },
    /// Fixed-length prefix.
    Length { len: usize },
    /// Protobase header.
    Protobase(ProtobaseHeader),
}

/// Per-connection decode progress.
#[derive(Debug, Default)]
pub struct DecodeState {
    pending: Option<PendingHeader>,
    scanned: usize,
}

impl DecodeState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Header consumed by an earlier call, if any.
    pub fn pending(&self) -> Option<PendingHeader> {
        self.pending
    }

    pub fn set_pending(&mut self, header: PendingHeader) {
        self.pending = Some(header);
    }

    pub fn take_pending(&mut self) -> Option<PendingHeader> {
        self.pending.take()
    }

    /// Bytes already searched by a delimiter-based codec.
    pub fn scanned(&self) -> usize {
        self.scanned
    }

    pub fn set_scanned(&mut self, scanned: usize) {
        self.scanned = scanned;
    }

    /// True when no message is partially decoded.
    pub fn is_idle(&self) -> bool {
        self.pending.is_none() && self.scanned == 0
    }

    pub fn clear(&mut self) {
        self.pending = None;
        self.scanned = 0;
    }
}

/// Everything a decode call may touch besides the inbound bytes.
pub struct DecodeContext<'a> {
    conn: &'a ConnectionInfo,
    state: &'a mut DecodeState,
    pools: &'a mut ExchangePools,
}

impl<'a> DecodeContext<'a> {
    pub fn new(
        conn: &'a ConnectionInfo,
        state: &'a mut DecodeState,
        pools: &'a mut ExchangePools,
    ) -> Self {
        Self { conn, state, pools }
    }

    pub fn conn(&self) -> &ConnectionInfo {
        self.conn
    }

    pub fn state(&mut self) -> &mut DecodeState {
        self.state
    }

    /// Pooled or fresh exchange of `kind` from the worker's pools.
    pub fn obtain(&mut self, kind: ExchangeKind) -> Exchange {
        self.pools.obtain(kind)
    }
}

/// Wire protocol codec.
pub trait Codec: Send + Sync + 'static {
    /// Identifier compared against a connection's negotiated protocol.
    fn protocol_id(&self) -> &'static str;

    /// Exchange family this codec produces and accepts.
    fn exchange_kind(&self) -> ExchangeKind;

    /// Decode one exchange from the front of `src`.
    ///
    /// Returns `Ok(None)` when `src` does not yet hold a complete message;
    /// bytes that were not consumed stay in `src` and any consumed header is
    /// kept in the decode state for the next call.
    fn decode(
        &self,
        cx: &mut DecodeContext<'_>,
        src: &mut BytesMut,
    ) -> Result<Option<Exchange>, CodecError>;

    /// Serialize `exchange` into a buffer from `alloc`.
    fn encode(
        &self,
        conn: &ConnectionInfo,
        exchange: &Exchange,
        alloc: &mut dyn Allocator,
    ) -> Result<BytesMut, CodecError>;

    /// Heartbeat request, or `None` if the connection's protocol has none.
    fn create_ping(&self, _conn: &ConnectionInfo) -> Option<Exchange> {
        None
    }

    /// Heartbeat reply built from `ping`, or `None` if not applicable.
    fn create_pong(&self, _conn: &ConnectionInfo, _ping: Exchange) -> Option<Exchange> {
        None
    }

    /// Whether `conn` negotiated this codec's protocol.
    fn applies_to(&self, conn: &ConnectionInfo) -> bool {
        conn.protocol_id() == self.protocol_id()
    }
}

//! Exchange objects: the unit of a single request or response.
//!
//! An exchange is a mutable, reusable record carrying protocol metadata and
//! payload. Each protocol family gets its own variant so codecs can check
//! what they were handed instead of downcasting:
//!
//! - `Frame`: websocket-style frames (kind tag + payload)
//! - `Text`: plain messages for the line and fixed-length codecs
//! - `Protobase`: named, hashable, binary-capable exchanges
//!
//! Exchanges are owned by the I/O worker that decoded them until they are
//! handed to application code or pushed back into the worker's pool.

use bytes::{Bytes, BytesMut};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use thiserror::Error;

/// Message kind tag, governing header construction on frame protocols.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameKind {
    Text = 1,
    Binary = 2,
    Close = 8,
    Ping = 9,
    Pong = 10,
}

impl FrameKind {
    /// All kinds, in tag order.
    pub const ALL: [FrameKind; 5] = [
        FrameKind::Text,
        FrameKind::Binary,
        FrameKind::Close,
        FrameKind::Ping,
        FrameKind::Pong,
    ];

    /// Wire tag for this kind.
    pub fn tag(self) -> u8 {
        self as u8
    }

    /// Look up a kind by its wire tag.
    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(FrameKind::Text),
            2 => Some(FrameKind::Binary),
            8 => Some(FrameKind::Close),
            9 => Some(FrameKind::Ping),
            10 => Some(FrameKind::Pong),
            _ => None,
        }
    }

    /// Ping, pong and close never reach application handlers.
    pub fn is_control(self) -> bool {
        matches!(self, FrameKind::Close | FrameKind::Ping | FrameKind::Pong)
    }
}

/// Concrete exchange family. Pools are keyed by this.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExchangeKind {
    Frame,
    Text,
    Protobase,
}

/// Errors from exchange field accessors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExchangeError {
    /// A write-once field was written a second time.
    #[error("{0} is already set")]
    AlreadySet(&'static str),
    /// An offset/length slice fell outside the source buffer.
    #[error("slice {offset}+{len} out of bounds for {size} bytes")]
    OutOfBounds {
        offset: usize,
        len: usize,
        size: usize,
    },
}

/// Read and write buffers of one exchange.
///
/// The read side holds bytes received from the peer. The write side holds
/// bytes queued for send; its size is tracked independently of the buffer's
/// capacity, which survives `clear` so a pooled exchange keeps its allocation.
#[derive(Debug, Default, Clone)]
pub struct Payload {
    read: Bytes,
    write: BytesMut,
}

impl Payload {
    /// Bytes received from the peer.
    pub fn read(&self) -> &[u8] {
        &self.read
    }

    /// Declared size of the received payload.
    pub fn read_size(&self) -> usize {
        self.read.len()
    }

    /// Whether any payload bytes were received.
    pub fn has_read(&self) -> bool {
        !self.read.is_empty()
    }

    /// Received payload as UTF-8, if it is valid.
    pub fn read_text(&self) -> Option<&str> {
        std::str::from_utf8(&self.read).ok()
    }

    /// Install received bytes. Called by codecs on decode.
    pub fn set_read(&mut self, bytes: Bytes) {
        self.read = bytes;
    }

    /// Take the received bytes, leaving the read side empty.
    pub fn take_read(&mut self) -> Bytes {
        std::mem::take(&mut self.read)
    }

    /// Bytes queued for send.
    pub fn write(&self) -> &[u8] {
        &self.write
    }

    /// Number of bytes queued for send.
    pub fn write_size(&self) -> usize {
        self.write.len()
    }

    /// Capacity of the write buffer.
    pub fn write_capacity(&self) -> usize {
        self.write.capacity()
    }

    /// Append one byte to the write side.
    pub fn write_byte(&mut self, b: u8) {
        self.write.extend_from_slice(&[b]);
    }

    /// Append bytes to the write side.
    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.write.extend_from_slice(bytes);
    }

    /// Append `src[offset..offset + len]` to the write side.
    pub fn write_slice(
        &mut self,
        src: &[u8],
        offset: usize,
        len: usize,
    ) -> Result<(), ExchangeError> {
        let end = offset.checked_add(len).filter(|&end| end <= src.len());
        match end {
            Some(end) => {
                self.write.extend_from_slice(&src[offset..end]);
                Ok(())
            }
            None => Err(ExchangeError::OutOfBounds {
                offset,
                len,
                size: src.len(),
            }),
        }
    }

    /// Mutable access to the write buffer.
    pub fn write_mut(&mut self) -> &mut BytesMut {
        &mut self.write
    }

    /// Copy the received bytes to the write side (echo).
    pub fn echo(&mut self) {
        let read = self.read.clone();
        self.write.extend_from_slice(&read);
    }

    /// Drop both sides, keeping write capacity.
    pub fn clear(&mut self) {
        self.read = Bytes::new();
        self.write.clear();
    }
}

/// A frame or plain message: kind tag plus one payload.
#[derive(Debug, Default, Clone)]
pub struct Message {
    kind: Option<FrameKind>,
    payload: Payload,
    pooled: bool,
}

impl Message {
    /// Empty message with the given kind.
    pub fn new(kind: FrameKind) -> Self {
        Self {
            kind: Some(kind),
            ..Self::default()
        }
    }

    /// Text message queued for send.
    pub fn text(text: &str) -> Self {
        let mut msg = Self::new(FrameKind::Text);
        msg.payload.write_bytes(text.as_bytes());
        msg
    }

    /// Binary message queued for send.
    pub fn binary(data: &[u8]) -> Self {
        let mut msg = Self::new(FrameKind::Binary);
        msg.payload.write_bytes(data);
        msg
    }

    pub fn kind(&self) -> Option<FrameKind> {
        self.kind
    }

    pub fn set_kind(&mut self, kind: FrameKind) {
        self.kind = Some(kind);
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn payload_mut(&mut self) -> &mut Payload {
        &mut self.payload
    }

    fn reset(&mut self) {
        self.kind = None;
        self.payload.clear();
    }
}

/// Exchange of the protobase sub-protocol.
///
/// Carries a write-once exchange id and service name, an optional session
/// id used for sticky balancing, a text part and a binary part.
#[derive(Debug, Default, Clone)]
pub struct ProtobaseExchange {
    id: Option<u32>,
    name: Option<String>,
    session_id: Option<u32>,
    kind: Option<FrameKind>,
    read_text: String,
    write_text: String,
    binary: Payload,
    pooled: bool,
}

impl ProtobaseExchange {
    /// Message addressed to `name` carrying `text`.
    pub fn request(name: &str, text: &str) -> Self {
        Self {
            name: Some(name.to_string()),
            write_text: text.to_string(),
            ..Self::default()
        }
    }

    /// Heartbeat exchange (`Ping` or `Pong`).
    pub fn heartbeat(kind: FrameKind) -> Self {
        Self {
            kind: Some(kind),
            ..Self::default()
        }
    }

    pub fn id(&self) -> Option<u32> {
        self.id
    }

    /// Set the exchange id. Writable once per use.
    pub fn set_id(&mut self, id: u32) -> Result<(), ExchangeError> {
        if self.id.is_some() {
            return Err(ExchangeError::AlreadySet("exchange id"));
        }
        self.id = Some(id);
        Ok(())
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Set the service name. Writable once per use.
    pub fn set_name(&mut self, name: impl Into<String>) -> Result<(), ExchangeError> {
        if self.name.is_some() {
            return Err(ExchangeError::AlreadySet("service name"));
        }
        self.name = Some(name.into());
        Ok(())
    }

    pub fn session_id(&self) -> Option<u32> {
        self.session_id
    }

    pub fn set_session_id(&mut self, session_id: u32) {
        self.session_id = Some(session_id);
    }

    /// `Ping`/`Pong` for heartbeats, `None` for ordinary messages.
    pub fn kind(&self) -> Option<FrameKind> {
        self.kind
    }

    pub fn set_kind(&mut self, kind: FrameKind) {
        self.kind = Some(kind);
    }

    /// Text received from the peer.
    pub fn read_text(&self) -> &str {
        &self.read_text
    }

    /// Length in bytes of the received text.
    pub fn text_length(&self) -> usize {
        self.read_text.len()
    }

    pub(crate) fn set_read_text(&mut self, text: String) {
        self.read_text = text;
    }

    /// Text queued for send.
    pub fn write_text(&self) -> &str {
        &self.write_text
    }

    /// Append text to the send side.
    pub fn push_text(&mut self, text: &str) {
        self.write_text.push_str(text);
    }

    /// Binary bytes received from the peer.
    pub fn read_binary(&self) -> &[u8] {
        self.binary.read()
    }

    pub fn read_binary_size(&self) -> usize {
        self.binary.read_size()
    }

    pub fn has_read_binary(&self) -> bool {
        self.binary.has_read()
    }

    pub fn write_binary(&mut self, bytes: &[u8]) {
        self.binary.write_bytes(bytes);
    }

    pub fn write_binary_byte(&mut self, b: u8) {
        self.binary.write_byte(b);
    }

    /// Append `bytes[offset..offset + len]` to the binary send side.
    pub fn write_binary_slice(
        &mut self,
        bytes: &[u8],
        offset: usize,
        len: usize,
    ) -> Result<(), ExchangeError> {
        self.binary.write_slice(bytes, offset, len)
    }

    /// Binary bytes queued for send.
    pub fn written_binary(&self) -> &[u8] {
        self.binary.write()
    }

    pub fn write_binary_size(&self) -> usize {
        self.binary.write_size()
    }

    pub(crate) fn binary_mut(&mut self) -> &mut Payload {
        &mut self.binary
    }

    fn reset(&mut self) {
        self.id = None;
        self.name = None;
        self.session_id = None;
        self.kind = None;
        self.read_text.clear();
        self.write_text.clear();
        self.binary.clear();
    }
}

/// A single protocol message, tagged by protocol family.
#[derive(Debug, Clone)]
pub enum Exchange {
    Frame(Message),
    Text(Message),
    Protobase(ProtobaseExchange),
}

impl Exchange {
    /// Fresh, empty exchange of the given family.
    pub fn new(kind: ExchangeKind) -> Self {
        match kind {
            ExchangeKind::Frame => Exchange::Frame(Message::default()),
            ExchangeKind::Text => Exchange::Text(Message::default()),
            ExchangeKind::Protobase => Exchange::Protobase(ProtobaseExchange::default()),
        }
    }

    pub fn kind(&self) -> ExchangeKind {
        match self {
            Exchange::Frame(_) => ExchangeKind::Frame,
            Exchange::Text(_) => ExchangeKind::Text,
            Exchange::Protobase(_) => ExchangeKind::Protobase,
        }
    }

    /// Message kind tag. Protobase messages without a heartbeat kind report `None`.
    pub fn frame_kind(&self) -> Option<FrameKind> {
        match self {
            Exchange::Frame(m) | Exchange::Text(m) => m.kind(),
            Exchange::Protobase(p) => p.kind(),
        }
    }

    pub fn set_frame_kind(&mut self, kind: FrameKind) {
        match self {
            Exchange::Frame(m) | Exchange::Text(m) => m.set_kind(kind),
            Exchange::Protobase(p) => p.set_kind(kind),
        }
    }

    /// Correlation id, for protocols that carry one.
    pub fn exchange_id(&self) -> Option<u32> {
        match self {
            Exchange::Protobase(p) => p.id(),
            _ => None,
        }
    }

    /// Service name, for protocols that carry one.
    pub fn name(&self) -> Option<&str> {
        match self {
            Exchange::Protobase(p) => p.name(),
            _ => None,
        }
    }

    /// Sticky-balancing session id, for protocols that carry one.
    pub fn session_id(&self) -> Option<u32> {
        match self {
            Exchange::Protobase(p) => p.session_id(),
            _ => None,
        }
    }

    pub fn as_message(&self) -> Option<&Message> {
        match self {
            Exchange::Frame(m) | Exchange::Text(m) => Some(m),
            Exchange::Protobase(_) => None,
        }
    }

    pub fn as_message_mut(&mut self) -> Option<&mut Message> {
        match self {
            Exchange::Frame(m) | Exchange::Text(m) => Some(m),
            Exchange::Protobase(_) => None,
        }
    }

    pub fn as_protobase(&self) -> Option<&ProtobaseExchange> {
        match self {
            Exchange::Protobase(p) => Some(p),
            _ => None,
        }
    }

    pub fn as_protobase_mut(&mut self) -> Option<&mut ProtobaseExchange> {
        match self {
            Exchange::Protobase(p) => Some(p),
            _ => None,
        }
    }

    /// Hash of the exchange content used for hashed balancing.
    ///
    /// The service name is the key when present, otherwise the payload:
    /// the outgoing side when anything was written, the received side
    /// otherwise. Stable for identical content within one build.
    pub fn hash_key(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        match self {
            Exchange::Frame(m) | Exchange::Text(m) => {
                let payload = m.payload();
                if payload.write().is_empty() {
                    payload.read().hash(&mut hasher)
                } else {
                    payload.write().hash(&mut hasher)
                }
            }
            Exchange::Protobase(p) => match p.name() {
                Some(name) => name.hash(&mut hasher),
                None if !p.write_text().is_empty() => p.write_text().hash(&mut hasher),
                None => p.read_text().hash(&mut hasher),
            },
        }
        hasher.finish()
    }

    /// Whether this object was checked out from a worker pool.
    pub fn is_pooled(&self) -> bool {
        match self {
            Exchange::Frame(m) | Exchange::Text(m) => m.pooled,
            Exchange::Protobase(p) => p.pooled,
        }
    }

    pub(crate) fn set_pooled(&mut self, pooled: bool) {
        match self {
            Exchange::Frame(m) | Exchange::Text(m) => m.pooled = pooled,
            Exchange::Protobase(p) => p.pooled = pooled,
        }
    }

    /// Clear buffers, id and kind for reuse. Buffer capacity is kept.
    pub fn reset(&mut self) {
        match self {
            Exchange::Frame(m) | Exchange::Text(m) => m.reset(),
            Exchange::Protobase(p) => p.reset(),
        }
    }
}

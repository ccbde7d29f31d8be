//! Per-connection message processing shared by every runtime.
//!
//! The runtime reads bytes into the connection's inbound buffer and calls
//! `process`. Each decoded exchange is routed:
//!
//! - ping: answered with the codec's pong
//! - pong: recycled
//! - close: echoed, then the connection is closed
//! - anything else: handed to the `Handler`; a returned exchange is encoded
//!
//! Encoded replies are appended to the connection's outbound queue in
//! decode order. The runtime writes the queue and returns each buffer to the
//! worker's allocator once it is fully written.

use crate::buffer::Allocator;
use crate::codec::{Codec, CodecError, DecodeContext, DecodeState};
use crate::connection::ConnectionInfo;
use crate::exchange::{Exchange, FrameKind};
use crate::runtime::{Handler, WorkerContext};
use bytes::BytesMut;
use std::collections::VecDeque;
use std::io;
use tracing::{debug, trace, warn};

/// What the runtime should do with the connection after `process`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessResult {
    /// Keep reading.
    Continue,
    /// Flush the outbound queue, then close.
    Close,
}

/// Decode and handle every complete message in `inbound`.
pub fn process(
    codec: &dyn Codec,
    handler: &dyn Handler,
    conn: &ConnectionInfo,
    state: &mut DecodeState,
    worker: &mut WorkerContext,
    inbound: &mut BytesMut,
    outbound: &mut VecDeque<BytesMut>,
) -> Result<ProcessResult, CodecError> {
    loop {
        let exchange = {
            let mut cx = DecodeContext::new(conn, state, &mut worker.pools);
            match codec.decode(&mut cx, inbound)? {
                Some(exchange) => exchange,
                None => return Ok(ProcessResult::Continue),
            }
        };

        match exchange.frame_kind() {
            Some(FrameKind::Ping) => {
                trace!(conn = conn.id(), "ping");
                match codec.create_pong(conn, exchange) {
                    Some(pong) => send(codec, conn, worker, pong, outbound)?,
                    None => debug!(conn = conn.id(), "ping on protocol without heartbeat"),
                }
            }
            Some(FrameKind::Pong) => {
                trace!(conn = conn.id(), "pong");
                worker.pools.release(exchange);
            }
            Some(FrameKind::Close) => {
                let mut close = exchange;
                if let Some(msg) = close.as_message_mut() {
                    msg.payload_mut().echo();
                }
                send(codec, conn, worker, close, outbound)?;
                debug!(conn = conn.id(), "close received");
                return Ok(ProcessResult::Close);
            }
            _ => {
                if let Some(reply) = handler.accept(conn, exchange) {
                    send(codec, conn, worker, reply, outbound)?;
                }
            }
        }
    }
}

/// Encode `exchange` onto the outbound queue and recycle it.
pub fn send(
    codec: &dyn Codec,
    conn: &ConnectionInfo,
    worker: &mut WorkerContext,
    exchange: Exchange,
    outbound: &mut VecDeque<BytesMut>,
) -> Result<(), CodecError> {
    let encoded = codec.encode(conn, &exchange, &mut worker.buffers);
    worker.pools.release(exchange);
    outbound.push_back(encoded?);
    Ok(())
}

/// Encode the codec's heartbeat ping, if its protocol has one.
pub fn ping(
    codec: &dyn Codec,
    conn: &ConnectionInfo,
    alloc: &mut dyn Allocator,
) -> Result<Option<BytesMut>, CodecError> {
    match codec.create_ping(conn) {
        Some(ping) => Ok(Some(codec.encode(conn, &ping, alloc)?)),
        None => Ok(None),
    }
}

/// Log a codec failure and turn it into the connection's close reason.
pub fn violation(conn_id: usize, e: CodecError) -> io::Error {
    if e.is_protocol_violation() {
        warn!(conn_id, error = %e, "Protocol violation");
    }
    e.into()
}

/// Return written buffers to the allocator.
pub fn recycle(alloc: &mut dyn Allocator, outbound: &mut VecDeque<BytesMut>) {
    for buf in outbound.drain(..) {
        alloc.release(buf);
    }
}

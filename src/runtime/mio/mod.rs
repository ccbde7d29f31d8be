//! mio-based runtime.
//!
//! Readiness-based I/O using mio (epoll on Linux, kqueue on macOS).
//!
//! - `event_loop`: multi-worker server, one `SO_REUSEPORT` listener per worker
//! - `connector`: single client connection driven by its own I/O thread

mod connector;
mod event_loop;

pub use connector::{connect, ClientConnection};
pub use event_loop::Server;

use crate::buffer::Allocator;
use crate::codec::DecodeState;
use crate::connection::{ConnState, ConnectionInfo};
use crate::runtime::dispatch;
use bytes::BytesMut;
use mio::net::TcpStream;
use mio::{Interest, Registry, Token};
use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::time::Instant;

/// Bytes read per `read` call.
const READ_CHUNK: usize = 16 * 1024;

/// A socket plus its codec and write-queue state.
struct Link {
    stream: TcpStream,
    info: ConnectionInfo,
    decode: DecodeState,
    inbound: BytesMut,
    outbound: VecDeque<BytesMut>,
    state: ConnState,
    /// Whether WRITABLE interest is registered.
    writable: bool,
    last_active: Instant,
}

impl Link {
    fn new(stream: TcpStream, info: ConnectionInfo) -> Self {
        Self {
            stream,
            info,
            decode: DecodeState::new(),
            inbound: BytesMut::with_capacity(READ_CHUNK),
            outbound: VecDeque::new(),
            state: ConnState::Reading,
            writable: false,
            last_active: Instant::now(),
        }
    }

    /// Read until the socket would block. Returns `true` on EOF.
    fn read(&mut self) -> io::Result<bool> {
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            match self.stream.read(&mut chunk) {
                Ok(0) => return Ok(true),
                Ok(n) => {
                    self.inbound.extend_from_slice(&chunk[..n]);
                    self.last_active = Instant::now();
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Write queued buffers until the queue drains or the socket would
    /// block. Fully written buffers go back to `alloc`.
    fn flush(&mut self, alloc: &mut dyn Allocator) -> io::Result<()> {
        let mut written = self.state.written();
        let result = loop {
            let Some(front) = self.outbound.front() else {
                break Ok(());
            };
            match self.stream.write(&front[written..]) {
                Ok(0) => {
                    break Err(io::Error::new(io::ErrorKind::WriteZero, "write returned 0"));
                }
                Ok(n) => {
                    written += n;
                    self.last_active = Instant::now();
                    if written == front.len() {
                        if let Some(buf) = self.outbound.pop_front() {
                            alloc.release(buf);
                        }
                        written = 0;
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break Ok(()),
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => break Err(e),
            }
        };
        self.state = self.state.with_written(written, !self.outbound.is_empty());
        result
    }

    /// Nothing left to write and a close was requested.
    fn ready_to_close(&self) -> bool {
        self.state.is_closing() && self.outbound.is_empty()
    }

    /// Register WRITABLE interest only while output is queued.
    fn update_interest(&mut self, registry: &Registry, token: Token) -> io::Result<()> {
        let want_writable = !self.outbound.is_empty();
        if want_writable != self.writable {
            let interest = if want_writable {
                Interest::READABLE | Interest::WRITABLE
            } else {
                Interest::READABLE
            };
            registry.reregister(&mut self.stream, token, interest)?;
            self.writable = want_writable;
        }
        Ok(())
    }

    /// Flush what is queued, then close.
    fn close_after_flush(&mut self) {
        self.state = ConnState::Closing {
            written: self.state.written(),
        };
    }

    /// Hand every queued buffer back to `alloc`.
    fn release(&mut self, alloc: &mut dyn Allocator) {
        dispatch::recycle(alloc, &mut self.outbound);
    }
}

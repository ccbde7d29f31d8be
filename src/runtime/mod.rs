//! I/O runtimes hosting the codecs.
//!
//! Backends:
//! - `mio`: one readiness loop per worker thread (epoll/kqueue), plus a
//!   client connector
//! - `tokio`: one current-thread runtime per worker thread
//!
//! Both share:
//! - `WorkerContext`: per-worker exchange pools and buffer pool
//! - `dispatch`: decode loop, heartbeat handling, handler invocation
//! - `Handler` / `Submit`: the application-facing read and write points

pub mod dispatch;
pub mod mio;
pub mod tokio;

use crate::buffer::BufferPool;
use crate::codec::Codec;
use crate::config::{Config, RuntimeType};
use crate::connection::ConnectionInfo;
use crate::exchange::Exchange;
use crate::pool::ExchangePools;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

/// Application callback for decoded exchanges.
///
/// Called on the I/O worker, so it must not block. Returning an exchange
/// writes it back on the same connection.
pub trait Handler: Send + Sync + 'static {
    fn accept(&self, conn: &ConnectionInfo, exchange: Exchange) -> Option<Exchange>;

    /// A submitted `exchange` could not be encoded. The connection stays open.
    fn rejected(&self, _conn: &ConnectionInfo, _exchange: &Exchange, _error: &io::Error) {}

    /// `conn` is gone; nothing more will be read or written on it.
    fn closed(&self, _conn: &ConnectionInfo) {}
}

impl<F> Handler for F
where
    F: Fn(&ConnectionInfo, Exchange) -> Option<Exchange> + Send + Sync + 'static,
{
    fn accept(&self, conn: &ConnectionInfo, exchange: Exchange) -> Option<Exchange> {
        self(conn, exchange)
    }
}

/// Write side of a connection: queue an exchange for encode and send.
pub trait Submit {
    fn submit(&self, exchange: Exchange) -> io::Result<()>;
}

/// Handler that writes every exchange back to its sender.
#[derive(Debug, Default, Clone, Copy)]
pub struct EchoHandler;

impl Handler for EchoHandler {
    fn accept(&self, _conn: &ConnectionInfo, mut exchange: Exchange) -> Option<Exchange> {
        match &mut exchange {
            Exchange::Frame(msg) | Exchange::Text(msg) => msg.payload_mut().echo(),
            Exchange::Protobase(p) => {
                let text = p.read_text().to_string();
                p.push_text(&text);
                let binary = p.read_binary().to_vec();
                p.write_binary(&binary);
            }
        }
        Some(exchange)
    }
}

/// State owned by one I/O worker thread.
pub struct WorkerContext {
    pub id: usize,
    pub pools: ExchangePools,
    pub buffers: BufferPool,
}

impl WorkerContext {
    pub fn new(id: usize, config: &Config) -> Self {
        Self {
            id,
            pools: ExchangePools::new(config.exchange_stack_size),
            buffers: BufferPool::new(config.buffer_count, config.buffer_size),
        }
    }
}

/// A running server on either backend.
pub enum Server {
    Mio(mio::Server),
    Tokio(tokio::Server),
}

impl Server {
    pub fn local_addr(&self) -> SocketAddr {
        match self {
            Server::Mio(s) => s.local_addr(),
            Server::Tokio(s) => s.local_addr(),
        }
    }

    /// Ask every worker to stop.
    pub fn shutdown(&self) {
        match self {
            Server::Mio(s) => s.shutdown(),
            Server::Tokio(s) => s.shutdown(),
        }
    }

    /// Wait for every worker to exit.
    pub fn join(self) {
        match self {
            Server::Mio(s) => s.join(),
            Server::Tokio(s) => s.join(),
        }
    }
}

/// Start a server on the configured backend.
pub fn start(
    config: &Config,
    codec: Arc<dyn Codec>,
    handler: Arc<dyn Handler>,
) -> io::Result<Server> {
    match config.runtime {
        RuntimeType::Mio => Ok(Server::Mio(mio::Server::start(config, codec, handler)?)),
        RuntimeType::Tokio => Ok(Server::Tokio(tokio::Server::start(config, codec, handler)?)),
    }
}

/// Bind one `SO_REUSEPORT` listener per worker on the configured address.
///
/// The first bind resolves port 0; the rest share its port.
pub(crate) fn bind_listeners(
    config: &Config,
) -> io::Result<(SocketAddr, Vec<std::net::TcpListener>)> {
    let addr: SocketAddr = config
        .listen
        .parse()
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

    let first = create_listener_with_reuseport(addr)?;
    let local_addr = first.local_addr()?;
    let mut listeners = vec![first];
    for _ in 1..worker_count(config.workers) {
        listeners.push(create_listener_with_reuseport(local_addr)?);
    }
    Ok((local_addr, listeners))
}

/// Create a TCP listener with SO_REUSEPORT for kernel load balancing.
fn create_listener_with_reuseport(addr: SocketAddr) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_port(true)?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(1024)?;

    Ok(socket.into())
}

/// Resolve the worker count; zero means one per CPU.
pub(crate) fn worker_count(configured: usize) -> usize {
    if configured == 0 {
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    } else {
        configured
    }
}

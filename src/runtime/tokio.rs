//! tokio-based runtime.
//!
//! Each worker thread runs its own current-thread runtime with a
//! `SO_REUSEPORT` listener, so connections, exchanges and buffers stay on
//! the worker that accepted them, the same affinity the mio backend has.
//! Connection tasks are spawned on a `LocalSet` and share the worker's
//! pools through an `Rc<RefCell<_>>`; the borrow is never held across an
//! await point.

use crate::buffer::Allocator;
use crate::codec::{Codec, DecodeState};
use crate::config::Config;
use crate::connection::ConnectionInfo;
use crate::correlator::mark_io_worker;
use crate::runtime::dispatch::{self, ProcessResult};
use crate::runtime::{bind_listeners, Handler, WorkerContext};
use bytes::BytesMut;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::rc::Rc;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::{watch, Semaphore};
use tokio::task::LocalSet;
use tracing::{debug, error, info, trace};

/// Read buffer size
const BUFFER_SIZE: usize = 16 * 1024;

/// A running multi-worker tokio server.
pub struct Server {
    local_addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl Server {
    /// Bind the listeners and start one runtime thread per worker.
    pub fn start(
        config: &Config,
        codec: Arc<dyn Codec>,
        handler: Arc<dyn Handler>,
    ) -> io::Result<Self> {
        let (local_addr, listeners) = bind_listeners(config)?;

        info!(
            workers = listeners.len(),
            addr = %local_addr,
            protocol = codec.protocol_id(),
            "Starting tokio runtime"
        );

        let (shutdown, _) = watch::channel(false);
        let mut handles = Vec::with_capacity(listeners.len());

        for (worker_id, listener) in listeners.into_iter().enumerate() {
            let config = config.clone();
            let codec = Arc::clone(&codec);
            let handler = Arc::clone(&handler);
            let stop = shutdown.subscribe();

            let handle = thread::Builder::new()
                .name(format!("baseio-worker-{worker_id}"))
                .spawn(move || {
                    let result = run_worker(worker_id, listener, config, codec, handler, stop);
                    if let Err(e) = result {
                        error!(worker = worker_id, error = %e, "Worker failed");
                    }
                })?;
            handles.push(handle);
        }

        Ok(Self {
            local_addr,
            shutdown,
            handles,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting and drop every open connection.
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    /// Wait for every worker to exit.
    pub fn join(self) {
        for handle in self.handles {
            let _ = handle.join();
        }
    }
}

fn run_worker(
    id: usize,
    listener: std::net::TcpListener,
    config: Config,
    codec: Arc<dyn Codec>,
    handler: Arc<dyn Handler>,
    shutdown: watch::Receiver<bool>,
) -> io::Result<()> {
    mark_io_worker();

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    let local = LocalSet::new();
    local.block_on(&rt, accept_loop(id, listener, config, codec, handler, shutdown))
}

async fn accept_loop(
    id: usize,
    listener: std::net::TcpListener,
    config: Config,
    codec: Arc<dyn Codec>,
    handler: Arc<dyn Handler>,
    mut shutdown: watch::Receiver<bool>,
) -> io::Result<()> {
    let listener = TcpListener::from_std(listener)?;
    let ctx = Rc::new(RefCell::new(WorkerContext::new(id, &config)));
    let connection_limit = Arc::new(Semaphore::new(config.max_connections));
    let mut next_id = 0usize;

    info!(
        worker = id,
        max_connections = config.max_connections,
        "Worker started"
    );

    loop {
        // Wait for a connection slot
        let permit = tokio::select! {
            _ = shutdown.changed() => break,
            permit = Arc::clone(&connection_limit).acquire_owned() => {
                permit.map_err(io::Error::other)?
            }
        };

        let accepted = tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, peer)) => {
                if let Err(e) = stream.set_nodelay(true) {
                    debug!(error = %e, "Failed to set TCP_NODELAY");
                }
                let info = ConnectionInfo::new(next_id, id, codec.protocol_id()).with_peer(peer);
                next_id = next_id.wrapping_add(1);
                debug!(worker = id, conn_id = info.id(), peer = %peer, "Accepted connection");

                let codec = Arc::clone(&codec);
                let handler = Arc::clone(&handler);
                let ctx = Rc::clone(&ctx);
                tokio::task::spawn_local(async move {
                    let closed = info.clone();
                    let result =
                        serve_connection(stream, info, codec, Arc::clone(&handler), ctx).await;
                    if let Err(e) = result {
                        debug!(conn_id = closed.id(), error = %e, "Connection error");
                    }
                    handler.closed(&closed);
                    drop(permit);
                });
            }
            Err(e) => {
                error!(error = %e, "Failed to accept connection");
            }
        }
    }

    info!(worker = id, "Worker stopped");
    Ok(())
}

/// Drive one connection until EOF, a close exchange or a codec failure.
pub async fn serve_connection<S>(
    mut stream: S,
    info: ConnectionInfo,
    codec: Arc<dyn Codec>,
    handler: Arc<dyn Handler>,
    ctx: Rc<RefCell<WorkerContext>>,
) -> io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut decode = DecodeState::new();
    let mut inbound = BytesMut::with_capacity(BUFFER_SIZE);
    let mut outbound = VecDeque::new();

    loop {
        let n = stream.read_buf(&mut inbound).await?;
        if n == 0 {
            trace!(conn_id = info.id(), "Connection closed by peer");
            return Ok(());
        }

        let result = {
            let mut ctx = ctx.borrow_mut();
            dispatch::process(
                codec.as_ref(),
                handler.as_ref(),
                &info,
                &mut decode,
                &mut ctx,
                &mut inbound,
                &mut outbound,
            )
        };

        let close = match result {
            Ok(ProcessResult::Continue) => false,
            Ok(ProcessResult::Close) => true,
            Err(e) => {
                dispatch::recycle(&mut ctx.borrow_mut().buffers, &mut outbound);
                return Err(dispatch::violation(info.id(), e));
            }
        };

        write_queue(&mut stream, &mut outbound, &ctx).await?;
        if close {
            stream.shutdown().await?;
            return Ok(());
        }
    }
}

/// Write every queued buffer in order, returning each to the worker's pool.
async fn write_queue<S>(
    stream: &mut S,
    outbound: &mut VecDeque<BytesMut>,
    ctx: &RefCell<WorkerContext>,
) -> io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    while let Some(buf) = outbound.pop_front() {
        let result = stream.write_all(&buf).await;
        ctx.borrow_mut().buffers.release(buf);
        if let Err(e) = result {
            dispatch::recycle(&mut ctx.borrow_mut().buffers, outbound);
            return Err(e);
        }
    }
    stream.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::Exchange;
    use crate::protocols::{build_codec, websocket, ProtocolType};
    use crate::runtime::EchoHandler;
    use tokio_test::io::Builder;

    type Setup = (Arc<dyn Codec>, ConnectionInfo, Rc<RefCell<WorkerContext>>);

    fn setup(protocol: ProtocolType) -> Setup {
        let config = Config::default();
        let codec = build_codec(protocol, config.limits());
        let info = ConnectionInfo::new(0, 0, codec.protocol_id());
        let ctx = Rc::new(RefCell::new(WorkerContext::new(0, &config)));
        (codec, info, ctx)
    }

    #[tokio::test]
    async fn test_line_echo() {
        let (codec, info, ctx) = setup(ProtocolType::Line);
        let stream = Builder::new()
            .read(b"hello\nwor")
            .write(b"hello\n")
            .read(b"ld\n")
            .write(b"world\n")
            .build();

        serve_connection(stream, info, codec, Arc::new(EchoHandler), Rc::clone(&ctx))
            .await
            .unwrap();

        let ctx = ctx.borrow();
        assert_eq!(ctx.buffers.available(), ctx.buffers.capacity());
    }

    #[tokio::test]
    async fn test_ping_answered_without_handler() {
        let (codec, info, ctx) = setup(ProtocolType::WebSocket);
        let refuse = |_: &ConnectionInfo, _: Exchange| -> Option<Exchange> {
            panic!("heartbeat reached the handler")
        };
        let stream = Builder::new()
            .read(&[0x89, 0x02, b'h', b'b'])
            .write(&[0x8A, 0x02, b'h', b'b'])
            .build();

        serve_connection(stream, info, codec, Arc::new(refuse), ctx)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_close_is_echoed_then_shutdown() {
        let (codec, info, ctx) = setup(ProtocolType::WebSocket);
        assert_eq!(info.protocol_id(), websocket::PROTOCOL_ID);
        let stream = Builder::new()
            .read(&[0x88, 0x00])
            .write(&[0x88, 0x00])
            .build();

        serve_connection(stream, info, codec, Arc::new(EchoHandler), ctx)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_violation_fails_connection() {
        let (codec, info, ctx) = setup(ProtocolType::WebSocket);
        // unknown opcode 3
        let stream = Builder::new().read(&[0x83, 0x00]).build();

        let err = serve_connection(stream, info, codec, Arc::new(EchoHandler), Rc::clone(&ctx))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn test_server_echo_and_shutdown() {
        use std::io::{Read, Write};
        use std::time::Duration;

        let config = Config {
            listen: "127.0.0.1:0".to_string(),
            workers: 2,
            ..Config::default()
        };
        let codec = build_codec(ProtocolType::FixedLength, config.limits());
        let server = Server::start(&config, codec, Arc::new(EchoHandler)).unwrap();

        let mut stream = std::net::TcpStream::connect(server.local_addr()).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        stream.write_all(&[0, 0, 0, 3, b'a', b'b', b'c']).unwrap();

        let mut buf = [0u8; 7];
        stream.read_exact(&mut buf).unwrap();
        assert_eq!(buf, [0, 0, 0, 3, b'a', b'b', b'c']);

        server.shutdown();
        server.join();
    }
}

//! mio server event loop.
//!
//! Readiness-based model: poll tells us when sockets are ready,
//! then we perform non-blocking read/write syscalls.
//! Each worker owns a `SO_REUSEPORT` listener on the same port, so the
//! kernel spreads accepted connections across workers. A connection never
//! leaves the worker that accepted it, and neither do the exchanges and
//! buffers it uses.

use super::Link;
use crate::codec::Codec;
use crate::config::Config;
use crate::connection::{ConnectionInfo, ConnectionRegistry};
use crate::correlator::mark_io_worker;
use crate::runtime::dispatch::{self, ProcessResult};
use crate::runtime::{bind_listeners, Handler, WorkerContext};
use mio::net::TcpListener;
use mio::{Events, Interest, Poll, Token, Waker};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info, warn};

const LISTENER_TOKEN: Token = Token(usize::MAX);
const WAKER_TOKEN: Token = Token(usize::MAX - 1);

/// A running multi-worker mio server.
pub struct Server {
    local_addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    wakers: Vec<Arc<Waker>>,
    handles: Vec<JoinHandle<()>>,
}

impl Server {
    /// Bind the listeners and start the workers.
    pub fn start(
        config: &Config,
        codec: Arc<dyn Codec>,
        handler: Arc<dyn Handler>,
    ) -> io::Result<Self> {
        let (local_addr, listeners) = bind_listeners(config)?;
        let num_workers = listeners.len();

        info!(
            workers = num_workers,
            addr = %local_addr,
            protocol = codec.protocol_id(),
            "Starting mio runtime"
        );

        let shutdown = Arc::new(AtomicBool::new(false));
        let mut wakers = Vec::with_capacity(num_workers);
        let mut handles = Vec::with_capacity(num_workers);

        for (worker_id, listener) in listeners.into_iter().enumerate() {
            let poll = Poll::new()?;
            let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);
            wakers.push(Arc::clone(&waker));

            let worker = Worker {
                id: worker_id,
                poll,
                listener: TcpListener::from_std(listener),
                config: config.clone(),
                codec: Arc::clone(&codec),
                handler: Arc::clone(&handler),
                shutdown: Arc::clone(&shutdown),
            };

            let handle = thread::Builder::new()
                .name(format!("baseio-worker-{worker_id}"))
                .spawn(move || {
                    if let Err(e) = worker.run() {
                        error!(worker = worker_id, error = %e, "Worker failed");
                    }
                })?;
            handles.push(handle);
        }

        Ok(Self {
            local_addr,
            shutdown,
            wakers,
            handles,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Ask every worker to stop after its current poll iteration.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        for waker in &self.wakers {
            if let Err(e) = waker.wake() {
                warn!(error = %e, "Failed to wake worker");
            }
        }
    }

    /// Wait for every worker to exit.
    pub fn join(self) {
        for handle in self.handles {
            let _ = handle.join();
        }
    }
}

struct Worker {
    id: usize,
    poll: Poll,
    listener: TcpListener,
    config: Config,
    codec: Arc<dyn Codec>,
    handler: Arc<dyn Handler>,
    shutdown: Arc<AtomicBool>,
}

impl Worker {
    fn run(mut self) -> io::Result<()> {
        mark_io_worker();

        self.poll
            .registry()
            .register(&mut self.listener, LISTENER_TOKEN, Interest::READABLE)?;

        let mut events = Events::with_capacity(self.config.batch_size);
        let mut ctx = WorkerContext::new(self.id, &self.config);
        let mut connections: ConnectionRegistry<Link> =
            ConnectionRegistry::new(self.config.max_connections);

        info!(
            worker = self.id,
            max_connections = self.config.max_connections,
            buffer_count = self.config.buffer_count,
            buffer_size = self.config.buffer_size,
            "Worker started"
        );

        while !self.shutdown.load(Ordering::Acquire) {
            match self.poll.poll(&mut events, None) {
                Ok(()) => {}
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }

            for event in events.iter() {
                match event.token() {
                    LISTENER_TOKEN => self.accept(&mut connections)?,
                    WAKER_TOKEN => {}
                    Token(conn_id) => {
                        let keep = self.handle_event(
                            conn_id,
                            event.is_readable(),
                            event.is_writable(),
                            &mut connections,
                            &mut ctx,
                        );
                        match keep {
                            Ok(true) => {}
                            Ok(false) => self.close(conn_id, &mut connections, &mut ctx),
                            Err(e) => {
                                debug!(conn_id, error = %e, "Connection error");
                                self.close(conn_id, &mut connections, &mut ctx);
                            }
                        }
                    }
                }
            }
        }

        for conn_id in connections.ids() {
            self.close(conn_id, &mut connections, &mut ctx);
        }
        info!(worker = self.id, "Worker stopped");
        Ok(())
    }

    fn accept(&mut self, connections: &mut ConnectionRegistry<Link>) -> io::Result<()> {
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    let Some(conn_id) = connections.next_id() else {
                        warn!(worker = self.id, peer = %peer, "Connection limit reached");
                        continue;
                    };
                    if let Err(e) = stream.set_nodelay(true) {
                        debug!(error = %e, "Failed to set TCP_NODELAY");
                    }
                    let info = ConnectionInfo::new(conn_id, self.id, self.codec.protocol_id())
                        .with_peer(peer);
                    let mut link = Link::new(stream, info);
                    self.poll
                        .registry()
                        .register(&mut link.stream, Token(conn_id), Interest::READABLE)?;
                    connections.insert(link);

                    debug!(worker = self.id, conn_id, peer = %peer, "Accepted connection");
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    error!("Accept error: {}", e);
                    break;
                }
            }
        }
        Ok(())
    }

    /// Returns `false` when the connection should be closed.
    fn handle_event(
        &mut self,
        conn_id: usize,
        readable: bool,
        writable: bool,
        connections: &mut ConnectionRegistry<Link>,
        ctx: &mut WorkerContext,
    ) -> io::Result<bool> {
        let Some(link) = connections.get_mut(conn_id) else {
            return Ok(true);
        };

        let mut eof = false;
        if readable && !link.state.is_closing() {
            eof = link.read()?;
            let result = dispatch::process(
                self.codec.as_ref(),
                self.handler.as_ref(),
                &link.info,
                &mut link.decode,
                ctx,
                &mut link.inbound,
                &mut link.outbound,
            );
            match result {
                Ok(ProcessResult::Continue) => {}
                Ok(ProcessResult::Close) => link.close_after_flush(),
                Err(e) => return Err(dispatch::violation(conn_id, e)),
            }
        }

        if readable || writable || !link.outbound.is_empty() {
            link.flush(&mut ctx.buffers)?;
        }
        if eof || link.ready_to_close() {
            return Ok(false);
        }
        link.update_interest(self.poll.registry(), Token(conn_id))?;
        Ok(true)
    }

    fn close(
        &mut self,
        conn_id: usize,
        connections: &mut ConnectionRegistry<Link>,
        ctx: &mut WorkerContext,
    ) {
        if let Some(mut link) = connections.remove(conn_id) {
            let _ = self.poll.registry().deregister(&mut link.stream);
            link.release(&mut ctx.buffers);
            self.handler.closed(&link.info);
            debug!(worker = self.id, conn_id, "Connection closed");
        }
    }
}

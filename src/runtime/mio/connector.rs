//! Client connection driven by a dedicated mio I/O thread.
//!
//! Callers submit exchanges from any thread; the exchange crosses to the
//! I/O thread over a channel and a `Waker`, where it is encoded and written
//! in submit order. Decoded responses go to the connection's `Handler`,
//! typically a `CorrelationTable` shared with a `BlockingClient`.
//!
//! With a heartbeat interval configured, the I/O thread sends the codec's
//! ping whenever the connection has been idle that long.

use super::Link;
use crate::codec::Codec;
use crate::config::Config;
use crate::connection::ConnectionInfo;
use crate::correlator::mark_io_worker;
use crate::exchange::Exchange;
use crate::runtime::dispatch::{self, ProcessResult};
use crate::runtime::{Handler, Submit, WorkerContext};
use crossbeam::channel::{self, Receiver, Sender, TryRecvError};
use mio::{Events, Interest, Poll, Token, Waker};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

const STREAM_TOKEN: Token = Token(0);
const WAKER_TOKEN: Token = Token(1);

enum Command {
    Write(Exchange),
    Close,
}

/// Handle to a connected client socket.
pub struct ClientConnection {
    info: ConnectionInfo,
    tx: Sender<Command>,
    waker: Arc<Waker>,
    closed: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

/// Connect to `addr` and start the connection's I/O thread.
pub fn connect(
    addr: SocketAddr,
    config: &Config,
    codec: Arc<dyn Codec>,
    handler: Arc<dyn Handler>,
) -> io::Result<ClientConnection> {
    let std_stream = std::net::TcpStream::connect_timeout(&addr, config.request_timeout())?;
    std_stream.set_nodelay(true)?;
    std_stream.set_nonblocking(true)?;
    let stream = mio::net::TcpStream::from_std(std_stream);

    let poll = Poll::new()?;
    let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);
    let (tx, rx) = channel::unbounded();
    let closed = Arc::new(AtomicBool::new(false));
    let info = ConnectionInfo::new(0, 0, codec.protocol_id()).with_peer(addr);

    let driver = Driver {
        poll,
        link: Link::new(stream, info.clone()),
        rx,
        config: config.clone(),
        codec,
        handler,
        heartbeat: config.heartbeat(),
        closed: Arc::clone(&closed),
    };

    let handle = thread::Builder::new()
        .name("baseio-connector".to_string())
        .spawn(move || driver.run())?;

    info!(peer = %addr, protocol = info.protocol_id(), "Connected");

    Ok(ClientConnection {
        info,
        tx,
        waker,
        closed,
        handle: Some(handle),
    })
}

impl ClientConnection {
    pub fn info(&self) -> &ConnectionInfo {
        &self.info
    }

    /// Whether the I/O thread has stopped.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn send(&self, command: Command) -> io::Result<()> {
        if self.is_closed() {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "connection closed"));
        }
        self.tx
            .send(command)
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "I/O thread gone"))?;
        self.waker.wake()
    }

    /// Flush queued writes, close the socket and wait for the I/O thread.
    pub fn close(mut self) {
        let _ = self.send(Command::Close);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Submit for ClientConnection {
    fn submit(&self, exchange: Exchange) -> io::Result<()> {
        self.send(Command::Write(exchange))
    }
}

impl Drop for ClientConnection {
    fn drop(&mut self) {
        if self.handle.is_some() {
            let _ = self.send(Command::Close);
        }
    }
}

struct Driver {
    poll: Poll,
    link: Link,
    rx: Receiver<Command>,
    config: Config,
    codec: Arc<dyn Codec>,
    handler: Arc<dyn Handler>,
    heartbeat: Option<Duration>,
    closed: Arc<AtomicBool>,
}

impl Driver {
    fn run(mut self) {
        mark_io_worker();
        // pools are bound to the thread that creates them
        let mut ctx = WorkerContext::new(0, &self.config);
        if let Err(e) = self.event_loop(&mut ctx) {
            debug!(error = %e, "Client connection error");
        }
        self.link.release(&mut ctx.buffers);
        // set before notifying so late submits see the closed flag
        self.closed.store(true, Ordering::Release);
        self.handler.closed(&self.link.info);
        debug!("Client connection closed");
    }

    fn event_loop(&mut self, ctx: &mut WorkerContext) -> io::Result<()> {
        self.poll
            .registry()
            .register(&mut self.link.stream, STREAM_TOKEN, Interest::READABLE)?;
        let mut events = Events::with_capacity(16);

        loop {
            let timeout = self.heartbeat.map(|interval| {
                interval.saturating_sub(self.link.last_active.elapsed())
            });
            match self.poll.poll(&mut events, timeout) {
                Ok(()) => {}
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }

            let mut readable = false;
            for event in events.iter() {
                if event.token() == STREAM_TOKEN && event.is_readable() {
                    readable = true;
                }
            }

            self.drain_commands(ctx)?;

            if readable && !self.link.state.is_closing() {
                let eof = self.link.read()?;
                let result = dispatch::process(
                    self.codec.as_ref(),
                    self.handler.as_ref(),
                    &self.link.info,
                    &mut self.link.decode,
                    ctx,
                    &mut self.link.inbound,
                    &mut self.link.outbound,
                );
                match result {
                    Ok(ProcessResult::Continue) => {}
                    Ok(ProcessResult::Close) => self.link.close_after_flush(),
                    Err(e) => return Err(dispatch::violation(self.link.info.id(), e)),
                }
                if eof {
                    return Ok(());
                }
            }

            self.heartbeat_if_idle(ctx)?;
            self.link.flush(&mut ctx.buffers)?;
            if self.link.ready_to_close() {
                return Ok(());
            }
            self.link
                .update_interest(self.poll.registry(), STREAM_TOKEN)?;
        }
    }

    /// Encode every submitted exchange in submit order.
    fn drain_commands(&mut self, ctx: &mut WorkerContext) -> io::Result<()> {
        loop {
            match self.rx.try_recv() {
                Ok(Command::Write(exchange)) => {
                    if self.link.state.is_closing() {
                        warn!("write submitted after close, dropping");
                        let e = io::Error::new(io::ErrorKind::NotConnected, "connection closing");
                        self.handler.rejected(&self.link.info, &exchange, &e);
                        continue;
                    }
                    trace!(kind = ?exchange.kind(), "encoding submitted exchange");
                    self.encode(ctx, exchange);
                }
                Ok(Command::Close) => self.link.close_after_flush(),
                Err(TryRecvError::Empty) => return Ok(()),
                Err(TryRecvError::Disconnected) => {
                    self.link.close_after_flush();
                    return Ok(());
                }
            }
        }
    }

    /// Queue one submitted exchange. A failed encode is reported to the
    /// handler and affects only that exchange.
    fn encode(&mut self, ctx: &mut WorkerContext, exchange: Exchange) {
        let encoded = self
            .codec
            .encode(&self.link.info, &exchange, &mut ctx.buffers);
        match encoded {
            Ok(buf) => self.link.outbound.push_back(buf),
            Err(e) => {
                let e = io::Error::from(e);
                warn!(
                    kind = ?exchange.kind(),
                    error = %e,
                    "failed to encode submitted exchange"
                );
                self.handler.rejected(&self.link.info, &exchange, &e);
            }
        }
        ctx.pools.release(exchange);
    }

    fn heartbeat_if_idle(&mut self, ctx: &mut WorkerContext) -> io::Result<()> {
        let Some(interval) = self.heartbeat else {
            return Ok(());
        };
        if self.link.last_active.elapsed() < interval
            || !self.link.outbound.is_empty()
            || self.link.state.is_closing()
        {
            return Ok(());
        }
        let ping = dispatch::ping(self.codec.as_ref(), &self.link.info, &mut ctx.buffers)?;
        if let Some(ping) = ping {
            trace!("sending heartbeat");
            self.link.outbound.push_back(ping);
        }
        // restart the idle clock even when the protocol has no heartbeat
        self.link.last_active = Instant::now();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::{FrameKind, Message};
    use crate::protocols::{build_codec, ProtocolType};
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::sync::Mutex;

    fn config(heartbeat_ms: u64) -> Config {
        Config {
            heartbeat_ms,
            ..Config::default()
        }
    }

    #[test]
    fn test_submit_writes_in_order() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let config = config(0);
        let codec = build_codec(ProtocolType::Line, config.limits());
        let ignore = |_: &ConnectionInfo, _: Exchange| -> Option<Exchange> { None };

        let conn = connect(addr, &config, codec, Arc::new(ignore)).unwrap();
        let (mut peer, _) = listener.accept().unwrap();
        peer.set_read_timeout(Some(Duration::from_secs(5))).unwrap();

        for text in ["a", "b", "c"] {
            conn.submit(Exchange::Text(Message::text(text))).unwrap();
        }

        let mut received = Vec::new();
        let mut buf = [0u8; 16];
        while received.len() < 6 {
            let n = peer.read(&mut buf).unwrap();
            assert!(n > 0);
            received.extend_from_slice(&buf[..n]);
        }
        assert_eq!(received, b"a\nb\nc\n");

        conn.close();
        assert_eq!(peer.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn test_responses_reach_handler() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let config = config(0);
        let codec = build_codec(ProtocolType::Line, config.limits());

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let handler = move |_: &ConnectionInfo, ex: Exchange| -> Option<Exchange> {
            let text = ex.as_message().and_then(|m| m.payload().read_text().map(String::from));
            sink.lock().unwrap().extend(text);
            None
        };

        let conn = connect(addr, &config, codec, Arc::new(handler)).unwrap();
        let (mut peer, _) = listener.accept().unwrap();
        peer.write_all(b"one\ntwo\n").unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while seen.lock().unwrap().len() < 2 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(*seen.lock().unwrap(), vec!["one", "two"]);
        conn.close();
    }

    #[test]
    fn test_idle_heartbeat() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let config = config(20);
        let codec = build_codec(ProtocolType::WebSocket, config.limits());
        let ignore = |_: &ConnectionInfo, _: Exchange| -> Option<Exchange> { None };

        let conn = connect(addr, &config, codec, Arc::new(ignore)).unwrap();
        let (mut peer, _) = listener.accept().unwrap();
        peer.set_read_timeout(Some(Duration::from_secs(5))).unwrap();

        let mut buf = [0u8; 2];
        peer.read_exact(&mut buf).unwrap();
        assert_eq!(buf, [0x80 | FrameKind::Ping.tag(), 0]);
        conn.close();
    }

    #[test]
    fn test_submit_after_peer_close_fails() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let config = config(0);
        let codec = build_codec(ProtocolType::Line, config.limits());
        let ignore = |_: &ConnectionInfo, _: Exchange| -> Option<Exchange> { None };

        let conn = connect(addr, &config, codec, Arc::new(ignore)).unwrap();
        let (peer, _) = listener.accept().unwrap();
        drop(peer);

        let deadline = Instant::now() + Duration::from_secs(5);
        while !conn.is_closed() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(conn.is_closed());
        let err = conn
            .submit(Exchange::Text(Message::text("x")))
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotConnected);
    }
}

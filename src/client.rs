//! Synchronous request/response over an asynchronous connection.
//!
//! `BlockingClient` writes through any `Submit` implementation and waits on
//! a correlator registered in a shared `CorrelationTable`. The same table is
//! installed as the connection's handler, so responses decoded by the I/O
//! worker wake the blocked caller.

use crate::correlator::{CorrelationKey, CorrelationTable, WaitError};
use crate::exchange::Exchange;
use crate::runtime::Submit;
use std::io;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, trace};

/// Default request timeout.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_millis(3000);

/// Client-side request failures.
#[derive(Debug, Error)]
pub enum ClientError {
    /// A request with the same correlation key is still outstanding.
    #[error("request {0:?} already in flight")]
    InFlight(CorrelationKey),
    /// No response before the deadline.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    /// The request could not be written, or its connection closed.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error(transparent)]
    Wait(WaitError),
}

impl From<WaitError> for ClientError {
    fn from(e: WaitError) -> Self {
        match e {
            WaitError::Timeout { waited } => ClientError::Timeout(waited),
            WaitError::Failed { kind, reason } => ClientError::Io(io::Error::new(kind, reason)),
            other => ClientError::Wait(other),
        }
    }
}

/// Blocking request/response client over one connection.
pub struct BlockingClient<S> {
    session: S,
    table: Arc<CorrelationTable>,
    next_id: AtomicU32,
    default_timeout: Duration,
}

impl<S: Submit> BlockingClient<S> {
    /// Client writing through `session`. `table` must be the handler of the
    /// connection behind `session`.
    pub fn new(session: S, table: Arc<CorrelationTable>) -> Self {
        Self {
            session,
            table,
            next_id: AtomicU32::new(1),
            default_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn session(&self) -> &S {
        &self.session
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// Send `request` and block until its response or `timeout`.
    ///
    /// Protobase requests without an id are given one so several callers
    /// can pipeline on one connection. Other protocols allow one request in
    /// flight; a concurrent call fails with `InFlight`.
    pub fn request(
        &self,
        mut request: Exchange,
        timeout: Duration,
    ) -> Result<Exchange, ClientError> {
        if let Some(p) = request.as_protobase_mut() {
            if p.id().is_none() {
                // skip 0, which means "no id" on the wire
                let id = loop {
                    let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                    if id != 0 {
                        break id;
                    }
                };
                // just checked that no id is set
                let _ = p.set_id(id);
            }
        }

        let key = CorrelationTable::key_of(&request);
        let mut correlator = self.table.register(key)?;
        trace!(?key, "submitting request");

        if let Err(e) = self.session.submit(request) {
            self.table.abandon(key);
            return Err(e.into());
        }

        match correlator.wait(timeout) {
            Ok(response) => Ok(response),
            Err(e) => {
                self.table.abandon(key);
                debug!(?key, error = %e, "request abandoned");
                Err(e.into())
            }
        }
    }

    /// `request` with the client's default timeout.
    pub fn request_default(&self, request: Exchange) -> Result<Exchange, ClientError> {
        self.request(request, self.default_timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::{Message, ProtobaseExchange};
    use std::sync::Mutex;
    use std::thread;

    /// Answers every submitted exchange from a background thread.
    struct Loopback {
        table: Arc<CorrelationTable>,
        delay: Duration,
    }

    impl Submit for Loopback {
        fn submit(&self, exchange: Exchange) -> io::Result<()> {
            let table = Arc::clone(&self.table);
            let delay = self.delay;
            thread::spawn(move || {
                thread::sleep(delay);
                table.complete(exchange);
            });
            Ok(())
        }
    }

    /// Records submissions and never answers.
    #[derive(Default)]
    struct BlackHole {
        sent: Mutex<Vec<Exchange>>,
    }

    impl Submit for BlackHole {
        fn submit(&self, exchange: Exchange) -> io::Result<()> {
            self.sent.lock().unwrap().push(exchange);
            Ok(())
        }
    }

    /// Accepts the write, then fails it the way an I/O thread reports an
    /// encode failure.
    struct Exhausted {
        table: Arc<CorrelationTable>,
    }

    impl Submit for Exhausted {
        fn submit(&self, exchange: Exchange) -> io::Result<()> {
            let table = Arc::clone(&self.table);
            thread::spawn(move || {
                let error = io::Error::new(io::ErrorKind::OutOfMemory, "buffer pool exhausted");
                table.fail(CorrelationTable::key_of(&exchange), &error);
            });
            Ok(())
        }
    }

    struct Broken;

    impl Submit for Broken {
        fn submit(&self, _exchange: Exchange) -> io::Result<()> {
            Err(io::Error::new(io::ErrorKind::BrokenPipe, "closed"))
        }
    }

    #[test]
    fn test_request_response() {
        let table = Arc::new(CorrelationTable::new());
        let session = Loopback {
            table: Arc::clone(&table),
            delay: Duration::from_millis(10),
        };
        let client = BlockingClient::new(session, table);

        let response = client
            .request_default(Exchange::Frame(Message::text("hello")))
            .unwrap();
        assert_eq!(response.as_message().unwrap().payload().write(), b"hello");
    }

    #[test]
    fn test_protobase_requests_get_ids() {
        let table = Arc::new(CorrelationTable::new());
        let session = Loopback {
            table: Arc::clone(&table),
            delay: Duration::ZERO,
        };
        let client = BlockingClient::new(session, table);

        let a = client
            .request_default(Exchange::Protobase(ProtobaseExchange::request("svc", "a")))
            .unwrap();
        let b = client
            .request_default(Exchange::Protobase(ProtobaseExchange::request("svc", "b")))
            .unwrap();
        assert_eq!(a.exchange_id(), Some(1));
        assert_eq!(b.exchange_id(), Some(2));
    }

    #[test]
    fn test_timeout_abandons_key() {
        let table = Arc::new(CorrelationTable::new());
        let client = BlockingClient::new(BlackHole::default(), Arc::clone(&table))
            .with_timeout(Duration::from_millis(30));

        match client.request_default(Exchange::Frame(Message::text("?"))) {
            Err(ClientError::Timeout(waited)) => assert!(waited >= Duration::from_millis(30)),
            other => panic!("unexpected: {:?}", other),
        }
        assert!(table.is_empty());
        assert_eq!(client.session().sent.lock().unwrap().len(), 1);

        // the late response is dropped quietly
        assert!(!table.complete(Exchange::Frame(Message::text("late"))));
    }

    #[test]
    fn test_concurrent_sole_request_is_rejected() {
        let table = Arc::new(CorrelationTable::new());
        let _held = table.register(CorrelationKey::Sole).unwrap();
        let client = BlockingClient::new(BlackHole::default(), Arc::clone(&table));

        match client.request(Exchange::Frame(Message::text("x")), Duration::from_millis(5)) {
            Err(ClientError::InFlight(CorrelationKey::Sole)) => {}
            other => panic!("unexpected: {:?}", other),
        }
        assert!(client.session().sent.lock().unwrap().is_empty());
    }

    #[test]
    fn test_encode_failure_is_io_error_not_timeout() {
        let table = Arc::new(CorrelationTable::new());
        let session = Exhausted {
            table: Arc::clone(&table),
        };
        let client = BlockingClient::new(session, Arc::clone(&table));

        let start = std::time::Instant::now();
        match client.request(Exchange::Frame(Message::text("x")), Duration::from_secs(10)) {
            Err(ClientError::Io(e)) => assert_eq!(e.kind(), io::ErrorKind::OutOfMemory),
            other => panic!("unexpected: {:?}", other),
        }
        assert!(start.elapsed() < Duration::from_secs(5));
        assert!(table.is_empty());
    }

    #[test]
    fn test_submit_failure_is_io_error() {
        let table = Arc::new(CorrelationTable::new());
        let client = BlockingClient::new(Broken, Arc::clone(&table));
        match client.request_default(Exchange::Frame(Message::text("x"))) {
            Err(ClientError::Io(e)) => assert_eq!(e.kind(), io::ErrorKind::BrokenPipe),
            other => panic!("unexpected: {:?}", other),
        }
        assert!(table.is_empty());
    }
}

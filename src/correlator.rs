//! Blocking request/response correlation.
//!
//! A caller obtains a `Correlator` before writing a request, hands a
//! `Signaller` to whatever completes the exchange, and blocks in `wait`
//! until the response arrives or the deadline passes. The I/O worker that
//! decodes the response calls `Signaller::signal`; it never blocks.
//!
//! State lives in one atomic word, `(generation << 2) | state`. A signal
//! only lands if the word still reads `pending` for the signaller's own
//! generation, so at most one signal is honoured per generation and signals
//! that arrive after a timeout, or after `rearm`, are dropped. A failure
//! (`Signaller::fail`) completes a generation the same way a response does.

use crate::client::ClientError;
use crate::connection::ConnectionInfo;
use crate::exchange::Exchange;
use crate::runtime::Handler;
use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use std::cell::Cell;
use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, trace};

const PENDING: u64 = 0;
const SATISFIED: u64 = 1;
const TIMED_OUT: u64 = 2;
const CONSUMED: u64 = 3;
const STATE_MASK: u64 = 0b11;

thread_local! {
    static IO_WORKER: Cell<bool> = const { Cell::new(false) };
}

/// Mark the current thread as an I/O worker. `wait` is refused on it.
pub(crate) fn mark_io_worker() {
    IO_WORKER.with(|flag| flag.set(true));
}

fn on_io_worker() -> bool {
    IO_WORKER.with(Cell::get)
}

/// Failures of `Correlator::wait`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WaitError {
    /// No response before the deadline.
    #[error("no response after {waited:?}")]
    Timeout { waited: Duration },
    /// Blocking an I/O worker would stall every connection it serves.
    #[error("cannot block on an I/O worker thread")]
    IoWorkerThread,
    /// The current generation already completed or timed out.
    #[error("correlator is not armed")]
    NotArmed,
    /// The request could not be written or its connection closed.
    #[error("request failed: {reason}")]
    Failed { kind: io::ErrorKind, reason: String },
}

type Outcome = Result<Exchange, WaitError>;

/// Observable correlator state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CorrelatorState {
    Pending,
    Satisfied,
    TimedOut,
    /// The response was handed to the waiter.
    Consumed,
}

fn decode_state(word: u64) -> CorrelatorState {
    match word & STATE_MASK {
        PENDING => CorrelatorState::Pending,
        SATISFIED => CorrelatorState::Satisfied,
        TIMED_OUT => CorrelatorState::TimedOut,
        _ => CorrelatorState::Consumed,
    }
}

fn word(generation: u64, state: u64) -> u64 {
    (generation << 2) | state
}

struct Shared {
    state: AtomicU64,
    tx: Sender<(u64, Outcome)>,
}

/// Waiting side of a correlation. One outstanding exchange per generation.
pub struct Correlator {
    shared: Arc<Shared>,
    rx: Receiver<(u64, Outcome)>,
}

/// Completing side of a correlation. Cheap to clone and safe to move to the
/// I/O worker.
#[derive(Clone)]
pub struct Signaller {
    shared: Arc<Shared>,
    generation: u64,
}

impl Default for Correlator {
    fn default() -> Self {
        Self::new()
    }
}

impl Correlator {
    /// New correlator, armed at generation 0.
    pub fn new() -> Self {
        let (tx, rx) = channel::unbounded();
        Self {
            shared: Arc::new(Shared {
                state: AtomicU64::new(word(0, PENDING)),
                tx,
            }),
            rx,
        }
    }

    /// Current generation.
    pub fn generation(&self) -> u64 {
        self.shared.state.load(Ordering::Acquire) >> 2
    }

    pub fn state(&self) -> CorrelatorState {
        decode_state(self.shared.state.load(Ordering::Acquire))
    }

    /// Signaller bound to the current generation.
    pub fn signaller(&self) -> Signaller {
        Signaller {
            shared: Arc::clone(&self.shared),
            generation: self.generation(),
        }
    }

    /// Start a new generation for the next exchange.
    ///
    /// Signallers handed out before this call become no-ops.
    pub fn rearm(&mut self) {
        let next = self.generation().wrapping_add(1) & (u64::MAX >> 2);
        self.shared.state.store(word(next, PENDING), Ordering::Release);
        while self.rx.try_recv().is_ok() {}
    }

    /// Block until the response for the current generation arrives or
    /// `timeout` elapses.
    pub fn wait(&mut self, timeout: Duration) -> Result<Exchange, WaitError> {
        if on_io_worker() {
            return Err(WaitError::IoWorkerThread);
        }

        let current = self.shared.state.load(Ordering::Acquire);
        let generation = current >> 2;
        match current & STATE_MASK {
            PENDING | SATISFIED => {}
            _ => return Err(WaitError::NotArmed),
        }

        let start = Instant::now();
        let deadline = start + timeout;
        loop {
            match self.rx.recv_deadline(deadline) {
                Ok((gen, outcome)) if gen == generation => {
                    return self.consume(generation, outcome);
                }
                Ok((gen, _)) => {
                    trace!(stale = gen, generation, "discarding stale response");
                }
                Err(RecvTimeoutError::Timeout) => break,
                // the sender lives in `shared`, which we hold
                Err(RecvTimeoutError::Disconnected) => return Err(WaitError::NotArmed),
            }
        }

        let timed_out = self.shared.state.compare_exchange(
            word(generation, PENDING),
            word(generation, TIMED_OUT),
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        if timed_out.is_ok() {
            return Err(WaitError::Timeout {
                waited: start.elapsed(),
            });
        }

        // A signal won the race and its send is in flight.
        loop {
            match self.rx.recv() {
                Ok((gen, outcome)) if gen == generation => {
                    return self.consume(generation, outcome);
                }
                Ok(_) => continue,
                Err(_) => return Err(WaitError::NotArmed),
            }
        }
    }

    fn consume(&self, generation: u64, outcome: Outcome) -> Outcome {
        self.shared
            .state
            .store(word(generation, CONSUMED), Ordering::Release);
        outcome
    }
}

impl Signaller {
    /// Deliver `response`. Returns `false` without effect if this
    /// generation already completed, timed out or was re-armed.
    pub fn signal(&self, response: Exchange) -> bool {
        self.deliver(Ok(response))
    }

    /// Complete this generation with `error` instead of a response. Same
    /// once-only rule as `signal`.
    pub fn fail(&self, error: &io::Error) -> bool {
        self.deliver(Err(WaitError::Failed {
            kind: error.kind(),
            reason: error.to_string(),
        }))
    }

    fn deliver(&self, outcome: Outcome) -> bool {
        let landed = self
            .shared
            .state
            .compare_exchange(
                word(self.generation, PENDING),
                word(self.generation, SATISFIED),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok();
        if !landed {
            return false;
        }
        // A leftover from a re-armed generation is drained by `rearm` or
        // skipped by `wait`.
        let _ = self.shared.tx.send((self.generation, outcome));
        true
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }
}

/// Key a pending request is matched on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CorrelationKey {
    /// Pipelined protocols match responses by exchange id.
    Id(u32),
    /// Non-pipelined protocols have a single slot.
    Sole,
}

/// Pending correlations of one client connection.
///
/// Plugs into a connector as its `Handler`: every decoded response is
/// matched against the table and signalled to the waiting caller.
pub struct CorrelationTable {
    pending: Mutex<HashMap<CorrelationKey, Signaller>>,
}

impl Default for CorrelationTable {
    fn default() -> Self {
        Self::new()
    }
}

impl CorrelationTable {
    pub fn new() -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<CorrelationKey, Signaller>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Key `exchange` correlates on.
    pub fn key_of(exchange: &Exchange) -> CorrelationKey {
        match exchange.exchange_id() {
            Some(id) => CorrelationKey::Id(id),
            None => CorrelationKey::Sole,
        }
    }

    /// Register a pending request under `key`.
    ///
    /// Fails with `InFlight` if `key` is already pending.
    pub fn register(&self, key: CorrelationKey) -> Result<Correlator, ClientError> {
        let mut pending = self.lock();
        if pending.contains_key(&key) {
            return Err(ClientError::InFlight(key));
        }
        let correlator = Correlator::new();
        pending.insert(key, correlator.signaller());
        Ok(correlator)
    }

    /// Match `response` to its pending request and signal it.
    ///
    /// Responses nobody waits for are dropped and logged.
    pub fn complete(&self, response: Exchange) -> bool {
        let key = Self::key_of(&response);
        let signaller = self.lock().remove(&key);
        match signaller {
            Some(signaller) => {
                let delivered = signaller.signal(response);
                if !delivered {
                    debug!(?key, "late response after timeout");
                }
                delivered
            }
            None => {
                debug!(?key, "response for unknown or abandoned request");
                false
            }
        }
    }

    /// Fail the request pending under `key`.
    pub fn fail(&self, key: CorrelationKey, error: &io::Error) -> bool {
        let signaller = self.lock().remove(&key);
        match signaller {
            Some(signaller) => signaller.fail(error),
            None => false,
        }
    }

    /// Fail every pending request. Returns how many waiters were woken.
    pub fn fail_all(&self, error: &io::Error) -> usize {
        let drained: Vec<_> = self.lock().drain().collect();
        drained
            .into_iter()
            .filter(|(_, signaller)| signaller.fail(error))
            .count()
    }

    /// Forget `key`, typically after its waiter timed out.
    pub fn abandon(&self, key: CorrelationKey) {
        self.lock().remove(&key);
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

impl Handler for CorrelationTable {
    fn accept(&self, _conn: &ConnectionInfo, exchange: Exchange) -> Option<Exchange> {
        self.complete(exchange);
        None
    }

    fn rejected(&self, _conn: &ConnectionInfo, exchange: &Exchange, error: &io::Error) {
        self.fail(Self::key_of(exchange), error);
    }

    fn closed(&self, conn: &ConnectionInfo) {
        let error = io::Error::new(io::ErrorKind::NotConnected, "connection closed");
        let failed = self.fail_all(&error);
        if failed > 0 {
            debug!(conn_id = conn.id(), failed, "failed pending requests on close");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::{Message, ProtobaseExchange};
    use std::thread;

    // scheduling allowance for the wait upper bound
    const SLOP: Duration = Duration::from_secs(1);

    fn response(text: &str) -> Exchange {
        Exchange::Frame(Message::text(text))
    }

    #[test]
    fn test_signal_before_wait() {
        let mut correlator = Correlator::new();
        assert!(correlator.signaller().signal(response("early")));
        assert_eq!(correlator.state(), CorrelatorState::Satisfied);

        let got = correlator.wait(Duration::from_millis(10)).unwrap();
        assert_eq!(got.as_message().unwrap().payload().write(), b"early");
        assert_eq!(correlator.state(), CorrelatorState::Consumed);
        assert_eq!(
            correlator.wait(Duration::from_millis(10)).unwrap_err(),
            WaitError::NotArmed
        );
    }

    #[test]
    fn test_signal_from_another_thread() {
        let mut correlator = Correlator::new();
        let signaller = correlator.signaller();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            signaller.signal(response("pong"))
        });

        let got = correlator.wait(Duration::from_secs(5)).unwrap();
        assert_eq!(got.as_message().unwrap().payload().write(), b"pong");
        assert!(handle.join().unwrap());
    }

    #[test]
    fn test_timeout_then_late_signal() {
        let mut correlator = Correlator::new();
        let signaller = correlator.signaller();

        let start = Instant::now();
        match correlator.wait(Duration::from_millis(50)) {
            Err(WaitError::Timeout { waited }) => {
                assert!(waited >= Duration::from_millis(50));
                assert!(waited < Duration::from_millis(50) + SLOP);
            }
            other => panic!("unexpected: {:?}", other.map(|_| ())),
        }
        assert!(start.elapsed() >= Duration::from_millis(50));
        assert!(start.elapsed() < Duration::from_millis(50) + SLOP);
        assert_eq!(correlator.state(), CorrelatorState::TimedOut);

        assert!(!signaller.signal(response("late")));
        assert_eq!(correlator.state(), CorrelatorState::TimedOut);
        assert!(correlator.rx.is_empty());
    }

    #[test]
    fn test_late_signal_leaves_next_request_alone() {
        let table = CorrelationTable::new();
        let mut first = table.register(CorrelationKey::Sole).unwrap();
        let stale = first.signaller();
        assert!(matches!(
            first.wait(Duration::from_millis(10)),
            Err(WaitError::Timeout { .. })
        ));
        table.abandon(CorrelationKey::Sole);

        let mut second = table.register(CorrelationKey::Sole).unwrap();
        assert!(!stale.signal(response("late")));
        assert_eq!(second.state(), CorrelatorState::Pending);
        assert!(second.rx.is_empty());

        assert!(table.complete(response("fresh")));
        let got = second.wait(Duration::from_millis(10)).unwrap();
        assert_eq!(got.as_message().unwrap().payload().write(), b"fresh");
    }

    #[test]
    fn test_late_response_for_other_id_is_dropped() {
        let table = CorrelationTable::new();
        let mut one = table.register(CorrelationKey::Id(1)).unwrap();
        assert!(one.wait(Duration::from_millis(10)).is_err());
        let mut two = table.register(CorrelationKey::Id(2)).unwrap();

        let mut late = ProtobaseExchange::request("svc", "");
        late.set_id(1).unwrap();
        assert!(!table.complete(Exchange::Protobase(late)));
        assert_eq!(two.state(), CorrelatorState::Pending);

        let mut reply = ProtobaseExchange::request("svc", "");
        reply.set_id(2).unwrap();
        assert!(table.complete(Exchange::Protobase(reply)));
        assert_eq!(
            two.wait(Duration::from_millis(10)).unwrap().exchange_id(),
            Some(2)
        );
    }

    #[test]
    fn test_fail_completes_with_error() {
        let mut correlator = Correlator::new();
        let signaller = correlator.signaller();
        let exhausted = io::Error::new(io::ErrorKind::OutOfMemory, "buffer pool exhausted");
        assert!(signaller.fail(&exhausted));
        assert!(!signaller.signal(response("too late")));

        match correlator.wait(Duration::from_secs(5)) {
            Err(WaitError::Failed { kind, .. }) => assert_eq!(kind, io::ErrorKind::OutOfMemory),
            other => panic!("unexpected: {:?}", other.map(|_| ())),
        }
        assert_eq!(correlator.state(), CorrelatorState::Consumed);
    }

    #[test]
    fn test_close_fails_every_pending_request() {
        let table = Arc::new(CorrelationTable::new());
        let waiters: Vec<_> = (1..=3)
            .map(|id| {
                let mut correlator = table.register(CorrelationKey::Id(id)).unwrap();
                thread::spawn(move || {
                    let start = Instant::now();
                    let result = correlator.wait(Duration::from_secs(30));
                    (result, start.elapsed())
                })
            })
            .collect();

        thread::sleep(Duration::from_millis(20));
        let conn = ConnectionInfo::new(0, 0, "Protobase");
        table.closed(&conn);
        assert!(table.is_empty());

        for waiter in waiters {
            let (result, elapsed) = waiter.join().unwrap();
            assert!(matches!(
                result,
                Err(WaitError::Failed {
                    kind: io::ErrorKind::NotConnected,
                    ..
                })
            ));
            assert!(elapsed < SLOP);
        }
    }

    #[test]
    fn test_rejected_fails_only_its_key() {
        let table = CorrelationTable::new();
        let mut one = table.register(CorrelationKey::Id(1)).unwrap();
        let two = table.register(CorrelationKey::Id(2)).unwrap();

        let mut request = ProtobaseExchange::request("svc", "");
        request.set_id(1).unwrap();
        let conn = ConnectionInfo::new(0, 0, "Protobase");
        let error = io::Error::new(io::ErrorKind::InvalidData, "wrong exchange");
        table.rejected(&conn, &Exchange::Protobase(request), &error);

        assert!(matches!(
            one.wait(Duration::from_millis(10)),
            Err(WaitError::Failed {
                kind: io::ErrorKind::InvalidData,
                ..
            })
        ));
        assert_eq!(two.state(), CorrelatorState::Pending);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_second_signal_is_ignored() {
        let mut correlator = Correlator::new();
        let a = correlator.signaller();
        let b = a.clone();
        assert!(a.signal(response("first")));
        assert!(!b.signal(response("second")));

        let got = correlator.wait(Duration::from_millis(10)).unwrap();
        assert_eq!(got.as_message().unwrap().payload().write(), b"first");
    }

    #[test]
    fn test_rearm_discards_old_generation() {
        let mut correlator = Correlator::new();
        let old = correlator.signaller();
        let _ = correlator.wait(Duration::from_millis(5));

        correlator.rearm();
        assert_eq!(correlator.generation(), 1);
        assert_eq!(correlator.state(), CorrelatorState::Pending);
        assert!(!old.signal(response("stale")));

        let fresh = correlator.signaller();
        assert!(fresh.signal(response("fresh")));
        let got = correlator.wait(Duration::from_millis(10)).unwrap();
        assert_eq!(got.as_message().unwrap().payload().write(), b"fresh");
    }

    #[test]
    fn test_wait_refused_on_io_worker() {
        thread::spawn(|| {
            mark_io_worker();
            let mut correlator = Correlator::new();
            assert_eq!(
                correlator.wait(Duration::from_millis(1)).unwrap_err(),
                WaitError::IoWorkerThread
            );
        })
        .join()
        .unwrap();
    }

    #[test]
    fn test_table_matches_by_id() {
        let table = CorrelationTable::new();
        let mut one = table.register(CorrelationKey::Id(1)).unwrap();
        let mut two = table.register(CorrelationKey::Id(2)).unwrap();
        assert!(matches!(
            table.register(CorrelationKey::Id(1)),
            Err(ClientError::InFlight(CorrelationKey::Id(1)))
        ));

        let mut reply = ProtobaseExchange::request("svc", "");
        reply.set_id(2).unwrap();
        assert!(table.complete(Exchange::Protobase(reply)));

        let got = two.wait(Duration::from_millis(10)).unwrap();
        assert_eq!(got.exchange_id(), Some(2));
        assert!(matches!(
            one.wait(Duration::from_millis(5)),
            Err(WaitError::Timeout { .. })
        ));
        assert_eq!(table.len(), 1);
        table.abandon(CorrelationKey::Id(1));
        assert!(table.is_empty());
    }

    #[test]
    fn test_table_drops_unmatched_responses() {
        let table = CorrelationTable::new();
        assert!(!table.complete(response("nobody asked")));

        let _sole = table.register(CorrelationKey::Sole).unwrap();
        let conn = ConnectionInfo::new(0, 0, "WebSocket");
        assert!(table.accept(&conn, response("yes")).is_none());
        assert!(table.is_empty());
    }
}

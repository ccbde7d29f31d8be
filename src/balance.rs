//! Routing exchanges across a set of connections.
//!
//! Two strategies:
//!
//! - **Hashed**: `hash(routing key) % len(members)`. Deterministic for a
//!   fixed member set; remaps when the set changes.
//! - **Sticky**: the first exchange of a session binds it to a member chosen
//!   by hashing the session id. Later exchanges of that session go to the
//!   same member. If that member has left, routing fails instead of quietly
//!   moving the session, even if an equal handle joins again later.
//!
//! Membership may change concurrently with routing. A lookup racing a
//! removal may still return the member being removed.

use crate::exchange::Exchange;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use thiserror::Error;
use tracing::debug;

/// Routing failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RouteError {
    #[error("no connections to route to")]
    NoConnections,
    /// Sticky routing needs a session id on the exchange.
    #[error("exchange carries no session id")]
    MissingSessionId,
    /// The session's bound connection has left the set.
    #[error("connection bound to session {session} is gone")]
    TargetUnavailable { session: u32 },
}

/// Balancing strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BalanceMode {
    Hashed,
    Sticky,
}

/// One membership of a target. A rejoin is a new membership.
#[derive(Clone)]
struct Member<T> {
    target: T,
    epoch: u64,
}

/// Router over a dynamic set of targets, typically connection handles.
pub struct BalanceRouter<T> {
    mode: BalanceMode,
    members: RwLock<Vec<Member<T>>>,
    sessions: Mutex<HashMap<u32, Member<T>>>,
    next_epoch: AtomicU64,
}

fn hash_of<H: Hash>(value: H) -> u64 {
    let mut hasher = DefaultHasher::new();
    value.hash(&mut hasher);
    hasher.finish()
}

impl<T: Clone + PartialEq> BalanceRouter<T> {
    pub fn new(mode: BalanceMode) -> Self {
        Self {
            mode,
            members: RwLock::new(Vec::new()),
            sessions: Mutex::new(HashMap::new()),
            next_epoch: AtomicU64::new(0),
        }
    }

    pub fn hashed() -> Self {
        Self::new(BalanceMode::Hashed)
    }

    pub fn sticky() -> Self {
        Self::new(BalanceMode::Sticky)
    }

    pub fn mode(&self) -> BalanceMode {
        self.mode
    }

    // A panic while holding a lock leaves the set itself consistent.
    fn read(&self) -> RwLockReadGuard<'_, Vec<Member<T>>> {
        self.members.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Vec<Member<T>>> {
        self.members.write().unwrap_or_else(|e| e.into_inner())
    }

    fn sessions(&self) -> MutexGuard<'_, HashMap<u32, Member<T>>> {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Add a target. Adding one twice has no effect.
    pub fn join(&self, target: T) {
        let mut members = self.write();
        if !members.iter().any(|m| m.target == target) {
            let epoch = self.next_epoch.fetch_add(1, Ordering::Relaxed);
            members.push(Member { target, epoch });
        }
    }

    /// Remove a target. Sessions bound to it stay bound and fail to route,
    /// including after the same target joins again.
    pub fn leave(&self, target: &T) -> bool {
        let mut members = self.write();
        match members.iter().position(|m| m.target == *target) {
            Some(index) => {
                members.remove(index);
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Pick the target for `exchange`.
    pub fn route(&self, exchange: &Exchange) -> Result<T, RouteError> {
        match self.mode {
            BalanceMode::Hashed => self.route_key(exchange.hash_key()),
            BalanceMode::Sticky => {
                let session = exchange.session_id().ok_or(RouteError::MissingSessionId)?;
                self.route_session(session)
            }
        }
    }

    fn pick(&self, key: u64) -> Result<Member<T>, RouteError> {
        let members = self.read();
        if members.is_empty() {
            return Err(RouteError::NoConnections);
        }
        let index = (key % members.len() as u64) as usize;
        Ok(members[index].clone())
    }

    /// Hashed pick for an explicit routing key.
    pub fn route_key(&self, key: u64) -> Result<T, RouteError> {
        self.pick(key).map(|m| m.target)
    }

    /// Sticky pick for `session`, binding it on first sight.
    pub fn route_session(&self, session: u32) -> Result<T, RouteError> {
        let mut sessions = self.sessions();
        if let Some(bound) = sessions.get(&session) {
            let live = self
                .read()
                .iter()
                .any(|m| m.epoch == bound.epoch && m.target == bound.target);
            if live {
                return Ok(bound.target.clone());
            }
            debug!(session, "sticky target left the set");
            return Err(RouteError::TargetUnavailable { session });
        }

        let member = self.pick(hash_of(session))?;
        let target = member.target.clone();
        sessions.insert(session, member);
        Ok(target)
    }

    /// Bind `session` to the current membership of `target`. A target
    /// outside the set gives a binding that never routes.
    pub fn bind(&self, session: u32, target: T) {
        let epoch = self
            .read()
            .iter()
            .find(|m| m.target == target)
            .map_or(u64::MAX, |m| m.epoch);
        self.sessions().insert(session, Member { target, epoch });
    }

    /// Drop the binding of `session` so its next exchange binds afresh.
    pub fn forget(&self, session: u32) -> Option<T> {
        self.sessions().remove(&session).map(|m| m.target)
    }
}

//! Connection identity and bookkeeping.
//!
//! `ConnectionInfo` is the narrow view of a connection that codecs and
//! handlers see: its id, the worker that owns it (pool affinity), the
//! negotiated protocol id and the peer address. `ConnectionRegistry` tracks
//! a worker's live connections in a slab.

use slab::Slab;
use std::net::SocketAddr;

/// Identity of one connection as seen by codecs and handlers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    id: usize,
    worker: usize,
    protocol_id: &'static str,
    peer: Option<SocketAddr>,
}

impl ConnectionInfo {
    pub fn new(id: usize, worker: usize, protocol_id: &'static str) -> Self {
        Self {
            id,
            worker,
            protocol_id,
            peer: None,
        }
    }

    pub fn with_peer(mut self, peer: SocketAddr) -> Self {
        self.peer = Some(peer);
        self
    }

    /// Connection id, unique within its worker.
    pub fn id(&self) -> usize {
        self.id
    }

    /// Id of the I/O worker that owns this connection.
    pub fn worker(&self) -> usize {
        self.worker
    }

    /// Protocol negotiated on this connection.
    pub fn protocol_id(&self) -> &'static str {
        self.protocol_id
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }
}

/// Current state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Reading requests, nothing queued for write.
    Reading,
    /// Responses queued and not yet fully written.
    Writing {
        /// Bytes already written from the front buffer.
        written: usize,
    },
    /// Flush what is queued, then close.
    Closing {
        /// Bytes already written from the front buffer.
        written: usize,
    },
}

impl ConnState {
    /// Bytes of the front buffer already written.
    pub fn written(&self) -> usize {
        match *self {
            ConnState::Reading => 0,
            ConnState::Writing { written } | ConnState::Closing { written } => written,
        }
    }

    pub fn is_closing(&self) -> bool {
        matches!(self, ConnState::Closing { .. })
    }

    /// Record write progress, keeping a pending close.
    pub fn with_written(self, written: usize, queued: bool) -> Self {
        match self {
            ConnState::Closing { .. } => ConnState::Closing { written },
            _ if queued => ConnState::Writing { written },
            _ => ConnState::Reading,
        }
    }
}

/// Registry of active connections using slab allocation.
///
/// Provides O(1) insert, lookup, and remove operations.
pub struct ConnectionRegistry<C> {
    connections: Slab<C>,
    max_connections: usize,
}

impl<C> ConnectionRegistry<C> {
    /// Create a new registry with specified maximum capacity.
    pub fn new(max_connections: usize) -> Self {
        Self {
            connections: Slab::with_capacity(max_connections),
            max_connections,
        }
    }

    /// Reserve the next id without inserting.
    ///
    /// Returns `None` if the registry is at capacity.
    pub fn next_id(&self) -> Option<usize> {
        if self.connections.len() >= self.max_connections {
            return None;
        }
        Some(self.connections.vacant_key())
    }

    /// Insert a new connection into the registry.
    ///
    /// Returns `None` if the registry is at capacity.
    pub fn insert(&mut self, conn: C) -> Option<usize> {
        if self.connections.len() >= self.max_connections {
            return None;
        }
        Some(self.connections.insert(conn))
    }

    /// Get an immutable reference to a connection.
    pub fn get(&self, id: usize) -> Option<&C> {
        self.connections.get(id)
    }

    /// Get a mutable reference to a connection.
    pub fn get_mut(&mut self, id: usize) -> Option<&mut C> {
        self.connections.get_mut(id)
    }

    /// Remove a connection from the registry.
    pub fn remove(&mut self, id: usize) -> Option<C> {
        self.connections.try_remove(id)
    }

    /// Check if a connection exists.
    pub fn contains(&self, id: usize) -> bool {
        self.connections.contains(id)
    }

    /// Number of active connections.
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    /// Check if there are no connections.
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Maximum number of connections allowed.
    pub fn capacity(&self) -> usize {
        self.max_connections
    }

    /// Ids of all connections.
    pub fn ids(&self) -> Vec<usize> {
        self.connections.iter().map(|(id, _)| id).collect()
    }
}

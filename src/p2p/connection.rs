//! Peer connection bookkeeping and the live-connection registry
//!
//! The physical transport lives outside this crate. A [`Connection`] is the
//! core's view of one peer link: identity, direction, a writable state
//! flag, an outbound frame channel the transport drains, and the
//! per-connection request bookkeeping the dispatcher mutates. The
//! [`ConnectionRegistry`] tracks every live connection and answers
//! "next candidate peer" queries for rerouting.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::warn;

use super::request::PendingRequest;

static CONNECTION_INSTANCE_ID: AtomicU64 = AtomicU64::new(1);

/// Direction of a peer connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionDirection {
    Inbound,  // Peer connected to us
    Outbound, // We connected to peer
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting = 0,
    Open = 1,
    Closed = 2,
}

/// Frame handed to the transport layer for delivery.
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundFrame {
    /// Encoded package bytes to write to the socket.
    Message(Vec<u8>),
    /// The core wants the socket closed (e.g. heartbeat gave up on the peer).
    Close,
}

/// One peer link as seen by the protocol core.
pub struct Connection {
    /// Stable peer identifier (host:port or URL), stable across reconnects.
    pub peer: String,
    /// Unique id of this connection instance (guards against a reconnect
    /// being mistaken for the link it replaced).
    pub connection_id: u64,
    pub direction: ConnectionDirection,
    state: AtomicU8,
    sleeping: AtomicBool,
    outbound: mpsc::UnboundedSender<OutboundFrame>,
    last_activity: Mutex<Instant>,
    last_heartbeat_sent: Mutex<Option<Instant>>,
    pub(crate) pending_requests: Mutex<HashMap<String, PendingRequest>>,
    pub(crate) in_preparing_response: Mutex<HashSet<String>>,
}

impl Connection {
    /// Create a connection in the `Open` state. Returns the receiving end
    /// of the outbound frame channel for the transport to drain.
    pub fn new(
        peer: impl Into<String>,
        direction: ConnectionDirection,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<OutboundFrame>) {
        let (outbound, rx) = mpsc::unbounded_channel();
        let conn = Arc::new(Self {
            peer: peer.into(),
            connection_id: CONNECTION_INSTANCE_ID.fetch_add(1, Ordering::Relaxed),
            direction,
            state: AtomicU8::new(ConnectionState::Open as u8),
            sleeping: AtomicBool::new(false),
            outbound,
            last_activity: Mutex::new(Instant::now()),
            last_heartbeat_sent: Mutex::new(None),
            pending_requests: Mutex::new(HashMap::new()),
            in_preparing_response: Mutex::new(HashSet::new()),
        });
        (conn, rx)
    }

    pub fn state(&self) -> ConnectionState {
        match self.state.load(Ordering::Relaxed) {
            0 => ConnectionState::Connecting,
            1 => ConnectionState::Open,
            _ => ConnectionState::Closed,
        }
    }

    pub fn set_state(&self, state: ConnectionState) {
        self.state.store(state as u8, Ordering::Relaxed);
    }

    pub fn is_open(&self) -> bool {
        matches!(self.state(), ConnectionState::Open)
    }

    /// Queue encoded bytes for the transport. Fails (quietly, with a log)
    /// when the connection is not open or the transport is gone.
    pub(crate) fn send_frame(&self, bytes: Vec<u8>) -> bool {
        if !self.is_open() {
            return false;
        }
        if self.outbound.send(OutboundFrame::Message(bytes)).is_err() {
            warn!(peer = %self.peer, "transport channel dropped, cannot send");
            return false;
        }
        true
    }

    /// Mark the connection closed and ask the transport to tear the
    /// socket down. The close event coming back from the transport is
    /// what drains pending requests.
    pub fn close(&self) {
        self.set_state(ConnectionState::Closed);
        let _ = self.outbound.send(OutboundFrame::Close);
    }

    /// Record inbound traffic: refresh the activity timestamp and wake
    /// the peer if it was sleeping.
    pub fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
        self.sleeping.store(false, Ordering::Relaxed);
    }

    pub fn last_activity(&self) -> Instant {
        *self.last_activity.lock()
    }

    pub fn sleeping(&self) -> bool {
        self.sleeping.load(Ordering::Relaxed)
    }

    pub fn set_sleeping(&self, sleeping: bool) {
        self.sleeping.store(sleeping, Ordering::Relaxed);
    }

    pub fn last_heartbeat_sent(&self) -> Option<Instant> {
        *self.last_heartbeat_sent.lock()
    }

    pub fn set_last_heartbeat_sent(&self, value: Option<Instant>) {
        *self.last_heartbeat_sent.lock() = value;
    }

    pub fn pending_request_count(&self) -> usize {
        self.pending_requests.lock().len()
    }

    pub fn has_pending_request(&self, tag: &str) -> bool {
        self.pending_requests.lock().contains_key(tag)
    }
}

/// All live connections, keyed by connection id.
///
/// Mutated only on connect/disconnect; every reader iterates over a
/// snapshot, so connection churn never invalidates an iteration.
pub struct ConnectionRegistry {
    connections: DashMap<u64, Arc<Connection>>,
    max_inbound: usize,
}

impl ConnectionRegistry {
    pub fn new(max_inbound: usize) -> Self {
        Self {
            connections: DashMap::new(),
            max_inbound,
        }
    }

    /// Track a connection. Inbound registrations beyond the configured
    /// cap are refused.
    pub fn register(&self, conn: Arc<Connection>) -> bool {
        if conn.direction == ConnectionDirection::Inbound && self.inbound_count() >= self.max_inbound
        {
            warn!(peer = %conn.peer, max = self.max_inbound, "inbound connection limit reached, rejecting");
            return false;
        }
        self.connections.insert(conn.connection_id, conn);
        true
    }

    pub fn remove(&self, connection_id: u64) -> Option<Arc<Connection>> {
        self.connections.remove(&connection_id).map(|(_, conn)| conn)
    }

    pub fn get(&self, connection_id: u64) -> Option<Arc<Connection>> {
        self.connections
            .get(&connection_id)
            .map(|entry| Arc::clone(entry.value()))
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    pub fn inbound_count(&self) -> usize {
        self.connections
            .iter()
            .filter(|entry| entry.value().direction == ConnectionDirection::Inbound)
            .count()
    }

    /// Copy-on-read view of the current connection set.
    pub fn snapshot(&self) -> Vec<Arc<Connection>> {
        self.connections
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    /// Pick the next open outbound connection not yet tried for a request.
    /// Ordered by connection id so selection is stable for a given set.
    pub fn find_next_candidate(&self, exclude: &HashSet<u64>) -> Option<Arc<Connection>> {
        let mut candidates: Vec<Arc<Connection>> = self
            .snapshot()
            .into_iter()
            .filter(|conn| {
                conn.is_open()
                    && conn.direction == ConnectionDirection::Outbound
                    && !exclude.contains(&conn.connection_id)
            })
            .collect();
        candidates.sort_by_key(|conn| conn.connection_id);
        candidates.into_iter().next()
    }
}

//! polaris-p2p: transport and request/response protocol core for the
//! Polaris ledger node.
//!
//! The crate multiplexes tagged commands over many peer connections,
//! collapses duplicate in-flight requests, transparently reroutes stalled
//! requests to other peers, and keeps links alive with heartbeats. The
//! physical transport and the ledger logic consuming decoded payloads are
//! collaborators, not part of this crate.

pub mod p2p;

pub use p2p::{
    calculate_tag, Connection, ConnectionDirection, ConnectionRegistry, ConnectionState,
    DispatcherRole, HandlerRegistry, P2pConfig, P2pNode, Package, PackageError, PackageType,
    RequestDispatcher, RequestFailure, RequestOutcome, ResponseHandler,
};

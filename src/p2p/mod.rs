//! P2P request/response protocol core
//!
//! Maintains bidirectional connections to many peers and multiplexes
//! tagged application commands over them:
//! - Content-addressed request tags (duplicate collapsing, correlation)
//! - Transparent rerouting of stalled requests to another peer
//! - Heartbeat-driven liveness with sleep opt-out
//!
//! The physical transport (sockets, listen/accept) and peer discovery
//! live outside this crate; see [`node::P2pNode`] for the event boundary.

pub mod connection;
pub mod handlers;
pub mod heartbeat;
pub mod message;
pub mod node;
pub mod p2p_config;
pub mod package;
pub mod request;

// Test utilities for isolated unit testing
#[cfg(test)]
pub mod test_utils;

// Public re-exports used by embedding code (keep minimal)
pub use connection::{
    Connection, ConnectionDirection, ConnectionRegistry, ConnectionState, OutboundFrame,
};
pub use handlers::{CommandHandler, HandlerRegistry};
pub use heartbeat::HeartbeatMonitor;
pub use node::P2pNode;
pub use p2p_config::{load_p2p_config, P2pConfig};
pub use package::{calculate_tag, Package, PackageError, PackageType};
pub use request::{
    DispatcherRole, RequestDispatcher, RequestFailure, RequestOutcome, ResponseHandler,
};

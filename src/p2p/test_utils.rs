//! Test utilities for p2p unit tests
//!
//! Helpers to build isolated connections and recording response handlers
//! without any transport or global state.

use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;

use super::connection::{Connection, ConnectionDirection, OutboundFrame};
use super::p2p_config::P2pConfig;
use super::request::{RequestOutcome, ResponseHandler};

pub fn test_config() -> P2pConfig {
    P2pConfig::default()
}

/// A connection whose outbound frames are captured for assertions.
pub fn test_connection(
    peer: &str,
    direction: ConnectionDirection,
) -> (Arc<Connection>, mpsc::UnboundedReceiver<OutboundFrame>) {
    Connection::new(peer, direction)
}

/// A response handler that records every outcome it is resolved with.
pub fn recording_handler() -> (ResponseHandler, Arc<Mutex<Vec<RequestOutcome>>>) {
    let calls: Arc<Mutex<Vec<RequestOutcome>>> = Arc::new(Mutex::new(Vec::new()));
    let recorded = Arc::clone(&calls);
    let handler: ResponseHandler = Arc::new(move |_conn, _request, outcome| {
        recorded.lock().push(outcome.clone());
    });
    (handler, calls)
}

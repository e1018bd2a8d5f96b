//! Outbound message path
//!
//! Thin validation layer between the dispatcher and the transport: checks
//! the connection is writable and the body is well formed, encodes the
//! envelope, and hands the bytes to the connection's outbound channel.
//! Holds no dispatcher state of its own.

use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, warn};

use super::connection::Connection;
use super::package::{Package, PackageType, PROTOCOL_ALT, PROTOCOL_VERSION};

/// Encode and queue one package. Every precondition failure is logged and
/// reported as `false`; nothing here panics or throws.
pub fn send_message(
    conn: &Arc<Connection>,
    package_type: PackageType,
    command: &str,
    body: &Value,
) -> bool {
    if !conn.is_open() {
        warn!(peer = %conn.peer, state = ?conn.state(), command, "connection not open, dropping outbound message");
        return false;
    }

    let package = match Package::from_parts(package_type, command, body) {
        Ok(package) => package,
        Err(err) => {
            warn!(peer = %conn.peer, command, %err, "refusing to send malformed package");
            return false;
        }
    };
    let bytes = match package.encode() {
        Ok(bytes) => bytes,
        Err(err) => {
            warn!(peer = %conn.peer, command, %err, "package encoding failed");
            return false;
        }
    };

    if !conn.send_frame(bytes) {
        return false;
    }
    debug!(peer = %conn.peer, package_type = ?package_type, command, "sent package");
    true
}

/// Fire-and-forget notification, no correlation tag involved.
pub fn send_talk(conn: &Arc<Connection>, subject: &str, body: &Value) -> bool {
    send_message(conn, PackageType::Talk, subject, body)
}

pub fn send_error(conn: &Arc<Connection>, text: &str) -> bool {
    send_talk(conn, "error", &json!({ "error": text }))
}

pub fn send_info(conn: &Arc<Connection>, text: &str) -> bool {
    send_talk(conn, "info", &json!({ "info": text }))
}

pub fn send_result(conn: &Arc<Connection>, body: &Value) -> bool {
    send_talk(conn, "result", body)
}

/// Announce our protocol and library versions to a freshly connected peer.
pub fn send_version(conn: &Arc<Connection>) -> bool {
    send_talk(
        conn,
        "version",
        &json!({
            "protocol_version": PROTOCOL_VERSION,
            "alt": PROTOCOL_ALT,
            "library": env!("CARGO_PKG_NAME"),
            "library_version": env!("CARGO_PKG_VERSION"),
        }),
    )
}

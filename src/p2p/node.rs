//! Node composition root
//!
//! Owns the connection registry, the request dispatcher, the command
//! handler registry and the heartbeat monitor, and translates the four
//! transport lifecycle events (opened, message, closed, error) into
//! protocol behavior. The embedding transport calls `on_*`; application
//! code registers command handlers and sends requests through the
//! dispatcher.

use serde_json::json;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::connection::{Connection, ConnectionRegistry};
use super::handlers::HandlerRegistry;
use super::heartbeat::{self, HeartbeatMonitor};
use super::p2p_config::P2pConfig;
use super::package::{Package, PackageType};
use super::request::{DispatcherRole, RequestDispatcher};

pub struct P2pNode {
    config: P2pConfig,
    registry: Arc<ConnectionRegistry>,
    dispatcher: Arc<RequestDispatcher>,
    handlers: Arc<HandlerRegistry>,
    heartbeat: HeartbeatMonitor,
}

impl P2pNode {
    pub fn new(role: DispatcherRole, config: P2pConfig) -> Arc<Self> {
        let registry = Arc::new(ConnectionRegistry::new(config.max_inbound_connections));
        let dispatcher = RequestDispatcher::new(role, Arc::clone(&registry), &config);
        let handlers = Arc::new(HandlerRegistry::new());
        let heartbeat = HeartbeatMonitor::new(&config);

        let node = Arc::new(Self {
            config,
            registry,
            dispatcher,
            handlers,
            heartbeat,
        });
        node.register_builtin_handlers();
        node
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn dispatcher(&self) -> &Arc<RequestDispatcher> {
        &self.dispatcher
    }

    pub fn handlers(&self) -> &Arc<HandlerRegistry> {
        &self.handlers
    }

    pub fn start_heartbeat(&self) {
        self.heartbeat
            .start(Arc::clone(&self.registry), Arc::clone(&self.dispatcher));
    }

    pub fn stop_heartbeat(&self) {
        self.heartbeat.stop();
    }

    /// The transport reports a connection is up (dialed out or accepted).
    /// Registering a new peer also wakes any reroutes that were parked
    /// for lack of a candidate.
    pub fn on_connection_opened(&self, conn: &Arc<Connection>) -> bool {
        if !self.registry.register(Arc::clone(conn)) {
            conn.close();
            return false;
        }
        info!(peer = %conn.peer, direction = ?conn.direction, "connection registered");
        self.dispatcher.retry_parked();
        true
    }

    /// The transport delivered one inbound frame.
    pub fn on_message(&self, conn: &Arc<Connection>, bytes: &[u8]) {
        conn.touch();

        let package = match Package::decode(bytes) {
            Ok(package) => package,
            Err(err) => {
                // one bad frame is dropped, the connection stays open
                warn!(peer = %conn.peer, %err, "dropping malformed package");
                return;
            }
        };
        debug!(
            peer = %conn.peer, package_type = ?package.package_type,
            command = %package.command, tag = ?package.tag,
            "received package"
        );

        match package.package_type {
            PackageType::Request => self.handle_inbound_request(conn, &package),
            PackageType::Ping => self.invoke_handler(conn, &package),
            PackageType::Response | PackageType::Pong => {
                let Some(tag) = package.tag.as_deref() else {
                    warn!(peer = %conn.peer, command = %package.command, "response without a tag");
                    return;
                };
                self.dispatcher
                    .on_response_received(conn, tag, package.body.clone());
            }
            PackageType::Talk => self.invoke_handler(conn, &package),
            PackageType::System => {
                debug!(peer = %conn.peer, command = %package.command, "ignoring system package");
            }
        }
    }

    /// The transport reports the connection is gone.
    pub fn on_connection_closed(&self, conn: &Arc<Connection>) {
        self.dispatcher.handle_connection_closed(conn);
    }

    pub fn on_connection_error(&self, conn: &Arc<Connection>, error: &str) {
        warn!(peer = %conn.peer, error, "connection error");
        self.dispatcher.handle_connection_closed(conn);
    }

    /// Inbound tagged request: suppress retransmissions of a request we
    /// are still answering, then hand off to the registered handler.
    fn handle_inbound_request(&self, conn: &Arc<Connection>, package: &Package) {
        let Some(tag) = package.tag.as_deref() else {
            warn!(peer = %conn.peer, command = %package.command, "request without a tag");
            return;
        };

        if !conn.in_preparing_response.lock().insert(tag.to_string()) {
            debug!(
                peer = %conn.peer, command = %package.command,
                "ignoring identical request while still preparing the response"
            );
            return;
        }

        match self.handlers.get(package.package_type, &package.command) {
            Some(handler) => (*handler)(conn, package),
            None => {
                warn!(peer = %conn.peer, command = %package.command, "no handler for inbound request");
                self.dispatcher.send_error_response(
                    conn,
                    PackageType::Response,
                    &package.command,
                    tag,
                    "unhandled request",
                );
            }
        }
    }

    fn invoke_handler(&self, conn: &Arc<Connection>, package: &Package) {
        match self.handlers.get(package.package_type, &package.command) {
            Some(handler) => (*handler)(conn, package),
            None => {
                debug!(
                    peer = %conn.peer, package_type = ?package.package_type,
                    command = %package.command, "no handler registered, ignoring"
                );
            }
        }
    }

    fn register_builtin_handlers(self: &Arc<Self>) {
        // answer pings; advertise sleep if this node opted out of
        // being heartbeated
        let dispatcher = Arc::clone(&self.dispatcher);
        let sleep_when_idle = self.config.sleep_when_idle;
        self.handlers.register(
            PackageType::Ping,
            heartbeat::COMMAND_PING,
            Arc::new(move |conn, package| {
                let Some(tag) = package.tag.as_deref() else {
                    return;
                };
                dispatcher.send_response(
                    conn,
                    PackageType::Pong,
                    heartbeat::COMMAND_PONG,
                    &json!({ "tag": tag, "sleep": sleep_when_idle }),
                );
            }),
        );
    }
}

//! Tagged request dispatch with duplicate collapsing and rerouting
//!
//! The dispatcher sends content-tagged requests, tracks them per
//! connection, and guarantees that every registered response handler is
//! resolved exactly once — by a response, by a timeout, or by a
//! closed-connection error. Identical concurrent requests collapse onto
//! one wire send. Reroutable requests that stall are transparently
//! re-issued on another peer; whichever peer eventually answers resolves
//! every handler on every connection the request was tried on.

use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::connection::{Connection, ConnectionRegistry, ConnectionState};
use super::message;
use super::p2p_config::P2pConfig;
use super::package::{self, PackageType};

/// What a response handler is resolved with.
#[derive(Debug, Clone, PartialEq)]
pub enum RequestOutcome {
    /// Response body delivered by a peer (not necessarily the peer the
    /// request was first sent to).
    Response(Value),
    /// The request failed without any peer answering.
    Failed(RequestFailure),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RequestFailure {
    #[error("response timeout")]
    ResponseTimeout,
    #[error("connection closed")]
    ConnectionClosed,
}

/// Callback resolved exactly once per registration with
/// `(connection, original request body, outcome)`.
pub type ResponseHandler = Arc<dyn Fn(&Arc<Connection>, &Value, &RequestOutcome) + Send + Sync>;

/// Which side of the link this dispatcher drives. Rerouting is a client
/// mechanism — a node chasing data from its peers. A server answering
/// inbound clients never reroutes and never broadcasts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatcherRole {
    Client,
    Server,
}

/// Everything needed to re-issue a stalled request on another peer,
/// captured by value at request-creation time.
#[derive(Clone)]
pub struct RerouteContext {
    pub(crate) connection: Arc<Connection>,
    pub(crate) package_type: PackageType,
    pub(crate) command: String,
    pub(crate) body: Value,
    pub(crate) tag: String,
}

/// One in-flight tagged request on one connection.
pub struct PendingRequest {
    /// Immutable snapshot of the request body as sent (tag attached).
    pub(crate) request: Value,
    /// All callers waiting on this tag, in registration order.
    pub(crate) response_handlers: Vec<ResponseHandler>,
    pub(crate) reroute: Option<RerouteContext>,
    pub(crate) reroute_timer: Option<JoinHandle<()>>,
    pub(crate) cancel_timer: Option<JoinHandle<()>>,
    pub(crate) rerouted: bool,
}

impl PendingRequest {
    pub(crate) fn clear_timers(&mut self) {
        if let Some(timer) = self.reroute_timer.take() {
            timer.abort();
        }
        if let Some(timer) = self.cancel_timer.take() {
            timer.abort();
        }
    }
}

impl Drop for PendingRequest {
    fn drop(&mut self) {
        self.clear_timers();
    }
}

/// The central request/response state machine.
pub struct RequestDispatcher {
    role: DispatcherRole,
    registry: Arc<ConnectionRegistry>,
    stalled_timeout: Duration,
    response_timeout: Duration,
    /// Every connection a tag has been tried on, original hop included.
    /// A response on any of them cancels the others.
    rerouted_by_tag: Mutex<HashMap<String, Vec<Arc<Connection>>>>,
    /// Reroutes that found no candidate peer; retried when a new
    /// connection shows up.
    parked_reroutes: Mutex<Vec<RerouteContext>>,
}

impl RequestDispatcher {
    pub fn new(
        role: DispatcherRole,
        registry: Arc<ConnectionRegistry>,
        config: &P2pConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            role,
            registry,
            stalled_timeout: config.stalled_timeout(),
            response_timeout: config.response_timeout(),
            rerouted_by_tag: Mutex::new(HashMap::new()),
            parked_reroutes: Mutex::new(Vec::new()),
        })
    }

    pub fn role(&self) -> DispatcherRole {
        self.role
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Send a tagged request and register `handler` for its resolution.
    ///
    /// If an identical request (same tag) is already pending on this
    /// connection, the handler is queued onto it and nothing touches the
    /// wire — the return value is `false` in that case and on every
    /// validation failure.
    pub fn send_request(
        self: &Arc<Self>,
        conn: &Arc<Connection>,
        package_type: PackageType,
        command: &str,
        body: &Value,
        reroutable: bool,
        handler: ResponseHandler,
    ) -> bool {
        if command.is_empty() {
            error!("send_request with empty command");
            return false;
        }
        let mut body_map = match package::body_object(body) {
            Some(map) => map,
            None => {
                error!(command, "send_request body must be a JSON object");
                return false;
            }
        };
        body_map.remove("tag");
        let clean_body = Value::Object(body_map);

        let tag = match package::calculate_tag(package_type, command, &clean_body) {
            Ok(tag) => tag,
            Err(err) => {
                error!(command, %err, "send_request could not derive a tag");
                return false;
            }
        };

        let reroutable = reroutable && self.role == DispatcherRole::Client;

        let mut content = clean_body.clone();
        if let Some(map) = content.as_object_mut() {
            map.insert("tag".to_string(), Value::String(tag.clone()));
        }

        {
            let mut pending = conn.pending_requests.lock();
            if let Some(existing) = pending.get_mut(&tag) {
                existing.response_handlers.push(handler);
                debug!(
                    peer = %conn.peer, command,
                    "identical request already in flight, queueing one more handler instead of resending"
                );
                return false;
            }

            let reroute = if reroutable {
                Some(RerouteContext {
                    connection: Arc::clone(conn),
                    package_type,
                    command: command.to_string(),
                    body: clean_body,
                    tag: tag.clone(),
                })
            } else {
                None
            };
            let (reroute_timer, cancel_timer) = match reroute.as_ref() {
                Some(ctx) => (Some(self.spawn_reroute_timer(ctx.clone())), None),
                None => (None, Some(self.spawn_cancel_timer(conn, &tag))),
            };

            pending.insert(
                tag.clone(),
                PendingRequest {
                    request: content.clone(),
                    response_handlers: vec![handler],
                    reroute,
                    reroute_timer,
                    cancel_timer,
                    rerouted: false,
                },
            );
        }

        message::send_message(conn, package_type, command, &content)
    }

    /// Fan one request out to a set of connections. Client role only.
    pub fn send_broadcast_request(
        self: &Arc<Self>,
        conns: &[Arc<Connection>],
        package_type: PackageType,
        command: &str,
        body: &Value,
        reroutable: bool,
        handler: ResponseHandler,
    ) -> bool {
        if self.role != DispatcherRole::Client {
            error!("will broadcast nothing, only a client dispatcher broadcasts");
            return false;
        }
        for conn in conns {
            self.send_request(
                conn,
                package_type,
                command,
                body,
                reroutable,
                Arc::clone(&handler),
            );
        }
        true
    }

    /// A RESPONSE (or PONG) arrived for `tag` on `conn`.
    ///
    /// Handlers run on a later scheduling turn, in registration order, so
    /// a handler calling back into the dispatcher cannot reenter the
    /// receive path mid-mutation. Afterwards every other connection this
    /// tag was rerouted to is cleaned up without firing its handlers —
    /// they are the same registrations and have just been resolved here.
    pub fn on_response_received(&self, conn: &Arc<Connection>, tag: &str, response: Value) {
        let removed = conn.pending_requests.lock().remove(tag);
        match removed {
            Some(mut pending) => {
                pending.clear_timers();
                let handlers: Vec<ResponseHandler> = pending.response_handlers.drain(..).collect();
                let request = pending.request.clone();
                let conn = Arc::clone(conn);
                tokio::spawn(async move {
                    let outcome = RequestOutcome::Response(response);
                    for handler in handlers {
                        (*handler)(&conn, &request, &outcome);
                    }
                });
            }
            None => {
                debug!(
                    peer = %conn.peer, tag,
                    "response with no pending request (already answered elsewhere, or timed out)"
                );
            }
        }
        self.resolve_rerouted_connections(tag);
    }

    /// Answer an inbound request. Releases the tag from the connection's
    /// in-preparing set so a retransmission of the same request can be
    /// processed again later.
    pub fn send_response(
        &self,
        conn: &Arc<Connection>,
        package_type: PackageType,
        command: &str,
        body: &Value,
    ) -> bool {
        if let Some(tag) = body.get("tag").and_then(Value::as_str) {
            if conn.in_preparing_response.lock().remove(tag) {
                debug!(peer = %conn.peer, tag, "response prepared, releasing request tag");
            }
        }
        message::send_message(conn, package_type, command, body)
    }

    pub fn send_error_response(
        &self,
        conn: &Arc<Connection>,
        package_type: PackageType,
        command: &str,
        tag: &str,
        error_text: &str,
    ) -> bool {
        self.send_response(
            conn,
            package_type,
            command,
            &json!({ "tag": tag, "error": error_text }),
        )
    }

    /// Drain a closed connection: reroutable requests migrate to another
    /// peer immediately (no waiting for the stall timer — the connection
    /// is already gone), everything else resolves with a closed error in
    /// the same turn. Rerouted entries stay in the map; the reroute
    /// bookkeeping needs them until the tag resolves for good.
    pub fn handle_connection_closed(self: &Arc<Self>, conn: &Arc<Connection>) {
        info!(peer = %conn.peer, "connection closed, completing all outstanding requests");
        self.registry.remove(conn.connection_id);
        conn.set_state(ConnectionState::Closed);

        let mut to_reroute: Vec<RerouteContext> = Vec::new();
        let mut to_fail: Vec<(Value, Vec<ResponseHandler>)> = Vec::new();
        {
            let mut pending = conn.pending_requests.lock();
            pending.retain(|_tag, entry| {
                entry.clear_timers();
                match entry.reroute.clone() {
                    Some(ctx) => {
                        if !entry.rerouted {
                            to_reroute.push(ctx);
                        }
                        true
                    }
                    None => {
                        to_fail.push((
                            entry.request.clone(),
                            entry.response_handlers.drain(..).collect(),
                        ));
                        false
                    }
                }
            });
        }

        let outcome = RequestOutcome::Failed(RequestFailure::ConnectionClosed);
        for (request, handlers) in to_fail {
            for handler in handlers {
                (*handler)(conn, &request, &outcome);
            }
        }
        for ctx in to_reroute {
            self.execute_reroute(ctx);
        }
    }

    /// Retry every parked reroute. Called when a new connection joins the
    /// registry — the "wake" a parked request has been waiting for.
    pub fn retry_parked(self: &Arc<Self>) {
        let contexts: Vec<RerouteContext> = self.parked_reroutes.lock().drain(..).collect();
        for ctx in contexts {
            self.execute_reroute(ctx);
        }
    }

    #[cfg(test)]
    pub(crate) fn parked_count(&self) -> usize {
        self.parked_reroutes.lock().len()
    }

    /// Move a stalled request to the next untried peer on behalf of all
    /// its waiting handlers.
    fn execute_reroute(self: &Arc<Self>, ctx: RerouteContext) {
        info!(
            command = %ctx.command, peer = %ctx.connection.peer,
            "will try to reroute a stalled request"
        );

        if !ctx.connection.has_pending_request(&ctx.tag) {
            debug!(
                command = %ctx.command,
                "not rerouting, the request was already handled by another peer"
            );
            return;
        }

        let mut exclude: HashSet<u64> = HashSet::new();
        exclude.insert(ctx.connection.connection_id);
        if let Some(group) = self.rerouted_by_tag.lock().get(&ctx.tag) {
            exclude.extend(group.iter().map(|c| c.connection_id));
        }

        let next = match self.registry.find_next_candidate(&exclude) {
            Some(next) => next,
            None => {
                info!(
                    command = %ctx.command,
                    "will not reroute, no other peer available; parking the request"
                );
                self.park(ctx);
                return;
            }
        };

        let handlers: Vec<ResponseHandler> = {
            let mut pending = ctx.connection.pending_requests.lock();
            match pending.get_mut(&ctx.tag) {
                Some(entry) => {
                    entry.rerouted = true;
                    entry.response_handlers.clone()
                }
                // resolved between the candidate search and now
                None => return,
            }
        };

        info!(
            command = %ctx.command, from = %ctx.connection.peer, to = %next.peer,
            "rerouting request"
        );

        // Record both hops before resending so a response on either side
        // can cancel the other; a late group entry could outlive the tag
        // and cancel an unrelated future request reusing it.
        {
            let mut groups = self.rerouted_by_tag.lock();
            let group = groups.entry(ctx.tag.clone()).or_default();
            if !group
                .iter()
                .any(|c| c.connection_id == ctx.connection.connection_id)
            {
                group.push(Arc::clone(&ctx.connection));
            }
            group.push(Arc::clone(&next));
        }

        // Re-enters send_request: the first handler creates a fresh
        // pending entry on the candidate under the same tag, the rest
        // collapse onto it.
        for handler in handlers {
            self.send_request(
                &next,
                ctx.package_type,
                &ctx.command,
                &ctx.body,
                true,
                handler,
            );
        }
    }

    fn park(&self, ctx: RerouteContext) {
        let mut parked = self.parked_reroutes.lock();
        let already = parked.iter().any(|p| {
            p.tag == ctx.tag && p.connection.connection_id == ctx.connection.connection_id
        });
        if !already {
            parked.push(ctx);
        }
    }

    /// The tag has been answered somewhere. Cancel its timers and drop
    /// its pending entries on every other connection it was tried on.
    fn resolve_rerouted_connections(&self, tag: &str) {
        let group = self.rerouted_by_tag.lock().remove(tag);
        if let Some(connections) = group {
            for other in connections {
                if let Some(mut entry) = other.pending_requests.lock().remove(tag) {
                    entry.clear_timers();
                    debug!(
                        peer = %other.peer, tag,
                        "dropping rerouted request copy answered by another peer"
                    );
                }
            }
        }
        self.parked_reroutes.lock().retain(|ctx| ctx.tag != tag);
    }

    fn spawn_reroute_timer(self: &Arc<Self>, ctx: RerouteContext) -> JoinHandle<()> {
        let dispatcher = Arc::downgrade(self);
        let stalled_timeout = self.stalled_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(stalled_timeout).await;
            if let Some(dispatcher) = dispatcher.upgrade() {
                warn!(
                    command = %ctx.command, peer = %ctx.connection.peer,
                    "request stalled with no response"
                );
                dispatcher.execute_reroute(ctx);
            }
        })
    }

    fn spawn_cancel_timer(self: &Arc<Self>, conn: &Arc<Connection>, tag: &str) -> JoinHandle<()> {
        let dispatcher = Arc::downgrade(self);
        let conn = Arc::clone(conn);
        let tag = tag.to_string();
        let response_timeout = self.response_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(response_timeout).await;
            if let Some(dispatcher) = dispatcher.upgrade() {
                dispatcher.cancel_on_timeout(&conn, &tag);
            }
        })
    }

    fn cancel_on_timeout(&self, conn: &Arc<Connection>, tag: &str) {
        let removed = conn.pending_requests.lock().remove(tag);
        let Some(mut pending) = removed else {
            return;
        };
        pending.clear_timers();
        warn!(peer = %conn.peer, tag, "response overdue, abandoning request");

        let request = pending.request.clone();
        let handlers: Vec<ResponseHandler> = pending.response_handlers.drain(..).collect();
        let outcome = RequestOutcome::Failed(RequestFailure::ResponseTimeout);
        for handler in handlers {
            (*handler)(conn, &request, &outcome);
        }
    }
}

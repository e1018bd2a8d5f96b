//! Heartbeat-driven liveness monitoring
//!
//! Periodically pings connections that have gone quiet and disconnects
//! peers that stay silent past the response deadline. A peer may answer a
//! ping with `sleep = true` to keep the link open while opting out of
//! further pings; any message it sends later wakes it again. The same
//! loop runs over inbound and outbound connections alike — in this
//! network any node may need to detect a silent counterpart.

use parking_lot::Mutex;
use rand::Rng;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info};

use super::connection::{Connection, ConnectionRegistry};
use super::p2p_config::P2pConfig;
use super::package::PackageType;
use super::request::{RequestDispatcher, RequestOutcome, ResponseHandler};

pub const COMMAND_PING: &str = "ping";
pub const COMMAND_PONG: &str = "pong";

pub struct HeartbeatMonitor {
    interval: Duration,
    timeout: Duration,
    response_timeout: Duration,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl HeartbeatMonitor {
    pub fn new(config: &P2pConfig) -> Self {
        Self {
            interval: config.heartbeat_interval(),
            timeout: config.heartbeat_timeout(),
            response_timeout: config.heartbeat_response_timeout(),
            task: Mutex::new(None),
        }
    }

    /// Start the periodic ping loop.
    ///
    /// A small random jitter is added to the interval: two symmetric
    /// peers with identical intervals would otherwise ping each other at
    /// the same instant.
    pub fn start(&self, registry: Arc<ConnectionRegistry>, dispatcher: Arc<RequestDispatcher>) {
        let mut task = self.task.lock();
        if let Some(previous) = task.take() {
            previous.abort();
        }

        let interval = self.interval + Duration::from_millis(rand::thread_rng().gen_range(0..1000));
        let timeout = self.timeout;
        let response_timeout = self.response_timeout;
        *task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                Self::tick(&registry, &dispatcher, timeout, response_timeout);
            }
        }));
    }

    pub fn stop(&self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }

    /// One pass over all connections: ping the idle ones, drop the dead
    /// ones.
    pub(crate) fn tick(
        registry: &Arc<ConnectionRegistry>,
        dispatcher: &Arc<RequestDispatcher>,
        timeout: Duration,
        response_timeout: Duration,
    ) {
        for conn in registry.snapshot() {
            if conn.sleeping() || !conn.is_open() {
                continue;
            }

            let idle = conn.last_activity().elapsed();
            if idle < timeout {
                continue;
            }

            match conn.last_heartbeat_sent() {
                Some(sent) if sent.elapsed() >= response_timeout => {
                    info!(
                        peer = %conn.peer, idle_ms = idle.as_millis() as u64,
                        "will disconnect peer who stayed silent after a ping"
                    );
                    conn.close();
                }
                Some(_) => {
                    // ping outstanding, still within the response window
                }
                None => {
                    conn.set_last_heartbeat_sent(Some(Instant::now()));
                    debug!(peer = %conn.peer, "sending heartbeat ping");
                    dispatcher.send_request(
                        &conn,
                        PackageType::Ping,
                        COMMAND_PING,
                        &json!({}),
                        false,
                        Self::pong_handler(),
                    );
                }
            }
        }
    }

    /// Resolution handler for an outgoing ping: clears the outstanding
    /// marker, and honors a peer that asks not to be pinged any more.
    fn pong_handler() -> ResponseHandler {
        Arc::new(|conn, _request, outcome| {
            conn.set_last_heartbeat_sent(None);
            if let RequestOutcome::Response(body) = outcome {
                if body.get("sleep").and_then(Value::as_bool) == Some(true) {
                    // the peer wants the link kept open without pings;
                    // resumed as soon as it sends anything itself
                    debug!(peer = %conn.peer, "peer opted out of heartbeats, marking sleeping");
                    conn.set_sleeping(true);
                }
            }
        })
    }
}

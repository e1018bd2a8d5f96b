//! End-to-end dispatch scenarios: duplicate collapsing, reroute on stall,
//! reroute on close, parked reroutes, and resolution exactly-once.

use parking_lot::Mutex;
use polaris_p2p::p2p::connection::OutboundFrame;
use polaris_p2p::{
    Connection, ConnectionDirection, DispatcherRole, P2pConfig, P2pNode, Package, PackageType,
    RequestFailure, RequestOutcome, ResponseHandler,
};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;

fn recording_handler() -> (ResponseHandler, Arc<Mutex<Vec<RequestOutcome>>>) {
    let calls: Arc<Mutex<Vec<RequestOutcome>>> = Arc::new(Mutex::new(Vec::new()));
    let recorded = Arc::clone(&calls);
    let handler: ResponseHandler = Arc::new(move |_conn, _request, outcome| {
        recorded.lock().push(outcome.clone());
    });
    (handler, calls)
}

fn next_package(rx: &mut UnboundedReceiver<OutboundFrame>) -> Option<Package> {
    match rx.try_recv() {
        Ok(OutboundFrame::Message(bytes)) => Some(Package::decode(&bytes).unwrap()),
        _ => None,
    }
}

fn response_frame(command: &str, tag: &str, body: Value) -> Vec<u8> {
    let mut body = body;
    body.as_object_mut()
        .unwrap()
        .insert("tag".to_string(), json!(tag));
    Package::from_parts(PackageType::Response, command, &body)
        .unwrap()
        .encode()
        .unwrap()
}

fn open_peer(
    node: &Arc<P2pNode>,
    peer: &str,
) -> (Arc<Connection>, UnboundedReceiver<OutboundFrame>) {
    let (conn, rx) = Connection::new(peer, ConnectionDirection::Outbound);
    assert!(node.on_connection_opened(&conn));
    (conn, rx)
}

#[tokio::test]
async fn test_duplicate_requests_share_one_wire_send_and_one_response() {
    let node = P2pNode::new(DispatcherRole::Client, P2pConfig::default());
    let (conn, mut rx) = open_peer(&node, "hub-a:6615");
    let (h1, calls1) = recording_handler();
    let (h2, calls2) = recording_handler();

    let body = json!({"unit": "U1"});
    node.dispatcher()
        .send_request(&conn, PackageType::Request, "get_joint", &body, true, h1);
    node.dispatcher()
        .send_request(&conn, PackageType::Request, "get_joint", &body, true, h2);

    let sent = next_package(&mut rx).unwrap();
    assert!(next_package(&mut rx).is_none(), "exactly one frame on the wire");
    let tag = sent.tag.unwrap();

    node.on_message(
        &conn,
        &response_frame("get_joint", &tag, json!({"joint": {"unit": "U1"}})),
    );
    tokio::time::sleep(Duration::from_millis(10)).await;

    let expected = RequestOutcome::Response(json!({"joint": {"unit": "U1"}}));
    assert_eq!(calls1.lock().as_slice(), [expected.clone()]);
    assert_eq!(calls2.lock().as_slice(), [expected]);
    assert_eq!(conn.pending_request_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_stalled_request_is_rerouted_and_answered_by_substitute() {
    let node = P2pNode::new(DispatcherRole::Client, P2pConfig::default());
    let (conn_a, mut rx_a) = open_peer(&node, "hub-a:6615");
    let (conn_b, mut rx_b) = open_peer(&node, "hub-b:6615");
    let (handler, calls) = recording_handler();

    node.dispatcher().send_request(
        &conn_a,
        PackageType::Request,
        "get_joint",
        &json!({"unit": "U1"}),
        true,
        handler,
    );
    let first = next_package(&mut rx_a).unwrap();
    let tag = first.tag.clone().unwrap();
    assert!(next_package(&mut rx_b).is_none());

    // stall: nothing answered within the stalled timeout
    tokio::time::sleep(Duration::from_millis(5_100)).await;

    let rerouted = next_package(&mut rx_b).expect("request must move to the substitute peer");
    assert_eq!(rerouted.tag.as_deref(), Some(tag.as_str()));
    assert_eq!(rerouted.command, "get_joint");
    assert!(next_package(&mut rx_a).is_none(), "nothing resent on the stalled peer");
    assert!(conn_a.has_pending_request(&tag));
    assert!(conn_b.has_pending_request(&tag));

    // the substitute answers; handlers registered on the original
    // connection fire with that response
    node.on_message(
        &conn_b,
        &response_frame("get_joint", &tag, json!({"joint": {"unit": "U1"}})),
    );
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert_eq!(
        calls.lock().as_slice(),
        [RequestOutcome::Response(json!({"joint": {"unit": "U1"}}))]
    );
    assert_eq!(conn_a.pending_request_count(), 0);
    assert_eq!(conn_b.pending_request_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_reroute_chain_never_returns_to_a_tried_peer() {
    let node = P2pNode::new(DispatcherRole::Client, P2pConfig::default());
    let (conn_a, mut rx_a) = open_peer(&node, "hub-a:6615");
    let (conn_b, mut rx_b) = open_peer(&node, "hub-b:6615");
    let (_conn_c, mut rx_c) = open_peer(&node, "hub-c:6615");
    let (handler, calls) = recording_handler();

    node.dispatcher().send_request(
        &conn_a,
        PackageType::Request,
        "catchup",
        &json!({"last_stable_mci": 5}),
        true,
        handler,
    );
    let tag = next_package(&mut rx_a).unwrap().tag.unwrap();

    tokio::time::sleep(Duration::from_millis(5_100)).await;
    assert!(next_package(&mut rx_b).is_some(), "first hop goes to peer b");

    // second stall hops to c, never back to a
    tokio::time::sleep(Duration::from_millis(5_100)).await;
    let third = next_package(&mut rx_c).expect("second hop goes to peer c");
    assert_eq!(third.tag.as_deref(), Some(tag.as_str()));
    assert!(next_package(&mut rx_a).is_none());

    node.on_message(
        &_conn_c,
        &response_frame("catchup", &tag, json!({"status": "done"})),
    );
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert_eq!(calls.lock().len(), 1, "handler resolves exactly once");
    assert_eq!(conn_a.pending_request_count(), 0);
    assert_eq!(conn_b.pending_request_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_original_peer_answering_after_reroute_resolves_once() {
    let node = P2pNode::new(DispatcherRole::Client, P2pConfig::default());
    let (conn_a, mut rx_a) = open_peer(&node, "hub-a:6615");
    let (conn_b, mut rx_b) = open_peer(&node, "hub-b:6615");
    let (handler, calls) = recording_handler();

    node.dispatcher().send_request(
        &conn_a,
        PackageType::Request,
        "get_joint",
        &json!({"unit": "U1"}),
        true,
        handler,
    );
    let tag = next_package(&mut rx_a).unwrap().tag.unwrap();

    tokio::time::sleep(Duration::from_millis(5_100)).await;
    assert!(next_package(&mut rx_b).is_some());

    // the original peer finally answers, late
    node.on_message(
        &conn_a,
        &response_frame("get_joint", &tag, json!({"joint": {}})),
    );
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(calls.lock().len(), 1);
    assert_eq!(conn_b.pending_request_count(), 0, "substitute copy cancelled");

    // the substitute answering afterwards is a no-op
    node.on_message(
        &conn_b,
        &response_frame("get_joint", &tag, json!({"joint": {}})),
    );
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(calls.lock().len(), 1, "no double resolution");
}

#[tokio::test(start_paused = true)]
async fn test_close_fails_non_reroutable_requests_immediately() {
    let node = P2pNode::new(DispatcherRole::Client, P2pConfig::default());
    let (conn, mut rx) = open_peer(&node, "hub-a:6615");
    let (handler, calls) = recording_handler();

    node.dispatcher().send_request(
        &conn,
        PackageType::Request,
        "get_witnesses",
        &json!({}),
        false,
        handler,
    );
    assert!(next_package(&mut rx).is_some());

    tokio::time::sleep(Duration::from_secs(1)).await;
    node.on_connection_closed(&conn);

    // resolved in the same turn as the close, not after the 300s timer
    assert_eq!(
        calls.lock().as_slice(),
        [RequestOutcome::Failed(RequestFailure::ConnectionClosed)]
    );
    assert_eq!(conn.pending_request_count(), 0);

    // and the cancel timer never fires a second resolution
    tokio::time::sleep(Duration::from_secs(400)).await;
    assert_eq!(calls.lock().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_close_migrates_reroutable_requests_without_waiting() {
    let node = P2pNode::new(DispatcherRole::Client, P2pConfig::default());
    let (conn_a, mut rx_a) = open_peer(&node, "hub-a:6615");
    let (conn_b, mut rx_b) = open_peer(&node, "hub-b:6615");
    let (handler, calls) = recording_handler();

    node.dispatcher().send_request(
        &conn_a,
        PackageType::Request,
        "get_joint",
        &json!({"unit": "U1"}),
        true,
        handler,
    );
    let tag = next_package(&mut rx_a).unwrap().tag.unwrap();

    node.on_connection_closed(&conn_a);

    // rerouted immediately, no stall timer involved
    let moved = next_package(&mut rx_b).expect("request must migrate on close");
    assert_eq!(moved.tag.as_deref(), Some(tag.as_str()));
    assert!(calls.lock().is_empty(), "no error surfaced to the caller");
    // the closed connection keeps the migrated entry for correlation
    assert!(conn_a.has_pending_request(&tag));

    node.on_message(
        &conn_b,
        &response_frame("get_joint", &tag, json!({"joint": {}})),
    );
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(
        calls.lock().as_slice(),
        [RequestOutcome::Response(json!({"joint": {}}))]
    );
    assert_eq!(conn_a.pending_request_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_parked_request_is_retried_when_a_peer_appears() {
    let node = P2pNode::new(DispatcherRole::Client, P2pConfig::default());
    let (conn_a, mut rx_a) = open_peer(&node, "hub-a:6615");
    let (handler, calls) = recording_handler();

    node.dispatcher().send_request(
        &conn_a,
        PackageType::Request,
        "get_joint",
        &json!({"unit": "U1"}),
        true,
        handler,
    );
    let tag = next_package(&mut rx_a).unwrap().tag.unwrap();

    // only peer dies: the reroute finds no candidate and parks
    node.on_connection_closed(&conn_a);
    assert!(calls.lock().is_empty());
    assert!(conn_a.has_pending_request(&tag));

    // a new peer joining wakes the parked reroute
    let (conn_b, mut rx_b) = open_peer(&node, "hub-b:6615");
    let moved = next_package(&mut rx_b).expect("parked request retried on the new peer");
    assert_eq!(moved.tag.as_deref(), Some(tag.as_str()));

    node.on_message(
        &conn_b,
        &response_frame("get_joint", &tag, json!({"joint": {}})),
    );
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(calls.lock().len(), 1);
    assert_eq!(conn_a.pending_request_count(), 0, "original entry cleaned up");
    assert_eq!(conn_b.pending_request_count(), 0);
}

#[tokio::test]
async fn test_broadcast_reaches_every_connection() {
    let node = P2pNode::new(DispatcherRole::Client, P2pConfig::default());
    let (conn_a, mut rx_a) = open_peer(&node, "hub-a:6615");
    let (conn_b, mut rx_b) = open_peer(&node, "hub-b:6615");
    let (handler, calls) = recording_handler();

    assert!(node.dispatcher().send_broadcast_request(
        &[Arc::clone(&conn_a), Arc::clone(&conn_b)],
        PackageType::Request,
        "get_witnesses",
        &json!({}),
        false,
        handler,
    ));

    let sent_a = next_package(&mut rx_a).unwrap();
    let sent_b = next_package(&mut rx_b).unwrap();
    assert_eq!(sent_a.tag, sent_b.tag, "same logical request, same tag");

    // each peer answers its own copy; the shared handler fires per peer
    let tag = sent_a.tag.unwrap();
    node.on_message(
        &conn_a,
        &response_frame("get_witnesses", &tag, json!({"witnesses": ["W1"]})),
    );
    node.on_message(
        &conn_b,
        &response_frame("get_witnesses", &tag, json!({"witnesses": ["W1"]})),
    );
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(calls.lock().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_heartbeat_loop_pings_idle_connection() {
    let node = P2pNode::new(DispatcherRole::Client, P2pConfig::default());
    let (_conn, mut rx) = open_peer(&node, "hub-a:6615");
    node.start_heartbeat();

    // interval 3s (+ up to 1s jitter), idle threshold 10s: by 15s the
    // loop must have pinged
    tokio::time::sleep(Duration::from_secs(15)).await;
    node.stop_heartbeat();

    let mut saw_ping = false;
    while let Ok(frame) = rx.try_recv() {
        if let OutboundFrame::Message(bytes) = frame {
            let package = Package::decode(&bytes).unwrap();
            if package.package_type == PackageType::Ping {
                saw_ping = true;
            }
        }
    }
    assert!(saw_ping, "idle connection must be pinged");
}

//! End-to-end routing scenarios on the in-memory mesh.

use std::sync::mpsc;
use std::sync::Arc;
use std::time::{Duration, Instant};

use xornet::config::{Config, MAX_SEND_ATTEMPTS, NODE_GROUP_SIZE};
use xornet::messages::{ClosestNodesUpdate, Message, MessageType, Subscribe};
use xornet::router::{admit_peer, Router};
use xornet::transport::memory::Mesh;
use xornet::transport::{MessageReceived, Transport};
use xornet::{Id, NodeInfo, ID_SIZE};

fn id_with_first_bytes(bytes: &[u8]) -> Id {
    let mut raw = [0u8; ID_SIZE];
    raw[..bytes.len()].copy_from_slice(bytes);
    Id(raw)
}

/// A full routing node on the mesh, plus the channel its application
/// functor delivers into.
struct TestNode {
    router: Router,
    delivered: mpsc::Receiver<Vec<u8>>,
}

fn spawn_node(mesh: &Mesh, id: Id) -> TestNode {
    let transport = Arc::new(mesh.endpoint(id));
    let router = Router::new(id, transport, Config::default());

    router.set_request_public_key_functor(Arc::new(|_, callback| {
        let key = ed25519_dalek_key();
        callback(Some(key));
    }));

    let (tx, rx) = mpsc::channel();
    router.set_message_received_functor(Arc::new(move |payload, _claim, _cacheable, _reply| {
        let _ = tx.send(payload);
    }));

    // No live endpoints yet; this still registers the inbound callbacks
    // on the mesh.
    let _ = router.join(&[]);

    TestNode {
        router,
        delivered: rx,
    }
}

fn ed25519_dalek_key() -> ed25519_dalek::VerifyingKey {
    ed25519_dalek::SigningKey::from_bytes(&[1u8; 32]).verifying_key()
}

/// A passive mesh endpoint that records every frame it receives.
fn spawn_listener(mesh: &Mesh, id: Id) -> mpsc::Receiver<Vec<u8>> {
    let transport = mesh.endpoint(id);
    let (tx, rx) = mpsc::channel();
    let on_message: MessageReceived = Arc::new(move |bytes| {
        let _ = tx.send(bytes);
    });
    let _ = transport.bootstrap(&[], on_message, Arc::new(|_| {}));
    rx
}

fn vault_peer(id: Id) -> NodeInfo {
    let mut node = NodeInfo::random();
    node.node_id = id;
    node.connection_id = id;
    node
}

fn recv_message(rx: &mpsc::Receiver<Vec<u8>>, timeout: Duration) -> Option<Message> {
    rx.recv_timeout(timeout)
        .ok()
        .map(|bytes| Message::from_bytes(&bytes).expect("mesh frames are whole messages"))
}

/// Drains frames until one matches, or the timeout passes.
fn recv_matching(
    rx: &mpsc::Receiver<Vec<u8>>,
    timeout: Duration,
    predicate: impl Fn(&Message) -> bool,
) -> Option<Message> {
    let deadline = Instant::now() + timeout;
    while let Some(remaining) = deadline.checked_duration_since(Instant::now()) {
        match recv_message(rx, remaining) {
            Some(message) if predicate(&message) => return Some(message),
            Some(_) => continue,
            None => break,
        }
    }
    None
}

// === S1: direct-to-self ===

#[test]
fn direct_to_self_is_consumed_locally() {
    let mesh = Mesh::new();
    let node = spawn_node(&mesh, id_with_first_bytes(&[0x42]));
    let this_node = *node.router.node_id();

    // A ping addressed to our own id is consumed by the ping service;
    // with no peers there is nobody to talk to afterwards.
    let mut ping = Message::request(MessageType::Ping, this_node);
    ping.id = 0xF000_0064;
    ping.source_id = Some(this_node);
    node.router.handle_inbound(ping);

    // An application request to our own id makes the full local round
    // trip: delivery, reply, timer completion.
    let (reply_tx, reply_rx) = mpsc::channel();
    node.router.set_message_received_functor(Arc::new(
        move |payload, _claim, _cacheable, reply| {
            assert_eq!(payload, b"to-myself".to_vec());
            reply(b"from-myself".to_vec());
        },
    ));
    node.router
        .send(
            this_node,
            b"to-myself".to_vec(),
            1,
            true,
            false,
            Some(Box::new(move |result| {
                let _ = reply_tx.send(result);
            })),
            Some(Duration::from_secs(5)),
        )
        .unwrap();

    let reply = reply_rx.recv_timeout(Duration::from_secs(2)).unwrap();
    assert_eq!(reply.unwrap(), b"from-myself".to_vec());
}

// === S2: simple forward ===

#[test]
fn forward_chooses_the_closer_peer() {
    let mesh = Mesh::new();
    let a_id = id_with_first_bytes(&[0x00, 0x01]);
    let b_id = id_with_first_bytes(&[0x10]);
    let c_id = id_with_first_bytes(&[0xf0]);
    let destination = id_with_first_bytes(&[0x12]);

    let a = spawn_node(&mesh, a_id);
    let b_rx = spawn_listener(&mesh, b_id);
    let c_rx = spawn_listener(&mesh, c_id);
    mesh.link(&a_id, &b_id);
    mesh.link(&a_id, &c_id);

    assert!(admit_peer(&a.router, vault_peer(b_id), false));
    assert!(admit_peer(&a.router, vault_peer(c_id), false));

    let mut message = Message::request(MessageType::NodeLevel, destination);
    message.id = 0xF000_0200;
    message.source_id = Some(c_id);
    message.hops_to_live = 8;
    message.data = vec![b"application-payload".to_vec()];

    a.router.handle_inbound(message);

    let forwarded = recv_matching(&b_rx, Duration::from_secs(2), |message| {
        message.id == 0xF000_0200
    })
    .expect("B is strictly closer to the destination");

    assert_eq!(forwarded.data, vec![b"application-payload".to_vec()]);
    assert_eq!(forwarded.hops_to_live, 7);
    assert_eq!(forwarded.route_history, vec![a_id]);

    assert!(
        recv_matching(&c_rx, Duration::from_millis(300), |message| message.id == 0xF000_0200).is_none(),
        "the further peer must not see the message"
    );
}

// === S3: group fan-out ===

#[test]
fn group_leader_replicates_to_next_closest_peers() {
    let mesh = Mesh::new();
    let leader_id = id_with_first_bytes(&[0x00, 0x01]);
    let destination = id_with_first_bytes(&[0x01]);

    let leader = spawn_node(&mesh, leader_id);

    let peer_ids: Vec<Id> = (0u8..5)
        .map(|i| id_with_first_bytes(&[0x20 + i * 0x18]))
        .collect();
    let receivers: Vec<mpsc::Receiver<Vec<u8>>> = peer_ids
        .iter()
        .map(|id| {
            let rx = spawn_listener(&mesh, *id);
            mesh.link(&leader_id, id);
            assert!(admit_peer(&leader.router, vault_peer(*id), false));
            rx
        })
        .collect();

    let mut message = Message::request(MessageType::NodeLevel, destination);
    message.id = 0xF000_0300;
    message.source_id = Some(peer_ids[4]);
    message.direct = false;
    message.visited = true;
    message.replication = NODE_GROUP_SIZE as u16;
    message.data = vec![b"group-data".to_vec()];

    leader.router.handle_inbound(message);

    // One local delivery as a replicant.
    assert_eq!(
        leader
            .delivered
            .recv_timeout(Duration::from_secs(2))
            .unwrap(),
        b"group-data".to_vec()
    );

    // Exactly replication - 1 rewritten direct copies land on the
    // next-closest peers.
    let mut replicas = 0;
    for (peer_id, rx) in peer_ids.iter().zip(receivers.iter()) {
        if let Some(replica) = recv_matching(rx, Duration::from_millis(500), |message| {
            message.id == 0xF000_0300
        }) {
            assert!(replica.is_direct());
            assert_eq!(replica.destination_id, Some(*peer_id));
            assert_eq!(replica.data, vec![b"group-data".to_vec()]);
            replicas += 1;
        }
    }
    assert_eq!(replicas, NODE_GROUP_SIZE - 1);
}

// === S4: retry and eviction ===

#[test]
fn send_failures_evict_the_peer_and_reroute() {
    let mesh = Mesh::new();
    let a_id = id_with_first_bytes(&[0x00, 0x01]);
    let b_id = id_with_first_bytes(&[0x08]);
    let c_id = id_with_first_bytes(&[0x09]);
    let destination = id_with_first_bytes(&[0x08, 0x80]);

    let a = spawn_node(&mesh, a_id);
    let b_rx = spawn_listener(&mesh, b_id);
    let c_rx = spawn_listener(&mesh, c_id);
    mesh.link(&a_id, &b_id);
    mesh.link(&a_id, &c_id);

    assert!(admit_peer(&a.router, vault_peer(b_id), false));
    assert!(admit_peer(&a.router, vault_peer(c_id), false));

    // Every attempt toward B fails transiently.
    mesh.fail_sends(a_id, b_id, MAX_SEND_ATTEMPTS + 2);

    let mut message = Message::request(MessageType::NodeLevel, destination);
    message.id = 0xF000_0400;
    message.source_id = Some(c_id);
    message.visited = true;

    let started = Instant::now();
    a.router.handle_inbound(message);

    // The message eventually lands on the backup peer.
    let rerouted = recv_matching(&c_rx, Duration::from_secs(5), |message| message.id == 0xF000_0400)
        .expect("message must be re-routed after eviction");
    assert_eq!(rerouted.destination_id, Some(destination));

    // Two 50ms backoffs happened before the eviction.
    assert!(started.elapsed() >= Duration::from_millis(100));

    // B was evicted from the routing table.
    assert!(!a
        .router
        .routing_table()
        .lock()
        .unwrap()
        .is_connected(&b_id));
    assert!(
        recv_matching(&b_rx, Duration::from_millis(200), |message| message.id == 0xF000_0400).is_none()
    );
}

// === S5: loop avoidance ===

#[test]
fn route_history_suppresses_loops() {
    let mesh = Mesh::new();
    let a_id = id_with_first_bytes(&[0x00, 0x01]);
    let b_id = id_with_first_bytes(&[0x08]);
    let c_id = id_with_first_bytes(&[0x0c]);
    let destination = id_with_first_bytes(&[0x08, 0x80]);

    let a = spawn_node(&mesh, a_id);
    let b_rx = spawn_listener(&mesh, b_id);
    let c_rx = spawn_listener(&mesh, c_id);
    mesh.link(&a_id, &b_id);
    mesh.link(&a_id, &c_id);

    assert!(admit_peer(&a.router, vault_peer(b_id), false));
    assert!(admit_peer(&a.router, vault_peer(c_id), false));

    // B already forwarded this message; it must go to C even though B is
    // closer to the destination.
    let mut message = Message::request(MessageType::NodeLevel, destination);
    message.id = 0xF000_0500;
    message.source_id = Some(b_id);
    message.visited = true;
    message.route_history = vec![b_id, a_id];

    a.router.handle_inbound(message);

    let forwarded = recv_matching(&c_rx, Duration::from_secs(2), |message| message.id == 0xF000_0500)
        .expect("message must forward to a peer outside the route history");
    assert!(forwarded.route_history.contains(&a_id));
    assert!(
        recv_matching(&b_rx, Duration::from_millis(300), |message| message.id == 0xF000_0500).is_none()
    );

    // With every peer in the history, the message is abandoned.
    let mut stuck = Message::request(MessageType::NodeLevel, destination);
    stuck.id = 0xF000_0501;
    stuck.source_id = Some(b_id);
    stuck.visited = true;
    stuck.route_history = vec![b_id, c_id, a_id];

    a.router.handle_inbound(stuck);

    assert!(
        recv_matching(&b_rx, Duration::from_millis(300), |message| message.id == 0xF000_0501).is_none()
    );
    assert!(
        recv_matching(&c_rx, Duration::from_millis(300), |message| message.id == 0xF000_0501).is_none()
    );
}

// === S6: subscribe / update coherence ===

#[test]
fn eviction_propagates_new_close_group_to_subscribers() {
    let mesh = Mesh::new();
    let x_id = id_with_first_bytes(&[0x00, 0x01]);
    let x = spawn_node(&mesh, x_id);

    // Nine peers; the eight closest form X's close group.
    let peer_ids: Vec<Id> = (1u8..10).map(|i| id_with_first_bytes(&[i * 0x10])).collect();
    let receivers: Vec<mpsc::Receiver<Vec<u8>>> = peer_ids
        .iter()
        .map(|id| {
            let rx = spawn_listener(&mesh, *id);
            mesh.link(&x_id, id);
            assert!(admit_peer(&x.router, vault_peer(*id), false));
            rx
        })
        .collect();

    let closest = peer_ids[0];
    let subscriber = peer_ids[8];
    let subscriber_rx = &receivers[8];

    // The furthest peer subscribes to X's group updates.
    let mut subscribe = Message::request(MessageType::ClosestNodesUpdateSubscribe, x_id);
    subscribe.id = 0xF000_0600;
    subscribe.source_id = Some(subscriber);
    subscribe.data = vec![Subscribe {
        peer: subscriber,
        subscribe: true,
    }
    .to_bytes()
    .unwrap()];
    x.router.handle_inbound(subscribe);

    // It receives the initial close group, which contains the closest
    // peer but not itself.
    let initial = recv_matching(subscriber_rx, Duration::from_secs(2), |message| {
        message.message_type == MessageType::ClosestNodesUpdate
    })
    .expect("subscriber must receive the initial update");
    let initial = ClosestNodesUpdate::from_bytes(&initial.data[0]).unwrap();
    assert!(initial
        .nodes_info
        .iter()
        .any(|info| info.node_id == closest));

    // The closest peer of X goes away.
    x.router.handle_connection_lost(closest);
    assert!(!x
        .router
        .routing_table()
        .lock()
        .unwrap()
        .is_connected(&closest));

    // Every subscriber hears the new close group, which now includes
    // the former ninth peer and no longer the lost one.
    let update = recv_matching(subscriber_rx, Duration::from_secs(2), |message| {
        message.message_type == MessageType::ClosestNodesUpdate
            && ClosestNodesUpdate::from_bytes(&message.data[0])
                .map(|update| !update.nodes_info.iter().any(|info| info.node_id == closest))
                .unwrap_or(false)
    })
    .expect("subscriber must receive the post-eviction update");
    let update = ClosestNodesUpdate::from_bytes(&update.data[0]).unwrap();
    assert!(update
        .nodes_info
        .iter()
        .any(|info| info.node_id == subscriber));

    // The evicted ex-member is told to drop its subscription state.
    let unsubscribe = recv_matching(&receivers[0], Duration::from_secs(2), |message| {
        message.message_type == MessageType::ClosestNodesUpdateSubscribe
            && Subscribe::from_bytes(&message.data[0])
                .map(|subscribe| !subscribe.subscribe)
                .unwrap_or(false)
    });
    assert!(unsubscribe.is_some(), "ex-member must receive an unsubscribe");
}

// === Two live routers: request/response over the mesh ===

#[test]
fn request_and_reply_across_two_nodes() {
    let mesh = Mesh::new();
    let a_id = id_with_first_bytes(&[0x00, 0x01]);
    let b_id = id_with_first_bytes(&[0x80]);

    let a = spawn_node(&mesh, a_id);
    let b = spawn_node(&mesh, b_id);
    mesh.link(&a_id, &b_id);

    assert!(admit_peer(&a.router, vault_peer(b_id), false));
    assert!(admit_peer(&b.router, vault_peer(a_id), false));

    b.router.set_message_received_functor(Arc::new(
        move |payload, _claim, _cacheable, reply| {
            assert_eq!(payload, b"ping-app".to_vec());
            reply(b"pong-app".to_vec());
        },
    ));

    let (tx, rx) = mpsc::channel();
    a.router
        .send(
            b_id,
            b"ping-app".to_vec(),
            1,
            true,
            false,
            Some(Box::new(move |result| {
                let _ = tx.send(result);
            })),
            Some(Duration::from_secs(5)),
        )
        .unwrap();

    let result = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(result.unwrap(), b"pong-app".to_vec());

    // Silence unused warnings for delivery channels we did not need.
    let _ = &a.delivered;
    let _ = &b.delivered;
}

#[test]
fn response_timeout_fires_when_peer_never_answers() {
    let mesh = Mesh::new();
    let a_id = id_with_first_bytes(&[0x00, 0x01]);
    let b_id = id_with_first_bytes(&[0x80]);

    let a = spawn_node(&mesh, a_id);
    // B listens but never replies.
    let _b_rx = spawn_listener(&mesh, b_id);
    mesh.link(&a_id, &b_id);
    assert!(admit_peer(&a.router, vault_peer(b_id), false));

    let (tx, rx) = mpsc::channel();
    a.router
        .send(
            b_id,
            b"anyone-there".to_vec(),
            1,
            true,
            false,
            Some(Box::new(move |result| {
                let _ = tx.send(result);
            })),
            Some(Duration::from_millis(100)),
        )
        .unwrap();

    let result = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert!(result.is_err(), "the pending response must time out");
}

#[test]
fn stop_cancels_pending_responses() {
    let mesh = Mesh::new();
    let a_id = id_with_first_bytes(&[0x00, 0x01]);
    let b_id = id_with_first_bytes(&[0x80]);

    let a = spawn_node(&mesh, a_id);
    let _b_rx = spawn_listener(&mesh, b_id);
    mesh.link(&a_id, &b_id);
    assert!(admit_peer(&a.router, vault_peer(b_id), false));

    let (tx, rx) = mpsc::channel();
    a.router
        .send(
            b_id,
            b"never-answered".to_vec(),
            1,
            true,
            false,
            Some(Box::new(move |result| {
                let _ = tx.send(result);
            })),
            Some(Duration::from_secs(60)),
        )
        .unwrap();

    a.router.stop();

    let result = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert!(result.is_err(), "shutdown must cancel the pending response");
}

//! Services answering inbound routing rpcs.
//!
//! Requests land here from the message handler's classification; each
//! service either mutates local state, replies, or both. Peer admission
//! and removal run through this module so that every topology change
//! fires the same group-matrix bookkeeping.

use std::sync::{Arc, Mutex};

use ed25519_dalek::VerifyingKey;
use tracing::{debug, info, trace, warn};

use crate::client_table::ClientTable;
use crate::common::{Id, NodeInfo};
use crate::config::{MAX_ROUTING_TABLE_SIZE, NODE_GROUP_SIZE};
use crate::group_change::GroupChangeHandler;
use crate::group_matrix::MatrixChange;
use crate::messages::{Connect, ConnectSuccess, FindNodes, FoundNodes, Message, Remove};
use crate::network::Network;
use crate::routing_table::RoutingTable;
use crate::rpcs;

/// Asks the embedding application for a peer's validated public key.
pub type RequestPublicKeyFunctor =
    Arc<dyn Fn(Id, Box<dyn FnOnce(Option<VerifyingKey>) + Send>) + Send + Sync>;

/// Reports group-matrix membership changes to the application.
pub type MatrixChangedFunctor = Arc<dyn Fn(MatrixChange) + Send + Sync>;

/// Cheaply clonable handle; all shared state sits behind locks.
#[derive(Clone)]
pub struct Service {
    this_node: Id,
    this_connection: Id,
    client_mode: bool,
    routing_table: Arc<Mutex<RoutingTable>>,
    client_table: Arc<Mutex<ClientTable>>,
    network: Network,
    group_change: Arc<GroupChangeHandler>,
    request_public_key: Arc<Mutex<Option<RequestPublicKeyFunctor>>>,
    matrix_changed: Arc<Mutex<Option<MatrixChangedFunctor>>>,
}

impl Service {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        this_node: Id,
        this_connection: Id,
        client_mode: bool,
        routing_table: Arc<Mutex<RoutingTable>>,
        client_table: Arc<Mutex<ClientTable>>,
        network: Network,
        group_change: Arc<GroupChangeHandler>,
    ) -> Service {
        Service {
            this_node,
            this_connection,
            client_mode,
            routing_table,
            client_table,
            network,
            group_change,
            request_public_key: Arc::new(Mutex::new(None)),
            matrix_changed: Arc::new(Mutex::new(None)),
        }
    }

    pub fn set_request_public_key_functor(&self, functor: RequestPublicKeyFunctor) {
        *self.request_public_key.lock().unwrap() = Some(functor);
    }

    pub fn set_matrix_changed_functor(&self, functor: MatrixChangedFunctor) {
        *self.matrix_changed.lock().unwrap() = Some(functor);
    }

    // === Rpc services ===

    /// Liveness probe; echoes the payload back to the source.
    pub fn ping(&self, message: &Message) {
        trace!(from = ?message.source_id, message_id = message.id, "Ping");
        let echo = message.data.first().cloned().unwrap_or_default();
        self.send_response(Message::response_to(message, echo, self.this_node));
    }

    /// Answers with the ids closest to the requested target, including
    /// our own when it qualifies.
    pub fn find_nodes(&self, message: &Message) {
        let Some(request) = message
            .data
            .first()
            .and_then(|bytes| FindNodes::from_bytes(bytes).ok())
        else {
            warn!(message_id = message.id, "Malformed find-nodes request");
            return;
        };

        let count = (request.count as usize).clamp(1, MAX_ROUTING_TABLE_SIZE);
        let mut ids: Vec<Id> = {
            let table = self.routing_table.lock().unwrap();
            table
                .closest_nodes(&request.target, count)
                .iter()
                .map(|node| node.node_id)
                .collect()
        };
        ids.push(self.this_node);
        ids.sort_by(|a, b| {
            if Id::closer_to_target(a, b, &request.target) {
                std::cmp::Ordering::Less
            } else {
                std::cmp::Ordering::Greater
            }
        });
        ids.truncate(count);

        let found = FoundNodes {
            target: request.target,
            nodes: ids,
        };
        let Ok(payload) = found.to_bytes() else {
            return;
        };
        trace!(
            target = ?request.target,
            count = found.nodes.len(),
            message_id = message.id,
            "Answering find-nodes"
        );
        self.send_response(Message::response_to(message, payload, self.this_node));
    }

    /// Connect handshake: open a transport connection toward the
    /// requester and answer with our own endpoints.
    pub fn connect(&self, message: &Message) {
        let Some(request) = message
            .data
            .first()
            .and_then(|bytes| Connect::from_bytes(bytes).ok())
        else {
            warn!(message_id = message.id, "Malformed connect request");
            return;
        };

        if request.node_id == self.this_node || request.node_id.is_zero() {
            return;
        }

        if !request.client
            && !self
                .routing_table
                .lock()
                .unwrap()
                .would_accept(&request.node_id)
        {
            debug!(peer = ?request.node_id, "Connect refused; no room for peer");
            return;
        }

        let Some(our_endpoints) = self.network.available_endpoint(&request.node_id) else {
            debug!(peer = ?request.node_id, "No available endpoint for peer");
            return;
        };

        let Some(peer_endpoints) = parse_endpoints(&request) else {
            warn!(peer = ?request.node_id, "Connect request with unparsable endpoints");
            return;
        };

        self.network.add_connection(
            request.connection_id,
            peer_endpoints,
            self.this_node.to_vec(),
        );

        let reply = Connect {
            node_id: self.this_node,
            connection_id: self.this_connection,
            nat_symmetric: false,
            endpoint_local: our_endpoints.local.to_string(),
            endpoint_external: our_endpoints.external.to_string(),
            client: self.client_mode,
        };
        let Ok(payload) = reply.to_bytes() else {
            return;
        };
        info!(peer = ?request.node_id, message_id = message.id, "Accepted connect request");
        self.send_response(Message::response_to(message, payload, self.this_node));
    }

    /// The peer reports the transport link is live; validate its key,
    /// admit it, and acknowledge.
    pub fn connect_success(&self, message: &Message) {
        let Some(report) = message
            .data
            .first()
            .and_then(|bytes| ConnectSuccess::from_bytes(bytes).ok())
        else {
            warn!(message_id = message.id, "Malformed connect-success");
            return;
        };
        if report.node_id.is_zero() || report.node_id == self.this_node {
            return;
        }

        let node =
            NodeInfo::new(report.node_id).with_connection_id(report.connection_id);
        let service = self.clone();
        let client = report.client;

        self.with_validated_key(node, move |node| {
            let peer_id = node.node_id;
            let peer_connection = node.connection_id;

            let admitted = if client {
                service.admit_client_peer(node)
            } else {
                service.admit_vault_peer(node)
            };
            if !admitted {
                return;
            }

            match rpcs::connect_success_acknowledgement(
                peer_id,
                service.this_node,
                service.this_connection,
                service.client_mode,
            ) {
                Ok(ack) => service.network.send_to_direct(&ack, peer_id, peer_connection),
                Err(error) => warn!(?error, "Failed to build acknowledgement"),
            }
        });
    }

    /// Furthest-node eviction request: drop the sender when it really is
    /// our furthest peer, and report our own furthest entries either way.
    pub fn remove_request(&self, message: &Message) {
        if message
            .data
            .first()
            .and_then(|bytes| Remove::from_bytes(bytes).ok())
            .is_none()
        {
            warn!(message_id = message.id, "Malformed remove request");
            return;
        }
        let Some(source) = message.source_id else {
            return;
        };

        let (source_info, furthest, furthest_ids) = {
            let table = self.routing_table.lock().unwrap();
            let mut nodes = table.to_vec();
            nodes.reverse();
            let furthest_ids: Vec<Id> = nodes
                .iter()
                .filter(|node| node.node_id != source)
                .take(NODE_GROUP_SIZE)
                .map(|node| node.node_id)
                .collect();
            (
                table.get_node_info(&source),
                table.furthest_node(),
                furthest_ids,
            )
        };
        let evict = furthest
            .as_ref()
            .map(|node| node.node_id == source)
            .unwrap_or(false);

        let reply = Remove {
            peer_id: source,
            furthest: furthest_ids,
        };
        let Ok(payload) = reply.to_bytes() else {
            return;
        };
        // Answer synchronously over the still-live connection; the
        // teardown below must not outrun the reply.
        let response = Message::response_to(message, payload, self.this_node);
        match &source_info {
            Some(info) => self.network.send_now(&response, info.node_id, info.connection_id),
            None => self.send_response(response),
        }

        if evict {
            let node = furthest.expect("checked above");
            info!(peer = ?source, "Evicting furthest peer on request");
            self.network.remove_connection(&node.connection_id);
            self.drop_vault_peer(&node.node_id);
        } else {
            debug!(peer = ?source, "Remove request from peer that is not our furthest");
        }
    }

    /// The evicted side of the handshake only learns who else is far.
    pub fn remove_response(&self, message: &Message) {
        let Some(reply) = message
            .data
            .first()
            .and_then(|bytes| Remove::from_bytes(bytes).ok())
        else {
            warn!(message_id = message.id, "Malformed remove response");
            return;
        };
        debug!(
            from = ?message.source_id,
            furthest = reply.furthest.len(),
            "Remove response received"
        );
    }

    // === Peer admission / removal ===

    /// Admits a vault peer and runs every side effect a topology change
    /// owes: matrix row sync, subscriber updates, eviction teardown.
    pub fn admit_vault_peer(&self, node: NodeInfo) -> bool {
        let peer_id = node.node_id;
        let (old_group, old_unique) = self.group_snapshot();

        let outcome = self.routing_table.lock().unwrap().add(node);
        let evicted = match outcome {
            Ok(evicted) => evicted,
            Err(reason) => {
                debug!(peer = ?peer_id, %reason, "Vault peer not admitted");
                return false;
            }
        };

        info!(peer = ?peer_id, "Added vault peer to routing table");

        if let Some(evicted) = evicted {
            debug!(peer = ?evicted.node_id, "Evicted to make room");
            self.network.remove_connection(&evicted.connection_id);
            self.group_change.remove_subscriber(&evicted.node_id);
        }

        self.after_topology_change(old_group, old_unique);
        true
    }

    /// Admits a client peer; clients never touch the matrix.
    pub fn admit_client_peer(&self, node: NodeInfo) -> bool {
        let peer_id = node.node_id;
        let is_vault = self.routing_table.lock().unwrap().is_connected(&peer_id);

        match self.client_table.lock().unwrap().add(node, is_vault) {
            Ok(()) => {
                info!(client = ?peer_id, "Added client peer");
                true
            }
            Err(reason) => {
                debug!(client = ?peer_id, %reason, "Client peer not admitted");
                false
            }
        }
    }

    /// Removes a vault peer and runs the topology side effects.
    pub fn drop_vault_peer(&self, node_id: &Id) -> Option<NodeInfo> {
        let (old_group, old_unique) = self.group_snapshot();

        let removed = self.routing_table.lock().unwrap().drop_node(node_id)?;
        self.group_change.remove_subscriber(node_id);
        self.after_topology_change(old_group, old_unique);

        Some(removed)
    }

    // === Private Methods ===

    fn group_snapshot(&self) -> (Vec<NodeInfo>, Vec<Id>) {
        let table = self.routing_table.lock().unwrap();
        let unique = table
            .matrix()
            .unique_nodes()
            .iter()
            .map(|node| node.node_id)
            .collect();
        (table.own_close_group(), unique)
    }

    fn after_topology_change(&self, old_group: Vec<NodeInfo>, old_unique: Vec<Id>) {
        let (new_group, new_unique) = self.group_snapshot();

        let group_changed = old_group.len() != new_group.len()
            || old_group
                .iter()
                .zip(new_group.iter())
                .any(|(a, b)| a.node_id != b.node_id);
        if group_changed {
            self.group_change.close_group_changed(&old_group, &new_group);
        }

        let change = MatrixChange::new(self.this_node, old_unique, new_unique);
        if !change.is_empty() {
            let functor = self.matrix_changed.lock().unwrap().clone();
            if let Some(functor) = functor {
                functor(change);
            }
        }
    }

    pub(crate) fn with_validated_key(
        &self,
        node: NodeInfo,
        then: impl FnOnce(NodeInfo) + Send + 'static,
    ) {
        let functor = self.request_public_key.lock().unwrap().clone();
        let Some(functor) = functor else {
            warn!(peer = ?node.node_id, "No public key functor; dropping peer");
            return;
        };

        let peer_id = node.node_id;
        functor(
            peer_id,
            Box::new(move |key| match key {
                Some(key) => then(node.with_public_key(key)),
                None => warn!(peer = ?peer_id, "Public key validation failed"),
            }),
        );
    }

    /// Routes a response the way the original tail of every service
    /// does: through the bootstrap connection while the table is empty,
    /// toward the closest peer otherwise.
    fn send_response(&self, response: Message) {
        if self.routing_table.lock().unwrap().is_empty() {
            if let Some(bootstrap) = self.network.bootstrap_connection_id() {
                self.network.send_to_direct(&response, bootstrap, bootstrap);
                return;
            }
        }
        self.network.send_to_closest(response);
    }
}

fn parse_endpoints(connect: &Connect) -> Option<crate::transport::EndpointPair> {
    Some(crate::transport::EndpointPair {
        local: connect.endpoint_local.parse().ok()?,
        external: connect.endpoint_external.parse().ok()?,
    })
}

#[cfg(test)]
mod test {
    use std::sync::mpsc;
    use std::time::Duration;

    use crate::messages::MessageType;
    use crate::transport::memory::Mesh;
    use crate::transport::{MessageReceived, Transport};

    use super::*;

    struct Fixture {
        mesh: Mesh,
        this_node: Id,
        routing_table: Arc<Mutex<RoutingTable>>,
        service: Service,
    }

    fn fixture() -> Fixture {
        let mesh = Mesh::new();
        let this_node = Id::zero();
        let transport = Arc::new(mesh.endpoint(this_node));
        let _ = transport.bootstrap(&[], Arc::new(|_| {}), Arc::new(|_| {}));

        let routing_table = Arc::new(Mutex::new(RoutingTable::new(this_node)));
        let client_table = Arc::new(Mutex::new(ClientTable::new(this_node)));
        let network = Network::new(
            this_node,
            routing_table.clone(),
            client_table.clone(),
            transport,
            2,
        );
        let group_change = GroupChangeHandler::new(routing_table.clone(), network.clone());
        let service = Service::new(
            this_node,
            this_node,
            false,
            routing_table.clone(),
            client_table,
            network,
            group_change,
        );
        service.set_request_public_key_functor(Arc::new(|_, callback| {
            let key = ed25519_dalek::SigningKey::from_bytes(&[7u8; 32]).verifying_key();
            callback(Some(key));
        }));

        Fixture {
            mesh,
            this_node,
            routing_table,
            service,
        }
    }

    fn peer_on_mesh(fix: &Fixture, first_byte: u8) -> (NodeInfo, mpsc::Receiver<Vec<u8>>) {
        let mut bytes = [0u8; crate::common::ID_SIZE];
        bytes[0] = first_byte;
        let id = Id(bytes);

        let transport = fix.mesh.endpoint(id);
        let (tx, rx) = mpsc::channel();
        let on_message: MessageReceived = Arc::new(move |bytes| {
            let _ = tx.send(bytes);
        });
        let _ = transport.bootstrap(&[], on_message, Arc::new(|_| {}));
        fix.mesh.link(&fix.this_node, &id);

        let mut node = NodeInfo::random();
        node.node_id = id;
        node.connection_id = id;

        (node, rx)
    }

    #[test]
    fn ping_echoes_to_source() {
        let fix = fixture();
        let (peer, rx) = peer_on_mesh(&fix, 0x10);
        fix.routing_table
            .lock()
            .unwrap()
            .add(peer.clone())
            .unwrap();

        let mut ping = rpcs::ping(fix.this_node, peer.node_id);
        ping.data = vec![b"probe".to_vec()];
        fix.service.ping(&ping);

        let bytes = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        let pong = Message::from_bytes(&bytes).unwrap();
        assert_eq!(pong.message_type, MessageType::Ping);
        assert!(pong.is_response());
        assert_eq!(pong.id, ping.id);
        assert_eq!(pong.data, vec![b"probe".to_vec()]);
    }

    #[test]
    fn find_nodes_returns_sorted_ids_including_self() {
        let fix = fixture();
        let (peer, rx) = peer_on_mesh(&fix, 0x80);
        fix.routing_table
            .lock()
            .unwrap()
            .add(peer.clone())
            .unwrap();

        // Target right next to our own (zero) id; we are the closest.
        let mut target = [0u8; crate::common::ID_SIZE];
        target[crate::common::ID_SIZE - 1] = 1;
        let request = rpcs::find_nodes(Id(target), peer.node_id, 8).unwrap();

        fix.service.find_nodes(&request);

        let bytes = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        let response = Message::from_bytes(&bytes).unwrap();
        let found = FoundNodes::from_bytes(&response.data[0]).unwrap();

        assert_eq!(found.nodes[0], fix.this_node);
        assert!(found.nodes.contains(&peer.node_id));
    }

    #[test]
    fn connect_success_admits_peer_and_acknowledges() {
        let fix = fixture();
        let (peer, rx) = peer_on_mesh(&fix, 0x10);

        let mut report = rpcs::connect_success(fix.this_node, peer.node_id, peer.node_id, false)
            .unwrap();
        report.source_id = Some(peer.node_id);
        fix.service.connect_success(&report);

        // Admission side effects and the acknowledgement race on
        // separate queues; drain until the acknowledgement shows up.
        let mut saw_ack = false;
        while let Ok(bytes) = rx.recv_timeout(Duration::from_secs(2)) {
            let message = Message::from_bytes(&bytes).unwrap();
            if message.message_type == MessageType::ConnectSuccessAcknowledgement {
                saw_ack = true;
                break;
            }
        }
        assert!(saw_ack);

        assert!(fix
            .routing_table
            .lock()
            .unwrap()
            .is_connected(&peer.node_id));
    }

    #[test]
    fn connect_success_without_key_functor_drops_peer() {
        let fix = fixture();
        *fix.service.request_public_key.lock().unwrap() = None;
        let (peer, rx) = peer_on_mesh(&fix, 0x10);

        let report =
            rpcs::connect_success(fix.this_node, peer.node_id, peer.node_id, false).unwrap();
        fix.service.connect_success(&report);

        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
        assert!(!fix
            .routing_table
            .lock()
            .unwrap()
            .is_connected(&peer.node_id));
    }

    #[test]
    fn remove_request_evicts_only_genuine_furthest() {
        let fix = fixture();
        let (near, _near_rx) = peer_on_mesh(&fix, 0x01);
        let (far, far_rx) = peer_on_mesh(&fix, 0xf0);

        {
            let mut table = fix.routing_table.lock().unwrap();
            table.add(near.clone()).unwrap();
            table.add(far.clone()).unwrap();
        }

        // The far peer asks us to drop it.
        let request = rpcs::remove(fix.this_node, far.node_id).unwrap();
        fix.service.remove_request(&request);

        assert!(!fix.routing_table.lock().unwrap().is_connected(&far.node_id));
        assert!(fix.routing_table.lock().unwrap().is_connected(&near.node_id));

        // And it receives a response listing our remaining furthest.
        let mut saw_response = false;
        while let Ok(bytes) = far_rx.recv_timeout(Duration::from_secs(2)) {
            let message = Message::from_bytes(&bytes).unwrap();
            if message.message_type == MessageType::Remove && message.is_response() {
                saw_response = true;
                break;
            }
        }
        assert!(saw_response);
    }

    #[test]
    fn remove_request_from_near_peer_is_refused() {
        let fix = fixture();
        let (near, _rx) = peer_on_mesh(&fix, 0x01);
        let (far, _far_rx) = peer_on_mesh(&fix, 0xf0);

        {
            let mut table = fix.routing_table.lock().unwrap();
            table.add(near.clone()).unwrap();
            table.add(far.clone()).unwrap();
        }

        let request = rpcs::remove(fix.this_node, near.node_id).unwrap();
        fix.service.remove_request(&request);

        assert!(fix.routing_table.lock().unwrap().is_connected(&near.node_id));
        assert!(fix.routing_table.lock().unwrap().is_connected(&far.node_id));
    }

    #[test]
    fn admit_fires_matrix_changed_functor() {
        let fix = fixture();
        let (tx, rx) = mpsc::channel();
        fix.service
            .set_matrix_changed_functor(Arc::new(move |change| {
                let _ = tx.send(change);
            }));

        let (peer, _rx) = peer_on_mesh(&fix, 0x10);
        assert!(fix.service.admit_vault_peer(peer.clone()));

        let change = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(change.new_nodes, vec![peer.node_id]);
        assert!(change.lost_nodes.is_empty());
    }

    #[test]
    fn client_peers_never_enter_the_routing_table() {
        let fix = fixture();
        let (peer, _rx) = peer_on_mesh(&fix, 0x10);

        assert!(fix.service.admit_client_peer(peer.clone()));
        assert!(!fix
            .routing_table
            .lock()
            .unwrap()
            .is_connected(&peer.node_id));
    }
}

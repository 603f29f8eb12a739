//! Handling for responses to our own routing rpcs.

use std::sync::{Arc, Mutex};

use tracing::{debug, trace, warn};

use crate::common::{Id, NodeInfo};
use crate::messages::{Connect, ConnectSuccess, FoundNodes, Message};
use crate::network::Network;
use crate::routing_table::RoutingTable;
use crate::rpcs;
use crate::service::Service;

#[derive(Clone)]
pub struct ResponseHandler {
    this_node: Id,
    this_connection: Id,
    client_mode: bool,
    routing_table: Arc<Mutex<RoutingTable>>,
    network: Network,
    service: Service,
}

impl ResponseHandler {
    pub fn new(
        this_node: Id,
        this_connection: Id,
        client_mode: bool,
        routing_table: Arc<Mutex<RoutingTable>>,
        network: Network,
        service: Service,
    ) -> ResponseHandler {
        ResponseHandler {
            this_node,
            this_connection,
            client_mode,
            routing_table,
            network,
            service,
        }
    }

    // === Rpc responses ===

    /// A pong proves the peer alive; its rank climbs.
    pub fn ping(&self, message: &Message) {
        let Some(source) = message.source_id else {
            return;
        };
        let mut table = self.routing_table.lock().unwrap();
        if let Some(node) = table.get_node_info(&source) {
            table.update_rank(&source, node.rank.saturating_add(1));
            trace!(peer = ?source, "Pong received");
        }
    }

    /// The peer accepted our connect: open the transport link and report
    /// success so both sides admit each other.
    pub fn connect(&self, message: &Message) {
        let Some(reply) = message
            .data
            .first()
            .and_then(|bytes| Connect::from_bytes(bytes).ok())
        else {
            warn!(message_id = message.id, "Malformed connect response");
            return;
        };
        if reply.node_id.is_zero() || reply.node_id == self.this_node {
            return;
        }

        let endpoints = match (
            reply.endpoint_local.parse(),
            reply.endpoint_external.parse(),
        ) {
            (Ok(local), Ok(external)) => crate::transport::EndpointPair { local, external },
            _ => {
                warn!(peer = ?reply.node_id, "Connect response with unparsable endpoints");
                return;
            }
        };

        self.network
            .add_connection(reply.connection_id, endpoints, self.this_node.to_vec());

        match rpcs::connect_success(
            reply.node_id,
            self.this_node,
            self.this_connection,
            self.client_mode,
        ) {
            Ok(success) => {
                trace!(peer = ?reply.node_id, "Connect response; reporting success");
                self.network
                    .send_to_direct(&success, reply.node_id, reply.connection_id);
            }
            Err(error) => warn!(?error, "Failed to build connect-success"),
        }
    }

    /// Found nodes become connect attempts toward every id we still
    /// have room for.
    pub fn find_nodes(&self, message: &Message) {
        let Some(found) = message
            .data
            .first()
            .and_then(|bytes| FoundNodes::from_bytes(bytes).ok())
        else {
            warn!(message_id = message.id, "Malformed find-nodes response");
            return;
        };

        debug!(
            target = ?found.target,
            count = found.nodes.len(),
            "Find-nodes response"
        );

        for node_id in found.nodes {
            if node_id == self.this_node || node_id.is_zero() {
                continue;
            }
            {
                let table = self.routing_table.lock().unwrap();
                if table.is_connected(&node_id) || !table.would_accept(&node_id) {
                    continue;
                }
            }
            self.send_connect_towards(node_id);
        }
    }

    /// The peer acknowledged our success report; admit it on our side.
    pub fn connect_success_acknowledgement(&self, message: &Message) {
        let Some(report) = message
            .data
            .first()
            .and_then(|bytes| ConnectSuccess::from_bytes(bytes).ok())
        else {
            warn!(message_id = message.id, "Malformed acknowledgement");
            return;
        };
        if report.node_id.is_zero() || report.node_id == self.this_node {
            return;
        }

        let node = NodeInfo::new(report.node_id).with_connection_id(report.connection_id);
        let service = self.service.clone();
        let client = report.client;

        self.service.with_validated_key(node, move |node| {
            if client {
                service.admit_client_peer(node);
            } else {
                service.admit_vault_peer(node);
            }
        });
    }

    // === Private Methods ===

    fn send_connect_towards(&self, node_id: Id) {
        let Some(endpoints) = self.network.available_endpoint(&node_id) else {
            debug!(peer = ?node_id, "No endpoint available for connect");
            return;
        };

        let payload = Connect {
            node_id: self.this_node,
            connection_id: self.this_connection,
            nat_symmetric: false,
            endpoint_local: endpoints.local.to_string(),
            endpoint_external: endpoints.external.to_string(),
            client: self.client_mode,
        };

        let empty_table = self.routing_table.lock().unwrap().is_empty();
        let rpc = if empty_table {
            rpcs::connect_relay(node_id, self.this_node, self.this_connection, &payload)
        } else {
            rpcs::connect(node_id, self.this_node, &payload)
        };

        match rpc {
            Ok(rpc) => {
                if empty_table {
                    if let Some(bootstrap) = self.network.bootstrap_connection_id() {
                        self.network.send_to_direct(&rpc, bootstrap, bootstrap);
                    }
                } else {
                    self.network.send_to_closest(rpc);
                }
            }
            Err(error) => warn!(?error, "Failed to build connect rpc"),
        }
    }
}

#[cfg(test)]
mod test {
    use std::sync::mpsc;
    use std::time::Duration;

    use crate::client_table::ClientTable;
    use crate::group_change::GroupChangeHandler;
    use crate::messages::MessageType;
    use crate::transport::memory::Mesh;
    use crate::transport::{MessageReceived, Transport};

    use super::*;

    struct Fixture {
        mesh: Mesh,
        this_node: Id,
        routing_table: Arc<Mutex<RoutingTable>>,
        handler: ResponseHandler,
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
            network.clone(),
            group_change,
        );
        service.set_request_public_key_functor(Arc::new(|_, callback| {
            let key = ed25519_dalek::SigningKey::from_bytes(&[9u8; 32]).verifying_key();
            callback(Some(key));
        }));
        let handler = ResponseHandler::new(
            this_node,
            this_node,
            false,
            routing_table.clone(),
            network,
            service,
        );

        Fixture {
            mesh,
            this_node,
            routing_table,
            handler,
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
    fn pong_bumps_rank() {
        let fix = fixture();
        let (peer, _rx) = peer_on_mesh(&fix, 0x10);
        fix.routing_table
            .lock()
            .unwrap()
            .add(peer.clone())
            .unwrap();
        let before = fix
            .routing_table
            .lock()
            .unwrap()
            .get_node_info(&peer.node_id)
            .unwrap()
            .rank;

        let request = rpcs::ping(peer.node_id, fix.this_node);
        let pong = Message::response_to(&request, vec![], peer.node_id);
        fix.handler.ping(&pong);

        let after = fix
            .routing_table
            .lock()
            .unwrap()
            .get_node_info(&peer.node_id)
            .unwrap()
            .rank;
        assert_eq!(after, before + 1);
    }

    #[test]
    fn acknowledgement_admits_peer() {
        let fix = fixture();
        let (peer, _rx) = peer_on_mesh(&fix, 0x10);

        let request = rpcs::connect_success_acknowledgement(
            fix.this_node,
            peer.node_id,
            peer.connection_id,
            false,
        )
        .unwrap();
        fix.handler.connect_success_acknowledgement(&request);

        assert!(fix
            .routing_table
            .lock()
            .unwrap()
            .is_connected(&peer.node_id));
    }

    #[test]
    fn connect_response_reports_success_to_peer() {
        let fix = fixture();
        let (peer, rx) = peer_on_mesh(&fix, 0x10);

        let payload = Connect {
            node_id: peer.node_id,
            connection_id: peer.connection_id,
            nat_symmetric: false,
            endpoint_local: "127.0.0.1:4000".into(),
            endpoint_external: "127.0.0.1:4000".into(),
            client: false,
        };
        let request = rpcs::connect(fix.this_node, peer.node_id, &payload).unwrap();
        let response = Message::response_to(
            &request,
            payload.to_bytes().unwrap(),
            peer.node_id,
        );

        fix.handler.connect(&response);

        let bytes = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        let success = Message::from_bytes(&bytes).unwrap();
        assert_eq!(success.message_type, MessageType::ConnectSuccess);
    }

    #[test]
    fn find_nodes_response_courts_unknown_ids() {
        let fix = fixture();
        let (connected, _crx) = peer_on_mesh(&fix, 0x10);
        fix.routing_table
            .lock()
            .unwrap()
            .add(connected.clone())
            .unwrap();

        let mut unknown_bytes = [0u8; crate::common::ID_SIZE];
        unknown_bytes[0] = 0x11;
        let unknown = Id(unknown_bytes);

        let found = FoundNodes {
            target: fix.this_node,
            nodes: vec![connected.node_id, unknown, fix.this_node],
        };
        let request = rpcs::find_nodes(fix.this_node, fix.this_node, 8).unwrap();
        let response = Message::response_to(
            &request,
            found.to_bytes().unwrap(),
            connected.node_id,
        );

        fix.handler.find_nodes(&response);

        // The connect attempt routes through our only connected peer.
        let bytes = _crx.recv_timeout(Duration::from_secs(2)).unwrap();
        let connect = Message::from_bytes(&bytes).unwrap();
        assert_eq!(connect.message_type, MessageType::Connect);
        assert_eq!(connect.destination_id, Some(unknown));
    }
}

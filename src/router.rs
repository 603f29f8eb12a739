//! Per-node assembly of the routing core.
//!
//! A [Router] wires the tables, the outbound network, the group-change
//! handler, the services and the message handler around one transport
//! endpoint, and exposes the embedding application's surface: join the
//! overlay, send, receive, stop.

use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::client_table::ClientTable;
use crate::common::{Id, NodeInfo};
use crate::config::{Config, CLOSEST_NODES_SIZE, NODE_GROUP_SIZE};
use crate::group_change::GroupChangeHandler;
use crate::handler::{MessageHandler, MessageReceivedFunctor};
use crate::messages::{Message, MessageType};
use crate::network::Network;
use crate::response::ResponseHandler;
use crate::routing_table::RoutingTable;
use crate::rpcs;
use crate::service::{MatrixChangedFunctor, RequestPublicKeyFunctor, Service};
use crate::timer::{ResponseFunctor, Timer};
use crate::transport::Transport;
use crate::Result;

/// Cheaply clonable handle over one node's routing core.
#[derive(Clone)]
pub struct Router {
    this_node: Id,
    config: Config,
    routing_table: Arc<Mutex<RoutingTable>>,
    client_table: Arc<Mutex<ClientTable>>,
    network: Network,
    timer: Timer,
    service: Service,
    group_change: Arc<GroupChangeHandler>,
    handler: MessageHandler,
}

impl Router {
    /// Assembles a node around `transport`. Nothing is sent until
    /// [Router::join].
    pub fn new(node_id: Id, transport: Arc<dyn Transport>, config: Config) -> Router {
        let routing_table = Arc::new(Mutex::new(RoutingTable::new(node_id)));
        let client_table = Arc::new(Mutex::new(ClientTable::new(node_id)));
        let network = Network::new(
            node_id,
            routing_table.clone(),
            client_table.clone(),
            transport,
            config.outbound_workers,
        );
        let timer = Timer::new();
        let group_change = GroupChangeHandler::new(routing_table.clone(), network.clone());
        let service = Service::new(
            node_id,
            node_id,
            config.client_mode,
            routing_table.clone(),
            client_table.clone(),
            network.clone(),
            group_change.clone(),
        );
        let response_handler = ResponseHandler::new(
            node_id,
            node_id,
            config.client_mode,
            routing_table.clone(),
            network.clone(),
            service.clone(),
        );
        let handler = MessageHandler::new(
            node_id,
            config.client_mode,
            config.caching,
            routing_table.clone(),
            client_table.clone(),
            network.clone(),
            timer.clone(),
            service.clone(),
            response_handler,
            group_change.clone(),
        );

        Router {
            this_node: node_id,
            config,
            routing_table,
            client_table,
            network,
            timer,
            service,
            group_change,
            handler,
        }
    }

    // === Functors ===

    pub fn set_message_received_functor(&self, functor: MessageReceivedFunctor) {
        self.handler.set_message_received_functor(functor);
    }

    pub fn set_request_public_key_functor(&self, functor: RequestPublicKeyFunctor) {
        self.service.set_request_public_key_functor(functor);
    }

    pub fn set_matrix_changed_functor(&self, functor: MatrixChangedFunctor) {
        self.service.set_matrix_changed_functor(functor);
    }

    // === Getters ===

    pub fn node_id(&self) -> &Id {
        &self.this_node
    }

    pub fn routing_table_len(&self) -> usize {
        self.routing_table.lock().unwrap().len()
    }

    pub fn close_group(&self) -> Vec<Id> {
        self.routing_table
            .lock()
            .unwrap()
            .own_close_group()
            .iter()
            .map(|node| node.node_id)
            .collect()
    }

    /// Direct access for embedding tests and maintenance tasks.
    pub fn routing_table(&self) -> &Arc<Mutex<RoutingTable>> {
        &self.routing_table
    }

    pub fn client_table(&self) -> &Arc<Mutex<ClientTable>> {
        &self.client_table
    }

    // === Public Methods ===

    /// Bootstraps against the supplied endpoints and asks the overlay
    /// for the nodes closest to our own id.
    pub fn join(&self, endpoints: &[SocketAddr]) -> Result<Id> {
        let handler = self.handler.clone();
        let on_message = Arc::new(move |bytes: Vec<u8>| match Message::from_bytes(&bytes) {
            Ok(message) => handler.handle_message(message),
            Err(error) => debug!(?error, "Dropping undecodable inbound bytes"),
        });

        let router = self.clone();
        let on_connection_lost = Arc::new(move |connection_id: Id| {
            router.handle_connection_lost(connection_id);
        });

        let bootstrap_peer = self
            .network
            .bootstrap(endpoints, on_message, on_connection_lost)?;

        let find = rpcs::find_nodes_relay(
            self.this_node,
            self.this_node,
            self.this_node,
            CLOSEST_NODES_SIZE as u32,
        )?;
        self.network
            .send_to_direct(&find, bootstrap_peer, bootstrap_peer);

        info!(node = ?self.this_node, via = ?bootstrap_peer, "Joining the overlay");
        Ok(bootstrap_peer)
    }

    /// Sends an application payload toward `destination`.
    ///
    /// `replication = 1` with `direct` reaches the one node owning the
    /// id; group messages (`direct = false`) converge on the close
    /// group. A `response` functor awaits the reply until `timeout`.
    #[allow(clippy::too_many_arguments)]
    pub fn send(
        &self,
        destination: Id,
        data: Vec<u8>,
        replication: u16,
        direct: bool,
        cacheable: bool,
        response: Option<ResponseFunctor>,
        timeout: Option<Duration>,
    ) -> Result<u32> {
        let mut message = Message::request(MessageType::NodeLevel, destination);
        message.id = rpcs::next_message_id();
        message.source_id = Some(self.this_node);
        message.direct = direct;
        message.cacheable = cacheable;
        message.client_node = self.config.client_mode;
        message.replication = replication.clamp(1, NODE_GROUP_SIZE as u16);
        message.data = vec![data];

        if let Some(response) = response {
            let timeout = timeout.unwrap_or(self.config.response_timeout);
            self.timer.add_task(message.id, timeout, response);
        }

        let message_id = message.id;
        if destination == self.this_node {
            // Local destinations go through the inbound ladder so that
            // group-to-self and direct-to-self semantics hold.
            self.handler.handle_message(message);
        } else {
            self.network.send_to_closest(message);
        }

        Ok(message_id)
    }

    /// Feeds one raw inbound frame into the classification ladder.
    /// Normally the transport callback does this.
    pub fn handle_inbound(&self, message: Message) {
        let handler = self.handler.clone();
        handler.handle_message(message);
    }

    /// Drops whatever peer owned the lost connection and repairs the
    /// group state around the gap.
    pub fn handle_connection_lost(&self, connection_id: Id) {
        let vault = self
            .routing_table
            .lock()
            .unwrap()
            .get_node_by_connection(&connection_id);

        if let Some(node) = vault {
            warn!(peer = ?node.node_id, "Connection lost; dropping vault peer");
            self.service.drop_vault_peer(&node.node_id);
            return;
        }

        if self
            .client_table
            .lock()
            .unwrap()
            .drop_connection(&connection_id)
            .is_some()
        {
            self.group_change.remove_subscriber(&connection_id);
        }
    }

    /// Stops outbound traffic and cancels pending responses. Irreversible.
    pub fn stop(&self) {
        self.network.stop();
        self.timer.stop();
    }
}

/// Admits a peer directly into a router's tables. Joins in tests and
/// zero-state bootstrap build topologies with this instead of the full
/// connect handshake.
pub fn admit_peer(router: &Router, node: NodeInfo, client: bool) -> bool {
    if client {
        router.service.admit_client_peer(node)
    } else {
        router.service.admit_vault_peer(node)
    }
}

// === Bootstrap endpoint cache ===

/// Reads a plain `host:port`-per-line bootstrap file. Unparsable lines
/// are skipped with a warning.
pub fn read_bootstrap_file(path: &Path) -> Result<Vec<SocketAddr>> {
    let contents = fs::read_to_string(path)?;
    Ok(contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| match line.parse() {
            Ok(address) => Some(address),
            Err(_) => {
                warn!(line, "Skipping unparsable bootstrap endpoint");
                None
            }
        })
        .collect())
}

/// Writes the bootstrap endpoint cache, one `host:port` per line.
pub fn write_bootstrap_file(path: &Path, endpoints: &[SocketAddr]) -> Result<()> {
    let contents: String = endpoints
        .iter()
        .map(|endpoint| format!("{endpoint}\n"))
        .collect();
    fs::write(path, contents)?;
    Ok(())
}

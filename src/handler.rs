//! Inbound message classification.
//!
//! Every framed message delivered by the transport lands in
//! [MessageHandler::handle_message], which walks a fixed ladder of
//! guards: protocol violations are dropped, cacheable traffic meets the
//! cache, and everything else is dispatched for this node, as closest
//! node, as far node, as relay, or into client handling. The first
//! matching guard wins.

use std::sync::{Arc, Mutex};

use tracing::{debug, info, trace, warn};

use crate::cache::CacheManager;
use crate::client_table::ClientTable;
use crate::common::Id;
use crate::config::{CLOSEST_NODES_SIZE, NODE_GROUP_SIZE};
use crate::group_change::GroupChangeHandler;
use crate::messages::{Message, MessageType};
use crate::network::Network;
use crate::response::ResponseHandler;
use crate::routing_table::RoutingTable;
use crate::service::Service;
use crate::timer::Timer;

/// Delivers an application payload upward together with a reply
/// capability: `(payload, group_claim, cacheable, reply)`.
pub type MessageReceivedFunctor =
    Arc<dyn Fn(Vec<u8>, Option<Id>, bool, ReplyFunctor) + Send + Sync>;

/// One-shot reply callback handed to the application; an empty reply
/// suppresses the response.
pub type ReplyFunctor = Box<dyn FnOnce(Vec<u8>) + Send>;

/// Cheaply clonable handle; the reply capability and the transport
/// callback each carry one.
#[derive(Clone)]
pub struct MessageHandler {
    this_node: Id,
    client_mode: bool,
    routing_table: Arc<Mutex<RoutingTable>>,
    client_table: Arc<Mutex<ClientTable>>,
    network: Network,
    timer: Timer,
    service: Service,
    response_handler: ResponseHandler,
    group_change: Arc<GroupChangeHandler>,
    /// Vault nodes cache; clients never do.
    cache: Option<Arc<CacheManager>>,
    message_received: Arc<Mutex<Option<MessageReceivedFunctor>>>,
}

impl MessageHandler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        this_node: Id,
        client_mode: bool,
        caching: bool,
        routing_table: Arc<Mutex<RoutingTable>>,
        client_table: Arc<Mutex<ClientTable>>,
        network: Network,
        timer: Timer,
        service: Service,
        response_handler: ResponseHandler,
        group_change: Arc<GroupChangeHandler>,
    ) -> MessageHandler {
        MessageHandler {
            this_node,
            client_mode,
            routing_table,
            client_table,
            network,
            timer,
            service,
            response_handler,
            group_change,
            cache: (!client_mode && caching).then(|| Arc::new(CacheManager::new())),
            message_received: Arc::new(Mutex::new(None)),
        }
    }

    pub fn set_message_received_functor(&self, functor: MessageReceivedFunctor) {
        *self.message_received.lock().unwrap() = Some(functor);
    }

    // === Public Methods ===

    /// Entry point for every inbound message.
    pub fn handle_message(&self, mut message: Message) {
        if !message.validate() {
            warn!(message_id = message.id, "Message failed validation; dropping");
            return;
        }
        if message.hops_to_live == 0 {
            warn!(message_id = message.id, "Message exhausted hops to live; dropping");
            return;
        }

        message.hops_to_live -= 1;

        if self.is_cacheable_request(&message) {
            if let Some(cached) = self.cache.as_ref().and_then(|cache| cache.lookup(&message)) {
                return self.respond_from_cache(&message, cached);
            }
            // Miss: the request keeps routing toward the content group.
        } else if self.is_cacheable_response(&message) {
            if let Some(cache) = &self.cache {
                cache.store_copy(&message);
            }
        }

        // A group request a node addresses to its own id replicates
        // outward before coming back for local delivery.
        if message.source_id == Some(self.this_node)
            && message.destination_id == Some(self.this_node)
            && message.is_request()
            && !message.is_direct()
        {
            trace!(message_id = message.id, "Group message to own id; replicating outward");
            return self.network.send_to_closest(message);
        }

        if self.client_mode {
            return self.handle_client_message(message);
        }

        if message.is_relay_request() {
            return self.handle_relay_request(message);
        }

        if message.source_id.map(|id| id.is_zero()).unwrap_or(false) {
            warn!(message_id = message.id, "Stray message with zero source id; dropping");
            return;
        }

        if message.destination_id == Some(self.this_node) {
            return self.handle_message_for_this_node(message);
        }

        if self.is_relay_response_for_this_node(&message) {
            return self.handle_routing_message(message);
        }

        let Some(destination) = message.destination_id else {
            warn!(message_id = message.id, "Request without destination; dropping");
            return;
        };

        if message.is_direct()
            && self
                .client_table
                .lock()
                .unwrap()
                .is_connected(&destination)
        {
            return self.handle_message_for_client_nodes(message);
        }

        let close = {
            let table = self.routing_table.lock().unwrap();
            table.is_this_node_in_range(&destination, NODE_GROUP_SIZE)
                || (table.is_this_node_closest_to(&destination, !message.is_direct())
                    && message.visited)
        };
        if close {
            self.handle_message_as_closest_node(message);
        } else {
            self.handle_message_as_far_node(message);
        }
    }

    // === Routing dispatch ===

    fn handle_routing_message(&self, message: Message) {
        match message.message_type {
            MessageType::Ping => {
                if message.is_request() {
                    self.service.ping(&message)
                } else {
                    self.response_handler.ping(&message)
                }
            }
            MessageType::Connect => {
                if message.is_request() {
                    self.service.connect(&message)
                } else {
                    self.response_handler.connect(&message)
                }
            }
            MessageType::FindNodes => {
                if message.is_request() {
                    self.service.find_nodes(&message)
                } else {
                    self.response_handler.find_nodes(&message)
                }
            }
            MessageType::ConnectSuccess => self.service.connect_success(&message),
            MessageType::ConnectSuccessAcknowledgement => {
                self.response_handler.connect_success_acknowledgement(&message)
            }
            MessageType::Remove => {
                if message.is_request() {
                    self.service.remove_request(&message)
                } else {
                    self.service.remove_response(&message)
                }
            }
            MessageType::ClosestNodesUpdate => self.group_change.closest_nodes_update(&message),
            MessageType::ClosestNodesUpdateSubscribe => {
                self.group_change.closest_nodes_update_subscribe(&message)
            }
            MessageType::NodeLevel => {
                debug!(message_id = message.id, "Node-level message in routing dispatch")
            }
        }
    }

    // === For this node ===

    fn handle_message_for_this_node(&self, message: Message) {
        if self.relay_direct_message_if_needed(&message) {
            return;
        }

        trace!(message_id = message.id, "Message for this node");
        if message.is_routing() {
            self.handle_routing_message(message);
        } else {
            self.handle_node_level_message_for_this_node(message);
        }
    }

    /// Responses that travelled here only to be relayed onward leave
    /// again with the destination cleared, so the outbound path treats
    /// them as relay traffic.
    fn relay_direct_message_if_needed(&self, message: &Message) -> bool {
        let Some(relay_id) = message.relay_id else {
            return false;
        };

        if relay_id != self.this_node && message.is_response() {
            let mut relayed = message.clone();
            relayed.destination_id = None;
            trace!(relay = ?relay_id, message_id = message.id, "Relaying response onward");
            self.network.send_to_closest(relayed);
            true
        } else {
            false
        }
    }

    fn handle_node_level_message_for_this_node(&self, message: Message) {
        if message.is_request() {
            info!(
                from = ?message.source_id,
                message_id = message.id,
                "Node-level request delivered"
            );

            let handler = self.clone();
            let request = message.clone();
            let reply: ReplyFunctor = Box::new(move |reply_bytes| {
                if reply_bytes.is_empty() {
                    debug!(message_id = request.id, "Empty reply; no response sent");
                    return;
                }
                let response = Message::response_to(&request, reply_bytes, handler.this_node);
                if response.destination_id == Some(handler.this_node) && !handler.client_mode {
                    // Replying to ourselves short-circuits the network.
                    handler.handle_message(response);
                } else {
                    handler.network.send_to_closest(response);
                }
            });

            let functor = self.message_received.lock().unwrap().clone();
            if let Some(functor) = functor {
                let payload = message.data.first().cloned().unwrap_or_default();
                functor(payload, message.group_claim, message.cacheable, reply);
            }
        } else if !self.timer.add_response(&message) {
            debug!(message_id = message.id, "Response without a pending request");
        }
    }

    // === As closest node ===

    fn handle_message_as_closest_node(&self, message: Message) {
        trace!(
            destination = ?message.destination_id,
            message_id = message.id,
            "This node is in closest proximity to the destination"
        );
        if message.is_direct() {
            self.handle_direct_message_as_closest_node(message)
        } else {
            self.handle_group_message_as_closest_node(message)
        }
    }

    fn handle_direct_message_as_closest_node(&self, mut message: Message) {
        let Some(destination) = message.destination_id else {
            return;
        };

        let (closest, connected) = {
            let table = self.routing_table.lock().unwrap();
            (
                table.is_this_node_closest_to(&destination, false),
                table.is_connected(&destination),
            )
        };
        let client_connected = self.client_table.lock().unwrap().is_connected(&destination);

        if closest {
            if connected || client_connected {
                self.network.send_to_closest(message);
            } else if !message.visited {
                // Another node may be closer in a way not visible from
                // here; give the message one more hop.
                message.visited = true;
                self.network.send_to_closest(message);
            } else {
                warn!(
                    destination = ?destination,
                    message_id = message.id,
                    "Closest to unconnected destination; dropping direct message"
                );
            }
        } else {
            self.network.send_to_closest(message);
        }
    }

    fn handle_group_message_as_closest_node(&self, mut message: Message) {
        let Some(destination) = message.destination_id else {
            return;
        };
        let have_exact_peer = self
            .routing_table
            .lock()
            .unwrap()
            .is_connected(&destination);

        {
            let table = self.routing_table.lock().unwrap();
            if !table.is_this_node_closest_to(&destination, true) && !have_exact_peer {
                trace!(message_id = message.id, "Not closest for group message; passing on");
                drop(table);
                return self.network.send_to_closest(message);
            }

            if !message.visited
                && table.len() > CLOSEST_NODES_SIZE
                && !table.is_this_node_in_range(&destination, CLOSEST_NODES_SIZE)
            {
                drop(table);
                message.visited = true;
                return self.network.send_to_closest(message);
            }
        }

        // The matrix has the wider view: defer to the peer holding the
        // true group leader if it is not us.
        let leader = self.routing_table.lock().unwrap().group_leader(&destination);
        if let Some(leader) = leader {
            trace!(leader = ?leader.node_id, message_id = message.id, "Forwarding to group leader");
            return self
                .network
                .send_to_direct(&message, leader.node_id, leader.connection_id);
        }

        // This node leads the group; replicate to the other members.
        let mut replication = message.replication;
        if replication < 1 || replication as usize > NODE_GROUP_SIZE {
            warn!(
                replication,
                message_id = message.id,
                "Dropping group message with invalid replication"
            );
            return;
        }

        replication -= 1;
        message.direct = true;
        if have_exact_peer {
            replication += 1;
        }

        // One snapshot; concurrent drops must not skew the replica set.
        let mut close = self
            .routing_table
            .lock()
            .unwrap()
            .closest_nodes(&destination, replication as usize);
        if have_exact_peer && !close.is_empty() {
            close.remove(0);
        }

        info!(
            group = ?destination,
            replicas = close.len(),
            message_id = message.id,
            "Replicating group message as leader"
        );

        for peer in &close {
            message.destination_id = Some(peer.node_id);
            self.network
                .send_to_direct(&message, peer.node_id, peer.connection_id);
        }

        message.destination_id = Some(self.this_node);
        if message.is_routing() {
            self.handle_routing_message(message);
        } else {
            self.handle_node_level_message_for_this_node(message);
        }
    }

    // === As far node ===

    fn handle_message_as_far_node(&self, mut message: Message) {
        let Some(destination) = message.destination_id else {
            return;
        };

        if !message.visited
            && !message.is_direct()
            && self
                .routing_table
                .lock()
                .unwrap()
                .is_this_node_closest_to(&destination, true)
        {
            message.visited = true;
        }

        trace!(
            destination = ?destination,
            message_id = message.id,
            "Not in closest proximity; sending on"
        );
        self.network.send_to_closest(message);
    }

    // === Relay requests ===

    /// Messages from nodes that have not joined yet carry no source id;
    /// whoever accepts them becomes their source so responses can find
    /// the way back.
    fn handle_relay_request(&self, mut message: Message) {
        let Some(destination) = message.destination_id else {
            warn!(message_id = message.id, "Relay request without destination; dropping");
            return;
        };

        if destination == self.this_node && message.is_request() {
            if !message.is_direct() {
                message.source_id = Some(self.this_node);
                return self.network.send_to_closest(message);
            }
            return self.handle_message_for_this_node(message);
        }

        if message.is_request()
            && self
                .routing_table
                .lock()
                .unwrap()
                .is_this_node_closest_to(&destination, !message.is_direct())
        {
            message.source_id = Some(self.this_node);
            return self.handle_message_as_closest_node(message);
        }

        // This node becomes the source; the eventual response flows back
        // through here and out to the original relay connection.
        message.source_id = Some(self.this_node);
        self.network.send_to_closest(message);
    }

    // === Client nodes ===

    fn handle_message_for_client_nodes(&self, message: Message) {
        if message.is_request()
            && (!message.client_node || message.source_id != message.destination_id)
        {
            warn!(
                message_id = message.id,
                "Dropping non-client to client message"
            );
            return;
        }
        trace!(message_id = message.id, "Destination is in the client table");
        self.network.send_to_closest(message);
    }

    /// Clients refuse to relay foreign traffic.
    fn handle_client_message(&self, message: Message) {
        if message.is_relay_request() {
            warn!(message_id = message.id, "Stray relay message at client node; dropping");
            return;
        }
        if message.is_routing() {
            self.handle_routing_message(message);
        } else if message.destination_id == Some(self.this_node) {
            self.handle_node_level_message_for_this_node(message);
        }
    }

    // === Cache ===

    fn is_cacheable_request(&self, message: &Message) -> bool {
        self.cache.is_some() && message.cacheable && !message.is_routing() && message.is_request()
    }

    fn is_cacheable_response(&self, message: &Message) -> bool {
        self.cache.is_some() && message.cacheable && !message.is_routing() && message.is_response()
    }

    fn respond_from_cache(&self, request: &Message, cached: Vec<u8>) {
        info!(message_id = request.id, "Answering request from content cache");
        let mut response = Message::response_to(request, cached, self.this_node);
        response.group_claim = request.destination_id;
        self.network.send_to_closest(response);
    }

    fn is_relay_response_for_this_node(&self, message: &Message) -> bool {
        message.is_routing()
            && message.is_response()
            && message.relay_id == Some(self.this_node)
    }
}

//! Close-group update dissemination.
//!
//! Keeps the bidirectional subscriptions that hold every node's group
//! matrix coherent: peers that need our close group to stay current
//! subscribe to us, and we subscribe to ours. All dispatches for a given
//! peer leave through one queue, so updates arrive in send order.

use std::sync::{Arc, Mutex};
use std::thread;

use tracing::{debug, trace, warn};

use crate::common::{Id, NodeInfo};
use crate::messages::{ClosestNodesUpdate, Message, Subscribe};
use crate::network::Network;
use crate::routing_table::RoutingTable;
use crate::rpcs;

enum Dispatch {
    Rpc {
        message: Message,
        peer_id: Id,
        connection_id: Id,
    },
}

pub struct GroupChangeHandler {
    this_node: Id,
    routing_table: Arc<Mutex<RoutingTable>>,
    network: Network,
    subscribers: Mutex<Vec<NodeInfo>>,
    dispatch: flume::Sender<Dispatch>,
}

impl GroupChangeHandler {
    pub fn new(
        routing_table: Arc<Mutex<RoutingTable>>,
        network: Network,
    ) -> Arc<GroupChangeHandler> {
        let this_node = *network.this_node();
        let (dispatch, queue) = flume::unbounded::<Dispatch>();

        // One dispatcher thread keeps per-peer send order.
        let dispatch_network = network.clone();
        thread::spawn(move || {
            while let Ok(Dispatch::Rpc {
                message,
                peer_id,
                connection_id,
            }) = queue.recv()
            {
                dispatch_network.send_now(&message, peer_id, connection_id);
            }
        });

        Arc::new(GroupChangeHandler {
            this_node,
            routing_table,
            network,
            subscribers: Mutex::new(vec![]),
            dispatch,
        })
    }

    // === Getters ===

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().unwrap().len()
    }

    pub fn subscriber_ids(&self) -> Vec<Id> {
        self.subscribers
            .lock()
            .unwrap()
            .iter()
            .map(|node| node.node_id)
            .collect()
    }

    // === Inbound rpcs ===

    /// A peer reported its close group; refresh its matrix row.
    pub fn closest_nodes_update(&self, message: &Message) {
        if message.destination_id != Some(self.this_node) {
            warn!(message_id = message.id, "Close-group update not addressed to this node");
            return;
        }
        let Some(payload) = message.data.first() else {
            warn!(message_id = message.id, "Close-group update without payload");
            return;
        };
        let update = match ClosestNodesUpdate::from_bytes(payload) {
            Ok(update) => update,
            Err(error) => {
                warn!(?error, message_id = message.id, "Malformed close-group update");
                return;
            }
        };
        if update.node.is_zero() {
            warn!(message_id = message.id, "Close-group update with zero sender id");
            return;
        }
        if update.nodes_info.is_empty() {
            // An empty group would poison closeness queries; treat the
            // update as noise.
            warn!(peer = ?update.node, "Ignoring empty close-group update");
            return;
        }

        let close_nodes: Vec<NodeInfo> = update
            .nodes_info
            .iter()
            .filter(|info| !info.node_id.is_zero())
            .map(|info| NodeInfo::new(info.node_id).with_rank(info.rank))
            .collect();

        {
            let mut table = self.routing_table.lock().unwrap();
            if table.is_connected(&update.node) {
                table
                    .matrix_mut()
                    .update_from_connected_peer(&update.node, close_nodes);
                trace!(peer = ?update.node, "Applied close-group update");
            } else {
                debug!(peer = ?update.node, "Close-group update from unconnected peer dropped");
                return;
            }
        }

        // The new row may reveal peers that should be hearing from us.
        self.send_subscribe_rpc(true, None);
    }

    /// A peer asked to start or stop receiving our close-group updates.
    pub fn closest_nodes_update_subscribe(&self, message: &Message) {
        if message.destination_id != Some(self.this_node) {
            warn!(message_id = message.id, "Subscribe rpc not addressed to this node");
            return;
        }
        let Some(payload) = message.data.first() else {
            warn!(message_id = message.id, "Subscribe rpc without payload");
            return;
        };
        let subscribe = match Subscribe::from_bytes(payload) {
            Ok(subscribe) => subscribe,
            Err(error) => {
                warn!(?error, message_id = message.id, "Malformed subscribe rpc");
                return;
            }
        };
        if subscribe.peer.is_zero() {
            warn!(message_id = message.id, "Subscribe rpc with zero peer id");
            return;
        }

        if subscribe.subscribe {
            self.subscribe(subscribe.peer);
        } else {
            self.unsubscribe(&subscribe.peer);
        }
    }

    // === Outbound dissemination ===

    /// Pushes our current close group to every subscriber. Called when
    /// the routing table's closest entries changed.
    pub fn send_closest_nodes_update_rpcs(&self, close_nodes: &[NodeInfo]) {
        if close_nodes.is_empty() {
            return;
        }

        let subscribers = self.subscribers.lock().unwrap().clone();
        trace!(
            subscribers = subscribers.len(),
            group = close_nodes.len(),
            "Broadcasting close-group update"
        );

        for subscriber in subscribers {
            match rpcs::closest_nodes_update(subscriber.node_id, self.this_node, close_nodes) {
                Ok(rpc) => self.enqueue(rpc, &subscriber),
                Err(error) => warn!(?error, "Failed to build close-group update"),
            }
        }
    }

    /// With `subscribe`, asks every peer whose group involves us to keep
    /// us posted; without, tells the single `node_info` to forget us and
    /// drops it locally.
    pub fn send_subscribe_rpc(&self, subscribe: bool, node_info: Option<NodeInfo>) {
        let targets = if subscribe {
            self.routing_table
                .lock()
                .unwrap()
                .nodes_needing_group_updates()
        } else {
            match node_info {
                Some(node) => {
                    self.unsubscribe(&node.node_id);
                    vec![node]
                }
                None => vec![],
            }
        };

        for node in targets {
            match rpcs::closest_nodes_update_subscribe(node.node_id, self.this_node, subscribe) {
                Ok(rpc) => self.enqueue(rpc, &node),
                Err(error) => warn!(?error, "Failed to build subscribe rpc"),
            }
        }
    }

    /// Reconciles subscriptions after the close group moved from `old`
    /// to `new`: refresh subscribers, court the newcomers, release the
    /// leavers.
    pub fn close_group_changed(&self, old_group: &[NodeInfo], new_group: &[NodeInfo]) {
        self.send_closest_nodes_update_rpcs(new_group);
        self.send_subscribe_rpc(true, None);

        for node in old_group {
            let still_close = new_group
                .iter()
                .any(|current| current.node_id == node.node_id);
            if !still_close {
                self.send_subscribe_rpc(false, Some(node.clone()));
            }
        }
    }

    /// Forgets a disconnected peer.
    pub fn remove_subscriber(&self, node_id: &Id) {
        self.unsubscribe(node_id);
    }

    // === Private Methods ===

    fn subscribe(&self, peer_id: Id) {
        let (node_info, close_group) = {
            let table = self.routing_table.lock().unwrap();
            (table.get_node_info(&peer_id), table.own_close_group())
        };

        let Some(node_info) = node_info else {
            debug!(peer = ?peer_id, "Subscribe from peer outside the routing table");
            return;
        };

        {
            let mut subscribers = self.subscribers.lock().unwrap();
            if !subscribers
                .iter()
                .any(|subscriber| subscriber.node_id == peer_id)
            {
                subscribers.push(node_info.clone());
                trace!(peer = ?peer_id, total = subscribers.len(), "Subscribed peer");
            }
        }

        // The fresh subscriber gets our current group straight away.
        if !close_group.is_empty() {
            match rpcs::closest_nodes_update(peer_id, self.this_node, &close_group) {
                Ok(rpc) => self.enqueue(rpc, &node_info),
                Err(error) => warn!(?error, "Failed to build initial close-group update"),
            }
        }
    }

    fn unsubscribe(&self, peer_id: &Id) {
        let mut subscribers = self.subscribers.lock().unwrap();
        subscribers.retain(|subscriber| subscriber.node_id != *peer_id);
    }

    fn enqueue(&self, message: Message, peer: &NodeInfo) {
        let _ = self.dispatch.send(Dispatch::Rpc {
            message,
            peer_id: peer.node_id,
            connection_id: peer.connection_id,
        });
    }
}

//! Constructors for routing rpc messages.
//!
//! Every rpc built here is a `direct` request; responses are synthesized
//! by the services through [Message::response_to].

use std::sync::atomic::{AtomicU32, Ordering};

use crate::common::{Id, NodeInfo};
use crate::messages::{
    BasicNodeInfo, ClosestNodesUpdate, Connect, ConnectSuccess, FindNodes, Message, MessageType,
    Remove, Subscribe,
};
use crate::Result;

static NEXT_MESSAGE_ID: AtomicU32 = AtomicU32::new(1);

/// Process-unique message id for request/response correlation.
pub fn next_message_id() -> u32 {
    NEXT_MESSAGE_ID.fetch_add(1, Ordering::Relaxed)
}

pub fn ping(destination: Id, this_node: Id) -> Message {
    let mut message = Message::request(MessageType::Ping, destination);
    message.id = next_message_id();
    message.source_id = Some(this_node);
    message
}

pub fn connect(destination: Id, this_node: Id, payload: &Connect) -> Result<Message> {
    let mut message = Message::request(MessageType::Connect, destination);
    message.id = next_message_id();
    message.source_id = Some(this_node);
    message.data = vec![payload.to_bytes()?];
    Ok(message)
}

/// Relay-mode connect used while joining: no source id yet, the relay
/// fields let responses find their way back through the bootstrap peer.
pub fn connect_relay(
    destination: Id,
    relay_id: Id,
    relay_connection_id: Id,
    payload: &Connect,
) -> Result<Message> {
    let mut message = Message::request(MessageType::Connect, destination);
    message.id = next_message_id();
    message.relay_id = Some(relay_id);
    message.relay_connection_id = Some(relay_connection_id);
    message.data = vec![payload.to_bytes()?];
    Ok(message)
}

pub fn find_nodes(target: Id, this_node: Id, count: u32) -> Result<Message> {
    let mut message = Message::request(MessageType::FindNodes, target);
    message.id = next_message_id();
    message.source_id = Some(this_node);
    message.direct = false;
    message.data = vec![FindNodes { target, count }.to_bytes()?];
    Ok(message)
}

/// Relay-mode find-nodes used as the first query after bootstrap.
pub fn find_nodes_relay(
    target: Id,
    relay_id: Id,
    relay_connection_id: Id,
    count: u32,
) -> Result<Message> {
    let mut message = Message::request(MessageType::FindNodes, target);
    message.id = next_message_id();
    message.direct = false;
    message.relay_id = Some(relay_id);
    message.relay_connection_id = Some(relay_connection_id);
    message.data = vec![FindNodes { target, count }.to_bytes()?];
    Ok(message)
}

pub fn connect_success(
    destination: Id,
    this_node: Id,
    this_connection: Id,
    client: bool,
) -> Result<Message> {
    let mut message = Message::request(MessageType::ConnectSuccess, destination);
    message.id = next_message_id();
    message.source_id = Some(this_node);
    message.client_node = client;
    message.data = vec![ConnectSuccess {
        node_id: this_node,
        connection_id: this_connection,
        client,
    }
    .to_bytes()?];
    Ok(message)
}

pub fn connect_success_acknowledgement(
    destination: Id,
    this_node: Id,
    this_connection: Id,
    client: bool,
) -> Result<Message> {
    let mut message = Message::request(MessageType::ConnectSuccessAcknowledgement, destination);
    message.id = next_message_id();
    message.source_id = Some(this_node);
    message.client_node = client;
    message.data = vec![ConnectSuccess {
        node_id: this_node,
        connection_id: this_connection,
        client,
    }
    .to_bytes()?];
    Ok(message)
}

pub fn remove(destination: Id, this_node: Id) -> Result<Message> {
    let mut message = Message::request(MessageType::Remove, destination);
    message.id = next_message_id();
    message.source_id = Some(this_node);
    message.data = vec![Remove {
        peer_id: destination,
        furthest: vec![],
    }
    .to_bytes()?];
    Ok(message)
}

pub fn closest_nodes_update(
    destination: Id,
    this_node: Id,
    close_nodes: &[NodeInfo],
) -> Result<Message> {
    let mut message = Message::request(MessageType::ClosestNodesUpdate, destination);
    message.id = next_message_id();
    message.source_id = Some(this_node);
    message.data = vec![ClosestNodesUpdate {
        node: this_node,
        nodes_info: close_nodes.iter().map(BasicNodeInfo::from).collect(),
    }
    .to_bytes()?];
    Ok(message)
}

pub fn closest_nodes_update_subscribe(
    destination: Id,
    this_node: Id,
    subscribe: bool,
) -> Result<Message> {
    let mut message = Message::request(MessageType::ClosestNodesUpdateSubscribe, destination);
    message.id = next_message_id();
    message.source_id = Some(this_node);
    message.data = vec![Subscribe {
        peer: this_node,
        subscribe,
    }
    .to_bytes()?];
    Ok(message)
}

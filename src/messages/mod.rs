//! Serialize and deserialize overlay routing messages.

mod internal;

use serde_bytes::ByteBuf;

use crate::common::{Id, NodeInfo};
use crate::config::HOPS_TO_LIVE;
use crate::{Error, Result};

use internal::{
    WireBasicNodeInfo, WireClosestNodesUpdate, WireConnect, WireConnectSuccess, WireFindNodes,
    WireFoundNodes, WireMessage, WireRemove, WireSubscribe,
};

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
/// Message type discriminant.
///
/// Everything except [MessageType::NodeLevel] is handled by the routing
/// services; `NodeLevel` payloads are delivered to the application.
pub enum MessageType {
    Ping,
    Connect,
    FindNodes,
    ConnectSuccess,
    ConnectSuccessAcknowledgement,
    Remove,
    ClosestNodesUpdate,
    ClosestNodesUpdateSubscribe,
    NodeLevel,
}

impl MessageType {
    fn to_wire(self) -> i32 {
        match self {
            MessageType::Ping => 1,
            MessageType::Connect => 2,
            MessageType::FindNodes => 3,
            MessageType::ConnectSuccess => 4,
            MessageType::ConnectSuccessAcknowledgement => 5,
            MessageType::Remove => 6,
            MessageType::ClosestNodesUpdate => 7,
            MessageType::ClosestNodesUpdateSubscribe => 8,
            MessageType::NodeLevel => 100,
        }
    }

    fn from_wire(tag: i32) -> Result<MessageType> {
        Ok(match tag {
            1 => MessageType::Ping,
            2 => MessageType::Connect,
            3 => MessageType::FindNodes,
            4 => MessageType::ConnectSuccess,
            5 => MessageType::ConnectSuccessAcknowledgement,
            6 => MessageType::Remove,
            7 => MessageType::ClosestNodesUpdate,
            8 => MessageType::ClosestNodesUpdateSubscribe,
            100 => MessageType::NodeLevel,
            _ => {
                return Err(Error::WireFormat(serde_bencode::Error::Custom(format!(
                    "unknown message type {tag}"
                ))))
            }
        })
    }
}

#[derive(Debug, PartialEq, Clone)]
/// A routed overlay message.
pub struct Message {
    pub id: u32,
    pub message_type: MessageType,
    pub source_id: Option<Id>,
    pub destination_id: Option<Id>,
    pub last_id: Option<Id>,
    pub relay_id: Option<Id>,
    pub relay_connection_id: Option<Id>,
    pub request: bool,
    pub direct: bool,
    pub visited: bool,
    pub client_node: bool,
    /// Responses to this message may be served from / stored in the
    /// read-through content cache.
    pub cacheable: bool,
    pub replication: u16,
    pub hops_to_live: u16,
    pub group_claim: Option<Id>,
    pub route_history: Vec<Id>,
    pub data: Vec<Vec<u8>>,
}

impl Message {
    /// A request skeleton addressed to `destination_id`; callers fill in
    /// source, payload and flags.
    pub fn request(message_type: MessageType, destination_id: Id) -> Message {
        Message {
            id: 0,
            message_type,
            source_id: None,
            destination_id: Some(destination_id),
            last_id: None,
            relay_id: None,
            relay_connection_id: None,
            request: true,
            direct: true,
            visited: false,
            client_node: false,
            cacheable: false,
            replication: 1,
            hops_to_live: HOPS_TO_LIVE,
            group_claim: None,
            route_history: vec![],
            data: vec![],
        }
    }

    /// Synthesizes the response to `request`: source and destination
    /// swapped, same id and type, hops reset, marked as a response.
    pub fn response_to(request: &Message, reply_data: Vec<u8>, this_node: Id) -> Message {
        Message {
            id: request.id,
            message_type: request.message_type,
            source_id: Some(this_node),
            destination_id: request.source_id,
            last_id: Some(this_node),
            relay_id: request.relay_id,
            relay_connection_id: request.relay_connection_id,
            request: false,
            direct: true,
            visited: false,
            client_node: request.client_node,
            cacheable: request.cacheable,
            replication: 1,
            hops_to_live: HOPS_TO_LIVE,
            group_claim: None,
            route_history: vec![],
            data: vec![reply_data],
        }
    }

    // === Getters ===

    pub fn is_request(&self) -> bool {
        self.request
    }

    pub fn is_response(&self) -> bool {
        !self.request
    }

    pub fn is_direct(&self) -> bool {
        self.direct
    }

    /// Routing control traffic as opposed to application payloads.
    pub fn is_routing(&self) -> bool {
        self.message_type != MessageType::NodeLevel
    }

    /// A relay message originates from a node with no source id yet.
    pub fn is_relay_request(&self) -> bool {
        self.source_id.is_none()
    }

    /// Minimal structural validity: a routable message either carries a
    /// destination or is a relay response.
    pub fn validate(&self) -> bool {
        match self.destination_id {
            Some(destination) => !destination.is_zero(),
            None => self.relay_id.is_some() && self.is_response(),
        }
    }

    // === Public Methods ===

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let wire = WireMessage {
            id: self.id,
            message_type: self.message_type.to_wire(),
            source_id: self.source_id.map(id_buf),
            destination_id: self.destination_id.map(id_buf),
            last_id: self.last_id.map(id_buf),
            relay_id: self.relay_id.map(id_buf),
            relay_connection_id: self.relay_connection_id.map(id_buf),
            request: self.request as i32,
            direct: self.direct as i32,
            visited: if self.visited { Some(1) } else { None },
            client_node: if self.client_node { Some(1) } else { None },
            cacheable: if self.cacheable { Some(1) } else { None },
            replication: self.replication,
            hops_to_live: self.hops_to_live,
            group_claim: self.group_claim.map(id_buf),
            route_history: self.route_history.iter().map(|id| id_buf(*id)).collect(),
            data: self.data.iter().cloned().map(ByteBuf::from).collect(),
        };

        Ok(serde_bencode::to_bytes(&wire)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Message> {
        let wire: WireMessage = serde_bencode::from_bytes(bytes)?;

        Ok(Message {
            id: wire.id,
            message_type: MessageType::from_wire(wire.message_type)?,
            source_id: buf_id_opt(wire.source_id)?,
            destination_id: buf_id_opt(wire.destination_id)?,
            last_id: buf_id_opt(wire.last_id)?,
            relay_id: buf_id_opt(wire.relay_id)?,
            relay_connection_id: buf_id_opt(wire.relay_connection_id)?,
            request: wire.request != 0,
            direct: wire.direct != 0,
            visited: wire.visited.unwrap_or(0) != 0,
            client_node: wire.client_node.unwrap_or(0) != 0,
            cacheable: wire.cacheable.unwrap_or(0) != 0,
            replication: wire.replication,
            hops_to_live: wire.hops_to_live,
            group_claim: buf_id_opt(wire.group_claim)?,
            route_history: wire
                .route_history
                .into_iter()
                .map(|buf| Id::from_bytes(&buf))
                .collect::<Result<Vec<Id>>>()?,
            data: wire.data.into_iter().map(ByteBuf::into_vec).collect(),
        })
    }
}

// === Rpc payloads ===

#[derive(Debug, PartialEq, Clone)]
/// One close-group member inside a [ClosestNodesUpdate].
pub struct BasicNodeInfo {
    pub node_id: Id,
    pub rank: u32,
}

impl From<&NodeInfo> for BasicNodeInfo {
    fn from(node: &NodeInfo) -> BasicNodeInfo {
        BasicNodeInfo {
            node_id: node.node_id,
            rank: node.rank,
        }
    }
}

#[derive(Debug, PartialEq, Clone)]
/// A peer's self-reported close group.
pub struct ClosestNodesUpdate {
    /// The peer whose close group this is.
    pub node: Id,
    pub nodes_info: Vec<BasicNodeInfo>,
}

impl ClosestNodesUpdate {
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let wire = WireClosestNodesUpdate {
            node: id_buf(self.node),
            nodes_info: self
                .nodes_info
                .iter()
                .map(|info| WireBasicNodeInfo {
                    node_id: id_buf(info.node_id),
                    rank: info.rank,
                })
                .collect(),
        };
        Ok(serde_bencode::to_bytes(&wire)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<ClosestNodesUpdate> {
        let wire: WireClosestNodesUpdate = serde_bencode::from_bytes(bytes)?;
        Ok(ClosestNodesUpdate {
            node: Id::from_bytes(&wire.node)?,
            nodes_info: wire
                .nodes_info
                .into_iter()
                .map(|info| {
                    Ok(BasicNodeInfo {
                        node_id: Id::from_bytes(&info.node_id)?,
                        rank: info.rank,
                    })
                })
                .collect::<Result<Vec<BasicNodeInfo>>>()?,
        })
    }
}

#[derive(Debug, PartialEq, Clone)]
/// Ask a peer to start or stop sending us close-group updates.
pub struct Subscribe {
    pub peer: Id,
    pub subscribe: bool,
}

impl Subscribe {
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let wire = WireSubscribe {
            peer: id_buf(self.peer),
            subscribe: self.subscribe as i32,
        };
        Ok(serde_bencode::to_bytes(&wire)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Subscribe> {
        let wire: WireSubscribe = serde_bencode::from_bytes(bytes)?;
        Ok(Subscribe {
            peer: Id::from_bytes(&wire.peer)?,
            subscribe: wire.subscribe != 0,
        })
    }
}

#[derive(Debug, PartialEq, Clone)]
/// Connect handshake payload carried by both the request and response.
pub struct Connect {
    pub node_id: Id,
    pub connection_id: Id,
    pub nat_symmetric: bool,
    pub endpoint_local: String,
    pub endpoint_external: String,
    pub client: bool,
}

impl Connect {
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let wire = WireConnect {
            node_id: id_buf(self.node_id),
            connection_id: id_buf(self.connection_id),
            nat_symmetric: self.nat_symmetric as i32,
            endpoint_local: self.endpoint_local.clone(),
            endpoint_external: self.endpoint_external.clone(),
            client: self.client as i32,
        };
        Ok(serde_bencode::to_bytes(&wire)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Connect> {
        let wire: WireConnect = serde_bencode::from_bytes(bytes)?;
        Ok(Connect {
            node_id: Id::from_bytes(&wire.node_id)?,
            connection_id: Id::from_bytes(&wire.connection_id)?,
            nat_symmetric: wire.nat_symmetric != 0,
            endpoint_local: wire.endpoint_local,
            endpoint_external: wire.endpoint_external,
            client: wire.client != 0,
        })
    }
}

#[derive(Debug, PartialEq, Clone)]
/// Announces that the transport-level connection is live.
pub struct ConnectSuccess {
    pub node_id: Id,
    pub connection_id: Id,
    pub client: bool,
}

impl ConnectSuccess {
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let wire = WireConnectSuccess {
            node_id: id_buf(self.node_id),
            connection_id: id_buf(self.connection_id),
            client: self.client as i32,
        };
        Ok(serde_bencode::to_bytes(&wire)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<ConnectSuccess> {
        let wire: WireConnectSuccess = serde_bencode::from_bytes(bytes)?;
        Ok(ConnectSuccess {
            node_id: Id::from_bytes(&wire.node_id)?,
            connection_id: Id::from_bytes(&wire.connection_id)?,
            client: wire.client != 0,
        })
    }
}

#[derive(Debug, PartialEq, Clone)]
/// Ask for the ids closest to `target`.
pub struct FindNodes {
    pub target: Id,
    pub count: u32,
}

impl FindNodes {
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let wire = WireFindNodes {
            target: id_buf(self.target),
            count: self.count,
        };
        Ok(serde_bencode::to_bytes(&wire)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<FindNodes> {
        let wire: WireFindNodes = serde_bencode::from_bytes(bytes)?;
        Ok(FindNodes {
            target: Id::from_bytes(&wire.target)?,
            count: wire.count,
        })
    }
}

#[derive(Debug, PartialEq, Clone)]
/// The ids a peer knows closest to a requested target.
pub struct FoundNodes {
    pub target: Id,
    pub nodes: Vec<Id>,
}

impl FoundNodes {
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let wire = WireFoundNodes {
            target: id_buf(self.target),
            nodes: self.nodes.iter().map(|id| id_buf(*id)).collect(),
        };
        Ok(serde_bencode::to_bytes(&wire)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<FoundNodes> {
        let wire: WireFoundNodes = serde_bencode::from_bytes(bytes)?;
        Ok(FoundNodes {
            target: Id::from_bytes(&wire.target)?,
            nodes: wire
                .nodes
                .into_iter()
                .map(|buf| Id::from_bytes(&buf))
                .collect::<Result<Vec<Id>>>()?,
        })
    }
}

#[derive(Debug, PartialEq, Clone)]
/// Furthest-node eviction handshake.
pub struct Remove {
    /// The peer the sender wants dropped (the receiver, on requests).
    pub peer_id: Id,
    /// On responses, the responder's own furthest nodes.
    pub furthest: Vec<Id>,
}

impl Remove {
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let wire = WireRemove {
            peer_id: id_buf(self.peer_id),
            furthest: self.furthest.iter().map(|id| id_buf(*id)).collect(),
        };
        Ok(serde_bencode::to_bytes(&wire)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Remove> {
        let wire: WireRemove = serde_bencode::from_bytes(bytes)?;
        Ok(Remove {
            peer_id: Id::from_bytes(&wire.peer_id)?,
            furthest: wire
                .furthest
                .into_iter()
                .map(|buf| Id::from_bytes(&buf))
                .collect::<Result<Vec<Id>>>()?,
        })
    }
}

fn id_buf(id: Id) -> ByteBuf {
    ByteBuf::from(id.to_vec())
}

fn buf_id_opt(buf: Option<ByteBuf>) -> Result<Option<Id>> {
    buf.map(|buf| Id::from_bytes(&buf)).transpose()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn message_round_trip() {
        let mut message = Message::request(MessageType::NodeLevel, Id::random());
        message.id = 42;
        message.source_id = Some(Id::random());
        message.direct = false;
        message.replication = 4;
        message.route_history = vec![Id::random(), Id::random()];
        message.data = vec![b"payload".to_vec()];

        let decoded = Message::from_bytes(&message.to_bytes().unwrap()).unwrap();

        assert_eq!(decoded, message);
    }

    #[test]
    fn optional_flags_default_off() {
        let message = Message::request(MessageType::Ping, Id::random());
        let decoded = Message::from_bytes(&message.to_bytes().unwrap()).unwrap();

        assert!(!decoded.visited);
        assert!(!decoded.client_node);
        assert!(decoded.relay_id.is_none());
        assert!(decoded.route_history.is_empty());
    }

    #[test]
    fn corrupt_message_rejected() {
        let mut message = Message::request(MessageType::Ping, Id::random());
        message.id = 9;
        let mut bytes = message.to_bytes().unwrap();

        // Truncating the frame leaves an unterminated bencode value.
        bytes.truncate(bytes.len() - 5);

        assert!(Message::from_bytes(&bytes).is_err());
    }

    #[test]
    fn response_swaps_source_and_destination() {
        let this_node = Id::random();
        let origin = Id::random();

        let mut request = Message::request(MessageType::NodeLevel, this_node);
        request.id = 7;
        request.source_id = Some(origin);
        request.hops_to_live = 3;

        let response = Message::response_to(&request, b"reply".to_vec(), this_node);

        assert_eq!(response.id, 7);
        assert!(!response.request);
        assert_eq!(response.source_id, Some(this_node));
        assert_eq!(response.destination_id, Some(origin));
        assert_eq!(response.hops_to_live, HOPS_TO_LIVE);
        assert_eq!(response.data, vec![b"reply".to_vec()]);
    }

    #[test]
    fn closest_nodes_update_round_trip() {
        let update = ClosestNodesUpdate {
            node: Id::random(),
            nodes_info: (0..8)
                .map(|rank| BasicNodeInfo {
                    node_id: Id::random(),
                    rank,
                })
                .collect(),
        };

        let decoded = ClosestNodesUpdate::from_bytes(&update.to_bytes().unwrap()).unwrap();
        assert_eq!(decoded, update);
    }

    #[test]
    fn validate_requires_destination_or_relay() {
        let mut message = Message::request(MessageType::NodeLevel, Id::random());
        assert!(message.validate());

        message.destination_id = None;
        assert!(!message.validate());

        message.request = false;
        message.relay_id = Some(Id::random());
        assert!(message.validate());

        message.destination_id = Some(Id::zero());
        assert!(!message.validate());
    }
}

//! Struct and implementation of the peer entry shared by the routing
//! table, the client table and the group matrix.
use std::fmt::{self, Debug, Formatter};

use ed25519_dalek::VerifyingKey;

use crate::common::Id;

#[derive(Clone, PartialEq)]
/// A connected peer as seen by this node.
///
/// Cheap to clone by value; the group matrix stores snapshots that are
/// allowed to go stale until the peer's next close-group update.
pub struct NodeInfo {
    pub node_id: Id,
    /// Transport-level handle used to reach the peer. May differ from
    /// `node_id` while the peer is still bootstrapping.
    pub connection_id: Id,
    pub public_key: Option<VerifyingKey>,
    /// Monotone preference scalar used for eviction tie-breaks.
    pub rank: u32,
    /// Peer sits behind a symmetric NAT; direct connects may fail.
    pub nat_symmetric: bool,
    pub dimension_list: Vec<Id>,
}

impl NodeInfo {
    /// Creates a new NodeInfo whose connection id equals its node id.
    pub fn new(node_id: Id) -> NodeInfo {
        NodeInfo {
            node_id,
            connection_id: node_id,
            public_key: None,
            rank: 0,
            nat_symmetric: false,
            dimension_list: vec![],
        }
    }

    /// Creates a NodeInfo with a random id and a fresh key, for testing
    /// purposes.
    pub fn random() -> NodeInfo {
        let mut seed = [0u8; 32];
        rand::Rng::fill(&mut rand::thread_rng(), &mut seed[..]);
        let key = ed25519_dalek::SigningKey::from_bytes(&seed).verifying_key();

        NodeInfo::new(Id::random()).with_public_key(key)
    }

    // === Options ===

    pub fn with_connection_id(mut self, connection_id: Id) -> Self {
        self.connection_id = connection_id;
        self
    }

    pub fn with_public_key(mut self, public_key: VerifyingKey) -> Self {
        self.public_key = Some(public_key);
        self
    }

    pub fn with_rank(mut self, rank: u32) -> Self {
        self.rank = rank;
        self
    }

    pub fn with_nat_symmetric(mut self, nat_symmetric: bool) -> Self {
        self.nat_symmetric = nat_symmetric;
        self
    }

    // === Getters ===

    pub fn id(&self) -> &Id {
        &self.node_id
    }

    /// A routing-table entry needs a validated key before admission.
    pub fn has_valid_key(&self) -> bool {
        self.public_key.is_some()
    }
}

impl Debug for NodeInfo {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("NodeInfo")
            .field("node_id", &self.node_id)
            .field("connection_id", &self.connection_id)
            .field("rank", &self.rank)
            .finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn connection_id_defaults_to_node_id() {
        let node = NodeInfo::random();
        assert_eq!(node.node_id, node.connection_id);
    }

    #[test]
    fn builder_options() {
        let other = Id::random();
        let node = NodeInfo::new(Id::random())
            .with_connection_id(other)
            .with_rank(7)
            .with_nat_symmetric(true);

        assert_eq!(node.connection_id, other);
        assert_eq!(node.rank, 7);
        assert!(node.nat_symmetric);
        assert!(!node.has_valid_key());
        assert!(NodeInfo::random().has_valid_key());
    }
}

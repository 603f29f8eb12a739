//! Table of connected client peers.
//!
//! Clients route through this node but do not route themselves; they
//! never take part in closeness queries for traffic not addressed to
//! them. Several transport connections may share one client id.

use tracing::debug;

use crate::common::{Id, NodeInfo};
use crate::config::MAX_CLIENTS_PER_ID;

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum ClientAddError {
    #[error("Client id is this node's own id")]
    SelfId,
    #[error("Connection already present for this client")]
    Duplicate,
    #[error("Client has no validated public key")]
    InvalidKey,
    #[error("Too many connections for this client id")]
    IdFull,
    #[error("Id belongs to a vault peer")]
    VaultPeer,
}

#[derive(Debug)]
pub struct ClientTable {
    node_id: Id,
    nodes: Vec<NodeInfo>,
}

impl ClientTable {
    pub fn new(node_id: Id) -> Self {
        ClientTable {
            node_id,
            nodes: vec![],
        }
    }

    // === Getters ===

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    // === Public Methods ===

    /// Admits a client connection. `is_vault_peer` reports whether the
    /// id already lives in the routing table; the two tables must never
    /// overlap.
    pub fn add(
        &mut self,
        node: NodeInfo,
        is_vault_peer: bool,
    ) -> Result<(), ClientAddError> {
        if node.node_id == self.node_id {
            return Err(ClientAddError::SelfId);
        }
        if is_vault_peer {
            return Err(ClientAddError::VaultPeer);
        }
        if !node.has_valid_key() {
            return Err(ClientAddError::InvalidKey);
        }
        if self
            .nodes
            .iter()
            .any(|entry| entry.connection_id == node.connection_id)
        {
            return Err(ClientAddError::Duplicate);
        }
        if self
            .nodes
            .iter()
            .filter(|entry| entry.node_id == node.node_id)
            .count()
            >= MAX_CLIENTS_PER_ID
        {
            return Err(ClientAddError::IdFull);
        }

        self.nodes.push(node);
        Ok(())
    }

    /// Drops the connection identified by `connection_id`.
    pub fn drop_connection(&mut self, connection_id: &Id) -> Option<NodeInfo> {
        let pos = self
            .nodes
            .iter()
            .position(|node| node.connection_id == *connection_id)?;
        let removed = self.nodes.remove(pos);

        debug!(client = ?removed.node_id, "Dropped client connection");
        Some(removed)
    }

    pub fn is_connected(&self, node_id: &Id) -> bool {
        self.nodes.iter().any(|node| node.node_id == *node_id)
    }

    /// Every connection registered for a client id; group messages to a
    /// client fan out over all of them.
    pub fn nodes_info(&self, node_id: &Id) -> Vec<NodeInfo> {
        self.nodes
            .iter()
            .filter(|node| node.node_id == *node_id)
            .cloned()
            .collect()
    }
}

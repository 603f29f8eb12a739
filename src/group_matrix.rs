//! Per-node mirror of the close groups of this node's closest peers.
//!
//! Row *i* holds the close group of our *i*-th closest connected peer,
//! as that peer last reported it. The matrix widens closeness queries
//! beyond the routing table: it can prove that some unconnected node is
//! closer to a target than we are, and it names the connected peer
//! through which the true group leader is reachable.

use tracing::trace;

use crate::common::{Id, NodeInfo};
use crate::config::CLOSEST_NODES_SIZE;

#[derive(Debug, Clone)]
struct MatrixRow {
    peer: NodeInfo,
    /// The row key's close group, sorted by XOR to the row key.
    close_nodes: Vec<NodeInfo>,
}

#[derive(Debug, Clone)]
pub struct GroupMatrix {
    node_id: Id,
    rows: Vec<MatrixRow>,
}

impl GroupMatrix {
    pub fn new(node_id: Id) -> Self {
        GroupMatrix {
            node_id,
            rows: vec![],
        }
    }

    // === Getters ===

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn row_keys(&self) -> Vec<Id> {
        self.rows.iter().map(|row| row.peer.node_id).collect()
    }

    // === Public Methods ===

    /// Opens a row for a peer that just entered our close group. Rows
    /// are kept sorted by XOR of the row key to this node.
    pub fn add_connected_peer(&mut self, peer: NodeInfo) {
        if self.rows.iter().any(|row| row.peer.node_id == peer.node_id) {
            return;
        }

        let node_id = self.node_id;
        let pos = self
            .rows
            .binary_search_by(|row| {
                if Id::closer_to_target(&row.peer.node_id, &peer.node_id, &node_id) {
                    std::cmp::Ordering::Less
                } else {
                    std::cmp::Ordering::Greater
                }
            })
            .unwrap_err();

        self.rows.insert(
            pos,
            MatrixRow {
                peer,
                close_nodes: vec![],
            },
        );
    }

    pub fn remove_connected_peer(&mut self, peer_id: &Id) {
        self.rows.retain(|row| row.peer.node_id != *peer_id);
    }

    /// Replaces the row keyed by `peer_id` with the peer's reported
    /// close group, re-sorted by XOR to the row key.
    pub fn update_from_connected_peer(&mut self, peer_id: &Id, mut close_nodes: Vec<NodeInfo>) {
        let Some(row) = self.rows.iter_mut().find(|row| row.peer.node_id == *peer_id) else {
            trace!(peer = ?peer_id, "Group update for peer without a matrix row");
            return;
        };

        close_nodes.retain(|node| node.node_id != *peer_id);
        close_nodes.sort_by(|a, b| {
            if Id::closer_to_target(&a.node_id, &b.node_id, peer_id) {
                std::cmp::Ordering::Less
            } else {
                std::cmp::Ordering::Greater
            }
        });
        close_nodes.dedup_by(|a, b| a.node_id == b.node_id);
        close_nodes.truncate(CLOSEST_NODES_SIZE);

        row.close_nodes = close_nodes;
    }

    /// The deduplicated union of all rows: row keys and row members.
    pub fn unique_nodes(&self) -> Vec<NodeInfo> {
        let mut nodes: Vec<NodeInfo> = vec![];

        for row in &self.rows {
            for node in std::iter::once(&row.peer).chain(row.close_nodes.iter()) {
                if node.node_id != self.node_id
                    && !nodes.iter().any(|seen| seen.node_id == node.node_id)
                {
                    nodes.push(node.clone());
                }
            }
        }

        nodes
    }

    /// Union of all rows sorted by XOR to `target`, truncated to `count`.
    pub fn partial_sort_from_target(&self, target: &Id, count: usize) -> Vec<NodeInfo> {
        let mut nodes = self.unique_nodes();
        nodes.sort_by(|a, b| {
            if Id::closer_to_target(&a.node_id, &b.node_id, target) {
                std::cmp::Ordering::Less
            } else {
                std::cmp::Ordering::Greater
            }
        });
        nodes.truncate(count);
        nodes
    }

    /// True iff no node known to the matrix is strictly closer to
    /// `target` than this node.
    pub fn is_this_node_closest_to(&self, target: &Id, ignore_exact_match: bool) -> bool {
        self.unique_nodes()
            .iter()
            .filter(|node| !(ignore_exact_match && node.node_id == *target))
            .all(|node| !Id::closer_to_target(&node.node_id, &self.node_id, target))
    }

    /// Resolves the group leader for `target`.
    ///
    /// Returns `None` when this node's own id is the closest the matrix
    /// knows about; otherwise the connected row-key peer through which
    /// the closest known node is reachable.
    pub fn group_leader(&self, target: &Id) -> Option<NodeInfo> {
        let candidates = self.partial_sort_from_target(target, 1);
        let closest = candidates.first()?;

        if !Id::closer_to_target(&closest.node_id, &self.node_id, target) {
            return None;
        }

        // A row key is directly connected; a row member is reached via
        // its row key.
        for row in &self.rows {
            if row.peer.node_id == closest.node_id {
                return Some(row.peer.clone());
            }
        }
        for row in &self.rows {
            if row
                .close_nodes
                .iter()
                .any(|node| node.node_id == closest.node_id)
            {
                return Some(row.peer.clone());
            }
        }

        None
    }

    /// Row keys whose reported close group contains this node. These
    /// peers must hear about our own close-group changes.
    pub fn rows_containing(&self, member: &Id) -> Vec<NodeInfo> {
        self.rows
            .iter()
            .filter(|row| row.close_nodes.iter().any(|node| node.node_id == *member))
            .map(|row| row.peer.clone())
            .collect()
    }

    pub fn contains(&self, node_id: &Id) -> bool {
        self.rows.iter().any(|row| {
            row.peer.node_id == *node_id
                || row.close_nodes.iter().any(|node| node.node_id == *node_id)
        })
    }
}

/// Difference between two snapshots of the matrix's unique-node union,
/// reported to the embedding application when topology shifts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatrixChange {
    pub node_id: Id,
    pub new_nodes: Vec<Id>,
    pub lost_nodes: Vec<Id>,
}

impl MatrixChange {
    pub fn new(node_id: Id, old_unique: Vec<Id>, new_unique: Vec<Id>) -> MatrixChange {
        let new_nodes = new_unique
            .iter()
            .filter(|id| !old_unique.contains(id))
            .copied()
            .collect();
        let lost_nodes = old_unique
            .iter()
            .filter(|id| !new_unique.contains(id))
            .copied()
            .collect();

        MatrixChange {
            node_id,
            new_nodes,
            lost_nodes,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.new_nodes.is_empty() && self.lost_nodes.is_empty()
    }
}

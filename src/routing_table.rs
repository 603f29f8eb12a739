//! XOR-ordered table of the vault peers closest to this node.
//!
//! The table is the source of truth for "who do I forward to". It owns
//! the [GroupMatrix] so that the matrix's row keys always mirror the
//! table's closest entries under a single lock.

use std::cmp::Ordering;

use tracing::debug;

use crate::common::{Id, NodeInfo};
use crate::config::{bucket_ceiling, CLOSEST_NODES_SIZE, MAX_ROUTING_TABLE_SIZE};
use crate::group_matrix::GroupMatrix;

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
/// Reasons a candidate peer is refused admission.
pub enum AddError {
    #[error("Candidate id is this node's own id")]
    SelfId,
    #[error("Candidate already present")]
    Duplicate,
    #[error("Candidate has no validated public key")]
    InvalidKey,
    #[error("Table full and candidate is not closer than the furthest entry")]
    NotCloser,
    #[error("Candidate's bucket is at its ceiling and cannot donate")]
    BucketImbalance,
}

#[derive(Debug)]
pub struct RoutingTable {
    node_id: Id,
    /// Entries sorted ascending by XOR distance to `node_id`.
    nodes: Vec<NodeInfo>,
    matrix: GroupMatrix,
}

impl RoutingTable {
    pub fn new(node_id: Id) -> Self {
        RoutingTable {
            node_id,
            nodes: vec![],
            matrix: GroupMatrix::new(node_id),
        }
    }

    // === Getters ===

    pub fn node_id(&self) -> &Id {
        &self.node_id
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn matrix(&self) -> &GroupMatrix {
        &self.matrix
    }

    pub fn matrix_mut(&mut self) -> &mut GroupMatrix {
        &mut self.matrix
    }

    pub fn to_vec(&self) -> Vec<NodeInfo> {
        self.nodes.clone()
    }

    // === Public Methods ===

    /// Attempts to admit a peer; returns the entry evicted to make room,
    /// if any.
    pub fn add(&mut self, node: NodeInfo) -> Result<Option<NodeInfo>, AddError> {
        if node.node_id == self.node_id {
            return Err(AddError::SelfId);
        }
        if self.is_connected(&node.node_id) {
            return Err(AddError::Duplicate);
        }
        if !node.has_valid_key() {
            return Err(AddError::InvalidKey);
        }

        let evicted = if self.nodes.len() < MAX_ROUTING_TABLE_SIZE {
            None
        } else {
            Some(self.make_room_for(&node)?)
        };

        if let Some(evicted) = &evicted {
            self.nodes.retain(|entry| entry.node_id != evicted.node_id);
        }

        let pos = self.sorted_position(&node.node_id);
        self.nodes.insert(pos, node);
        self.sync_matrix_rows();

        Ok(evicted)
    }

    /// Removes a peer. The matrix row set follows in lock-step.
    pub fn drop_node(&mut self, node_id: &Id) -> Option<NodeInfo> {
        let pos = self
            .nodes
            .iter()
            .position(|node| node.node_id == *node_id)?;
        let removed = self.nodes.remove(pos);
        self.sync_matrix_rows();

        debug!(dropped = ?node_id, remaining = self.nodes.len(), "Dropped routing table entry");
        Some(removed)
    }

    pub fn is_connected(&self, node_id: &Id) -> bool {
        self.nodes.iter().any(|node| node.node_id == *node_id)
    }

    pub fn get_node_info(&self, node_id: &Id) -> Option<NodeInfo> {
        self.nodes
            .iter()
            .find(|node| node.node_id == *node_id)
            .cloned()
    }

    /// Resolves a transport connection back to its peer entry.
    pub fn get_node_by_connection(&self, connection_id: &Id) -> Option<NodeInfo> {
        self.nodes
            .iter()
            .find(|node| node.connection_id == *connection_id)
            .cloned()
    }

    pub fn update_rank(&mut self, node_id: &Id, rank: u32) {
        if let Some(node) = self
            .nodes
            .iter_mut()
            .find(|node| node.node_id == *node_id)
        {
            node.rank = rank;
        }
    }

    /// Up to `count` entries ordered by XOR to `target`.
    pub fn closest_nodes(&self, target: &Id, count: usize) -> Vec<NodeInfo> {
        self.closest_nodes_filtered(target, count, &[], false)
    }

    /// Up to `count` entries ordered by XOR to `target`, skipping any id
    /// in `exclude` and, optionally, an exact match of `target`.
    pub fn closest_nodes_filtered(
        &self,
        target: &Id,
        count: usize,
        exclude: &[Id],
        ignore_exact_match: bool,
    ) -> Vec<NodeInfo> {
        let mut candidates: Vec<NodeInfo> = self
            .nodes
            .iter()
            .filter(|node| !exclude.contains(&node.node_id))
            .filter(|node| !(ignore_exact_match && node.node_id == *target))
            .cloned()
            .collect();

        candidates.sort_by(|a, b| {
            if Id::closer_to_target(&a.node_id, &b.node_id, target) {
                Ordering::Less
            } else {
                Ordering::Greater
            }
        });
        candidates.truncate(count);
        candidates
    }

    /// The best next hop toward `target`, or None when every entry is
    /// excluded.
    pub fn closest_node(
        &self,
        target: &Id,
        exclude: &[Id],
        ignore_exact_match: bool,
    ) -> Option<NodeInfo> {
        self.closest_nodes_filtered(target, 1, exclude, ignore_exact_match)
            .into_iter()
            .next()
    }

    /// True iff nothing this node knows about, table or matrix, is
    /// strictly closer to `target` than this node itself.
    pub fn is_this_node_closest_to(&self, target: &Id, ignore_exact_match: bool) -> bool {
        let table_closest = self
            .nodes
            .iter()
            .filter(|node| !(ignore_exact_match && node.node_id == *target))
            .all(|node| !Id::closer_to_target(&node.node_id, &self.node_id, target));

        table_closest && self.matrix.is_this_node_closest_to(target, ignore_exact_match)
    }

    /// True iff this node is among the `count` nodes closest to `target`
    /// out of the table plus this node.
    pub fn is_this_node_in_range(&self, target: &Id, count: usize) -> bool {
        let closer = self
            .nodes
            .iter()
            .filter(|node| Id::closer_to_target(&node.node_id, &self.node_id, target))
            .count();

        closer < count
    }

    /// Resolves group leadership for `target` through the matrix.
    ///
    /// `None` means this node is the leader; otherwise the connected
    /// peer to forward to.
    pub fn group_leader(&self, target: &Id) -> Option<NodeInfo> {
        self.matrix.group_leader(target)
    }

    pub fn furthest_node(&self) -> Option<NodeInfo> {
        self.nodes.last().cloned()
    }

    /// This node's own close group: the closest entries of the table.
    pub fn own_close_group(&self) -> Vec<NodeInfo> {
        self.nodes
            .iter()
            .take(CLOSEST_NODES_SIZE)
            .cloned()
            .collect()
    }

    /// Peers that must hear about our close-group changes: our own close
    /// group plus every matrix row that reports us as a member.
    pub fn nodes_needing_group_updates(&self) -> Vec<NodeInfo> {
        let mut nodes = self.own_close_group();

        for peer in self.matrix.rows_containing(&self.node_id) {
            if !nodes.iter().any(|node| node.node_id == peer.node_id) {
                nodes.push(peer);
            }
        }

        nodes
    }

    /// Quick admission pre-check used before a connect handshake is paid
    /// for; the authoritative answer stays with [RoutingTable::add].
    pub fn would_accept(&self, candidate: &Id) -> bool {
        if *candidate == self.node_id || self.is_connected(candidate) {
            return false;
        }
        if self.nodes.len() < MAX_ROUTING_TABLE_SIZE {
            return true;
        }

        match self.furthest_node() {
            Some(furthest) => Id::closer_to_target(candidate, &furthest.node_id, &self.node_id),
            None => true,
        }
    }

    // === Private Methods ===

    fn sorted_position(&self, node_id: &Id) -> usize {
        let this_node = self.node_id;
        self.nodes
            .binary_search_by(|entry| {
                if Id::closer_to_target(&entry.node_id, node_id, &this_node) {
                    Ordering::Less
                } else {
                    Ordering::Greater
                }
            })
            .unwrap_err()
    }

    /// Picks the entry to evict for `candidate` when the table is full.
    fn make_room_for(&self, candidate: &NodeInfo) -> Result<NodeInfo, AddError> {
        let furthest = self.nodes.last().cloned().ok_or(AddError::NotCloser)?;

        if !Id::closer_to_target(&candidate.node_id, &furthest.node_id, &self.node_id) {
            return Err(AddError::NotCloser);
        }

        let bucket = self.node_id.common_leading_bits(&candidate.node_id);
        let occupancy = self.bucket_occupancy(bucket);

        if occupancy < bucket_ceiling() {
            return Ok(furthest);
        }

        // The candidate's bucket is at its ceiling: it may only replace
        // one of its own members, the lowest-ranked among those further
        // from us than the candidate.
        self.nodes
            .iter()
            .filter(|node| self.node_id.common_leading_bits(&node.node_id) == bucket)
            .filter(|node| {
                Id::closer_to_target(&candidate.node_id, &node.node_id, &self.node_id)
            })
            .min_by(|a, b| {
                a.rank.cmp(&b.rank).then_with(|| {
                    if Id::closer_to_target(&b.node_id, &a.node_id, &self.node_id) {
                        Ordering::Less
                    } else {
                        Ordering::Greater
                    }
                })
            })
            .cloned()
            .ok_or(AddError::BucketImbalance)
    }

    fn bucket_occupancy(&self, bucket: usize) -> usize {
        self.nodes
            .iter()
            .filter(|node| self.node_id.common_leading_bits(&node.node_id) == bucket)
            .count()
    }

    /// Keeps the matrix row keys equal to the closest table entries.
    fn sync_matrix_rows(&mut self) {
        let close_group = self.own_close_group();

        for key in self.matrix.row_keys() {
            if !close_group.iter().any(|node| node.node_id == key) {
                self.matrix.remove_connected_peer(&key);
            }
        }
        for node in close_group {
            self.matrix.add_connected_peer(node);
        }
    }
}

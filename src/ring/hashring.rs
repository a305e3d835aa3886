//! Consistent hashing with virtual nodes.
//!
//! Each physical node is represented by multiple virtual nodes (vnodes) on
//! the ring to keep resource distribution even. Every resource id maps to
//! exactly one owning node; ownership changes only when membership does.

use crate::types::NodeAddr;
use std::collections::BTreeMap;
use std::hash::Hasher;
use twox_hash::XxHash64;

/// Number of virtual nodes per physical node.
/// More vnodes = more even distribution but higher memory usage.
pub const DEFAULT_VNODES_PER_NODE: usize = 160;

/// A consistent hash ring mapping resource ids to owning nodes.
#[derive(Debug, Clone)]
pub struct HashRing {
    /// Virtual nodes mapped to their owning physical nodes.
    /// The key is the hash position on the ring.
    vnodes: BTreeMap<u64, NodeAddr>,

    /// Number of virtual nodes per physical node.
    vnodes_per_node: usize,

    /// Sorted list of physical nodes in the ring.
    nodes: Vec<NodeAddr>,
}

impl HashRing {
    /// Create a new empty hash ring.
    pub fn new() -> Self {
        Self::with_vnodes(DEFAULT_VNODES_PER_NODE)
    }

    /// Create a new hash ring with a custom vnode count.
    pub fn with_vnodes(vnodes_per_node: usize) -> Self {
        Self {
            vnodes: BTreeMap::new(),
            vnodes_per_node: vnodes_per_node.max(1),
            nodes: Vec::new(),
        }
    }

    /// Number of physical nodes in the ring.
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// All physical nodes in the ring, sorted.
    pub fn nodes(&self) -> &[NodeAddr] {
        &self.nodes
    }

    /// Whether a node is in the ring.
    pub fn contains_node(&self, node: NodeAddr) -> bool {
        self.nodes.contains(&node)
    }

    /// Add a node to the ring, creating `vnodes_per_node` virtual nodes.
    /// Adding an existing node is a no-op.
    pub fn add_node(&mut self, node: NodeAddr) {
        if self.nodes.contains(&node) {
            return;
        }

        self.nodes.push(node);
        self.nodes.sort();

        for i in 0..self.vnodes_per_node {
            let vnode_key = format!("{}:{}", node, i);
            let hash = hash_bytes(vnode_key.as_bytes());
            self.vnodes.insert(hash, node);
        }
    }

    /// Remove a node and its virtual nodes from the ring.
    pub fn remove_node(&mut self, node: NodeAddr) {
        if !self.nodes.contains(&node) {
            return;
        }

        self.nodes.retain(|&n| n != node);

        for i in 0..self.vnodes_per_node {
            let vnode_key = format!("{}:{}", node, i);
            let hash = hash_bytes(vnode_key.as_bytes());
            self.vnodes.remove(&hash);
        }
    }

    /// The owning node for a resource id.
    ///
    /// Deterministic for a fixed membership snapshot. Returns None only when
    /// the ring is empty.
    pub fn lookup(&self, resource_id: &str) -> Option<NodeAddr> {
        if self.vnodes.is_empty() {
            return None;
        }

        let hash = hash_bytes(resource_id.as_bytes());

        // First vnode at or after the hash, wrapping around the ring.
        self.vnodes
            .range(hash..)
            .next()
            .or_else(|| self.vnodes.iter().next())
            .map(|(_, &node)| node)
    }

    /// Checksum of the current membership.
    ///
    /// Changes exactly when the node set changes; forwarded operations carry
    /// it so both sides can detect a divergent ring view.
    pub fn checksum(&self) -> u64 {
        let mut hasher = XxHash64::with_seed(0);
        for node in &self.nodes {
            hasher.write(node.to_string().as_bytes());
            hasher.write_u8(b';');
        }
        hasher.finish()
    }

    /// Distribution of a sample of ids across nodes, for tests/monitoring.
    pub fn distribution(&self, sample_size: usize) -> std::collections::HashMap<NodeAddr, usize> {
        let mut distribution = std::collections::HashMap::new();

        for i in 0..sample_size {
            let id = format!("sample_{}", i);
            if let Some(owner) = self.lookup(&id) {
                *distribution.entry(owner).or_insert(0) += 1;
            }
        }

        distribution
    }
}

impl Default for HashRing {
    fn default() -> Self {
        Self::new()
    }
}

fn hash_bytes(bytes: &[u8]) -> u64 {
    let mut hasher = XxHash64::with_seed(0);
    hasher.write(bytes);
    hasher.finish()
}

//! Keys: globally unique, hash-routable identifiers
//!
//! A key's home node is a pure function of its bytes, so any node can
//! resolve any key's home without a directory. Chunk keys of one frame
//! carry a homing seed derived from the frame and chunk ordinal, which
//! pins chunk `i` of every column of that frame to the same node.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::cluster::NodeId;

/// Immutable identifier for an object in the distributed store
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Key {
    name: String,
    /// Overrides the bytes used for home-node routing. Chunk keys of the
    /// same frame and ordinal share a seed so aligned chunks co-locate.
    home_seed: Option<String>,
}

impl Key {
    /// Create a key routed by its own name
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            home_seed: None,
        }
    }

    /// Create a fresh key with a random suffix
    pub fn random(prefix: &str) -> Self {
        Self::new(format!("{}-{}", prefix, Uuid::new_v4()))
    }

    /// Key for chunk `ordinal` of column `col` of the frame `group`.
    /// All columns share the homing seed for a given ordinal.
    pub fn chunk_key(group: &Key, col: usize, ordinal: usize) -> Self {
        Self {
            name: format!("{}/c{}/p{}", group.name, col, ordinal),
            home_seed: Some(format!("{}/p{}", group.name, ordinal)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Home node for this key: first eight digest bytes mod node count.
    /// Stateless, so every node resolves the same home for the same key.
    pub fn home_node(&self, n_nodes: usize) -> NodeId {
        let seed = self.home_seed.as_deref().unwrap_or(&self.name);
        let digest = Sha256::digest(seed.as_bytes());
        let mut prefix = [0u8; 8];
        prefix.copy_from_slice(&digest[..8]);
        (u64::from_be_bytes(prefix) % n_nodes.max(1) as u64) as NodeId
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equal_bytes_route_to_equal_homes() {
        let a = Key::new("models/airlines-gbm");
        let b = Key::new("models/airlines-gbm");
        assert_eq!(a, b);
        for nodes in 1..16 {
            assert_eq!(a.home_node(nodes), b.home_node(nodes));
            assert!(a.home_node(nodes) < nodes);
        }
    }

    #[test]
    fn aligned_chunks_share_a_home() {
        let frame = Key::new("frames/train");
        for ordinal in 0..8 {
            let c0 = Key::chunk_key(&frame, 0, ordinal);
            let c1 = Key::chunk_key(&frame, 1, ordinal);
            assert_ne!(c0, c1);
            assert_eq!(c0.home_node(5), c1.home_node(5));
        }
    }

    #[test]
    fn random_keys_are_distinct() {
        assert_ne!(Key::random("tmp"), Key::random("tmp"));
    }

    #[test]
    fn single_node_cluster_homes_everything_locally() {
        assert_eq!(Key::random("x").home_node(1), 0);
    }
}

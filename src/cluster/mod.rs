//! In-process cluster: a fixed set of nodes joined by message-passing RPC
//!
//! Every node runs an actor over its own request channel and owns its
//! store shard, cache, and lock table. Handles are location-transparent:
//! the same API works against any node, and requests route to a key's
//! home node automatically.

pub(crate) mod rpc;

mod node;

use tokio::sync::mpsc;
use tracing::info;

use crate::error::{ChunkflowError, ChunkflowResult};

pub use node::NodeHandle;

pub(crate) use node::{run_node, NodeState};

/// Index of a node within the cluster
pub type NodeId = usize;

/// Tuning knobs shared by every node
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// Per-node read-through cache capacity, in entries
    pub cache_entries: usize,
    /// Minimum number of chunks a local fork-join leaf processes before
    /// the splitter stops recursing
    pub task_grain: usize,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            cache_entries: 1024,
            task_grain: 1,
        }
    }
}

/// A launched cluster. Dropping it (and every outstanding [`NodeHandle`])
/// closes the request channels and winds the node actors down.
pub struct Cluster {
    handles: Vec<NodeHandle>,
}

impl Cluster {
    /// Launch `n_nodes` nodes with default configuration. Must be called
    /// within a tokio runtime.
    pub fn launch(n_nodes: usize) -> ChunkflowResult<Self> {
        Self::launch_with(n_nodes, ClusterConfig::default())
    }

    pub fn launch_with(n_nodes: usize, config: ClusterConfig) -> ChunkflowResult<Self> {
        if n_nodes == 0 {
            return Err(ChunkflowError::validation(
                "n_nodes",
                "cluster needs at least one node",
            ));
        }

        let mut senders = Vec::with_capacity(n_nodes);
        let mut receivers = Vec::with_capacity(n_nodes);
        for _ in 0..n_nodes {
            let (tx, rx) = mpsc::unbounded_channel();
            senders.push(tx);
            receivers.push(rx);
        }
        let peers = std::sync::Arc::new(senders);

        let mut handles = Vec::with_capacity(n_nodes);
        for (id, rx) in receivers.into_iter().enumerate() {
            let state = std::sync::Arc::new(NodeState::new(id, n_nodes, config.clone()));
            handles.push(NodeHandle {
                shared: state.clone(),
                peers: peers.clone(),
            });
            tokio::spawn(run_node(state, peers.clone(), rx));
        }

        info!(n_nodes, "cluster launched");
        Ok(Self { handles })
    }

    /// Handle for node `id`; panics if `id` is out of range
    pub fn node(&self, id: NodeId) -> NodeHandle {
        self.handles[id].clone()
    }

    pub fn size(&self) -> usize {
        self.handles.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn launch_rejects_empty_cluster() {
        let err = Cluster::launch(0).err().map(|e| e.to_string());
        assert!(err.is_some_and(|m| m.contains("n_nodes")));
    }

    #[tokio::test]
    async fn handles_know_their_place() {
        let cluster = Cluster::launch(3).unwrap();
        assert_eq!(cluster.size(), 3);
        for id in 0..3 {
            let node = cluster.node(id);
            assert_eq!(node.id(), id);
            assert_eq!(node.n_nodes(), 3);
        }
    }
}

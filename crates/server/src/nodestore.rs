//! In-memory node-info store with optional JSON snapshot persistence.
//!
//! The main node keeps the last-known identity of every fleet member
//! here; the dispatcher reads it for the public nodes surface and writes
//! it on registration and on status changes. Every mutation is broadcast
//! to node-changed subscribers.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::warn;

use edgeiam_common::{IamError, NodeIdentity, NodeStatus, Result};

use crate::collaborators::NodeInfoStore;

const NODE_CHANGED_CAPACITY: usize = 64;
const SNAPSHOT_FILE: &str = "nodes.json";

/// Node-info store backed by a map, optionally snapshotted to disk.
pub struct MemoryNodeStore {
    nodes: Mutex<BTreeMap<String, NodeIdentity>>,
    snapshot_path: Option<PathBuf>,
    changed_tx: broadcast::Sender<NodeIdentity>,
}

impl MemoryNodeStore {
    pub fn new() -> Self {
        let (changed_tx, _) = broadcast::channel(NODE_CHANGED_CAPACITY);
        Self { nodes: Mutex::new(BTreeMap::new()), snapshot_path: None, changed_tx }
    }

    /// Creates a store that snapshots to `working_dir/nodes.json`,
    /// loading an existing snapshot if present.
    pub fn with_working_dir(working_dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = working_dir.into();
        std::fs::create_dir_all(&dir)?;

        let path = dir.join(SNAPSHOT_FILE);
        let nodes = match std::fs::read_to_string(&path) {
            Ok(raw) => serde_json::from_str::<BTreeMap<String, NodeIdentity>>(&raw)
                .map_err(|e| IamError::internal(format!("node snapshot parse error: {e}")))?,
            Err(_) => BTreeMap::new(),
        };

        let (changed_tx, _) = broadcast::channel(NODE_CHANGED_CAPACITY);
        Ok(Self { nodes: Mutex::new(nodes), snapshot_path: Some(path), changed_tx })
    }

    fn persist(&self, nodes: &BTreeMap<String, NodeIdentity>) {
        let Some(path) = &self.snapshot_path else {
            return;
        };

        let encoded = match serde_json::to_vec_pretty(nodes) {
            Ok(encoded) => encoded,
            Err(err) => {
                warn!(error = %err, "failed to encode node snapshot");
                return;
            }
        };

        let tmp = path.with_extension("json.tmp");
        let written = std::fs::write(&tmp, encoded).and_then(|_| std::fs::rename(&tmp, path));
        if let Err(err) = written {
            warn!(error = %err, path = %path.display(), "failed to persist node snapshot");
        }
    }

    fn notify(&self, node: NodeIdentity) {
        // Send errors only mean there are no subscribers right now.
        let _ = self.changed_tx.send(node);
    }
}

impl Default for MemoryNodeStore {
    fn default() -> Self {
        Self::new()
    }
}

impl NodeInfoStore for MemoryNodeStore {
    fn set_node_info(&self, info: NodeIdentity) -> Result<()> {
        info.validate()?;

        let mut nodes = self.nodes.lock();
        nodes.insert(info.id.clone(), info.clone());
        self.persist(&nodes);
        drop(nodes);

        self.notify(info);
        Ok(())
    }

    fn set_node_status(&self, node_id: &str, status: NodeStatus) -> Result<()> {
        let updated = {
            let mut nodes = self.nodes.lock();
            let node = nodes
                .get_mut(node_id)
                .ok_or_else(|| IamError::not_found(format!("node {node_id} is unknown")))?;
            node.status = Some(status);
            let updated = node.clone();
            self.persist(&nodes);
            updated
        };

        self.notify(updated);
        Ok(())
    }

    fn node_info(&self, node_id: &str) -> Result<NodeIdentity> {
        self.nodes
            .lock()
            .get(node_id)
            .cloned()
            .ok_or_else(|| IamError::not_found(format!("node {node_id} is unknown")))
    }

    fn all_node_ids(&self) -> Vec<String> {
        self.nodes.lock().keys().cloned().collect()
    }

    fn has_node(&self, node_id: &str) -> bool {
        self.nodes.lock().contains_key(node_id)
    }

    fn subscribe_node_changed(&self) -> broadcast::Receiver<NodeIdentity> {
        self.changed_tx.subscribe()
    }
}

/// Shared handle alias used across the server.
pub type SharedNodeStore = Arc<dyn NodeInfoStore>;

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: &str, status: NodeStatus) -> NodeIdentity {
        NodeIdentity { id: id.into(), status: Some(status), ..Default::default() }
    }

    #[test]
    fn test_set_and_get() {
        let store = MemoryNodeStore::new();
        store.set_node_info(node("node0", NodeStatus::Unprovisioned)).unwrap();

        let got = store.node_info("node0").unwrap();
        assert_eq!(got.status, Some(NodeStatus::Unprovisioned));
        assert!(store.has_node("node0"));
        assert!(!store.has_node("node1"));
        assert!(store.node_info("node1").is_err());
    }

    #[test]
    fn test_status_update_requires_known_node() {
        let store = MemoryNodeStore::new();
        let err = store.set_node_status("ghost", NodeStatus::Paused).unwrap_err();
        assert_eq!(err.kind(), edgeiam_common::ErrorKind::NotFound);

        store.set_node_info(node("node0", NodeStatus::Provisioned)).unwrap();
        store.set_node_status("node0", NodeStatus::Paused).unwrap();
        assert_eq!(store.node_info("node0").unwrap().status, Some(NodeStatus::Paused));
    }

    #[test]
    fn test_all_node_ids_sorted() {
        let store = MemoryNodeStore::new();
        store.set_node_info(node("node1", NodeStatus::Provisioned)).unwrap();
        store.set_node_info(node("main", NodeStatus::Provisioned)).unwrap();

        assert_eq!(store.all_node_ids(), vec!["main", "node1"]);
    }

    #[test]
    fn test_invalid_identity_rejected() {
        let store = MemoryNodeStore::new();
        let err = store.set_node_info(NodeIdentity::default()).unwrap_err();
        assert_eq!(err.kind(), edgeiam_common::ErrorKind::InvalidArgument);
    }

    #[test]
    fn test_change_broadcast() {
        let store = MemoryNodeStore::new();
        let mut rx = store.subscribe_node_changed();

        store.set_node_info(node("node0", NodeStatus::Unprovisioned)).unwrap();
        store.set_node_status("node0", NodeStatus::Provisioned).unwrap();

        assert_eq!(rx.try_recv().unwrap().status, Some(NodeStatus::Unprovisioned));
        assert_eq!(rx.try_recv().unwrap().status, Some(NodeStatus::Provisioned));
    }

    #[test]
    fn test_snapshot_round_trip() {
        let dir = tempfile::tempdir().unwrap();

        {
            let store = MemoryNodeStore::with_working_dir(dir.path()).unwrap();
            store.set_node_info(node("node0", NodeStatus::Provisioned)).unwrap();
        }

        let reloaded = MemoryNodeStore::with_working_dir(dir.path()).unwrap();
        assert_eq!(reloaded.node_info("node0").unwrap().status, Some(NodeStatus::Provisioned));
    }
}

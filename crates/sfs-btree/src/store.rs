//! Node arena: stable node ids mapped to lockable in-memory nodes.
//!
//! Parents reference children by [`NodeId`], never by pointer, so a node can
//! be split, merged, or rewritten to a new disk location without touching
//! anything but the id map and its parent's child list.

use crate::node::NodeData;
use parking_lot::RwLock;
use sfs_lock::{LockWaitStats, SixLock};
use sfs_types::NodeId;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::trace;

#[derive(Debug)]
pub struct BtreeNode {
    id: NodeId,
    pub(crate) lock: SixLock<NodeData>,
}

impl BtreeNode {
    #[must_use]
    pub fn id(&self) -> NodeId {
        self.id
    }

    #[must_use]
    pub fn lock(&self) -> &SixLock<NodeData> {
        &self.lock
    }
}

#[derive(Debug)]
pub(crate) struct NodeStore {
    nodes: RwLock<HashMap<NodeId, Arc<BtreeNode>>>,
    next_id: AtomicU64,
    lock_stats: Arc<LockWaitStats>,
}

impl NodeStore {
    pub(crate) fn new(first_id: u64, lock_stats: Arc<LockWaitStats>) -> Self {
        Self {
            nodes: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(first_id.max(1)),
            lock_stats,
        }
    }

    pub(crate) fn alloc_id(&self) -> NodeId {
        NodeId(self.next_id.fetch_add(1, Ordering::AcqRel))
    }

    /// Id the next allocation will return.
    pub(crate) fn peek_next_id(&self) -> u64 {
        self.next_id.load(Ordering::Acquire)
    }

    /// Never hand out an id at or below `id` again.
    pub(crate) fn reserve_through(&self, id: NodeId) {
        self.next_id
            .fetch_max(id.0.saturating_add(1), Ordering::AcqRel);
    }

    pub(crate) fn insert(&self, data: NodeData) -> Arc<BtreeNode> {
        let id = data.id;
        self.reserve_through(id);
        let node = Arc::new(BtreeNode {
            id,
            lock: SixLock::with_stats(data, Arc::clone(&self.lock_stats)),
        });
        self.nodes.write().insert(id, Arc::clone(&node));
        trace!(target: "sfs::btree", event = "node_insert", node = id.0);
        node
    }

    pub(crate) fn get(&self, id: NodeId) -> Option<Arc<BtreeNode>> {
        self.nodes.read().get(&id).cloned()
    }

    pub(crate) fn remove(&self, id: NodeId) {
        self.nodes.write().remove(&id);
        trace!(target: "sfs::btree", event = "node_remove", node = id.0);
    }

    pub(crate) fn len(&self) -> usize {
        self.nodes.read().len()
    }

    pub(crate) fn all(&self) -> Vec<Arc<BtreeNode>> {
        self.nodes.read().values().cloned().collect()
    }
}

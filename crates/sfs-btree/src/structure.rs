//! Splits, merges, root growth and collapse, and in-place compaction.
//!
//! Structural changes are serialized by the tree's structure mutex, so the
//! shape of the interior levels only changes under it. Commits never take
//! that mutex and never lock interior nodes; they keep running against
//! leaves that are not being restructured.
//!
//! Locking per operation (top-down, then ascending by key):
//!
//! ```text
//! split      parent intent, node intent        -> upgrade both to write
//! merge      parent intent, left, right intent -> upgrade all to write
//! root split old root intent -> write; new root published before release
//! collapse   root intent -> write; only child becomes root
//! ```
//!
//! Readers that slip past a node while it is being reshaped find a range
//! that no longer covers their key, or a dead node, and restart.

use crate::node::{ChildRef, NodeData};
use crate::store::BtreeNode;
use crate::Btree;
use sfs_error::{Result, SfsError};
use sfs_ondisk::{Key, NodeRange};
use sfs_types::NodeId;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Action {
    Split,
    Merge,
    Compact,
    Collapse,
}

fn corrupt(id: NodeId, detail: &str) -> SfsError {
    SfsError::NodeCorrupt {
        node: id.0,
        detail: detail.to_owned(),
    }
}

impl Btree {
    pub(crate) fn classify(&self, data: &NodeData, is_root: bool) -> Option<Action> {
        let opts = &self.opts;
        if data.unreadable.is_some() {
            return None;
        }
        if data.is_leaf() {
            let limit = opts.leaf_payload_limit();
            let live = data.live_bytes();
            if live > limit {
                return Some(Action::Split);
            }
            if data.page_len() > opts.node_size as usize {
                return Some(Action::Compact);
            }
            if !is_root && live * 100 < limit * usize::from(opts.merge_threshold_pct) {
                return Some(Action::Merge);
            }
            return None;
        }
        let fanout = data.children().len();
        let max = opts.max_fanout();
        if fanout > max {
            Some(Action::Split)
        } else if is_root && fanout == 1 {
            Some(Action::Collapse)
        } else if !is_root && fanout * 100 < max * usize::from(opts.merge_threshold_pct) {
            Some(Action::Merge)
        } else {
            None
        }
    }

    /// Bring the given nodes back within size bounds, cascading upward.
    pub fn maintain(&self, ids: &[NodeId]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let _structure = self.structure.lock();
        for id in ids {
            self.maintain_locked(*id)?;
        }
        Ok(())
    }

    /// Check every node. Used before writeback so each page fits.
    pub fn maintain_all(&self) -> Result<()> {
        let _structure = self.structure.lock();
        self.maintain_all_locked()
    }

    pub(crate) fn maintain_all_locked(&self) -> Result<()> {
        let mut nodes: Vec<(u8, NodeId)> = self
            .store
            .all()
            .iter()
            .map(|n| (n.lock.read().level(), n.id()))
            .collect();
        nodes.sort_unstable();
        for (_, id) in nodes {
            self.maintain_locked(id)?;
        }
        Ok(())
    }

    fn maintain_locked(&self, id: NodeId) -> Result<()> {
        let mut work = vec![id];
        while let Some(id) = work.pop() {
            let Some(node) = self.store.get(id) else {
                continue;
            };
            let action = {
                let g = node.lock.read();
                if g.is_dead() {
                    continue;
                }
                self.classify(&g, id == self.root_id())
            };
            match action {
                None => {}
                Some(Action::Compact) => {
                    let mut g = node.lock.write();
                    g.compact()?;
                    self.counters.compactions.fetch_add(1, Ordering::Relaxed);
                    drop(g);
                    work.push(id);
                }
                Some(Action::Split) => {
                    if let Some((parent, right)) = self.split(&node)? {
                        work.extend([parent, right, id]);
                    }
                }
                Some(Action::Merge) => {
                    if let Some((parent, survivor)) = self.merge(&node)? {
                        work.extend([parent, survivor]);
                    }
                }
                Some(Action::Collapse) => {
                    if let Some(new_root) = self.collapse_root(&node)? {
                        work.push(new_root);
                    }
                }
            }
        }
        Ok(())
    }

    /// Interior node whose child list references `id`; `None` for the root.
    fn parent_of(&self, id: NodeId, min: Key, level: u8) -> Result<Option<Arc<BtreeNode>>> {
        let mut cur = self.root_node()?;
        if cur.id() == id {
            return Ok(None);
        }
        loop {
            let next = {
                let g = cur.lock.read();
                if g.level() <= level {
                    return Err(corrupt(id, "node not reachable from the root"));
                }
                if g.level() == level + 1 {
                    if g.child_position(id).is_none() {
                        return Err(corrupt(id, "parent does not reference node"));
                    }
                    drop(g);
                    return Ok(Some(cur));
                }
                let child = g
                    .child_for(&min)
                    .ok_or_else(|| corrupt(g.id(), "interior node has no children"))?;
                self.store
                    .get(child.id)
                    .ok_or_else(|| corrupt(child.id, "child missing from node store"))?
            };
            cur = next;
        }
    }

    fn split(&self, node: &Arc<BtreeNode>) -> Result<Option<(NodeId, NodeId)>> {
        let (min, level) = {
            let g = node.lock.read();
            (g.range().min, g.level())
        };
        let Some(parent) = self.parent_of(node.id(), min, level)? else {
            return self.split_root(node);
        };

        let p = parent.lock.intent();
        let n = node.lock.intent();
        let mut p = p.upgrade();
        let mut n = n.upgrade();

        let right_id = self.store.alloc_id();
        let Some(right) = n.split_off(right_id)? else {
            return Ok(None);
        };
        let pos = p
            .child_position(node.id())
            .ok_or_else(|| corrupt(node.id(), "parent does not reference node"))?;
        let left_max = n.range().max;
        let right_max = right.range().max;
        self.store.insert(right);
        p.children[pos].max_key = left_max;
        p.children.insert(
            pos + 1,
            ChildRef {
                max_key: right_max,
                id: right_id,
                ptr: None,
            },
        );
        p.dirty = true;
        drop(n);
        drop(p);

        self.counters.splits.fetch_add(1, Ordering::Relaxed);
        debug!(
            target: "sfs::btree",
            event = "node_split",
            node = node.id().0,
            right = right_id.0,
            parent = parent.id().0,
            level
        );
        Ok(Some((parent.id(), right_id)))
    }

    fn split_root(&self, node: &Arc<BtreeNode>) -> Result<Option<(NodeId, NodeId)>> {
        let mut n = node.lock.intent().upgrade();
        let right_id = self.store.alloc_id();
        let Some(right) = n.split_off(right_id)? else {
            return Ok(None);
        };
        let root_id = self.store.alloc_id();
        let level = n.level() + 1;
        let root = NodeData::new_interior(
            root_id,
            level,
            NodeRange::FULL,
            vec![
                ChildRef {
                    max_key: n.range().max,
                    id: node.id(),
                    ptr: n.location().cloned(),
                },
                ChildRef {
                    max_key: right.range().max,
                    id: right_id,
                    ptr: None,
                },
            ],
        );
        self.store.insert(right);
        self.store.insert(root);
        *self.root.write() = root_id;
        drop(n);

        self.counters.root_splits.fetch_add(1, Ordering::Relaxed);
        info!(
            target: "sfs::btree",
            event = "root_split",
            old_root = node.id().0,
            new_root = root_id.0,
            height = u32::from(level) + 1
        );
        Ok(Some((root_id, right_id)))
    }

    fn merge(&self, node: &Arc<BtreeNode>) -> Result<Option<(NodeId, NodeId)>> {
        let (min, level) = {
            let g = node.lock.read();
            (g.range().min, g.level())
        };
        let Some(parent) = self.parent_of(node.id(), min, level)? else {
            return Ok(None);
        };

        let p = parent.lock.intent();
        let pos = p
            .child_position(node.id())
            .ok_or_else(|| corrupt(node.id(), "parent does not reference node"))?;
        if p.children().len() < 2 {
            return Ok(None);
        }
        let (li, ri) = if pos + 1 < p.children().len() {
            (pos, pos + 1)
        } else {
            (pos - 1, pos)
        };
        let left = self
            .store
            .get(p.children()[li].id)
            .ok_or_else(|| corrupt(p.children()[li].id, "child missing from node store"))?;
        let right = self
            .store
            .get(p.children()[ri].id)
            .ok_or_else(|| corrupt(p.children()[ri].id, "child missing from node store"))?;

        let l = left.lock.intent();
        let r = right.lock.intent();
        if l.unreadable.is_some() || r.unreadable.is_some() {
            return Ok(None);
        }
        let fits = if l.is_leaf() {
            (l.live_bytes() + r.live_bytes()) * 3 <= self.opts.leaf_payload_limit() * 2
        } else {
            (l.children().len() + r.children().len()) * 3 <= self.opts.max_fanout() * 2
        };
        if !fits {
            return Ok(None);
        }

        let mut p = p.upgrade();
        let mut l = l.upgrade();
        let mut r = r.upgrade();
        l.absorb(&mut r)?;
        let right_max = p.children[ri].max_key;
        p.children[li].max_key = right_max;
        p.children.remove(ri);
        p.dirty = true;
        if let Some(old) = r.location.take() {
            self.retired.lock().push(old);
        }
        drop(r);
        self.store.remove(right.id());
        drop(l);
        drop(p);

        self.counters.merges.fetch_add(1, Ordering::Relaxed);
        debug!(
            target: "sfs::btree",
            event = "node_merge",
            left = left.id().0,
            right = right.id().0,
            parent = parent.id().0,
            level
        );
        Ok(Some((parent.id(), left.id())))
    }

    fn collapse_root(&self, node: &Arc<BtreeNode>) -> Result<Option<NodeId>> {
        let g = node.lock.intent();
        if g.is_leaf() || g.children().len() != 1 {
            return Ok(None);
        }
        let child = g.children()[0].id;
        let mut g = g.upgrade();
        g.dead = true;
        if let Some(old) = g.location.take() {
            self.retired.lock().push(old);
        }
        *self.root.write() = child;
        drop(g);
        self.store.remove(node.id());

        self.counters.root_collapses.fetch_add(1, Ordering::Relaxed);
        info!(
            target: "sfs::btree",
            event = "root_collapse",
            old_root = node.id().0,
            new_root = child.0
        );
        Ok(Some(child))
    }
}

#[cfg(test)]
mod tests {
    use crate::{Btree, TreeOptions};
    use proptest::prelude::*;
    use sfs_ondisk::{Key, Value};
    use std::collections::BTreeMap;

    fn k(i: u64) -> Key {
        Key::new(i, 0, 0)
    }

    fn v(i: u64) -> Value {
        Value::Inline(i.to_le_bytes().to_vec())
    }

    fn insert_range(tree: &Btree, keys: impl IntoIterator<Item = u64>) {
        let muts: Vec<(Key, Value)> = keys.into_iter().map(|i| (k(i), v(i))).collect();
        for chunk in muts.chunks(24) {
            tree.apply_unjournaled(chunk).expect("apply");
        }
    }

    fn delete_range(tree: &Btree, keys: impl IntoIterator<Item = u64>) {
        let muts: Vec<(Key, Value)> = keys.into_iter().map(|i| (k(i), Value::Whiteout)).collect();
        for chunk in muts.chunks(24) {
            tree.apply_unjournaled(chunk).expect("apply");
        }
    }

    fn contents(tree: &Btree) -> Vec<(Key, Value)> {
        tree.range(Key::MIN, Key::MAX)
            .map(|r| r.expect("scan"))
            .collect()
    }

    #[test]
    fn growth_splits_root_and_keeps_ranges_tiled() {
        let tree = Btree::new(TreeOptions::small_for_tests()).expect("tree");
        insert_range(&tree, 0..2000);
        let stats = tree.stats();
        assert!(stats.height >= 3, "height {}", stats.height);
        assert!(stats.splits > 0);
        assert!(stats.root_splits >= 2);
        let shape = tree.validate().expect("valid");
        assert_eq!(shape.entries, 2000);
    }

    #[test]
    fn shrink_merges_and_collapses_root() {
        let tree = Btree::new(TreeOptions::small_for_tests()).expect("tree");
        insert_range(&tree, 0..2000);
        let tall = tree.stats().height;
        delete_range(&tree, 10..2000);
        tree.maintain_all().expect("maintain");
        let stats = tree.stats();
        assert!(stats.merges > 0);
        assert!(stats.root_collapses > 0);
        assert!(stats.height < tall);
        tree.validate().expect("valid");
        assert_eq!(contents(&tree).len(), 10);
    }

    #[test]
    fn split_preserves_merged_view() {
        let tree = Btree::new(TreeOptions::small_for_tests()).expect("tree");
        insert_range(&tree, (0..25).map(|i| i * 3));
        let before = contents(&tree);
        insert_range(&tree, [1000, 1001, 1002, 1003, 1004, 1005]);
        let after: Vec<(Key, Value)> = contents(&tree)
            .into_iter()
            .filter(|(key, _)| key.inode < 1000)
            .collect();
        assert_eq!(before, after);
        tree.validate().expect("valid");
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(24))]

        #[test]
        fn tree_matches_model(ops in proptest::collection::vec((0_u64..400, any::<bool>()), 1..600)) {
            let tree = Btree::new(TreeOptions::small_for_tests()).expect("tree");
            let mut model = BTreeMap::new();
            for chunk in ops.chunks(17) {
                let mut batch = BTreeMap::new();
                for (key, insert) in chunk {
                    let value = if *insert { v(*key) } else { Value::Whiteout };
                    batch.insert(k(*key), value);
                }
                for (key, value) in &batch {
                    if value.is_whiteout() {
                        model.remove(key);
                    } else {
                        model.insert(*key, value.clone());
                    }
                }
                let muts: Vec<(Key, Value)> = batch.into_iter().collect();
                tree.apply_unjournaled(&muts).expect("apply");
            }
            tree.validate().expect("valid");
            let expected: Vec<(Key, Value)> = model.into_iter().collect();
            prop_assert_eq!(contents(&tree), expected);
        }
    }
}

//! Loading a tree from disk and writing dirty nodes back.
//!
//! Writeback is post-order: children first, so each parent page can embed
//! the fresh location of every rewritten child. A node that is clean and
//! whose children did not move keeps its existing location. Every rewrite
//! goes to a new location; the superseded one is handed back through
//! [`NodeIo::free_node`], which only schedules it for reuse.
//!
//! A non-root page that cannot be read at load time does not fail the
//! load. The node is kept as an unreadable stand-in covering the range its
//! parent expects, so only that range reports errors. Writeback never
//! rewrites it: parents keep pointing at the old location.

use crate::Btree;
use crate::node::NodeData;
use sfs_error::{Result, SfsError};
use sfs_ondisk::{Key, NodePage, NodePtr, NodeRange, Value};
use sfs_types::{Cx, NodeId};
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::Ordering;
use tracing::{debug, error, info};

/// Device side of node persistence.
pub trait NodeIo {
    /// Fetch the page behind `ptr`, verified against its checksum, falling
    /// back across replicas as needed.
    fn read_node(&self, cx: &Cx, ptr: &NodePtr) -> Result<Vec<u8>>;

    /// Write a COW copy of a page and return its new location.
    fn write_node(&self, cx: &Cx, id: NodeId, level: u8, page: &[u8]) -> Result<NodePtr>;

    /// A location is no longer referenced by the in-memory tree.
    fn free_node(&self, ptr: &NodePtr);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WritebackOutcome {
    pub root: NodePtr,
    pub written: usize,
    pub freed: usize,
}

fn cancelled(cx: &Cx) -> Result<()> {
    cx.checkpoint().map_err(|_| SfsError::Cancelled)
}

fn corrupt(id: NodeId, detail: impl Into<String>) -> SfsError {
    SfsError::NodeCorrupt {
        node: id.0,
        detail: detail.into(),
    }
}

/// Read the page behind `ptr` and check it against what the parent expects.
fn read_checked(cx: &Cx, io: &dyn NodeIo, ptr: &NodePtr, range: NodeRange) -> Result<NodeData> {
    let bytes = io.read_node(cx, ptr)?;
    let page = NodePage::decode(&bytes, Some(ptr.id))?;
    if page.level != ptr.level {
        return Err(corrupt(
            ptr.id,
            format!("page level {} but pointer says {}", page.level, ptr.level),
        ));
    }
    if page.range != range {
        return Err(corrupt(ptr.id, "page range disagrees with parent"));
    }
    NodeData::from_page(page, ptr.clone())
}

/// Failures confined to one node's page.
fn is_unreadable(err: &SfsError) -> bool {
    matches!(err, SfsError::Unreadable { .. }) || err.is_corruption()
}

impl Btree {
    /// Rebuild the in-memory tree reachable from `root`.
    ///
    /// Every page is checked against the level and key range its parent
    /// expects. With no root an empty tree is returned. A root that cannot
    /// be read fails the load; any other node that cannot be read becomes an
    /// unreadable stand-in.
    pub fn load(
        cx: &Cx,
        io: &dyn NodeIo,
        root: Option<&NodePtr>,
        next_node_id: u64,
        opts: crate::TreeOptions,
    ) -> Result<Self> {
        let Some(root) = root else {
            let tree = Self::new(opts)?;
            tree.store.reserve_through(NodeId(next_node_id.saturating_sub(1)));
            return Ok(tree);
        };
        opts.validate()?;
        let tree = Self::bare(opts, next_node_id);

        let mut queue = VecDeque::from([(root.clone(), NodeRange::FULL)]);
        let mut seen = HashSet::new();
        while let Some((ptr, range)) = queue.pop_front() {
            cancelled(cx)?;
            if !seen.insert(ptr.id) {
                return Err(corrupt(ptr.id, "node reachable twice"));
            }
            let data = match read_checked(cx, io, &ptr, range) {
                Ok(data) => data,
                Err(err) if ptr.id != root.id && is_unreadable(&err) => {
                    error!(
                        target: "sfs::btree",
                        event = "node_unreadable",
                        node = ptr.id.0,
                        level = ptr.level,
                        min = %range.min,
                        max = %range.max,
                        error = %err
                    );
                    tree.counters.unreadable.fetch_add(1, Ordering::Relaxed);
                    tree.store.insert(NodeData::unreadable(ptr, range, err.to_string()));
                    continue;
                }
                Err(err) => return Err(err),
            };
            for (i, child) in data.children().iter().enumerate() {
                let child_ptr = child
                    .ptr
                    .clone()
                    .ok_or_else(|| corrupt(data.id(), "child without location"))?;
                if child_ptr.level + 1 != data.level() {
                    return Err(corrupt(child_ptr.id, "child level does not descend by one"));
                }
                queue.push_back((child_ptr, data.child_range(i)));
            }
            tree.store.insert(data);
        }
        *tree.root.write() = root.id;

        info!(
            target: "sfs::btree",
            event = "tree_loaded",
            root = root.id.0,
            nodes = seen.len(),
            unreadable = tree.counters.unreadable.load(Ordering::Relaxed),
            height = u32::from(root.level) + 1
        );
        Ok(tree)
    }

    /// Write every dirty node to a fresh location and return the new root.
    ///
    /// Nodes are brought within size bounds first. The caller must keep
    /// commits out for the duration.
    pub fn writeback(&self, cx: &Cx, io: &dyn NodeIo) -> Result<WritebackOutcome> {
        let _structure = self.structure.lock();
        self.maintain_all_locked()?;

        let mut written = 0;
        let mut freed = 0;
        let root_id = self.root_id();
        let root = self.write_subtree(cx, io, root_id, &mut written, &mut freed)?;

        let retired = std::mem::take(&mut *self.retired.lock());
        for ptr in &retired {
            io.free_node(ptr);
        }
        info!(
            target: "sfs::btree",
            event = "writeback",
            root = root.id.0,
            written,
            retired = retired.len()
        );
        Ok(WritebackOutcome {
            root,
            written,
            freed: freed + retired.len(),
        })
    }

    fn write_subtree(
        &self,
        cx: &Cx,
        io: &dyn NodeIo,
        id: NodeId,
        written: &mut usize,
        freed: &mut usize,
    ) -> Result<NodePtr> {
        cancelled(cx)?;
        let node = self
            .store
            .get(id)
            .ok_or_else(|| corrupt(id, "node missing from node store"))?;
        let child_ids: Vec<NodeId> = {
            let g = node.lock.read();
            if g.unreadable.is_some() {
                return g
                    .location()
                    .cloned()
                    .ok_or_else(|| corrupt(id, "unreadable node without location"));
            }
            g.children().iter().map(|c| c.id).collect()
        };

        let mut current = Vec::with_capacity(child_ids.len());
        for child in child_ids {
            let ptr = self.write_subtree(cx, io, child, written, freed)?;
            current.push((child, ptr));
        }

        let mut g = node.lock.write();
        // A child may have moved during an earlier writeback that failed.
        for (child, ptr) in current {
            let pos = g
                .child_position(child)
                .ok_or_else(|| corrupt(child, "parent lost child during writeback"))?;
            if g.children[pos].ptr.as_ref() != Some(&ptr) {
                g.children[pos].ptr = Some(ptr);
                g.dirty = true;
            }
        }
        if !g.dirty {
            if let Some(loc) = g.location() {
                return Ok(loc.clone());
            }
        }

        let page = g.encode_page(&self.opts)?;
        if page.len() > self.opts.node_size as usize {
            return Err(SfsError::InvalidGeometry(format!(
                "node {} needs {} bytes, node size is {}",
                id.0,
                page.len(),
                self.opts.node_size
            )));
        }
        let ptr = io.write_node(cx, id, g.level(), &page)?;
        if let Some(old) = g.location.replace(ptr.clone()) {
            io.free_node(&old);
            *freed += 1;
        }
        g.dirty = false;
        *written += 1;
        debug!(
            target: "sfs::btree",
            event = "node_written",
            node = id.0,
            level = g.level(),
            bytes = page.len()
        );
        Ok(ptr)
    }

    /// Force a node to be rewritten at the next writeback. False for nodes
    /// that are gone or unreadable.
    pub fn mark_dirty(&self, id: NodeId) -> bool {
        match self.store.get(id) {
            Some(node) => {
                let mut g = node.lock.write();
                if g.is_dead() || g.unreadable.is_some() {
                    return false;
                }
                g.dirty = true;
                true
            }
            None => false,
        }
    }

    /// On-disk location of every live node that has one.
    #[must_use]
    pub fn node_locations(&self) -> Vec<NodePtr> {
        self.store
            .all()
            .iter()
            .filter_map(|n| n.lock.read().location().cloned())
            .collect()
    }

    /// Visit every visible leaf entry, leaf by leaf in no particular order.
    pub fn for_each_leaf_entry(&self, mut f: impl FnMut(&Key, &Value)) {
        for node in self.store.all() {
            let g = node.lock.read();
            if g.is_dead() || !g.is_leaf() {
                continue;
            }
            for (key, value) in g.entries() {
                f(&key, &value);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TreeOptions;
    use parking_lot::Mutex;
    use sfs_ondisk::{Checksum, ChecksumKind, ReplicaPtr};
    use sfs_types::{BucketIndex, DeviceId, Generation, JournalSeq};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU64, Ordering};

    /// Pages kept in a map keyed by a fake bucket number.
    #[derive(Default)]
    struct MemIo {
        pages: Mutex<HashMap<u64, Vec<u8>>>,
        freed: Mutex<Vec<u64>>,
        next: AtomicU64,
    }

    impl NodeIo for MemIo {
        fn read_node(&self, _cx: &Cx, ptr: &NodePtr) -> Result<Vec<u8>> {
            let slot = ptr.checksum.value;
            self.pages
                .lock()
                .get(&slot)
                .cloned()
                .ok_or_else(|| SfsError::Unreadable {
                    what: format!("node {}", ptr.id.0),
                    detail: format!("slot {slot} lost"),
                })
        }

        fn write_node(&self, _cx: &Cx, id: NodeId, level: u8, page: &[u8]) -> Result<NodePtr> {
            let slot = self.next.fetch_add(1, Ordering::Relaxed);
            self.pages.lock().insert(slot, page.to_vec());
            Ok(NodePtr {
                id,
                level,
                size: u32::try_from(page.len()).expect("page fits"),
                checksum: Checksum {
                    kind: ChecksumKind::None,
                    value: slot,
                },
                replicas: vec![ReplicaPtr {
                    device: DeviceId(0),
                    bucket: BucketIndex(slot),
                    offset: 0,
                    generation: Generation(0),
                }],
            })
        }

        fn free_node(&self, ptr: &NodePtr) {
            self.freed.lock().push(ptr.checksum.value);
        }
    }

    fn k(i: u64) -> Key {
        Key::new(i, 0, 0)
    }

    fn populated(n: u64) -> Btree {
        let tree = Btree::new(TreeOptions::small_for_tests()).expect("tree");
        let muts: Vec<(Key, Value)> = (0..n)
            .map(|i| (k(i), Value::Inline(i.to_le_bytes().to_vec())))
            .collect();
        for chunk in muts.chunks(32) {
            tree.apply_unjournaled(chunk).expect("apply");
        }
        tree
    }

    fn dump(tree: &Btree) -> Vec<(Key, Value)> {
        tree.range(Key::MIN, Key::MAX)
            .map(|r| r.expect("scan"))
            .collect()
    }

    #[test]
    fn writeback_then_load_round_trips() {
        let cx = Cx::for_testing();
        let io = MemIo::default();
        let tree = populated(700);
        let out = tree.writeback(&cx, &io).expect("writeback");
        assert_eq!(out.written, tree.stats().nodes);

        let loaded = Btree::load(
            &cx,
            &io,
            Some(&out.root),
            tree.next_node_id(),
            TreeOptions::small_for_tests(),
        )
        .expect("load");
        assert_eq!(dump(&loaded), dump(&tree));
        loaded.validate().expect("valid");
        assert_eq!(loaded.stats().height, tree.stats().height);
        assert!(loaded.next_node_id() >= tree.next_node_id());
    }

    #[test]
    fn clean_tree_rewrites_nothing() {
        let cx = Cx::for_testing();
        let io = MemIo::default();
        let tree = populated(300);
        let first = tree.writeback(&cx, &io).expect("first");
        let second = tree.writeback(&cx, &io).expect("second");
        assert_eq!(second.written, 0);
        assert_eq!(second.root, first.root);
    }

    #[test]
    fn single_leaf_change_rewrites_its_path_only() {
        let cx = Cx::for_testing();
        let io = MemIo::default();
        let tree = populated(700);
        tree.writeback(&cx, &io).expect("first");
        let freed_before = io.freed.lock().len();
        tree.apply_unjournaled(&[(k(5), Value::Inline(vec![9]))])
            .expect("update");
        let out = tree.writeback(&cx, &io).expect("second");
        assert_eq!(out.written, usize::from(tree.stats().height));
        assert_eq!(io.freed.lock().len() - freed_before, out.written);
    }

    #[test]
    fn mark_dirty_forces_rewrite() {
        let cx = Cx::for_testing();
        let io = MemIo::default();
        let tree = populated(100);
        tree.writeback(&cx, &io).expect("first");
        let leaf = tree.cursor().seek(&k(50)).expect("seek").id();
        assert!(tree.mark_dirty(leaf));
        let out = tree.writeback(&cx, &io).expect("second");
        assert!(out.written >= 1);
        assert!(!tree.mark_dirty(NodeId(u64::MAX)));
    }

    #[test]
    fn load_rejects_range_mismatch() {
        let cx = Cx::for_testing();
        let io = MemIo::default();
        let tree = populated(300);
        let out = tree.writeback(&cx, &io).expect("writeback");
        assert!(out.root.level > 0);
        // Point the loader at a child as if it were the root.
        let loaded = Btree::load(&cx, &io, Some(&out.root), 0, TreeOptions::small_for_tests())
            .expect("load");
        let leaf_ptr = loaded
            .node_locations()
            .into_iter()
            .find(|p| p.level == 0 && p.id != out.root.id)
            .expect("a leaf");
        let err = Btree::load(&cx, &io, Some(&leaf_ptr), 0, TreeOptions::small_for_tests())
            .map(|_| ())
            .expect_err("leaf range is not the full key space");
        assert!(err.is_corruption());
    }

    #[test]
    fn leaf_entries_visitor_sees_everything() {
        let tree = populated(250);
        let mut n = 0;
        tree.for_each_leaf_entry(|_, _| n += 1);
        assert_eq!(n, 250);
    }

    fn leaf_with_siblings(tree: &Btree) -> (NodePtr, NodeRange) {
        tree.node_locations()
            .into_iter()
            .filter(|p| p.level == 0)
            .find_map(|p| {
                let range = tree.node(p.id)?.lock.read().range();
                (range.min != Key::MIN && range.max != Key::MAX).then_some((p, range))
            })
            .expect("an inner leaf")
    }

    #[test]
    fn lost_leaf_fails_only_its_own_range() {
        let cx = Cx::for_testing();
        let io = MemIo::default();
        let tree = populated(700);
        let out = tree.writeback(&cx, &io).expect("writeback");
        let (lost, range) = leaf_with_siblings(&tree);
        io.pages.lock().remove(&lost.checksum.value);

        let loaded = Btree::load(&cx, &io, Some(&out.root), tree.next_node_id(), TreeOptions::small_for_tests())
            .expect("load tolerates one lost leaf");
        assert_eq!(loaded.stats().unreadable_nodes, 1);
        let (inside, outside): (Vec<u64>, Vec<u64>) = (0..700).partition(|i| range.contains(&k(*i)));
        assert!(!inside.is_empty());
        for i in &inside {
            assert!(matches!(loaded.lookup(&k(*i)), Err(SfsError::Unreadable { .. })));
        }
        for i in &outside {
            assert_eq!(
                loaded.lookup(&k(*i)).expect("readable range"),
                Some(Value::Inline(i.to_le_bytes().to_vec()))
            );
        }
        assert!(matches!(
            loaded.apply_unjournaled(&[(k(inside[0]), Value::Inline(vec![1]))]),
            Err(SfsError::Unreadable { .. })
        ));
        let scanned: Vec<Result<(Key, Value)>> = loaded.range(Key::MIN, Key::MAX).collect();
        assert!(matches!(scanned.last(), Some(Err(SfsError::Unreadable { .. }))));
        assert_eq!(loaded.validate().expect("valid").unreadable, 1);
        assert!(!loaded.mark_dirty(lost.id));
    }

    #[test]
    fn writeback_keeps_pointing_at_a_lost_leaf() {
        let cx = Cx::for_testing();
        let io = MemIo::default();
        let tree = populated(700);
        let out = tree.writeback(&cx, &io).expect("writeback");
        let (lost, range) = leaf_with_siblings(&tree);
        io.pages.lock().remove(&lost.checksum.value);
        let loaded = Btree::load(&cx, &io, Some(&out.root), tree.next_node_id(), TreeOptions::small_for_tests())
            .expect("load");

        let outside = (0..700).find(|i| !range.contains(&k(*i))).expect("outside key");
        loaded
            .apply_unjournaled(&[(k(outside), Value::Inline(vec![7]))])
            .expect("update elsewhere");
        let again = loaded.writeback(&cx, &io).expect("writeback with lost leaf");
        assert!(loaded.node_locations().contains(&lost));

        let reloaded = Btree::load(&cx, &io, Some(&again.root), loaded.next_node_id(), TreeOptions::small_for_tests())
            .expect("reload");
        assert_eq!(reloaded.stats().unreadable_nodes, 1);
        assert_eq!(reloaded.lookup(&k(outside)).expect("lookup"), Some(Value::Inline(vec![7])));
    }

    #[test]
    fn replay_drops_mutations_under_a_lost_leaf() {
        let cx = Cx::for_testing();
        let io = MemIo::default();
        let tree = populated(700);
        let out = tree.writeback(&cx, &io).expect("writeback");
        let (lost, range) = leaf_with_siblings(&tree);
        io.pages.lock().remove(&lost.checksum.value);
        let loaded = Btree::load(&cx, &io, Some(&out.root), tree.next_node_id(), TreeOptions::small_for_tests())
            .expect("load");

        let inside = (0..700).find(|i| range.contains(&k(*i))).expect("inside key");
        let outside = (0..700).find(|i| !range.contains(&k(*i))).expect("outside key");
        let applied = loaded
            .replay(
                JournalSeq(9),
                &[(k(inside), Value::Whiteout), (k(outside), Value::Whiteout)],
            )
            .expect("replay");
        assert_eq!(applied, 1);
        assert_eq!(loaded.stats().replay_skipped, 1);
        assert_eq!(loaded.lookup(&k(outside)).expect("lookup"), None);
    }

    #[test]
    fn lost_root_still_fails_the_load() {
        let cx = Cx::for_testing();
        let io = MemIo::default();
        let tree = populated(300);
        let out = tree.writeback(&cx, &io).expect("writeback");
        io.pages.lock().remove(&out.root.checksum.value);
        let err = Btree::load(&cx, &io, Some(&out.root), 0, TreeOptions::small_for_tests())
            .map(|_| ())
            .expect_err("no root");
        assert!(matches!(err, SfsError::Unreadable { .. }));
    }
}

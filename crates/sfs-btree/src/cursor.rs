//! Lock-coupled descent with a cached, revalidatable path.
//!
//! A descent holds at most two read locks at a time: the parent stays
//! locked until the child lock is taken. When the child is contended the
//! parent is released first and the child is locked blocking, then its
//! range is checked again because a split or merge may have moved the key
//! elsewhere in between.
//!
//! After each descent the cursor remembers one [`RelockHandle`] per level.
//! The next seek starts from the deepest remembered node that (a) saw no
//! writer since it was recorded and (b) still covers the key; only when no
//! level qualifies does it re-walk from the root. Sequential scans therefore
//! hop between sibling leaves through their shared parent.
//!
//! A descent that reaches a node loaded as unreadable stops there with
//! `Unreadable`; only keys under that node are affected.

use crate::Btree;
use crate::node::NodeData;
use sfs_error::{Result, SfsError};
use sfs_lock::{ReadGuard, RelockHandle};
use sfs_ondisk::{Key, NodeRange};

struct PathLevel {
    handle: RelockHandle<NodeData>,
    range: NodeRange,
}

pub struct Cursor<'t> {
    tree: &'t Btree,
    path: Vec<PathLevel>,
}

impl<'t> Cursor<'t> {
    #[must_use]
    pub fn new(tree: &'t Btree) -> Self {
        Self {
            tree,
            path: Vec::new(),
        }
    }

    /// Number of levels currently remembered.
    #[must_use]
    pub fn depth(&self) -> usize {
        self.path.len()
    }

    /// Forget the cached path; the next seek starts at the root.
    pub fn reset(&mut self) {
        self.path.clear();
    }

    /// Read-lock the leaf covering `key`. Fails with `Unreadable` when the
    /// path to it passes through a node whose page could not be read.
    pub fn seek(&mut self, key: &Key) -> Result<ReadGuard<NodeData>> {
        let mut guard = match self.resume(key) {
            Some(g) => g,
            None => self.lock_root(key),
        };
        loop {
            self.remember(&guard);
            guard.check_readable()?;
            if guard.is_leaf() {
                return Ok(guard);
            }

            let parent_level = guard.level();
            let child_id = guard
                .child_for(key)
                .map(|c| c.id)
                .ok_or_else(|| SfsError::NodeCorrupt {
                    node: guard.id().0,
                    detail: "interior node has no children".to_owned(),
                })?;
            let child = self
                .tree
                .store
                .get(child_id)
                .ok_or_else(|| SfsError::NodeCorrupt {
                    node: child_id.0,
                    detail: "child missing from node store".to_owned(),
                })?;

            let child_guard = if let Some(g) = child.lock.try_read() {
                drop(guard);
                g
            } else {
                drop(guard);
                child.lock.read()
            };

            if child_guard.is_dead()
                || child_guard.level() + 1 != parent_level
                || !child_guard.range().contains(key)
            {
                drop(child_guard);
                self.tree.note_restart();
                guard = match self.resume(key) {
                    Some(g) => g,
                    None => self.lock_root(key),
                };
                continue;
            }
            guard = child_guard;
        }
    }

    fn remember(&mut self, guard: &ReadGuard<NodeData>) {
        self.path.push(PathLevel {
            handle: guard.relock_handle(),
            range: guard.range(),
        });
    }

    /// Relock the deepest remembered level that still covers `key`.
    fn resume(&mut self, key: &Key) -> Option<ReadGuard<NodeData>> {
        while let Some(level) = self.path.pop() {
            if !level.range.contains(key) {
                continue;
            }
            if let Some(g) = level.handle.try_read() {
                if !g.is_dead() && g.range().contains(key) {
                    return Some(g);
                }
            }
        }
        None
    }

    fn lock_root(&mut self, key: &Key) -> ReadGuard<NodeData> {
        self.path.clear();
        loop {
            if let Some(root) = self.tree.store.get(self.tree.root_id()) {
                let g = root.lock.read();
                if !g.is_dead() && g.range().contains(key) {
                    return g;
                }
            }
            self.tree.note_restart();
            std::thread::yield_now();
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::{Btree, TreeOptions};
    use sfs_ondisk::{Key, Value};

    fn k(i: u64) -> Key {
        Key::new(i, 0, 0)
    }

    fn small_tree(n: u64) -> Btree {
        let tree = Btree::new(TreeOptions::small_for_tests()).expect("tree");
        let muts: Vec<(Key, Value)> = (0..n).map(|i| (k(i), Value::Inline(vec![1; 8]))).collect();
        for chunk in muts.chunks(16) {
            tree.apply_unjournaled(chunk).expect("apply");
        }
        tree
    }

    #[test]
    fn seek_reaches_covering_leaf() {
        let tree = small_tree(500);
        assert!(tree.stats().height >= 2);
        let mut cursor = tree.cursor();
        for i in [0, 17, 250, 499] {
            let leaf = cursor.seek(&k(i)).expect("seek");
            assert!(leaf.is_leaf());
            assert!(leaf.range().contains(&k(i)));
            assert!(leaf.lookup(&k(i)).is_some());
        }
    }

    #[test]
    fn sequential_seeks_resume_below_root() {
        let tree = small_tree(500);
        let mut cursor = tree.cursor();
        let first = cursor.seek(&k(0)).expect("seek");
        let next = first.range().max.successor().expect("successor");
        drop(first);
        let depth = cursor.depth();
        assert_eq!(depth, usize::from(tree.stats().height));
        let restarts = tree.stats().restarts;
        let leaf = cursor.seek(&next).expect("seek sibling");
        assert!(leaf.range().contains(&next));
        assert_eq!(tree.stats().restarts, restarts);
    }

    #[test]
    fn stale_leaf_handle_falls_back_to_ancestor() {
        let tree = small_tree(200);
        let mut cursor = tree.cursor();
        let leaf = cursor.seek(&k(10)).expect("seek");
        drop(leaf);
        tree.apply_unjournaled(&[(k(10), Value::Whiteout)])
            .expect("delete");
        let leaf = cursor.seek(&k(10)).expect("reseek");
        assert_eq!(leaf.lookup(&k(10)), None);
    }
}

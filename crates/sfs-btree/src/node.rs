//! In-memory node contents.
//!
//! A leaf holds sealed sorted runs (oldest first) plus one open run that
//! absorbs new inserts. Lookups consult the open run, then sealed runs
//! newest first; the first hit wins and a whiteout hides everything older.
//!
//! An interior node holds child references ordered by max key. Child `i`
//! covers `(children[i-1].max_key, children[i].max_key]`; the first child
//! starts at the node's own `range.min` and the last ends at `range.max`.
//!
//! ```text
//!   interior [min ............................................ max]
//!              child 0: ..=k1 | child 1: ..=k2 | child 2: ..=max
//! ```

use crate::TreeOptions;
use sfs_error::{Result, SfsError};
use sfs_ondisk::node::{RUN_HEADER_LEN, page_len_for};
use sfs_ondisk::{Bset, Key, NodePage, NodePtr, NodeRange, Value, entry_len, merge_runs};
use sfs_types::{JournalSeq, NodeId, RunSeq};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChildRef {
    pub max_key: Key,
    pub id: NodeId,
    /// Last written location; `None` until the child reaches disk.
    pub ptr: Option<NodePtr>,
}

#[derive(Debug)]
pub struct NodeData {
    pub(crate) id: NodeId,
    pub(crate) level: u8,
    pub(crate) range: NodeRange,
    pub(crate) runs: Vec<Bset>,
    pub(crate) open: BTreeMap<Key, Value>,
    pub(crate) next_seq: RunSeq,
    pub(crate) children: Vec<ChildRef>,
    pub(crate) location: Option<NodePtr>,
    pub(crate) dirty: bool,
    pub(crate) journal_seq: JournalSeq,
    pub(crate) dead: bool,
    /// Set when no replica of the page could be read at mount. The node
    /// keeps its pointer and range but has no contents.
    pub(crate) unreadable: Option<String>,
}

fn corrupt(id: NodeId, detail: impl Into<String>) -> SfsError {
    SfsError::NodeCorrupt {
        node: id.0,
        detail: detail.into(),
    }
}

impl NodeData {
    pub(crate) fn new_leaf(id: NodeId, range: NodeRange) -> Self {
        Self {
            id,
            level: 0,
            range,
            runs: Vec::new(),
            open: BTreeMap::new(),
            next_seq: RunSeq(1),
            children: Vec::new(),
            location: None,
            dirty: true,
            journal_seq: JournalSeq::ZERO,
            dead: false,
            unreadable: None,
        }
    }

    pub(crate) fn new_interior(
        id: NodeId,
        level: u8,
        range: NodeRange,
        children: Vec<ChildRef>,
    ) -> Self {
        Self {
            level,
            children,
            ..Self::new_leaf(id, range)
        }
    }

    /// Stand-in for a node whose page could not be read. It keeps the level
    /// and range its parent expects and its old location, and is never
    /// rewritten.
    pub(crate) fn unreadable(location: NodePtr, range: NodeRange, reason: String) -> Self {
        let mut node = Self::new_leaf(location.id, range);
        node.level = location.level;
        node.location = Some(location);
        node.dirty = false;
        node.unreadable = Some(reason);
        node
    }

    /// Rebuild a node from a verified page read at `location`.
    pub(crate) fn from_page(page: NodePage, location: NodePtr) -> Result<Self> {
        let next_seq = page
            .runs
            .last()
            .map_or(RunSeq(1), |r| RunSeq(r.seq().0.saturating_add(1)));
        let mut node = Self::new_leaf(page.id, page.range);
        node.level = page.level;
        node.next_seq = next_seq;
        node.journal_seq = page.journal_seq;
        node.location = Some(location);
        node.dirty = false;

        if page.level == 0 {
            node.runs = page.runs;
            return Ok(node);
        }

        let views: Vec<&[(Key, Value)]> = page.runs.iter().map(Bset::entries).collect();
        for (max_key, value) in merge_runs(&views, true) {
            let Value::Node(ptr) = value else {
                return Err(corrupt(page.id, "interior entry is not a child pointer"));
            };
            node.children.push(ChildRef {
                max_key,
                id: ptr.id,
                ptr: Some(ptr),
            });
        }
        match node.children.last() {
            None => Err(corrupt(page.id, "interior node has no children")),
            Some(last) if last.max_key != page.range.max => Err(corrupt(
                page.id,
                "last child does not end at the node's max key",
            )),
            Some(_) => Ok(node),
        }
    }

    // ── Accessors ───────────────────────────────────────────────────────

    #[must_use]
    pub fn id(&self) -> NodeId {
        self.id
    }

    #[must_use]
    pub fn level(&self) -> u8 {
        self.level
    }

    #[must_use]
    pub fn range(&self) -> NodeRange {
        self.range
    }

    #[must_use]
    pub fn is_leaf(&self) -> bool {
        self.level == 0
    }

    #[must_use]
    pub fn is_dead(&self) -> bool {
        self.dead
    }

    /// Why the node's page could not be read, if it could not.
    #[must_use]
    pub fn unreadable_reason(&self) -> Option<&str> {
        self.unreadable.as_deref()
    }

    /// `Unreadable` error for callers that reached this node.
    pub(crate) fn check_readable(&self) -> Result<()> {
        match &self.unreadable {
            None => Ok(()),
            Some(reason) => Err(SfsError::Unreadable {
                what: format!(
                    "node {} (level {}, keys {}..={})",
                    self.id.0, self.level, self.range.min, self.range.max
                ),
                detail: reason.clone(),
            }),
        }
    }

    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    #[must_use]
    pub fn journal_seq(&self) -> JournalSeq {
        self.journal_seq
    }

    #[must_use]
    pub fn location(&self) -> Option<&NodePtr> {
        self.location.as_ref()
    }

    #[must_use]
    pub fn run_count(&self) -> usize {
        self.runs.len()
    }

    #[must_use]
    pub fn open_len(&self) -> usize {
        self.open.len()
    }

    #[must_use]
    pub fn children(&self) -> &[ChildRef] {
        &self.children
    }

    // ── Leaf reads ──────────────────────────────────────────────────────

    /// Newest stored version of `key`, whiteouts included.
    #[must_use]
    pub fn newest(&self, key: &Key) -> Option<&Value> {
        self.open
            .get(key)
            .or_else(|| self.runs.iter().rev().find_map(|r| r.get(key)))
    }

    #[must_use]
    pub fn lookup(&self, key: &Key) -> Option<Value> {
        self.newest(key).filter(|v| !v.is_whiteout()).cloned()
    }

    /// Visible entries in `[start, end]`, ascending.
    #[must_use]
    pub fn range_entries(&self, start: &Key, end: &Key) -> Vec<(Key, Value)> {
        if start > end {
            return Vec::new();
        }
        let open: Vec<(Key, Value)> = self
            .open
            .range(*start..=*end)
            .map(|(k, v)| (*k, v.clone()))
            .collect();
        let mut views: Vec<&[(Key, Value)]> =
            self.runs.iter().map(|r| r.range(start, end)).collect();
        views.push(&open);
        merge_runs(&views, true)
    }

    /// Every visible entry of the leaf.
    #[must_use]
    pub fn entries(&self) -> Vec<(Key, Value)> {
        self.range_entries(&self.range.min, &self.range.max)
    }

    /// Page bytes needed to write the node as it stands, without compaction.
    #[must_use]
    pub fn page_len(&self) -> usize {
        let mut len = page_len_for(self.runs.iter());
        if !self.open.is_empty() {
            len += RUN_HEADER_LEN
                + self
                    .open
                    .values()
                    .map(|v| entry_len(v.payload_len()))
                    .sum::<usize>();
        }
        len
    }

    /// Packed entry bytes left after compaction.
    #[must_use]
    pub fn live_bytes(&self) -> usize {
        self.entries()
            .iter()
            .map(|(_, v)| entry_len(v.payload_len()))
            .sum()
    }

    // ── Leaf writes ─────────────────────────────────────────────────────

    /// Insert into the open run; returns the previously visible value.
    pub(crate) fn insert(
        &mut self,
        key: Key,
        value: Value,
        opts: &TreeOptions,
    ) -> Result<Option<Value>> {
        if !self.range.contains(&key) {
            return Err(corrupt(self.id, "insert outside node range"));
        }
        let old = self.lookup(&key);
        self.open.insert(key, value);
        self.dirty = true;
        if self.open.len() >= opts.open_run_max_entries {
            self.seal_open()?;
        }
        if self.runs.len() > opts.max_runs_per_node {
            self.compact()?;
        }
        Ok(old)
    }

    pub(crate) fn seal_open(&mut self) -> Result<()> {
        if self.open.is_empty() {
            return Ok(());
        }
        let entries: Vec<(Key, Value)> = std::mem::take(&mut self.open).into_iter().collect();
        let run = Bset::from_sorted(self.next_seq, entries)?;
        self.push_run(run)
    }

    /// Append a sealed run. Run sequence numbers must strictly increase.
    pub(crate) fn push_run(&mut self, run: Bset) -> Result<()> {
        if self.runs.last().is_some_and(|last| run.seq() <= last.seq()) {
            return Err(corrupt(self.id, "run sequence numbers must strictly increase"));
        }
        self.next_seq = RunSeq(run.seq().0.saturating_add(1));
        self.runs.push(run);
        self.dirty = true;
        Ok(())
    }

    /// Fold every run into one, dropping whiteouts and shadowed versions.
    pub(crate) fn compact(&mut self) -> Result<()> {
        let merged = self.entries();
        self.replace_entries(merged)
    }

    fn replace_entries(&mut self, entries: Vec<(Key, Value)>) -> Result<()> {
        self.open.clear();
        self.runs.clear();
        self.dirty = true;
        if entries.is_empty() {
            return Ok(());
        }
        let run = Bset::from_sorted(self.next_seq, entries)?;
        self.push_run(run)
    }

    // ── Interior navigation ─────────────────────────────────────────────

    #[must_use]
    pub fn child_index(&self, key: &Key) -> usize {
        self.children
            .partition_point(|c| c.max_key < *key)
            .min(self.children.len().saturating_sub(1))
    }

    #[must_use]
    pub fn child_for(&self, key: &Key) -> Option<&ChildRef> {
        self.children.get(self.child_index(key))
    }

    #[must_use]
    pub fn child_range(&self, idx: usize) -> NodeRange {
        let min = match idx.checked_sub(1).and_then(|p| self.children.get(p)) {
            Some(prev) => prev.max_key.successor().unwrap_or(Key::MAX),
            None => self.range.min,
        };
        let max = self.children.get(idx).map_or(self.range.max, |c| c.max_key);
        NodeRange { min, max }
    }

    pub(crate) fn child_position(&self, id: NodeId) -> Option<usize> {
        self.children.iter().position(|c| c.id == id)
    }

    // ── Structure ───────────────────────────────────────────────────────

    /// Move the upper half into a new node `right_id`; `self` keeps the
    /// lower half. Leaves split at the byte median. Returns `None` when the
    /// node has too few entries to split.
    pub(crate) fn split_off(&mut self, right_id: NodeId) -> Result<Option<Self>> {
        if !self.is_leaf() {
            if self.children.len() < 2 {
                return Ok(None);
            }
            let upper = self.children.split_off(self.children.len() / 2);
            let left_max = self
                .children
                .last()
                .map(|c| c.max_key)
                .ok_or_else(|| corrupt(self.id, "split left no children"))?;
            let right_min = left_max
                .successor()
                .ok_or_else(|| corrupt(self.id, "split point at key space end"))?;
            let mut right = Self::new_interior(
                right_id,
                self.level,
                NodeRange {
                    min: right_min,
                    max: self.range.max,
                },
                upper,
            );
            right.journal_seq = self.journal_seq;
            self.range.max = left_max;
            self.dirty = true;
            return Ok(Some(right));
        }

        let mut entries = self.entries();
        if entries.len() < 2 {
            return Ok(None);
        }
        let total: usize = entries.iter().map(|(_, v)| entry_len(v.payload_len())).sum();
        let mut acc = 0;
        let mut mid = entries.len() / 2;
        for (i, (_, v)) in entries.iter().enumerate() {
            acc += entry_len(v.payload_len());
            if acc * 2 >= total {
                mid = i + 1;
                break;
            }
        }
        let mid = mid.clamp(1, entries.len() - 1);
        let upper = entries.split_off(mid);
        let median = upper[0].0;
        let left_max = median
            .predecessor()
            .ok_or_else(|| corrupt(self.id, "split point at key space start"))?;
        let mut right = Self::new_leaf(
            right_id,
            NodeRange {
                min: median,
                max: self.range.max,
            },
        );
        right.replace_entries(upper)?;
        right.journal_seq = self.journal_seq;
        self.range.max = left_max;
        self.replace_entries(entries)?;
        Ok(Some(right))
    }

    /// Take over the right neighbour's contents and range.
    pub(crate) fn absorb(&mut self, right: &mut Self) -> Result<()> {
        if self.level != right.level {
            return Err(corrupt(self.id, "merge across levels"));
        }
        if self.is_leaf() {
            let mut all = self.entries();
            all.extend(right.entries());
            self.range.max = right.range.max;
            self.replace_entries(all)?;
        } else {
            self.children.append(&mut right.children);
            self.range.max = right.range.max;
            self.dirty = true;
        }
        self.journal_seq = self.journal_seq.max(right.journal_seq);
        right.runs.clear();
        right.open.clear();
        right.dead = true;
        Ok(())
    }

    /// Serialize for writeback. Leaves seal their open run first and
    /// compact when the page would not fit; interior nodes emit one run of
    /// child pointers, so every child must already be on disk.
    pub(crate) fn encode_page(&mut self, opts: &TreeOptions) -> Result<Vec<u8>> {
        if self.is_leaf() {
            self.seal_open()?;
            if self.runs.len() > opts.max_runs_per_node
                || page_len_for(self.runs.iter()) > opts.node_size as usize
            {
                self.compact()?;
            }
            let runs: Vec<&Bset> = self.runs.iter().collect();
            return NodePage::encode_parts(self.id, self.level, self.journal_seq, self.range, &runs);
        }

        let mut entries = Vec::with_capacity(self.children.len());
        for child in &self.children {
            let ptr = child.ptr.clone().ok_or_else(|| {
                corrupt(self.id, format!("child {} has no on-disk location", child.id.0))
            })?;
            entries.push((child.max_key, Value::Node(ptr)));
        }
        let run = Bset::from_sorted(self.next_seq, entries)?;
        self.next_seq = RunSeq(self.next_seq.0.saturating_add(1));
        NodePage::encode_parts(self.id, self.level, self.journal_seq, self.range, &[&run])
    }
}

//! Lazy range iteration.
//!
//! The iterator buffers one leaf at a time: it read-locks the leaf covering
//! the next key, copies the visible entries up to the leaf's max key, and
//! releases the lock before yielding anything. The resume key is the
//! successor of that leaf's max, so a leaf that splits or merges between
//! refills is simply re-found by the cursor. Each leaf is a consistent
//! snapshot; the scan as a whole is not.

use crate::Btree;
use crate::cursor::Cursor;
use sfs_error::Result;
use sfs_ondisk::{Key, Value};
use std::collections::VecDeque;

pub struct RangeIter<'t> {
    cursor: Cursor<'t>,
    next: Option<Key>,
    end: Key,
    buffer: VecDeque<(Key, Value)>,
    leaves: usize,
}

impl<'t> RangeIter<'t> {
    pub(crate) fn new(tree: &'t Btree, start: Key, end: Key) -> Self {
        Self {
            cursor: Cursor::new(tree),
            next: (start <= end).then_some(start),
            end,
            buffer: VecDeque::new(),
            leaves: 0,
        }
    }

    /// Leaves visited so far.
    #[must_use]
    pub fn leaves_visited(&self) -> usize {
        self.leaves
    }

    fn refill(&mut self, from: Key) -> Result<()> {
        let leaf = self.cursor.seek(&from)?;
        let range = leaf.range();
        let upper = range.max.min(self.end);
        self.buffer.extend(leaf.range_entries(&from, &upper));
        drop(leaf);
        self.leaves += 1;
        self.next = if range.max >= self.end {
            None
        } else {
            range.max.successor()
        };
        Ok(())
    }
}

impl Iterator for RangeIter<'_> {
    type Item = Result<(Key, Value)>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(entry) = self.buffer.pop_front() {
                return Some(Ok(entry));
            }
            let from = self.next?;
            if let Err(err) = self.refill(from) {
                self.next = None;
                return Some(Err(err));
            }
        }
    }
}

//! Sorted runs.
//!
//! A [`Bset`] is sealed once from a batch of pending pairs and never
//! modified afterwards. It keeps both the decoded entries (for lookups and
//! merges) and the packed bytes with their CRC32C (for page writes), so a
//! run is encoded exactly once in its life.

use crate::key::{Key, compare_encoded, decode_entry, encode_entry, entry_len};
use crate::value::Value;
use sfs_error::{Result, SfsError};
use sfs_types::RunSeq;
use std::cmp::Ordering;
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bset {
    seq: RunSeq,
    entries: Vec<(Key, Value)>,
    data: Vec<u8>,
    crc: u32,
}

impl Bset {
    /// Sort `items` once and seal them. Duplicate keys keep the last pair
    /// supplied.
    pub fn build(seq: RunSeq, items: impl IntoIterator<Item = (Key, Value)>) -> Result<Self> {
        let mut map = BTreeMap::new();
        for (k, v) in items {
            map.insert(k, v);
        }
        Self::from_sorted(seq, map.into_iter().collect())
    }

    /// Seal entries that are already strictly ascending by key.
    pub fn from_sorted(seq: RunSeq, entries: Vec<(Key, Value)>) -> Result<Self> {
        if entries.windows(2).any(|w| w[0].0 >= w[1].0) {
            return Err(SfsError::CorruptKey(
                "run entries are not strictly ascending".to_owned(),
            ));
        }
        let mut data = Vec::new();
        for (k, v) in &entries {
            encode_entry(k, v, &mut data)?;
        }
        let crc = crc32c::crc32c(&data);
        Ok(Self {
            seq,
            entries,
            data,
            crc,
        })
    }

    /// Parse a packed run read from a node page.
    ///
    /// Validates the whole-run checksum, the entry count, and strict key
    /// order (with the byte comparator) before anything is decoded.
    pub fn decode(seq: RunSeq, data: &[u8], nr_entries: u32, crc: u32) -> Result<Self> {
        let computed = crc32c::crc32c(data);
        if computed != crc {
            return Err(SfsError::CorruptKey(format!(
                "run {} checksum mismatch: stored {crc:#010x}, computed {computed:#010x}",
                seq.0
            )));
        }
        let cap = usize::try_from(nr_entries)
            .unwrap_or(0)
            .min(data.len() / entry_len(0));
        let mut entries = Vec::with_capacity(cap);
        let mut pos = 0_usize;
        let mut prev: Option<&[u8]> = None;
        while pos < data.len() {
            let (pair, used) = decode_entry(&data[pos..])?;
            let raw = &data[pos..pos + used];
            if let Some(prev) = prev {
                if compare_encoded(prev, raw) != Ordering::Less {
                    return Err(SfsError::CorruptKey(format!(
                        "run {} keys out of order at byte {pos}",
                        seq.0
                    )));
                }
            }
            prev = Some(raw);
            entries.push(pair);
            pos += used;
        }
        if u32::try_from(entries.len()).ok() != Some(nr_entries) {
            return Err(SfsError::CorruptKey(format!(
                "run {} declares {nr_entries} entries, found {}",
                seq.0,
                entries.len()
            )));
        }
        Ok(Self {
            seq,
            entries,
            data: data.to_vec(),
            crc,
        })
    }

    #[must_use]
    pub fn seq(&self) -> RunSeq {
        self.seq
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn entries(&self) -> &[(Key, Value)] {
        &self.entries
    }

    /// Packed entry bytes.
    #[must_use]
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    #[must_use]
    pub fn crc(&self) -> u32 {
        self.crc
    }

    #[must_use]
    pub fn encoded_len(&self) -> usize {
        self.data.len()
    }

    /// Index of the first entry with key `>= key`.
    #[must_use]
    pub fn lower_bound(&self, key: &Key) -> usize {
        self.entries.partition_point(|(k, _)| k < key)
    }

    /// Binary search for `key`.
    #[must_use]
    pub fn get(&self, key: &Key) -> Option<&Value> {
        self.entries
            .binary_search_by(|(k, _)| k.cmp(key))
            .ok()
            .map(|i| &self.entries[i].1)
    }

    /// Entries with `start <= key <= end`.
    #[must_use]
    pub fn range(&self, start: &Key, end: &Key) -> &[(Key, Value)] {
        if start > end {
            return &[];
        }
        let lo = self.lower_bound(start);
        let hi = self.entries.partition_point(|(k, _)| k <= end);
        &self.entries[lo..hi.max(lo)]
    }
}

/// Merge runs given oldest first; for equal keys the later run wins.
///
/// With `drop_whiteouts` the result is a compacted view: deletion markers
/// are resolved and removed.
#[must_use]
pub fn merge_runs(runs: &[&[(Key, Value)]], drop_whiteouts: bool) -> Vec<(Key, Value)> {
    let mut merged: BTreeMap<Key, &Value> = BTreeMap::new();
    for run in runs {
        for (k, v) in *run {
            merged.insert(*k, v);
        }
    }
    merged
        .into_iter()
        .filter(|(_, v)| !(drop_whiteouts && v.is_whiteout()))
        .map(|(k, v)| (k, v.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn inline(b: u8) -> Value {
        Value::Inline(vec![b])
    }

    #[test]
    fn build_sorts_and_keeps_last_duplicate() {
        let run = Bset::build(
            RunSeq(1),
            vec![
                (Key::new(3, 0, 0), inline(3)),
                (Key::new(1, 0, 0), inline(1)),
                (Key::new(3, 0, 0), inline(4)),
            ],
        )
        .expect("build");
        assert_eq!(run.len(), 2);
        assert_eq!(run.entries()[0].0, Key::new(1, 0, 0));
        assert_eq!(run.get(&Key::new(3, 0, 0)), Some(&inline(4)));
        assert_eq!(run.get(&Key::new(2, 0, 0)), None);
    }

    #[test]
    fn decode_round_trips_and_checks_crc() {
        let run = Bset::build(
            RunSeq(9),
            (0..50_u64).map(|i| (Key::new(i, i, 0), inline(u8::try_from(i).expect("u8")))),
        )
        .expect("build");
        let nr = u32::try_from(run.len()).expect("nr");
        let decoded = Bset::decode(RunSeq(9), run.data(), nr, run.crc()).expect("decode");
        assert_eq!(decoded, run);

        let mut damaged = run.data().to_vec();
        damaged[30] ^= 0xFF;
        assert!(matches!(
            Bset::decode(RunSeq(9), &damaged, nr, run.crc()),
            Err(SfsError::CorruptKey(_))
        ));
        assert!(Bset::decode(RunSeq(9), run.data(), nr + 1, run.crc()).is_err());
    }

    #[test]
    fn decode_rejects_unsorted_bytes_even_with_valid_crc() {
        let mut data = Vec::new();
        encode_entry(&Key::new(2, 0, 0), &inline(2), &mut data).expect("b");
        encode_entry(&Key::new(1, 0, 0), &inline(1), &mut data).expect("a");
        let crc = crc32c::crc32c(&data);
        assert!(matches!(
            Bset::decode(RunSeq(1), &data, 2, crc),
            Err(SfsError::CorruptKey(_))
        ));
    }

    #[test]
    fn from_sorted_rejects_duplicates() {
        let err = Bset::from_sorted(
            RunSeq(1),
            vec![(Key::MIN, inline(0)), (Key::MIN, inline(1))],
        );
        assert!(err.is_err());
    }

    #[test]
    fn range_is_inclusive() {
        let run = Bset::build(RunSeq(1), (0..10_u64).map(|i| (Key::new(i, 0, 0), inline(0))))
            .expect("build");
        let r = run.range(&Key::new(3, 0, 0), &Key::new(5, 0, 0));
        assert_eq!(r.len(), 3);
        assert!(run.range(&Key::new(5, 0, 0), &Key::new(3, 0, 0)).is_empty());
    }

    #[test]
    fn newest_run_wins_and_whiteouts_suppress() {
        let old = Bset::build(
            RunSeq(1),
            vec![(Key::new(1, 0, 0), inline(1)), (Key::new(2, 0, 0), inline(2))],
        )
        .expect("old");
        let new = Bset::build(
            RunSeq(2),
            vec![(Key::new(1, 0, 0), Value::Whiteout), (Key::new(2, 0, 0), inline(9))],
        )
        .expect("new");
        let view = merge_runs(&[old.entries(), new.entries()], false);
        assert_eq!(view[0], (Key::new(1, 0, 0), Value::Whiteout));
        assert_eq!(view[1], (Key::new(2, 0, 0), inline(9)));
        let compacted = merge_runs(&[old.entries(), new.entries()], true);
        assert_eq!(compacted, vec![(Key::new(2, 0, 0), inline(9))]);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn merged_view_matches_sequential_model(
            batches in proptest::collection::vec(
                proptest::collection::vec((0_u64..40, proptest::option::of(any::<u8>())), 0..30),
                1..5,
            )
        ) {
            let mut model = BTreeMap::new();
            let mut runs = Vec::new();
            for (i, batch) in batches.iter().enumerate() {
                let items: Vec<(Key, Value)> = batch
                    .iter()
                    .map(|(k, v)| (Key::new(*k, 0, 0), v.map_or(Value::Whiteout, inline)))
                    .collect();
                for (k, v) in &items {
                    model.insert(*k, v.clone());
                }
                runs.push(Bset::build(RunSeq(i as u64 + 1), items).expect("build"));
            }
            let slices: Vec<&[(Key, Value)]> = runs.iter().map(Bset::entries).collect();
            let merged = merge_runs(&slices, true);
            let expected: Vec<(Key, Value)> = model
                .into_iter()
                .filter(|(_, v)| !v.is_whiteout())
                .collect();
            prop_assert_eq!(merged, expected);
        }
    }
}

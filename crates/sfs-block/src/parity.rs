//! Parity collaborator contract.
//!
//! Erasure-coded extents are stored as `k` equal-length data shards plus
//! `parity_shards()` parity shards on distinct devices. The engine calls
//! [`ParityCodec::compute_parity`] at write time and
//! [`ParityCodec::reconstruct`] when shards are missing or fail
//! verification.

use sfs_error::{Result, SfsError};

pub trait ParityCodec: Send + Sync {
    /// Number of parity shards produced per stripe.
    fn parity_shards(&self) -> usize;

    /// Parity blocks for equal-length `data` shards.
    fn compute_parity(&self, data: &[&[u8]]) -> Result<Vec<Vec<u8>>>;

    /// Fill the `None` entries of `shards` (data shards first, parity
    /// last). Fails if more shards are missing than the code tolerates.
    fn reconstruct(&self, shards: &mut [Option<Vec<u8>>]) -> Result<()>;
}

/// Single-parity XOR code (RAID-5 style): tolerates one missing shard.
#[derive(Debug, Clone, Copy, Default)]
pub struct XorParity;

fn xor_into(acc: &mut [u8], shard: &[u8]) {
    for (a, b) in acc.iter_mut().zip(shard) {
        *a ^= *b;
    }
}

impl ParityCodec for XorParity {
    fn parity_shards(&self) -> usize {
        1
    }

    fn compute_parity(&self, data: &[&[u8]]) -> Result<Vec<Vec<u8>>> {
        let Some(first) = data.first() else {
            return Err(SfsError::InvalidGeometry("parity over zero shards".to_owned()));
        };
        if data.iter().any(|s| s.len() != first.len()) {
            return Err(SfsError::InvalidGeometry(
                "parity shards must have equal length".to_owned(),
            ));
        }
        let mut parity = vec![0_u8; first.len()];
        for shard in data {
            xor_into(&mut parity, shard);
        }
        Ok(vec![parity])
    }

    fn reconstruct(&self, shards: &mut [Option<Vec<u8>>]) -> Result<()> {
        let missing: Vec<usize> = shards
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.is_none().then_some(i))
            .collect();
        match missing.as_slice() {
            [] => Ok(()),
            [idx] => {
                let len = shards
                    .iter()
                    .flatten()
                    .map(Vec::len)
                    .next()
                    .ok_or_else(|| SfsError::InvalidGeometry("no shards present".to_owned()))?;
                let mut rebuilt = vec![0_u8; len];
                for shard in shards.iter().flatten() {
                    xor_into(&mut rebuilt, shard);
                }
                shards[*idx] = Some(rebuilt);
                Ok(())
            }
            many => Err(SfsError::Unreadable {
                what: "parity stripe".to_owned(),
                detail: format!("{} shards missing, XOR parity tolerates 1", many.len()),
            }),
        }
    }
}

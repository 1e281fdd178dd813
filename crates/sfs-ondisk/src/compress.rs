//! Compression collaborator contract.
//!
//! Codecs are opaque to the engine: it hands over bytes plus an algorithm
//! id and stores whatever comes back. Algorithm id 0 always means "stored
//! uncompressed" and never reaches a collaborator.

use sfs_error::{Result, SfsError};

pub trait Compressor: Send + Sync {
    /// Compress `data` with `algorithm`.
    ///
    /// Returning `Ok(None)` tells the engine to store the extent
    /// uncompressed (incompressible input).
    fn compress(&self, algorithm: u8, data: &[u8]) -> Result<Option<Vec<u8>>>;

    /// Inverse of [`Compressor::compress`]. Any failure, including a
    /// length other than `expected_size`, is `DecompressFailed`.
    fn decompress(&self, algorithm: u8, data: &[u8], expected_size: usize) -> Result<Vec<u8>>;
}

/// Collaborator used when no codec is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoCompression;

impl Compressor for NoCompression {
    fn compress(&self, _algorithm: u8, _data: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(None)
    }

    fn decompress(&self, algorithm: u8, _data: &[u8], _expected_size: usize) -> Result<Vec<u8>> {
        Err(SfsError::DecompressFailed(format!(
            "no codec registered for algorithm {algorithm}"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_compression_stores_raw_and_rejects_decode() {
        let codec = NoCompression;
        assert_eq!(codec.compress(1, b"abc").expect("compress"), None);
        assert!(matches!(
            codec.decompress(1, b"abc", 3),
            Err(SfsError::DecompressFailed(_))
        ));
    }
}

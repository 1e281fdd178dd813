#![forbid(unsafe_code)]
//! Block I/O layer.
//!
//! Provides the `ByteDevice` trait consumed by every on-disk path, a
//! file-backed and an in-memory (fault-injectable) implementation, the
//! multi-device [`DeviceSet`] with transient-retry and health tracking, an
//! ARC read cache, and the parity collaborator used for erasure-coded
//! extents.

mod cache;
mod memory;
mod parity;
mod set;

pub use cache::ArcCache;
pub use memory::MemoryByteDevice;
pub use parity::{ParityCodec, XorParity};
pub use set::{DeviceHealth, DeviceSet, DeviceStats, RetryPolicy};

use sfs_error::{Result, SfsError};
use sfs_types::Cx;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;

#[inline]
pub(crate) fn cx_checkpoint(cx: &Cx) -> Result<()> {
    cx.checkpoint().map_err(|_| SfsError::Cancelled)
}

/// Byte-addressed device for fixed-offset I/O (pread/pwrite semantics).
///
/// Implementations report their own failures as `SfsError::DeviceIo`; the
/// `device` field is filled in by [`DeviceSet`], which knows the member id.
pub trait ByteDevice: Send + Sync {
    /// Total length in bytes.
    fn len_bytes(&self) -> u64;

    /// Read exactly `buf.len()` bytes from `offset` into `buf`.
    fn read_exact_at(&self, cx: &Cx, offset: u64, buf: &mut [u8]) -> Result<()>;

    /// Write all bytes in `buf` to `offset`.
    fn write_all_at(&self, cx: &Cx, offset: u64, buf: &[u8]) -> Result<()>;

    /// Flush pending writes to stable storage.
    fn sync(&self, cx: &Cx) -> Result<()>;
}

impl<D: ByteDevice + ?Sized> ByteDevice for Arc<D> {
    fn len_bytes(&self) -> u64 {
        (**self).len_bytes()
    }

    fn read_exact_at(&self, cx: &Cx, offset: u64, buf: &mut [u8]) -> Result<()> {
        (**self).read_exact_at(cx, offset, buf)
    }

    fn write_all_at(&self, cx: &Cx, offset: u64, buf: &[u8]) -> Result<()> {
        (**self).write_all_at(cx, offset, buf)
    }

    fn sync(&self, cx: &Cx) -> Result<()> {
        (**self).sync(cx)
    }
}

pub(crate) fn check_range(offset: u64, len: usize, device_len: u64, op: &str) -> Result<()> {
    let end = offset
        .checked_add(
            u64::try_from(len)
                .map_err(|_| SfsError::Format(format!("{op} length overflows u64")))?,
        )
        .ok_or_else(|| SfsError::Format(format!("{op} range overflows u64")))?;
    if end > device_len {
        return Err(SfsError::Format(format!(
            "{op} out of bounds: offset={offset} len={len} device_len={device_len}"
        )));
    }
    Ok(())
}

/// File-backed byte device using positional I/O.
///
/// This uses `std::os::unix::fs::FileExt`, which is thread-safe and does not
/// require a shared seek position.
#[derive(Debug, Clone)]
pub struct FileByteDevice {
    file: Arc<File>,
    len: u64,
}

impl FileByteDevice {
    /// Open an existing image read-write.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path.as_ref())?;
        let len = file.metadata()?.len();
        Ok(Self {
            file: Arc::new(file),
            len,
        })
    }

    /// Create (or truncate) an image of exactly `len` bytes.
    pub fn create(path: impl AsRef<Path>, len: u64) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path.as_ref())?;
        file.set_len(len)?;
        Ok(Self {
            file: Arc::new(file),
            len,
        })
    }

    fn io_error(err: &std::io::Error) -> SfsError {
        SfsError::DeviceIo {
            device: 0,
            transient: matches!(
                err.kind(),
                std::io::ErrorKind::Interrupted
                    | std::io::ErrorKind::WouldBlock
                    | std::io::ErrorKind::TimedOut
            ),
            detail: err.to_string(),
        }
    }
}

impl ByteDevice for FileByteDevice {
    fn len_bytes(&self) -> u64 {
        self.len
    }

    fn read_exact_at(&self, cx: &Cx, offset: u64, buf: &mut [u8]) -> Result<()> {
        cx_checkpoint(cx)?;
        check_range(offset, buf.len(), self.len, "read")?;
        self.file
            .read_exact_at(buf, offset)
            .map_err(|e| Self::io_error(&e))
    }

    fn write_all_at(&self, cx: &Cx, offset: u64, buf: &[u8]) -> Result<()> {
        cx_checkpoint(cx)?;
        check_range(offset, buf.len(), self.len, "write")?;
        self.file
            .write_all_at(buf, offset)
            .map_err(|e| Self::io_error(&e))
    }

    fn sync(&self, cx: &Cx) -> Result<()> {
        cx_checkpoint(cx)?;
        self.file.sync_data().map_err(|e| Self::io_error(&e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_device_round_trips() {
        let cx = Cx::for_testing();
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("dev0.img");
        let dev = FileByteDevice::create(&path, 64 * 1024).expect("create");
        dev.write_all_at(&cx, 4096, &[7_u8; 512]).expect("write");
        dev.sync(&cx).expect("sync");

        let reopened = FileByteDevice::open(&path).expect("open");
        assert_eq!(reopened.len_bytes(), 64 * 1024);
        let mut buf = [0_u8; 512];
        reopened.read_exact_at(&cx, 4096, &mut buf).expect("read");
        assert_eq!(buf, [7_u8; 512]);
    }

    #[test]
    fn out_of_bounds_is_rejected() {
        let cx = Cx::for_testing();
        let dir = tempfile::tempdir().expect("tempdir");
        let dev = FileByteDevice::create(dir.path().join("d.img"), 1024).expect("create");
        let mut buf = [0_u8; 16];
        assert!(dev.read_exact_at(&cx, 1020, &mut buf).is_err());
        assert!(dev.write_all_at(&cx, u64::MAX, &buf).is_err());
    }

    #[test]
    fn cancelled_cx_stops_io() {
        let cx = Cx::for_testing();
        cx.cancel();
        let dev = MemoryByteDevice::new(1024);
        let mut buf = [0_u8; 4];
        assert!(matches!(
            dev.read_exact_at(&cx, 0, &mut buf),
            Err(SfsError::Cancelled)
        ));
    }
}

//! In-memory device with fault injection.
//!
//! Used by tests to simulate bit rot, flaky links, dead devices, and power
//! loss at an exact byte boundary, then "reboot" by snapshotting the bytes
//! that actually reached the medium.

use crate::{ByteDevice, check_range, cx_checkpoint};
use parking_lot::Mutex;
use sfs_error::{Result, SfsError};
use sfs_types::Cx;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

#[derive(Debug)]
pub struct MemoryByteDevice {
    bytes: Mutex<Vec<u8>>,
    offline: AtomicBool,
    transient_read_failures: AtomicU64,
    transient_write_failures: AtomicU64,
    /// Remaining bytes that may still be written before "power loss".
    write_budget: Mutex<Option<u64>>,
    writes: AtomicU64,
    reads: AtomicU64,
}

impl MemoryByteDevice {
    #[must_use]
    pub fn new(len: usize) -> Self {
        Self::from_bytes(vec![0_u8; len])
    }

    #[must_use]
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self {
            bytes: Mutex::new(bytes),
            offline: AtomicBool::new(false),
            transient_read_failures: AtomicU64::new(0),
            transient_write_failures: AtomicU64::new(0),
            write_budget: Mutex::new(None),
            writes: AtomicU64::new(0),
            reads: AtomicU64::new(0),
        }
    }

    /// Copy of the current medium contents with every fault cleared.
    #[must_use]
    pub fn snapshot(&self) -> Self {
        Self::from_bytes(self.bytes.lock().clone())
    }

    /// XOR `len` bytes at `offset` with `0xFF`, bypassing all fault state.
    pub fn corrupt(&self, offset: u64, len: usize) {
        let mut bytes = self.bytes.lock();
        let start = usize::try_from(offset).unwrap_or(usize::MAX).min(bytes.len());
        let end = start.saturating_add(len).min(bytes.len());
        for b in &mut bytes[start..end] {
            *b ^= 0xFF;
        }
    }

    /// Raw copy of a byte range, bypassing all fault state.
    #[must_use]
    pub fn peek(&self, offset: u64, len: usize) -> Vec<u8> {
        let bytes = self.bytes.lock();
        let start = usize::try_from(offset).unwrap_or(usize::MAX).min(bytes.len());
        let end = start.saturating_add(len).min(bytes.len());
        bytes[start..end].to_vec()
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::Release);
    }

    /// The next `n` reads fail with a transient error.
    pub fn fail_next_reads(&self, n: u64) {
        self.transient_read_failures.store(n, Ordering::Release);
    }

    /// The next `n` writes fail with a transient error.
    pub fn fail_next_writes(&self, n: u64) {
        self.transient_write_failures.store(n, Ordering::Release);
    }

    /// Simulate power loss after `bytes` more bytes reach the medium.
    ///
    /// The write that crosses the budget is torn: its prefix lands, the
    /// rest is lost, and it and every later write fail permanently.
    pub fn crash_after_bytes(&self, bytes: u64) {
        *self.write_budget.lock() = Some(bytes);
    }

    #[must_use]
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn read_count(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    fn offline_error() -> SfsError {
        SfsError::DeviceIo {
            device: 0,
            transient: false,
            detail: "device offline".to_owned(),
        }
    }

    fn take_transient(counter: &AtomicU64) -> bool {
        counter
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl ByteDevice for MemoryByteDevice {
    fn len_bytes(&self) -> u64 {
        u64::try_from(self.bytes.lock().len()).unwrap_or(0)
    }

    fn read_exact_at(&self, cx: &Cx, offset: u64, buf: &mut [u8]) -> Result<()> {
        cx_checkpoint(cx)?;
        if self.offline.load(Ordering::Acquire) {
            return Err(Self::offline_error());
        }
        if Self::take_transient(&self.transient_read_failures) {
            return Err(SfsError::DeviceIo {
                device: 0,
                transient: true,
                detail: "injected read timeout".to_owned(),
            });
        }
        self.reads.fetch_add(1, Ordering::Relaxed);
        let bytes = self.bytes.lock();
        check_range(offset, buf.len(), bytes.len() as u64, "read")?;
        let start = usize::try_from(offset)
            .map_err(|_| SfsError::Format("offset overflow".to_owned()))?;
        buf.copy_from_slice(&bytes[start..start + buf.len()]);
        drop(bytes);
        Ok(())
    }

    fn write_all_at(&self, cx: &Cx, offset: u64, buf: &[u8]) -> Result<()> {
        cx_checkpoint(cx)?;
        if self.offline.load(Ordering::Acquire) {
            return Err(Self::offline_error());
        }
        if Self::take_transient(&self.transient_write_failures) {
            return Err(SfsError::DeviceIo {
                device: 0,
                transient: true,
                detail: "injected write timeout".to_owned(),
            });
        }
        let mut bytes = self.bytes.lock();
        check_range(offset, buf.len(), bytes.len() as u64, "write")?;
        let start = usize::try_from(offset)
            .map_err(|_| SfsError::Format("offset overflow".to_owned()))?;

        let mut budget = self.write_budget.lock();
        let landed = match budget.as_mut() {
            None => buf.len(),
            Some(left) => {
                let n = usize::try_from(*left).unwrap_or(usize::MAX).min(buf.len());
                *left -= n as u64;
                n
            }
        };
        bytes[start..start + landed].copy_from_slice(&buf[..landed]);
        self.writes.fetch_add(1, Ordering::Relaxed);
        if landed < buf.len() {
            drop(budget);
            drop(bytes);
            self.set_offline(true);
            return Err(SfsError::DeviceIo {
                device: 0,
                transient: false,
                detail: format!("power lost after {landed} of {} bytes", buf.len()),
            });
        }
        Ok(())
    }

    fn sync(&self, cx: &Cx) -> Result<()> {
        cx_checkpoint(cx)?;
        if self.offline.load(Ordering::Acquire) {
            return Err(Self::offline_error());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn corrupt_flips_bytes() {
        let cx = Cx::for_testing();
        let dev = MemoryByteDevice::new(64);
        dev.write_all_at(&cx, 0, &[0x0F; 8]).expect("write");
        dev.corrupt(2, 2);
        let mut buf = [0_u8; 8];
        dev.read_exact_at(&cx, 0, &mut buf).expect("read");
        assert_eq!(buf, [0x0F, 0x0F, 0xF0, 0xF0, 0x0F, 0x0F, 0x0F, 0x0F]);
    }

    #[test]
    fn transient_failures_are_consumed() {
        let cx = Cx::for_testing();
        let dev = MemoryByteDevice::new(64);
        dev.fail_next_reads(2);
        let mut buf = [0_u8; 4];
        for _ in 0..2 {
            assert!(matches!(
                dev.read_exact_at(&cx, 0, &mut buf),
                Err(SfsError::DeviceIo { transient: true, .. })
            ));
        }
        dev.read_exact_at(&cx, 0, &mut buf).expect("third read succeeds");
    }

    #[test]
    fn power_loss_tears_the_crossing_write() {
        let cx = Cx::for_testing();
        let dev = MemoryByteDevice::new(64);
        dev.crash_after_bytes(6);
        dev.write_all_at(&cx, 0, &[1; 4]).expect("fits");
        let err = dev.write_all_at(&cx, 4, &[2; 4]).expect_err("torn");
        assert!(matches!(err, SfsError::DeviceIo { transient: false, .. }));
        assert!(dev.write_all_at(&cx, 8, &[3; 1]).is_err());

        let rebooted = dev.snapshot();
        let mut buf = [0_u8; 9];
        rebooted.read_exact_at(&cx, 0, &mut buf).expect("read");
        assert_eq!(buf, [1, 1, 1, 1, 2, 2, 0, 0, 0]);
    }

    #[test]
    fn offline_device_fails_everything() {
        let cx = Cx::for_testing();
        let dev = MemoryByteDevice::new(64);
        dev.set_offline(true);
        assert!(dev.sync(&cx).is_err());
        assert!(dev.write_all_at(&cx, 0, &[1]).is_err());
    }
}

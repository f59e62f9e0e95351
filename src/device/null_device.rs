//! Null storage device for testing.

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::device::SyncStorageDevice;

/// Null disk device
///
/// Discards all writes and returns zeros for reads, while tracking the
/// logical size. Useful for memory-only operation and benchmarks; a log
/// backed by a `NullDisk` cannot serve scans below the head address.
pub struct NullDisk {
    /// Logical size of the device
    size: AtomicU64,
}

impl NullDisk {
    /// Create a new null disk
    pub fn new() -> Self {
        Self {
            size: AtomicU64::new(0),
        }
    }
}

impl Default for NullDisk {
    fn default() -> Self {
        Self::new()
    }
}

impl SyncStorageDevice for NullDisk {
    fn read_sync(&self, _offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        buf.fill(0);
        Ok(buf.len())
    }

    fn write_sync(&self, offset: u64, buf: &[u8]) -> io::Result<usize> {
        let new_end = offset + buf.len() as u64;
        loop {
            let current = self.size.load(Ordering::Acquire);
            if new_end <= current {
                break;
            }
            if self
                .size
                .compare_exchange(current, new_end, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                break;
            }
        }
        Ok(buf.len())
    }

    fn flush_sync(&self) -> io::Result<()> {
        Ok(())
    }

    fn size_sync(&self) -> io::Result<u64> {
        Ok(self.size.load(Ordering::Acquire))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_null_disk_reads_zero() {
        let disk = NullDisk::new();
        let mut buf = [1u8; 100];

        assert_eq!(disk.read_sync(0, &mut buf).unwrap(), 100);
        assert!(buf.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_null_disk_tracks_size() {
        let disk = NullDisk::new();
        let buf = [42u8; 100];

        disk.write_sync(50, &buf).unwrap();
        assert_eq!(disk.size_sync().unwrap(), 150);
    }
}

//! Block device backends
//!
//! A volume is addressed in fixed [`BLOCK_SIZE`] blocks. Two backends are
//! provided:
//! - [`FileDevice`]: a regular file or raw block device, optionally opened
//!   with O_DIRECT and locked exclusively
//! - [`MemoryDevice`]: an in-memory volume with I/O counters and transient
//!   fault injection

use nix::fcntl::{Flock, FlockArg};
use std::fs::{File, OpenOptions};
use std::io::{self, Seek, SeekFrom};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use strata_common::BLOCK_SIZE;

#[cfg(target_os = "linux")]
use std::os::unix::fs::OpenOptionsExt;

/// Alignment requirement for direct I/O
pub const ALIGNMENT: usize = 4096;

/// Fixed-size block storage
pub trait BlockDevice: Send {
    /// Number of addressable blocks
    fn block_count(&self) -> u64;

    /// Read block `lba` into `buf` (`BLOCK_SIZE` bytes)
    fn read_block(&mut self, lba: u64, buf: &mut [u8]) -> io::Result<()>;

    /// Write `buf` (`BLOCK_SIZE` bytes) to block `lba`
    fn write_block(&mut self, lba: u64, buf: &[u8]) -> io::Result<()>;

    /// Flush written blocks to stable storage
    fn sync(&mut self) -> io::Result<()>;
}

fn check_buffer(len: usize) -> io::Result<()> {
    if len == BLOCK_SIZE {
        Ok(())
    } else {
        Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("buffer of {len} bytes, expected {BLOCK_SIZE}"),
        ))
    }
}

fn check_range(lba: u64, block_count: u64) -> io::Result<()> {
    if lba < block_count {
        Ok(())
    } else {
        Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("block {lba} beyond end of device ({block_count} blocks)"),
        ))
    }
}

/// Counters shared between a device and its observers
#[derive(Debug, Default)]
pub struct DeviceStats {
    pub reads: AtomicU64,
    pub writes: AtomicU64,
    pub syncs: AtomicU64,
}

impl DeviceStats {
    #[must_use]
    pub fn reads(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn syncs(&self) -> u64 {
        self.syncs.load(Ordering::Relaxed)
    }
}

/// Block-aligned scratch buffer for O_DIRECT transfers
struct AlignedBuffer {
    raw: Vec<u8>,
    offset: usize,
}

impl AlignedBuffer {
    fn new() -> Self {
        let raw = vec![0u8; BLOCK_SIZE + ALIGNMENT];
        let offset = raw.as_ptr().align_offset(ALIGNMENT);
        Self { raw, offset }
    }

    fn as_slice(&self) -> &[u8] {
        &self.raw[self.offset..self.offset + BLOCK_SIZE]
    }

    fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.raw[self.offset..self.offset + BLOCK_SIZE]
    }
}

/// Volume backed by a file or block device
pub struct FileDevice {
    file: Flock<File>,
    path: PathBuf,
    block_count: u64,
    bounce: Option<AlignedBuffer>,
    stats: Arc<DeviceStats>,
}

impl FileDevice {
    /// Open an existing volume, taking an exclusive lock on it
    pub fn open(path: impl AsRef<Path>, direct_io: bool) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();

        let mut options = OpenOptions::new();
        options.read(true).write(true);

        // O_DIRECT bypasses the page cache on Linux
        #[cfg(target_os = "linux")]
        {
            if direct_io {
                options.custom_flags(libc::O_DIRECT);
            }
        }

        let mut file = options.open(&path)?;
        let size = file.seek(SeekFrom::End(0))?;
        file.seek(SeekFrom::Start(0))?;

        let file = Flock::lock(file, FlockArg::LockExclusiveNonblock)
            .map_err(|(_, errno)| io::Error::from(errno))?;

        Ok(Self {
            file,
            path,
            block_count: size / BLOCK_SIZE as u64,
            bounce: direct_io.then(AlignedBuffer::new),
            stats: Arc::new(DeviceStats::default()),
        })
    }

    /// Create (or truncate) a volume file of `size` bytes and open it
    pub fn create(path: impl AsRef<Path>, size: u64, direct_io: bool) -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path.as_ref())?;
        file.set_len(size)?;
        drop(file);
        Self::open(path, direct_io)
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn stats(&self) -> Arc<DeviceStats> {
        Arc::clone(&self.stats)
    }
}

impl BlockDevice for FileDevice {
    fn block_count(&self) -> u64 {
        self.block_count
    }

    fn read_block(&mut self, lba: u64, buf: &mut [u8]) -> io::Result<()> {
        check_buffer(buf.len())?;
        check_range(lba, self.block_count)?;
        let offset = lba * BLOCK_SIZE as u64;
        match self.bounce.as_mut() {
            Some(bounce) => {
                self.file.read_exact_at(bounce.as_mut_slice(), offset)?;
                buf.copy_from_slice(bounce.as_slice());
            }
            None => self.file.read_exact_at(buf, offset)?,
        }
        self.stats.reads.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn write_block(&mut self, lba: u64, buf: &[u8]) -> io::Result<()> {
        check_buffer(buf.len())?;
        check_range(lba, self.block_count)?;
        let offset = lba * BLOCK_SIZE as u64;
        match self.bounce.as_mut() {
            Some(bounce) => {
                bounce.as_mut_slice().copy_from_slice(buf);
                self.file.write_all_at(bounce.as_slice(), offset)?;
            }
            None => self.file.write_all_at(buf, offset)?,
        }
        self.stats.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn sync(&mut self) -> io::Result<()> {
        self.file.sync_data()?;
        self.stats.syncs.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

/// In-memory volume
///
/// `fail_next(n, kind)` makes the next `n` transfers fail with `kind`,
/// which is how retry behaviour is exercised.
pub struct MemoryDevice {
    blocks: Vec<u8>,
    block_count: u64,
    stats: Arc<DeviceStats>,
    faults: u32,
    fault_kind: io::ErrorKind,
}

impl MemoryDevice {
    /// Zero-filled volume of `size` bytes (rounded down to whole blocks)
    #[must_use]
    pub fn new(size: u64) -> Self {
        let block_count = size / BLOCK_SIZE as u64;
        Self {
            blocks: vec![0u8; block_count as usize * BLOCK_SIZE],
            block_count,
            stats: Arc::new(DeviceStats::default()),
            faults: 0,
            fault_kind: io::ErrorKind::Interrupted,
        }
    }

    #[must_use]
    pub fn stats(&self) -> Arc<DeviceStats> {
        Arc::clone(&self.stats)
    }

    /// Fail the next `count` reads, writes or syncs with `kind`
    pub fn fail_next(&mut self, count: u32, kind: io::ErrorKind) {
        self.faults = count;
        self.fault_kind = kind;
    }

    /// Raw view of one block, bypassing counters
    #[must_use]
    pub fn block(&self, lba: u64) -> &[u8] {
        let start = lba as usize * BLOCK_SIZE;
        &self.blocks[start..start + BLOCK_SIZE]
    }

    /// Mutable raw view of one block, bypassing counters
    pub fn block_mut(&mut self, lba: u64) -> &mut [u8] {
        let start = lba as usize * BLOCK_SIZE;
        &mut self.blocks[start..start + BLOCK_SIZE]
    }

    fn inject_fault(&mut self) -> io::Result<()> {
        if self.faults > 0 {
            self.faults -= 1;
            return Err(io::Error::from(self.fault_kind));
        }
        Ok(())
    }
}

impl BlockDevice for MemoryDevice {
    fn block_count(&self) -> u64 {
        self.block_count
    }

    fn read_block(&mut self, lba: u64, buf: &mut [u8]) -> io::Result<()> {
        check_buffer(buf.len())?;
        check_range(lba, self.block_count)?;
        self.inject_fault()?;
        buf.copy_from_slice(self.block(lba));
        self.stats.reads.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn write_block(&mut self, lba: u64, buf: &[u8]) -> io::Result<()> {
        check_buffer(buf.len())?;
        check_range(lba, self.block_count)?;
        self.inject_fault()?;
        self.block_mut(lba).copy_from_slice(buf);
        self.stats.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn sync(&mut self) -> io::Result<()> {
        self.inject_fault()?;
        self.stats.syncs.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_memory_device_read_write() {
        let mut dev = MemoryDevice::new(16 * BLOCK_SIZE as u64);
        assert_eq!(dev.block_count(), 16);

        let data = vec![0xA5u8; BLOCK_SIZE];
        dev.write_block(3, &data).unwrap();

        let mut buf = vec![0u8; BLOCK_SIZE];
        dev.read_block(3, &mut buf).unwrap();
        assert_eq!(buf, data);

        let stats = dev.stats();
        assert_eq!(stats.reads(), 1);
        assert_eq!(stats.writes(), 1);
    }

    #[test]
    fn test_memory_device_bounds() {
        let mut dev = MemoryDevice::new(4 * BLOCK_SIZE as u64);
        let mut buf = vec![0u8; BLOCK_SIZE];
        assert!(dev.read_block(4, &mut buf).is_err());
        assert!(dev.write_block(0, &buf[..100]).is_err());
    }

    #[test]
    fn test_memory_device_fault_injection() {
        let mut dev = MemoryDevice::new(4 * BLOCK_SIZE as u64);
        dev.fail_next(2, io::ErrorKind::WouldBlock);

        let mut buf = vec![0u8; BLOCK_SIZE];
        let err = dev.read_block(0, &mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
        assert!(dev.sync().is_err());
        dev.read_block(0, &mut buf).unwrap();
        assert_eq!(dev.stats().reads(), 1);
    }

    #[test]
    fn test_file_device_read_write() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("volume.img");

        let mut dev = FileDevice::create(&path, 8 * BLOCK_SIZE as u64, false).unwrap();
        assert_eq!(dev.block_count(), 8);

        let data: Vec<u8> = (0..BLOCK_SIZE).map(|i| (i % 251) as u8).collect();
        dev.write_block(5, &data).unwrap();
        dev.sync().unwrap();
        drop(dev);

        let mut dev = FileDevice::open(&path, false).unwrap();
        let mut buf = vec![0u8; BLOCK_SIZE];
        dev.read_block(5, &mut buf).unwrap();
        assert_eq!(buf, data);
        assert_eq!(dev.stats().reads(), 1);
    }

    #[test]
    fn test_file_device_exclusive_lock() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("volume.img");

        let _dev = FileDevice::create(&path, 4 * BLOCK_SIZE as u64, false).unwrap();
        assert!(FileDevice::open(&path, false).is_err());
    }

    #[test]
    fn test_aligned_buffer() {
        let mut buf = AlignedBuffer::new();
        assert_eq!(buf.as_slice().as_ptr() as usize % ALIGNMENT, 0);
        assert_eq!(buf.as_mut_slice().len(), BLOCK_SIZE);
    }
}

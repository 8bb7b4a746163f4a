//! Retrying block I/O
//!
//! Wraps a [`BlockDevice`] with address checks and the retry policy:
//! transient failures (would-block, interrupted, temporarily out of
//! resources) are retried after a short sleep; anything else is returned
//! immediately. When the retry budget runs out the failure is reported as
//! [`Error::Fatal`] and left to the embedding application.

use crate::device::BlockDevice;
use std::io;
use strata_common::error::is_transient_io;
use strata_common::{Error, LBA_NULL, Result, RetryConfig};
use tracing::{error, warn};

/// Block device plus retry policy
pub struct VolumeIo {
    device: Box<dyn BlockDevice>,
    retry: RetryConfig,
    block_count: u64,
}

impl VolumeIo {
    #[must_use]
    pub fn new(device: Box<dyn BlockDevice>, retry: RetryConfig) -> Self {
        let block_count = device.block_count();
        Self {
            device,
            retry,
            block_count,
        }
    }

    #[must_use]
    pub const fn block_count(&self) -> u64 {
        self.block_count
    }

    /// Reject the null block and anything past the end of the volume
    pub fn verify_lba(&self, lba: u64) -> Result<()> {
        if lba == LBA_NULL || lba >= self.block_count {
            return Err(Error::InvalidAddress {
                lba,
                block_count: self.block_count,
            });
        }
        Ok(())
    }

    pub fn read(&mut self, lba: u64, buf: &mut [u8]) -> Result<()> {
        self.verify_lba(lba)?;
        self.with_retry("read", lba, |dev| dev.read_block(lba, &mut *buf))
    }

    pub fn write(&mut self, lba: u64, buf: &[u8]) -> Result<()> {
        self.verify_lba(lba)?;
        self.with_retry("write", lba, |dev| dev.write_block(lba, buf))
    }

    pub fn sync(&mut self) -> Result<()> {
        self.with_retry("sync", LBA_NULL, |dev| dev.sync())
    }

    fn with_retry(
        &mut self,
        op: &'static str,
        lba: u64,
        mut f: impl FnMut(&mut dyn BlockDevice) -> io::Result<()>,
    ) -> Result<()> {
        let attempts = self.retry.max_attempts.max(1);
        for attempt in 1..=attempts {
            match f(self.device.as_mut()) {
                Ok(()) => return Ok(()),
                Err(e) if is_transient_io(&e) => {
                    warn!(op, lba, attempt, error = %e, "transient device error, retrying");
                    if attempt < attempts {
                        std::thread::sleep(self.retry.backoff());
                    }
                }
                Err(e) => return Err(Error::DiskIo(e)),
            }
        }
        error!(op, lba, attempts, "device error persisted through all retries");
        Err(Error::Fatal(format!(
            "{op} of block {lba} failed after {attempts} attempts"
        )))
    }

    pub fn into_device(self) -> Box<dyn BlockDevice> {
        self.device
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemoryDevice;
    use strata_common::BLOCK_SIZE;

    fn retry(max_attempts: u32) -> RetryConfig {
        RetryConfig {
            max_attempts,
            backoff_micros: 1,
        }
    }

    #[test]
    fn test_transient_errors_are_retried() {
        let mut dev = MemoryDevice::new(8 * BLOCK_SIZE as u64);
        dev.fail_next(3, io::ErrorKind::Interrupted);
        let stats = dev.stats();
        let mut io = VolumeIo::new(Box::new(dev), retry(5));

        io.write(2, &vec![7u8; BLOCK_SIZE]).unwrap();
        assert_eq!(stats.writes(), 1);

        let mut buf = vec![0u8; BLOCK_SIZE];
        io.read(2, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 7));
    }

    #[test]
    fn test_exhausted_retries_are_fatal() {
        let mut dev = MemoryDevice::new(8 * BLOCK_SIZE as u64);
        dev.fail_next(10, io::ErrorKind::WouldBlock);
        let mut io = VolumeIo::new(Box::new(dev), retry(4));

        let err = io.sync().unwrap_err();
        assert!(err.is_fatal());
        assert!(matches!(err, Error::Fatal(_)));
    }

    #[test]
    fn test_hard_errors_are_not_retried() {
        let mut dev = MemoryDevice::new(8 * BLOCK_SIZE as u64);
        dev.fail_next(1, io::ErrorKind::PermissionDenied);
        let stats = dev.stats();
        let mut io = VolumeIo::new(Box::new(dev), retry(5));

        let err = io.write(3, &vec![0u8; BLOCK_SIZE]).unwrap_err();
        assert!(matches!(err, Error::DiskIo(_)));
        // The next attempt goes through: only one fault was consumed
        io.write(3, &vec![0u8; BLOCK_SIZE]).unwrap();
        assert_eq!(stats.writes(), 1);
    }

    #[test]
    fn test_address_checks() {
        let io = VolumeIo::new(Box::new(MemoryDevice::new(8 * BLOCK_SIZE as u64)), retry(1));
        assert!(io.verify_lba(7).is_ok());
        assert!(matches!(
            io.verify_lba(8),
            Err(Error::InvalidAddress { lba: 8, block_count: 8 })
        ));
        assert!(io.verify_lba(LBA_NULL).is_err());
    }
}

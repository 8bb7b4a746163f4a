//! Volume superblock
//!
//! The superblock lives at [`LBA_SUPER`] inside region 0 and records the
//! volume geometry plus the allocation apex (highest inode number and
//! virtual block number handed out so far).

use bytes::{Buf, BufMut, Bytes, BytesMut};
use strata_common::{
    BLOCK_SIZE, Error, FRAGMENT_SIZE, INO_ROOT, LBA_SUPER, REGION_SIZE, Result, VOLUME_SIZE_MAX,
    VOLUME_SIZE_MIN,
};
use uuid::Uuid;

/// Magic number for the Strata volume format
pub const MAGIC: [u8; 8] = *b"STRATAFS";

/// Current volume format version
pub const FORMAT_VERSION: u32 = 1;

/// Encoded superblock size in bytes
pub const SUPERBLOCK_LEN: usize = 8 + 4 + 16 + 8 * 2 + 4 * 2 + 8 * 3 + 8 * 2 + 4 + 4;

/// Volume-wide metadata
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Superblock {
    /// Magic number for format identification
    pub magic: [u8; 8],
    /// Format version
    pub version: u32,
    /// Unique volume identifier
    pub uuid: Uuid,
    /// Volume size in bytes
    pub volume_size: u64,
    /// Number of data regions (region 0 excluded)
    pub region_count: u64,
    pub block_size: u32,
    pub fragment_size: u32,
    /// Root directory inode
    pub root_ino: u64,
    /// Highest inode number in use
    pub apex_ino: u64,
    /// Highest virtual data block number in use
    pub apex_vlba: u64,
    /// Creation timestamp (Unix epoch)
    pub created_at: u64,
    /// Number of times the volume has been opened
    pub mount_count: u64,
    pub flags: u32,
    /// Checksum of the encoded fields above
    pub checksum: u32,
}

impl Superblock {
    /// Create a superblock for a volume of `volume_size` bytes
    pub fn new(volume_size: u64) -> Result<Self> {
        let region_count = region_count_for(volume_size)?;

        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();

        let mut sb = Self {
            magic: MAGIC,
            version: FORMAT_VERSION,
            uuid: Uuid::new_v4(),
            volume_size,
            region_count,
            block_size: BLOCK_SIZE as u32,
            fragment_size: FRAGMENT_SIZE as u32,
            root_ino: INO_ROOT,
            apex_ino: INO_ROOT,
            apex_vlba: 0,
            created_at: now,
            mount_count: 0,
            flags: 0,
            checksum: 0,
        };
        sb.checksum = sb.compute_checksum();
        Ok(sb)
    }

    /// Number of blocks the volume spans
    #[must_use]
    pub const fn block_count(&self) -> u64 {
        self.volume_size / BLOCK_SIZE as u64
    }

    /// Serialize superblock to bytes
    #[must_use]
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(SUPERBLOCK_LEN);
        self.put_fields(&mut buf);
        buf.put_u32_le(self.checksum);
        buf.freeze()
    }

    fn put_fields(&self, buf: &mut BytesMut) {
        buf.put_slice(&self.magic);
        buf.put_u32_le(self.version);
        buf.put_slice(self.uuid.as_bytes());
        buf.put_u64_le(self.volume_size);
        buf.put_u64_le(self.region_count);
        buf.put_u32_le(self.block_size);
        buf.put_u32_le(self.fragment_size);
        buf.put_u64_le(self.root_ino);
        buf.put_u64_le(self.apex_ino);
        buf.put_u64_le(self.apex_vlba);
        buf.put_u64_le(self.created_at);
        buf.put_u64_le(self.mount_count);
        buf.put_u32_le(self.flags);
    }

    /// Parse superblock from bytes
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < SUPERBLOCK_LEN {
            return Err(Error::corrupted("superblock too small"));
        }

        let mut buf = data;

        let mut magic = [0u8; 8];
        buf.copy_to_slice(&mut magic);
        if magic != MAGIC {
            return Err(Error::corrupted("invalid superblock magic"));
        }

        let version = buf.get_u32_le();
        if version != FORMAT_VERSION {
            return Err(Error::corrupted(format!(
                "unsupported format version: {version}"
            )));
        }

        let mut uuid_bytes = [0u8; 16];
        buf.copy_to_slice(&mut uuid_bytes);

        let sb = Self {
            magic,
            version,
            uuid: Uuid::from_bytes(uuid_bytes),
            volume_size: buf.get_u64_le(),
            region_count: buf.get_u64_le(),
            block_size: buf.get_u32_le(),
            fragment_size: buf.get_u32_le(),
            root_ino: buf.get_u64_le(),
            apex_ino: buf.get_u64_le(),
            apex_vlba: buf.get_u64_le(),
            created_at: buf.get_u64_le(),
            mount_count: buf.get_u64_le(),
            flags: buf.get_u32_le(),
            checksum: buf.get_u32_le(),
        };

        let expected = sb.compute_checksum();
        if sb.checksum != expected {
            return Err(Error::corrupted(format!(
                "superblock checksum mismatch: stored {:#010x}, computed {expected:#010x}",
                sb.checksum
            )));
        }
        Ok(sb)
    }

    /// Compute checksum over all fields except the checksum itself
    #[must_use]
    pub fn compute_checksum(&self) -> u32 {
        let mut buf = BytesMut::with_capacity(SUPERBLOCK_LEN);
        self.put_fields(&mut buf);
        crc32c::crc32c(&buf)
    }

    /// Refresh the checksum after a field change
    pub fn seal(&mut self) {
        self.checksum = self.compute_checksum();
    }

    /// Check the geometry against a device of `capacity` bytes
    pub fn validate(&self, capacity: u64) -> Result<()> {
        if self.block_size as usize != BLOCK_SIZE || self.fragment_size as usize != FRAGMENT_SIZE {
            return Err(Error::corrupted(format!(
                "unsupported block geometry {}/{}",
                self.block_size, self.fragment_size
            )));
        }
        if !(VOLUME_SIZE_MIN..=VOLUME_SIZE_MAX).contains(&self.volume_size) {
            return Err(Error::corrupted(format!(
                "volume size {} out of range",
                self.volume_size
            )));
        }
        if capacity < self.volume_size {
            return Err(Error::corrupted(format!(
                "device capacity {capacity} smaller than volume size {}",
                self.volume_size
            )));
        }
        let spanned = self
            .region_count
            .checked_add(1)
            .and_then(|n| n.checked_mul(REGION_SIZE));
        if spanned != Some(self.volume_size) {
            return Err(Error::corrupted(format!(
                "{} regions do not span volume size {}",
                self.region_count, self.volume_size
            )));
        }
        if self.root_ino != INO_ROOT {
            return Err(Error::corrupted(format!(
                "unexpected root inode {}",
                self.root_ino
            )));
        }
        if self.apex_ino < self.root_ino {
            return Err(Error::corrupted(format!(
                "inode apex {} below root inode",
                self.apex_ino
            )));
        }
        Ok(())
    }
}

/// Number of data regions in a volume of `volume_size` bytes
pub fn region_count_for(volume_size: u64) -> Result<u64> {
    if volume_size < VOLUME_SIZE_MIN {
        return Err(Error::geometry(format!(
            "volume size {volume_size} is below minimum {VOLUME_SIZE_MIN}"
        )));
    }
    if volume_size > VOLUME_SIZE_MAX {
        return Err(Error::geometry(format!(
            "volume size {volume_size} exceeds maximum {VOLUME_SIZE_MAX}"
        )));
    }
    if volume_size % REGION_SIZE != 0 {
        return Err(Error::geometry(format!(
            "volume size {volume_size} is not a multiple of {REGION_SIZE}"
        )));
    }
    Ok(volume_size / REGION_SIZE - 1)
}

/// Largest valid volume size that fits in `capacity` bytes
#[must_use]
pub const fn volume_size_for(capacity: u64) -> u64 {
    let size = capacity - capacity % REGION_SIZE;
    if size > VOLUME_SIZE_MAX {
        VOLUME_SIZE_MAX
    } else {
        size
    }
}

const _: () = assert!(LBA_SUPER < strata_common::REGION_BLOCKS);

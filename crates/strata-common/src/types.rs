//! Core type definitions for Strata
//!
//! This module defines the volume geometry, the virtual and physical
//! address types, and the `Outcome` signal returned by storage operations
//! that may complete later.
//!
//! Volume layout:
//! ```text
//! +------------------+  Region 0 (LBA 0..128)
//! |  LBA 0 (unused)  |
//! |  LBA 1 Superblock|
//! +------------------+  Region 1 (LBA 128..256)
//! |  Space-map block |  usage bitmap + virtual -> physical entries
//! |  127 data blocks |  fragments allocated by the space-map
//! +------------------+  Region 2 ...
//! ```

use derive_more::Display;
use std::fmt;
use xxhash_rust::xxh64::xxh64;

/// Smallest allocation unit (512 bytes)
pub const FRAGMENT_SIZE: usize = 512;

/// Logical block size (8KB)
pub const BLOCK_SIZE: usize = 8192;

/// Fragments per block
pub const FRAGMENTS_PER_BLOCK: usize = BLOCK_SIZE / FRAGMENT_SIZE;

/// Blocks per region; each region is governed by one space-map
pub const REGION_BLOCKS: u64 = 128;

/// Region size in bytes (1MB)
pub const REGION_SIZE: u64 = REGION_BLOCKS * BLOCK_SIZE as u64;

/// Fragments per region
pub const REGION_FRAGMENTS: usize = REGION_BLOCKS as usize * FRAGMENTS_PER_BLOCK;

/// Maximum number of mappings a single space-map can hold
pub const SPACE_MAP_ENTRIES: usize = 240;

/// Smallest usable volume: the superblock region plus one data region
pub const VOLUME_SIZE_MIN: u64 = 2 * REGION_SIZE;

/// Largest supported volume (2PB)
pub const VOLUME_SIZE_MAX: u64 = 1 << 51;

/// Null block address; never a valid object location
pub const LBA_NULL: u64 = 0;

/// Fixed location of the superblock
pub const LBA_SUPER: u64 = 1;

/// Inode number of the root directory
pub const INO_ROOT: u64 = 1;

/// Kind of a virtual object
#[derive(Clone, Copy, Debug, Display, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ObjectKind {
    #[display("super")]
    Super,
    #[display("spmap")]
    SpaceMap,
    #[display("dir")]
    Dir,
    #[display("dirseg")]
    DirSegment,
    #[display("inode")]
    Inode,
    #[display("fileseg")]
    FileSegment,
    #[display("data")]
    DataBlock,
}

impl ObjectKind {
    /// On-disk type code
    #[must_use]
    pub const fn code(self) -> u8 {
        match self {
            Self::Super => 1,
            Self::SpaceMap => 2,
            Self::Dir => 3,
            Self::DirSegment => 4,
            Self::Inode => 5,
            Self::FileSegment => 6,
            Self::DataBlock => 7,
        }
    }

    /// Parse an on-disk type code
    #[must_use]
    pub const fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(Self::Super),
            2 => Some(Self::SpaceMap),
            3 => Some(Self::Dir),
            4 => Some(Self::DirSegment),
            5 => Some(Self::Inode),
            6 => Some(Self::FileSegment),
            7 => Some(Self::DataBlock),
            _ => None,
        }
    }

    /// Size of an object of this kind, in fragments
    #[must_use]
    pub const fn fragments(self) -> usize {
        match self {
            Self::Super | Self::SpaceMap | Self::DataBlock => FRAGMENTS_PER_BLOCK,
            Self::Dir | Self::DirSegment => 8,
            Self::FileSegment => 4,
            Self::Inode => 2,
        }
    }

    /// Size of an object of this kind, in bytes
    #[must_use]
    pub const fn size(self) -> usize {
        self.fragments() * FRAGMENT_SIZE
    }

    /// Raw data blocks carry no header and are not decoded further
    #[must_use]
    pub const fn is_data_block(self) -> bool {
        matches!(self, Self::DataBlock)
    }
}

/// Logical identity of a stored object, independent of placement
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VirtualAddress {
    /// Object kind
    pub kind: ObjectKind,
    /// Owning inode number (0 for volume-level objects)
    pub ino: u64,
    /// Sub-offset within the owner (segment, region or logical block)
    pub xno: u64,
}

impl VirtualAddress {
    #[must_use]
    pub const fn new(kind: ObjectKind, ino: u64, xno: u64) -> Self {
        Self { kind, ino, xno }
    }

    #[must_use]
    pub const fn for_super() -> Self {
        Self::new(ObjectKind::Super, 0, 0)
    }

    /// Address of the space-map governing `region`
    #[must_use]
    pub const fn for_space_map(region: u64) -> Self {
        Self::new(ObjectKind::SpaceMap, 0, region)
    }

    /// Address of an inode-level object (`Inode` or `Dir`)
    #[must_use]
    pub const fn for_inode(kind: ObjectKind, ino: u64) -> Self {
        Self::new(kind, ino, 0)
    }

    #[must_use]
    pub const fn for_dir_segment(ino: u64, segment: u64) -> Self {
        Self::new(ObjectKind::DirSegment, ino, segment)
    }

    #[must_use]
    pub const fn for_file_segment(ino: u64, segment: u64) -> Self {
        Self::new(ObjectKind::FileSegment, ino, segment)
    }

    /// Address of a raw data block by its virtual block number
    #[must_use]
    pub const fn for_data_block(vlba: u64) -> Self {
        Self::new(ObjectKind::DataBlock, 0, vlba)
    }

    /// Stable hash used to distribute objects across regions
    #[must_use]
    pub fn hash64(&self) -> u64 {
        let mut key = [0u8; 17];
        key[0] = self.kind.code();
        key[1..9].copy_from_slice(&self.ino.to_le_bytes());
        key[9..17].copy_from_slice(&self.xno.to_le_bytes());
        xxh64(&key, 0)
    }

    /// Region that owns this address on a volume with `region_count` regions
    ///
    /// A space-map address names its own region. Everything else is spread
    /// over regions `1..=region_count` by hash.
    #[must_use]
    pub fn region(&self, region_count: u64) -> u64 {
        match self.kind {
            ObjectKind::SpaceMap => self.xno,
            _ if region_count == 0 => 0,
            _ => self.hash64() % region_count + 1,
        }
    }
}

impl fmt::Display for VirtualAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.kind, self.ino, self.xno)
    }
}

/// Location of an object's bytes: block index plus fragment within the block
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PhysicalAddress {
    /// Logical block address
    pub lba: u64,
    /// Fragment index within the block
    pub frg: u16,
}

impl PhysicalAddress {
    #[must_use]
    pub const fn new(lba: u64, frg: u16) -> Self {
        Self { lba, frg }
    }

    /// Address of the start of block `lba`
    #[must_use]
    pub const fn block(lba: u64) -> Self {
        Self { lba, frg: 0 }
    }

    /// Containing block
    #[must_use]
    pub const fn floor(self) -> Self {
        Self::block(self.lba)
    }

    #[must_use]
    pub const fn is_null(self) -> bool {
        self.lba == LBA_NULL
    }

    /// Byte offset of the fragment within its block
    #[must_use]
    pub const fn offset_in_block(self) -> usize {
        self.frg as usize * FRAGMENT_SIZE
    }

    /// Absolute byte offset on the volume
    #[must_use]
    pub const fn byte_offset(self) -> u64 {
        self.lba * BLOCK_SIZE as u64 + self.offset_in_block() as u64
    }

    /// Region containing this block
    #[must_use]
    pub const fn region(self) -> u64 {
        self.lba / REGION_BLOCKS
    }
}

impl fmt::Display for PhysicalAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.lba, self.frg)
    }
}

/// Kind of deferred block job
#[derive(Clone, Copy, Debug, Display, PartialEq, Eq, Hash)]
pub enum JobKind {
    #[display("read")]
    Read,
    #[display("write")]
    Write,
    #[display("sync")]
    Sync,
}

/// Result of a storage operation that may not finish immediately
///
/// `Pending` and `Deferred` are not failures: the request was accepted or
/// is waiting on an in-flight block job, and the caller must re-issue it
/// once the job queue has been drained.
#[must_use]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome<T> {
    /// Completed with a value
    Done(T),
    /// Waiting on a block that has a job in flight
    Pending,
    /// Write or sync accepted; completes when the job runs
    Deferred,
}

impl<T> Outcome<T> {
    pub const fn is_done(&self) -> bool {
        matches!(self, Self::Done(_))
    }

    pub const fn is_pending(&self) -> bool {
        matches!(self, Self::Pending)
    }

    pub const fn is_deferred(&self) -> bool {
        matches!(self, Self::Deferred)
    }

    /// The completed value, if any
    pub fn done(self) -> Option<T> {
        match self {
            Self::Done(v) => Some(v),
            Self::Pending | Self::Deferred => None,
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Outcome<U> {
        match self {
            Self::Done(v) => Outcome::Done(f(v)),
            Self::Pending => Outcome::Pending,
            Self::Deferred => Outcome::Deferred,
        }
    }
}

/// Unwrap `Result<Outcome<T>>` to `T`, returning early on errors and on
/// `Pending`/`Deferred`.
#[macro_export]
macro_rules! done {
    ($e:expr) => {
        match $e? {
            $crate::Outcome::Done(v) => v,
            $crate::Outcome::Pending => return Ok($crate::Outcome::Pending),
            $crate::Outcome::Deferred => return Ok($crate::Outcome::Deferred),
        }
    };
}

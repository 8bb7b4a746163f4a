//! Strata Storage - Object resolution and caching
//!
//! This crate maps virtual objects of a Strata volume onto physical
//! blocks, including:
//! - Block devices (O_DIRECT files, in-memory volumes)
//! - Per-region space-maps with fragment allocation
//! - Object cache with separate LRU lists for blocks and space-maps
//! - Synchronous or deferred block I/O through a pending-job queue
//! - The storage coordinator (fetch, stage, spawn, commit, unmap, squeeze)
//! - Volume format, open and close

pub mod arena;
pub mod block;
pub mod cache;
pub mod codec;
pub mod device;
pub mod io;
pub mod jobs;
pub mod layout;
pub mod lru;
pub mod object;
pub mod ops;
pub mod spacemap;
pub mod storage;
pub mod volume;

// Re-exports
pub use arena::{Arena, BlockId, ObjectId};
pub use block::{BlockRef, JobState};
pub use cache::{CacheStats, ObjectCache};
pub use codec::{FrameCodec, HEADER_LEN, ObjectCodec, record_len};
pub use device::{ALIGNMENT, BlockDevice, DeviceStats, FileDevice, MemoryDevice};
pub use io::VolumeIo;
pub use jobs::{CompletionSink, JobCompletion, PendingJobQueue};
pub use layout::{FORMAT_VERSION, MAGIC, SUPERBLOCK_LEN, Superblock};
pub use object::{ObjectBody, Vnode};
pub use ops::StorageOps;
pub use spacemap::{SPACE_MAP_LEN, SpaceEntry, SpaceMap};
pub use storage::{SqueezeReport, Storage};
pub use volume::{FormatOptions, Volume, root_vaddr};
